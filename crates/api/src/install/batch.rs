//! Batch import: create many services from an `mcpServers`-style JSON payload
//! and stream per-item progress to the caller over SSE.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use mcpgate_shared::{sanitize_service_name, GatewayError, ServiceType};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::{self, NewService};

use super::{InstallStatus, InstallationManager, InstallationTask};

/// One progress event on the batch-import stream. The final event carries
/// `status: "done"` and the summary.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchImportSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchImportSummary {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct BatchImportTask {
    pub id: String,
    pub created_at: OffsetDateTime,
    progress: StdMutex<Option<mpsc::Receiver<ProgressUpdate>>>,
}

/// Registry of in-flight batch imports, keyed by task id.
#[derive(Default)]
pub struct BatchImportManager {
    tasks: DashMap<String, Arc<BatchImportTask>>,
}

/// Parsed entry of the batch payload: either a command launch or a URL, with
/// optional args/envs/headers. Unknown value shapes are rejected up front.
#[derive(Debug, Default, Clone)]
struct BatchEntry {
    url: String,
    command: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    headers: HashMap<String, String>,
}

impl BatchImportManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Kick off an import; per-entry processing happens in the background.
    pub fn start(
        self: &Arc<Self>,
        pool: SqlitePool,
        installer: Arc<InstallationManager>,
        services: serde_json::Map<String, Value>,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(100);

        self.tasks.insert(
            task_id.clone(),
            Arc::new(BatchImportTask {
                id: task_id.clone(),
                created_at: OffsetDateTime::now_utc(),
                progress: StdMutex::new(Some(rx)),
            }),
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.process(pool, installer, services, tx).await;
        });

        task_id
    }

    /// Hand the progress receiver to the (single) SSE consumer and drop the
    /// task entry. The channel buffers every event up to and including the
    /// final summary, so a consumer connecting after completion still sees
    /// the full stream.
    pub fn take_progress(&self, task_id: &str) -> Option<mpsc::Receiver<ProgressUpdate>> {
        let (_, task) = self.tasks.remove(task_id)?;
        let progress = task.progress.lock().unwrap().take();
        progress
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    async fn process(
        &self,
        pool: SqlitePool,
        installer: Arc<InstallationManager>,
        services: serde_json::Map<String, Value>,
        tx: mpsc::Sender<ProgressUpdate>,
    ) {
        let mut summary = BatchImportSummary::default();

        for (name, value) in services {
            let update = match create_single_service_from_batch(&pool, &installer, &name, &value)
                .await
            {
                Ok(()) => {
                    summary.success += 1;
                    ProgressUpdate {
                        name: Some(name),
                        status: "success".to_string(),
                        message: Some("Service imported successfully.".to_string()),
                        summary: None,
                    }
                }
                Err(GatewayError::Conflict(_)) => {
                    summary.skipped += 1;
                    ProgressUpdate {
                        name: Some(name),
                        status: "skipped".to_string(),
                        message: Some("Service already exists".to_string()),
                        summary: None,
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    ProgressUpdate {
                        name: Some(name),
                        status: "failed".to_string(),
                        message: Some(err.to_string()),
                        summary: None,
                    }
                }
            };
            let _ = tx.send(update).await;
        }

        let _ = tx
            .send(ProgressUpdate {
                name: None,
                status: "done".to_string(),
                message: None,
                summary: Some(summary),
            })
            .await;

        // Dropping the sender ends the SSE stream. The entry itself is
        // removed when its consumer claims the receiver.
    }
}

fn string_map(value: &Value, field: &str) -> Result<HashMap<String, String>, GatewayError> {
    let object = value.as_object().ok_or_else(|| {
        GatewayError::Validation(format!("'{}' field must be a map of strings", field))
    })?;
    let mut map = HashMap::new();
    for (key, value) in object {
        let value = value.as_str().ok_or_else(|| {
            GatewayError::Validation(format!("'{}' field must be a map of strings", field))
        })?;
        map.insert(key.clone(), value.to_string());
    }
    Ok(map)
}

fn parse_entry(value: &Value) -> Result<BatchEntry, GatewayError> {
    let object = value
        .as_object()
        .ok_or_else(|| GatewayError::Validation("invalid service data format".to_string()))?;

    let mut entry = BatchEntry::default();

    if let Some(url) = object.get("url") {
        entry.url = url
            .as_str()
            .ok_or_else(|| GatewayError::Validation("'url' field must be a string".to_string()))?
            .to_string();
    }
    if let Some(command) = object.get("command") {
        entry.command = command
            .as_str()
            .ok_or_else(|| {
                GatewayError::Validation("'command' field must be a string".to_string())
            })?
            .to_string();
    }
    if let Some(args) = object.get("args") {
        let list = args.as_array().ok_or_else(|| {
            GatewayError::Validation("'args' field must be an array of strings".to_string())
        })?;
        for arg in list {
            let arg = arg.as_str().ok_or_else(|| {
                GatewayError::Validation("'args' field must be an array of strings".to_string())
            })?;
            entry.args.push(arg.to_string());
        }
    }
    if let Some(envs) = object.get("envs") {
        entry.envs = string_map(envs, "envs")?;
    }
    // `env` is the mcp.json spelling; merge it for compatibility.
    if let Some(env) = object.get("env") {
        entry.envs.extend(string_map(env, "env")?);
    }
    if let Some(headers) = object.get("headers") {
        entry.headers = string_map(headers, "headers")?;
    }

    Ok(entry)
}

/// Type detection: a URL ending in `/sse` is an SSE backend, any other URL is
/// streamable HTTP, and a bare command is stdio.
fn detect_type(entry: &BatchEntry) -> Result<ServiceType, GatewayError> {
    if !entry.url.is_empty() {
        let path = reqwest::Url::parse(&entry.url)
            .map_err(|e| GatewayError::Validation(format!("invalid URL format: {}", e)))?
            .path()
            .to_string();
        if path.ends_with("/sse") {
            return Ok(ServiceType::Sse);
        }
        return Ok(ServiceType::StreamableHttp);
    }
    if !entry.command.is_empty() {
        return Ok(ServiceType::Stdio);
    }
    Err(GatewayError::Validation(
        "invalid service definition: must contain 'url' or 'command'".to_string(),
    ))
}

/// Package manager heuristic from the launch command.
fn detect_package_manager(entry: &BatchEntry, fallback_name: &str) -> (String, String) {
    if entry.command == "npx" && !entry.args.is_empty() {
        let last = entry.args.last().expect("non-empty args");
        if last.contains('@') || last.contains('/') {
            return ("npm".to_string(), last.clone());
        }
    } else if entry.command == "uvx" && !entry.args.is_empty() {
        for (i, arg) in entry.args.iter().enumerate() {
            if arg == "--from" && i + 1 < entry.args.len() {
                return ("pypi".to_string(), entry.args[i + 1].clone());
            }
        }
        let first = &entry.args[0];
        if !first.is_empty() && !first.starts_with('-') {
            return ("pypi".to_string(), first.clone());
        }
    }
    ("custom".to_string(), fallback_name.to_string())
}

/// Create one service from a batch entry; a live row with the same name maps
/// to `Conflict`, which the caller reports as "skipped".
async fn create_single_service_from_batch(
    pool: &SqlitePool,
    installer: &Arc<InstallationManager>,
    service_name: &str,
    value: &Value,
) -> Result<(), GatewayError> {
    let sanitized = sanitize_service_name(service_name);
    if sanitized.is_empty() {
        return Err(GatewayError::Validation(
            "service name cannot be empty".to_string(),
        ));
    }

    if registry::get_by_name(pool, &sanitized).await.is_ok() {
        return Err(GatewayError::Conflict(format!(
            "service already exists: {}",
            sanitized
        )));
    }

    let entry = parse_entry(value)?;
    let service_type = detect_type(&entry)?;
    let (package_manager, source_package) = detect_package_manager(&entry, &sanitized);

    if service_type == ServiceType::Stdio && entry.command.is_empty() {
        return Err(GatewayError::Validation(
            "missing 'command' for stdio service".to_string(),
        ));
    }

    let envs_json = serde_json::to_string(&entry.envs).unwrap_or_else(|_| "{}".to_string());
    let new_service = match service_type {
        ServiceType::Stdio => NewService {
            name: sanitized.clone(),
            display_name: sanitized.clone(),
            description: "Imported via batch import".to_string(),
            default_on: true,
            enabled: true,
            service_type,
            command: entry.command.clone(),
            args_json: serde_json::to_string(&entry.args).unwrap_or_else(|_| "[]".to_string()),
            default_envs_json: envs_json,
            allow_user_override: true,
            installed_version: "0.0.1".to_string(),
            package_manager: package_manager.clone(),
            source_package_name: source_package.clone(),
            ..NewService::default()
        },
        ServiceType::Sse | ServiceType::StreamableHttp => NewService {
            name: sanitized.clone(),
            display_name: sanitized.clone(),
            description: "Imported via batch import".to_string(),
            default_on: true,
            enabled: true,
            service_type,
            command: entry.url.clone(),
            headers_json: serde_json::to_string(&entry.headers)
                .unwrap_or_else(|_| "{}".to_string()),
            default_envs_json: envs_json,
            allow_user_override: true,
            installed_version: "0.0.1".to_string(),
            package_manager: package_manager.clone(),
            source_package_name: source_package.clone(),
            ..NewService::default()
        },
    };

    let created = registry::create(pool, &new_service).await?;
    tracing::info!(service = %created.name, id = created.id, "batch import created service");

    // Marketplace-backed stdio entries get an async install probe; the
    // import itself does not wait for it.
    if created.service_type == ServiceType::Stdio && created.package_manager != "custom" {
        installer.submit(InstallationTask {
            service_id: created.id,
            user_id: 0,
            package_name: created.source_package_name.clone(),
            package_manager: created.package_manager.clone(),
            version: created.installed_version.clone(),
            command: created.command.clone(),
            args: created.args(),
            env_vars: entry.envs,
            status: InstallStatus::Pending,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            output: String::new(),
            error: String::new(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_shared::db::{create_memory_pool, run_migrations};
    use mcpgate_shared::Kv;
    use serde_json::json;

    async fn setup() -> (SqlitePool, Arc<InstallationManager>, Arc<BatchImportManager>) {
        let pool = create_memory_pool().await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        let installer = InstallationManager::new(pool.clone(), Kv::new());
        (pool, installer, BatchImportManager::new())
    }

    #[tokio::test]
    async fn test_batch_import_streams_progress_and_summary() {
        let (pool, installer, manager) = setup().await;

        let payload = json!({
            "a": {"url": "https://example.com/mcp"},
            "b": {"url": "https://example.com/sse"}
        });
        let task_id = manager.start(
            pool.clone(),
            installer,
            payload.as_object().unwrap().clone(),
        );

        let mut rx = manager.take_progress(&task_id).expect("receiver");
        let mut items = Vec::new();
        while let Some(update) = rx.recv().await {
            items.push(update);
        }

        assert_eq!(items.len(), 3);
        let done = items.last().unwrap();
        assert_eq!(done.status, "done");
        let summary = done.summary.as_ref().unwrap();
        assert_eq!(summary.success, 2);
        assert_eq!(summary.failed, 0);

        let a = registry::get_by_name(&pool, "a").await.expect("a created");
        assert_eq!(a.service_type, ServiceType::StreamableHttp);
        let b = registry::get_by_name(&pool, "b").await.expect("b created");
        assert_eq!(b.service_type, ServiceType::Sse);

        // Consuming the stream removed the task entry.
        assert!(!manager.contains(&task_id));
    }

    #[tokio::test]
    async fn test_existing_service_is_skipped() {
        let (pool, installer, manager) = setup().await;
        registry::create(
            &pool,
            &NewService {
                name: "dup".to_string(),
                display_name: "dup".to_string(),
                command: "http://x/mcp".to_string(),
                service_type: ServiceType::StreamableHttp,
                package_manager: "custom".to_string(),
                ..NewService::default()
            },
        )
        .await
        .expect("seed");

        let payload = json!({"dup": {"url": "https://example.com/mcp"}});
        let task_id = manager.start(pool, installer, payload.as_object().unwrap().clone());
        let mut rx = manager.take_progress(&task_id).expect("receiver");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, "skipped");
        let done = rx.recv().await.unwrap();
        assert_eq!(done.summary.as_ref().unwrap().skipped, 1);
    }

    #[tokio::test]
    async fn test_invalid_shapes_fail_per_item() {
        let (pool, installer, manager) = setup().await;

        let payload = json!({
            "no-source": {"envs": {}},
            "bad-args": {"command": "npx", "args": "-y pkg"},
            "bad-env": {"command": "npx", "env": {"KEY": 42}}
        });
        let task_id = manager.start(pool, installer, payload.as_object().unwrap().clone());
        let mut rx = manager.take_progress(&task_id).expect("receiver");

        let mut failed = 0;
        while let Some(update) = rx.recv().await {
            if update.status == "failed" {
                failed += 1;
            } else if update.status == "done" {
                assert_eq!(update.summary.as_ref().unwrap().failed, 3);
            }
        }
        assert_eq!(failed, 3);
    }

    #[test]
    fn test_detect_package_manager_heuristics() {
        let npx = BatchEntry {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@scope/pkg-a".to_string()],
            ..BatchEntry::default()
        };
        assert_eq!(
            detect_package_manager(&npx, "x"),
            ("npm".to_string(), "@scope/pkg-a".to_string())
        );

        let uvx_from = BatchEntry {
            command: "uvx".to_string(),
            args: vec!["--from".to_string(), "pkg-b".to_string(), "pkg-b".to_string()],
            ..BatchEntry::default()
        };
        assert_eq!(
            detect_package_manager(&uvx_from, "x"),
            ("pypi".to_string(), "pkg-b".to_string())
        );

        let uvx_bare = BatchEntry {
            command: "uvx".to_string(),
            args: vec!["pkg-c".to_string()],
            ..BatchEntry::default()
        };
        assert_eq!(
            detect_package_manager(&uvx_bare, "x"),
            ("pypi".to_string(), "pkg-c".to_string())
        );

        let custom = BatchEntry {
            command: "./server".to_string(),
            ..BatchEntry::default()
        };
        assert_eq!(
            detect_package_manager(&custom, "fallback"),
            ("custom".to_string(), "fallback".to_string())
        );
    }

    #[test]
    fn test_detect_type() {
        let sse = BatchEntry {
            url: "https://x.example/api/sse".to_string(),
            ..BatchEntry::default()
        };
        assert_eq!(detect_type(&sse).unwrap(), ServiceType::Sse);

        let http = BatchEntry {
            url: "https://x.example/mcp".to_string(),
            ..BatchEntry::default()
        };
        assert_eq!(detect_type(&http).unwrap(), ServiceType::StreamableHttp);

        let stdio = BatchEntry {
            command: "npx".to_string(),
            ..BatchEntry::default()
        };
        assert_eq!(detect_type(&stdio).unwrap(), ServiceType::Stdio);

        assert!(detect_type(&BatchEntry::default()).is_err());
    }
}
