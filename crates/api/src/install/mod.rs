//! Installation supervisor: background package installs with status
//! reporting, MCP initialize probing, and rollback on failure.

pub mod batch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use mcpgate_shared::kv::health_key;
use mcpgate_shared::{Kv, ServiceHealth, ServiceStatus};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::mcp::client::{McpClient, StdioSpec, TransportSpec};
use crate::mcp::types::Capabilities;
use crate::registry;

/// Whole-task deadline.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Deadline for the MCP initialize probe.
const INIT_PROBE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Health snapshots written on install success share the supervisor's TTL.
const HEALTH_TTL: Duration = Duration::from_secs(60 * 60);
/// Python virtual environments live under here, one per package.
pub const PYTHON_VENVS_DIR: &str = "data/python_venvs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Pending,
    Installing,
    Completed,
    Failed,
}

impl InstallStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, InstallStatus::Pending | InstallStatus::Installing)
    }
}

/// One installation task; at most one live task exists per service.
#[derive(Debug, Clone)]
pub struct InstallationTask {
    pub service_id: i64,
    pub user_id: i64,
    pub package_name: String,
    pub package_manager: String,
    pub version: String,
    pub command: String,
    pub args: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub status: InstallStatus,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub output: String,
    pub error: String,
}

/// What the initialize probe learned about the installed server.
#[derive(Debug, Clone, Serialize)]
pub struct McpServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub capabilities: Capabilities,
}

struct TaskEntry {
    task: InstallationTask,
    done: Arc<Notify>,
}

/// Single-flight task queue driving npm / PyPI installs.
pub struct InstallationManager {
    pool: SqlitePool,
    kv: Kv,
    tasks: StdMutex<HashMap<i64, TaskEntry>>,
}

impl InstallationManager {
    pub fn new(pool: SqlitePool, kv: Kv) -> Arc<Self> {
        Arc::new(Self {
            pool,
            kv,
            tasks: StdMutex::new(HashMap::new()),
        })
    }

    /// Submit a task. A live task for the same service makes this a silent
    /// de-dup no-op.
    pub fn submit(self: &Arc<Self>, mut task: InstallationTask) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks.get(&task.service_id) {
            if existing.task.status.is_live() {
                tracing::info!(
                    service_id = task.service_id,
                    status = ?existing.task.status,
                    "install task already live, skipping duplicate submission"
                );
                return;
            }
        }

        task.status = InstallStatus::Pending;
        task.start_time = OffsetDateTime::now_utc();
        task.end_time = None;

        let service_id = task.service_id;
        tasks.insert(
            service_id,
            TaskEntry {
                task,
                done: Arc::new(Notify::new()),
            },
        );
        drop(tasks);

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(service_id).await;
        });
    }

    pub fn task_status(&self, service_id: i64) -> Option<InstallationTask> {
        self.tasks
            .lock()
            .unwrap()
            .get(&service_id)
            .map(|entry| entry.task.clone())
    }

    /// Drop a task once consumers have read its terminal state.
    pub fn cleanup(&self, service_id: i64) {
        self.tasks.lock().unwrap().remove(&service_id);
    }

    /// Wait until the task reaches a terminal state. Returns `None` when no
    /// task exists for the service.
    pub async fn wait_for_terminal(&self, service_id: i64) -> Option<InstallStatus> {
        loop {
            let (status, done) = {
                let tasks = self.tasks.lock().unwrap();
                let entry = tasks.get(&service_id)?;
                (entry.task.status, entry.done.clone())
            };
            if !status.is_live() {
                return Some(status);
            }
            done.notified().await;
        }
    }

    fn set_status(&self, service_id: i64, update: impl FnOnce(&mut InstallationTask)) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(entry) = tasks.get_mut(&service_id) {
            update(&mut entry.task);
            if !entry.task.status.is_live() {
                entry.done.notify_waiters();
            }
        }
    }

    async fn run(self: Arc<Self>, service_id: i64) {
        let task = match self.task_status(service_id) {
            Some(task) => task,
            None => return,
        };

        self.set_status(service_id, |t| t.status = InstallStatus::Installing);
        tracing::info!(
            service_id,
            package = %task.package_name,
            manager = %task.package_manager,
            "installation started"
        );

        let result = tokio::time::timeout(INSTALL_TIMEOUT, self.install(&task)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(format!(
                "installation timed out after {:?}",
                INSTALL_TIMEOUT
            )),
        };

        match outcome {
            Ok(info) => {
                let output = format!(
                    "{} package {} initialized. Server: {}, Version: {}, Protocol: {}",
                    task.package_manager, task.package_name, info.name, info.version,
                    info.protocol_version
                );
                self.set_status(service_id, |t| {
                    t.status = InstallStatus::Completed;
                    t.end_time = Some(OffsetDateTime::now_utc());
                    t.output = output.clone();
                });
                tracing::info!(service_id, package = %task.package_name, "installation completed");

                let manager = self.clone();
                let task = task.clone();
                tokio::spawn(async move {
                    manager.apply_install_success(&task, &info).await;
                });
            }
            Err(error) => {
                self.set_status(service_id, |t| {
                    t.status = InstallStatus::Failed;
                    t.end_time = Some(OffsetDateTime::now_utc());
                    t.error = error.clone();
                    t.output = error.clone();
                });
                tracing::error!(service_id, package = %task.package_name, error = %error, "installation failed");

                // Roll back the row pre-created for this install.
                if let Err(err) = registry::soft_delete(&self.pool, service_id).await {
                    tracing::error!(service_id, error = %err, "failed to roll back service row");
                } else {
                    tracing::info!(service_id, "rolled back service row after failed install");
                }
            }
        }
    }

    async fn install(&self, task: &InstallationTask) -> Result<McpServerInfo, String> {
        match task.package_manager.as_str() {
            "npm" => self.install_npm(task).await,
            "pypi" | "uv" | "pip" => self.install_pypi(task).await,
            other => Err(format!("unsupported package manager: {}", other)),
        }
    }

    /// npm installs lean on `npx` fetching the package; the probe doubles as
    /// the install.
    async fn install_npm(&self, task: &InstallationTask) -> Result<McpServerInfo, String> {
        let command = if task.command.is_empty() {
            "npx".to_string()
        } else {
            task.command.clone()
        };
        let args = if task.args.is_empty() {
            vec!["-y".to_string(), task.package_name.clone()]
        } else {
            task.args.clone()
        };

        probe_stdio_initialize(&task.package_name, &command, &args, &task.env_vars).await
    }

    /// PyPI installs get a dedicated virtual environment, then the same probe.
    async fn install_pypi(&self, task: &InstallationTask) -> Result<McpServerInfo, String> {
        if !check_uv_available().await {
            return Err("uv command is not available".to_string());
        }

        let venv_dir = Path::new(PYTHON_VENVS_DIR)
            .join(&task.package_name)
            .join("venv");
        tokio::fs::create_dir_all(
            venv_dir
                .parent()
                .unwrap_or_else(|| Path::new(PYTHON_VENVS_DIR)),
        )
        .await
        .map_err(|e| format!("failed to create venv base directory: {}", e))?;

        run_checked(Command::new("uv").arg("venv").arg(&venv_dir)).await?;

        let package_spec = if task.version.is_empty() || task.version == "latest" {
            task.package_name.clone()
        } else {
            format!("{}=={}", task.package_name, task.version)
        };
        let venv_python = venv_dir.join("bin").join("python");
        run_checked(
            Command::new("uv")
                .arg("pip")
                .arg("install")
                .arg(&package_spec)
                .arg("--python")
                .arg(&venv_python),
        )
        .await?;

        let command = resolve_python_command(&task.command, &venv_dir);
        let args = if task.args.is_empty() {
            vec![
                "--from".to_string(),
                task.package_name.clone(),
                task.package_name.clone(),
            ]
        } else {
            task.args.clone()
        };

        probe_stdio_initialize(&task.package_name, &command, &args, &task.env_vars).await
    }

    /// Post-install side effects. The row is re-read first: a service
    /// uninstalled or disabled while installing must not be resurrected.
    async fn apply_install_success(&self, task: &InstallationTask, info: &McpServerInfo) {
        let mut service = match registry::get(&self.pool, task.service_id).await {
            Ok(service) => service,
            Err(err) => {
                tracing::error!(service_id = task.service_id, error = %err, "cannot load service for install completion");
                return;
            }
        };

        if service.deleted || !service.enabled {
            tracing::info!(
                service_id = task.service_id,
                "service was removed or disabled during install; skipping completion update"
            );
            return;
        }

        if service.command.is_empty() && !service.package_manager.is_empty() {
            match service.package_manager.as_str() {
                "npm" => {
                    service.command = "npx".to_string();
                    if service.args_json.is_empty() || service.args_json == "[]" {
                        let args = vec!["-y".to_string(), service.source_package_name.clone()];
                        service.args_json = serde_json::to_string(&args).unwrap_or_default();
                    }
                }
                "pypi" | "uv" | "pip" => {
                    service.command = "uvx".to_string();
                    if service.args_json.is_empty() || service.args_json == "[]" {
                        let args = vec![
                            "--from".to_string(),
                            service.source_package_name.clone(),
                            service.source_package_name.clone(),
                        ];
                        service.args_json = serde_json::to_string(&args).unwrap_or_default();
                    }
                }
                other => {
                    tracing::warn!(
                        service_id = service.id,
                        package_manager = %other,
                        "unknown package manager; command left empty"
                    );
                }
            }
        }

        service.enabled = true;
        service.installed_version = if task.version.is_empty() {
            info.version.clone()
        } else {
            task.version.clone()
        };

        if (service.default_envs_json.is_empty() || service.default_envs_json == "{}")
            && !task.env_vars.is_empty()
        {
            service.default_envs_json =
                serde_json::to_string(&task.env_vars).unwrap_or_else(|_| "{}".to_string());
        }

        if let Err(err) = registry::update(&self.pool, &service).await {
            tracing::error!(service_id = service.id, error = %err, "failed to persist install completion");
        }

        let mut health = ServiceHealth::unknown();
        health.status = ServiceStatus::Healthy;
        health.success_count = 1;
        health.message = format!(
            "Package {} (v{}) initialized. Server: {}, Protocol: {}",
            task.package_name, service.installed_version, info.name, info.protocol_version
        );
        if let Ok(json) = serde_json::to_string(&health) {
            self.kv
                .set(&health_key(service.id), &json, Some(HEALTH_TTL));
        }

        tracing::info!(service_id = service.id, name = %service.name, "install completion applied");
    }
}

/// Spawn the candidate server and run the MCP initialize handshake; success
/// proves the package actually is an MCP server.
async fn probe_stdio_initialize(
    package_name: &str,
    command: &str,
    args: &[String],
    env_vars: &HashMap<String, String>,
) -> Result<McpServerInfo, String> {
    let spec = StdioSpec {
        command: command.to_string(),
        args: args.to_vec(),
        envs: env_vars.clone(),
    };

    let client = McpClient::connect(&format!("install-probe-{}", package_name), TransportSpec::Stdio(spec))
        .map_err(|e| format!("failed to launch {}: {}", command, e))?;

    let initialized = tokio::time::timeout(INIT_PROBE_TIMEOUT, client.initialize()).await;
    let result = match initialized {
        Ok(Ok(result)) => Ok(McpServerInfo {
            name: result.server_info.name,
            version: result.server_info.version,
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
        }),
        Ok(Err(err)) => Err(format!(
            "failed to initialize MCP client for {} (is it an MCP server?): {}",
            package_name, err
        )),
        Err(_) => Err(format!(
            "initialize probe for {} timed out after {:?}",
            package_name, INIT_PROBE_TIMEOUT
        )),
    };

    client.close().await;
    result
}

pub async fn check_npx_available() -> bool {
    matches!(
        Command::new("npx").arg("--version").output().await,
        Ok(output) if output.status.success()
    )
}

pub async fn check_uv_available() -> bool {
    matches!(
        Command::new("uv").arg("--version").output().await,
        Ok(output) if output.status.success()
    )
}

/// `uvx`/`uv` stay system-wide; other relative commands resolve into the venv
/// bin directory when present.
fn resolve_python_command(command: &str, venv_dir: &Path) -> String {
    if command.is_empty() || command == "uv" || command == "uvx" {
        return if command.is_empty() {
            "uvx".to_string()
        } else {
            command.to_string()
        };
    }
    let path = PathBuf::from(command);
    if path.is_absolute() {
        return command.to_string();
    }
    let venv_command = venv_dir.join("bin").join(command);
    if venv_command.exists() {
        venv_command.to_string_lossy().to_string()
    } else {
        command.to_string()
    }
}

async fn run_checked(command: &mut Command) -> Result<String, String> {
    let rendered = format!("{:?}", command.as_std());
    let output = command
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", rendered, e))?;
    if !output.status.success() {
        return Err(format!(
            "{} failed: {}",
            rendered,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, NewService};
    use mcpgate_shared::db::{create_memory_pool, run_migrations};
    use mcpgate_shared::ServiceType;

    async fn test_pool() -> SqlitePool {
        let pool = create_memory_pool().await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn scripted_install_task(service_id: i64, package: &str) -> InstallationTask {
        // A stand-in MCP server: answers initialize, ignores the notification.
        let script = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"probe","version":"9.9.9"}}}'
read line
"#;
        InstallationTask {
            service_id,
            user_id: 1,
            package_name: package.to_string(),
            package_manager: "npm".to_string(),
            version: "1.0.0".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env_vars: HashMap::new(),
            status: InstallStatus::Pending,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            output: String::new(),
            error: String::new(),
        }
    }

    async fn create_pending_service(pool: &SqlitePool, name: &str) -> i64 {
        registry::create(
            pool,
            &NewService {
                name: name.to_string(),
                display_name: name.to_string(),
                service_type: ServiceType::Stdio,
                command: String::new(),
                args_json: String::new(),
                package_manager: "npm".to_string(),
                source_package_name: name.to_string(),
                ..NewService::default()
            },
        )
        .await
        .expect("create")
        .id
    }

    #[tokio::test]
    async fn test_successful_install_updates_service() {
        let pool = test_pool().await;
        let kv = Kv::new();
        let manager = InstallationManager::new(pool.clone(), kv.clone());

        let service_id = create_pending_service(&pool, "pkg-a").await;
        manager.submit(scripted_install_task(service_id, "pkg-a"));

        let status = manager.wait_for_terminal(service_id).await.expect("task");
        assert_eq!(status, InstallStatus::Completed);

        // Completion side effects run in a follow-up task.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let service = registry::get(&pool, service_id).await.expect("row");
        assert!(service.enabled);
        assert_eq!(service.installed_version, "1.0.0");
        assert_eq!(service.command, "npx");
        assert_eq!(service.args(), vec!["-y", "pkg-a"]);

        let snapshot = kv.get(&health_key(service_id)).expect("health written");
        let health: ServiceHealth = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(health.status, ServiceStatus::Healthy);
        assert!(health.message.contains("2025-03-26"));
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back_row() {
        let pool = test_pool().await;
        let manager = InstallationManager::new(pool.clone(), Kv::new());

        let service_id = create_pending_service(&pool, "pkg-b").await;
        let mut task = scripted_install_task(service_id, "pkg-b");
        task.command = "false".to_string(); // exits before answering initialize
        task.args = vec![];
        manager.submit(task);

        let status = manager.wait_for_terminal(service_id).await.expect("task");
        assert_eq!(status, InstallStatus::Failed);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let row = registry::get(&pool, service_id).await.expect("row kept");
        assert!(row.deleted);
        let task = manager.task_status(service_id).expect("task retained");
        assert!(!task.error.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_live_task_is_deduped() {
        let pool = test_pool().await;
        let manager = InstallationManager::new(pool.clone(), Kv::new());

        let service_id = create_pending_service(&pool, "pkg-c").await;
        // A slow backend keeps the first task live.
        let mut slow = scripted_install_task(service_id, "pkg-c");
        slow.args = vec!["-c".to_string(), "sleep 2".to_string()];
        manager.submit(slow);

        let first_start = manager.task_status(service_id).unwrap().start_time;
        manager.submit(scripted_install_task(service_id, "pkg-c"));
        assert_eq!(manager.task_status(service_id).unwrap().start_time, first_start);
    }

    #[tokio::test]
    async fn test_completion_skips_deleted_service() {
        let pool = test_pool().await;
        let kv = Kv::new();
        let manager = InstallationManager::new(pool.clone(), kv.clone());

        let service_id = create_pending_service(&pool, "pkg-d").await;
        // Simulate an uninstall racing the install: soft-delete before the
        // completion handler runs.
        registry::soft_delete(&pool, service_id).await.expect("delete");

        let task = scripted_install_task(service_id, "pkg-d");
        let info = McpServerInfo {
            name: "probe".to_string(),
            version: "9.9.9".to_string(),
            protocol_version: "2025-03-26".to_string(),
            capabilities: Capabilities::default(),
        };
        manager.apply_install_success(&task, &info).await;

        let row = registry::get(&pool, service_id).await.expect("row");
        assert!(row.deleted);
        assert!(!row.enabled);
        assert!(row.installed_version.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_package_manager_fails() {
        let pool = test_pool().await;
        let manager = InstallationManager::new(pool.clone(), Kv::new());

        let service_id = create_pending_service(&pool, "pkg-e").await;
        let mut task = scripted_install_task(service_id, "pkg-e");
        task.package_manager = "cargo".to_string();
        manager.submit(task);

        let status = manager.wait_for_terminal(service_id).await.expect("task");
        assert_eq!(status, InstallStatus::Failed);
        assert!(manager
            .task_status(service_id)
            .unwrap()
            .error
            .contains("unsupported package manager"));

        manager.cleanup(service_id);
        assert!(manager.task_status(service_id).is_none());
    }

    #[test]
    fn test_resolve_python_command() {
        let venv = Path::new("data/python_venvs/pkg/venv");
        assert_eq!(resolve_python_command("uvx", venv), "uvx");
        assert_eq!(resolve_python_command("uv", venv), "uv");
        assert_eq!(resolve_python_command("", venv), "uvx");
        assert_eq!(resolve_python_command("/usr/bin/python", venv), "/usr/bin/python");
        // A relative command that is not in the venv falls back to the system.
        assert_eq!(resolve_python_command("mcp-server", venv), "mcp-server");
    }
}
