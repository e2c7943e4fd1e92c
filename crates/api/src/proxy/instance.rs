//! Shared MCP instance cache.
//!
//! A shared instance pairs a live outbound client with an inbound proxy
//! server populated from it. Instances are keyed by (service, tenant scope,
//! effective environment) and created under a single global lock so that
//! concurrent misses on the same key never build two backends.

use std::collections::HashMap;
use std::sync::Arc;

use mcpgate_shared::{McpService, ServiceType};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::mcp::client::{spawn_pinger, McpClient, McpClientError, RemoteSpec, StdioSpec, TransportSpec};
use crate::mcp::server::McpProxyServer;

/// A live outbound client plus the inbound server republishing it.
pub struct SharedInstance {
    pub client: Arc<McpClient>,
    pub server: Arc<McpProxyServer>,
    pub created_at: OffsetDateTime,
    /// Cancelling stops the pinger and any SSE reader bound to this instance.
    cancel: CancellationToken,
}

impl SharedInstance {
    /// Stop background tasks and close the client. Server state is dropped
    /// with the instance.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.client.close().await;
    }
}

/// Cache of shared instances. The creation lock is held across the whole
/// connect/initialize/populate sequence; service starts are rare enough that
/// serialising them is acceptable.
#[derive(Default)]
pub struct InstanceCache {
    inner: Mutex<HashMap<String, Arc<SharedInstance>>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global-scope cache key for a service.
    pub fn global_key(service_id: i64) -> String {
        format!("global-service-{}-shared", service_id)
    }

    /// Per-user scope cache key.
    pub fn user_key(user_id: i64, service_id: i64) -> String {
        format!("user-{}-service-{}-shared", user_id, service_id)
    }

    pub fn global_label(service_id: i64) -> String {
        format!("global-shared-svc-{}", service_id)
    }

    pub fn user_label(user_id: i64, service_id: i64) -> String {
        format!("user-{}-shared-svc-{}", user_id, service_id)
    }

    /// Return the cached instance for `cache_key`, or build one from the
    /// service config. For stdio scopes `effective_envs_json` replaces the
    /// service's default env JSON (per-user overrides are merged upstream).
    pub async fn get_or_create(
        &self,
        service: &McpService,
        cache_key: &str,
        label: &str,
        effective_envs_json: &str,
    ) -> Result<Arc<SharedInstance>, McpClientError> {
        let mut cache = self.inner.lock().await;

        if let Some(instance) = cache.get(cache_key) {
            return Ok(instance.clone());
        }

        let mut config = service.clone();
        if config.service_type == ServiceType::Stdio && !effective_envs_json.is_empty() {
            config.default_envs_json = effective_envs_json.to_string();
        }

        let instance = build_instance(&config, label).await?;
        let instance = Arc::new(instance);
        cache.insert(cache_key.to_string(), instance.clone());
        tracing::info!(service = %service.name, key = %cache_key, "created shared MCP instance");

        Ok(instance)
    }

    pub async fn get(&self, cache_key: &str) -> Option<Arc<SharedInstance>> {
        self.inner.lock().await.get(cache_key).cloned()
    }

    /// Remove and shut down the instance under `cache_key`.
    pub async fn evict(&self, cache_key: &str) -> bool {
        let removed = self.inner.lock().await.remove(cache_key);
        match removed {
            Some(instance) => {
                tracing::info!(key = %cache_key, "evicting shared MCP instance");
                instance.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Remove and shut down every scope of a service (global and per-user).
    pub async fn evict_service(&self, service_id: i64) {
        let keys: Vec<String> = {
            let cache = self.inner.lock().await;
            let global = Self::global_key(service_id);
            let user_suffix = format!("-service-{}-shared", service_id);
            cache
                .keys()
                .filter(|k| **k == global || (k.starts_with("user-") && k.ends_with(&user_suffix)))
                .cloned()
                .collect()
        };
        for key in keys {
            self.evict(&key).await;
        }
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, Arc<SharedInstance>)> =
            self.inner.lock().await.drain().collect();
        for (key, instance) in drained {
            tracing::info!(key = %key, "shutting down shared MCP instance");
            instance.shutdown().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Build, start, initialize and populate one instance. On any failure the
/// client is closed and the error returned.
async fn build_instance(
    config: &McpService,
    label: &str,
) -> Result<SharedInstance, McpClientError> {
    let spec = transport_spec(config)?;
    let client = Arc::new(McpClient::connect(label, spec)?);
    let cancel = CancellationToken::new();

    if let Err(err) = client.start(&cancel).await {
        cancel.cancel();
        client.close().await;
        return Err(err);
    }

    if config.service_type.is_remote() {
        spawn_pinger(client.clone(), cancel.clone());
    }

    if let Err(err) = client.initialize().await {
        tracing::error!(service = %config.name, error = %err, "initialize failed");
        cancel.cancel();
        client.close().await;
        return Err(err);
    }

    let server = McpProxyServer::populate(&config.name, &config.installed_version, client.clone()).await;

    Ok(SharedInstance {
        client,
        server: Arc::new(server),
        created_at: OffsetDateTime::now_utc(),
        cancel,
    })
}

fn transport_spec(config: &McpService) -> Result<TransportSpec, McpClientError> {
    match config.service_type {
        ServiceType::Stdio => {
            if config.command.is_empty() {
                return Err(McpClientError::Process(format!(
                    "stdio service {} (ID: {}) has an empty command; it was likely \
                     not configured during installation (package manager: {}, package: {})",
                    config.name, config.id, config.package_manager, config.source_package_name
                )));
            }
            Ok(TransportSpec::Stdio(StdioSpec {
                command: config.command.clone(),
                args: config.args(),
                envs: config.default_envs(),
            }))
        }
        ServiceType::Sse => {
            if config.url().is_empty() {
                return Err(McpClientError::Process(format!(
                    "URL is empty for SSE service {} (ID: {})",
                    config.name, config.id
                )));
            }
            Ok(TransportSpec::Sse(RemoteSpec {
                url: config.url().to_string(),
                headers: config.headers(),
            }))
        }
        ServiceType::StreamableHttp => {
            if config.url().is_empty() {
                return Err(McpClientError::Process(format!(
                    "URL is empty for streamable HTTP service {} (ID: {})",
                    config.name, config.id
                )));
            }
            Ok(TransportSpec::StreamableHttp(RemoteSpec {
                url: config.url().to_string(),
                headers: config.headers(),
            }))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::OffsetDateTime;

    /// A stdio service whose backend is a small shell script speaking enough
    /// MCP to initialize and list empty capabilities.
    pub(crate) fn scripted_service(id: i64, name: &str) -> McpService {
        let script = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"scripted","version":"0.1.0"}}}\n' "$id" ;;
    *notifications*) ;;
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id" ;;
    *prompts/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"prompts":[]}}\n' "$id" ;;
    *resources/templates/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"resourceTemplates":[]}}\n' "$id" ;;
    *resources/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;
        let now = OffsetDateTime::now_utc();
        McpService {
            id,
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            category: "utility".to_string(),
            icon: String::new(),
            default_on: true,
            enabled: true,
            service_type: ServiceType::Stdio,
            command: "sh".to_string(),
            args_json: serde_json::to_string(&vec!["-c".to_string(), script.to_string()]).unwrap(),
            default_envs_json: "{}".to_string(),
            headers_json: "{}".to_string(),
            allow_user_override: true,
            required_env_vars_json: "[]".to_string(),
            package_manager: "custom".to_string(),
            source_package_name: name.to_string(),
            installed_version: "0.1.0".to_string(),
            installer_user_id: 0,
            rpd_limit: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_caches_by_key() {
        let cache = InstanceCache::new();
        let service = scripted_service(1, "svc");
        let key = InstanceCache::global_key(1);

        let a = cache
            .get_or_create(&service, &key, "global-shared-svc-1", "{}")
            .await
            .expect("create");
        let b = cache
            .get_or_create(&service, &key, "global-shared-svc-1", "{}")
            .await
            .expect("cached");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 1);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_evict_then_recreate_is_identity_distinct() {
        let cache = InstanceCache::new();
        let service = scripted_service(2, "svc2");
        let key = InstanceCache::global_key(2);

        let first = cache
            .get_or_create(&service, &key, "global-shared-svc-2", "{}")
            .await
            .expect("create");
        assert!(cache.evict(&key).await);

        let second = cache
            .get_or_create(&service, &key, "global-shared-svc-2", "{}")
            .await
            .expect("recreate");
        assert!(!Arc::ptr_eq(&first, &second));

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_user_scope_is_distinct_from_global() {
        let cache = InstanceCache::new();
        let service = scripted_service(3, "svc3");

        let global = cache
            .get_or_create(
                &service,
                &InstanceCache::global_key(3),
                "global-shared-svc-3",
                "{}",
            )
            .await
            .expect("global");
        let user = cache
            .get_or_create(
                &service,
                &InstanceCache::user_key(7, 3),
                "user-7-shared-svc-3",
                r#"{"API_KEY":"user"}"#,
            )
            .await
            .expect("user");
        assert!(!Arc::ptr_eq(&global, &user));
        assert_eq!(cache.len().await, 2);

        cache.evict_service(3).await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_missing_command_fails_creation() {
        let cache = InstanceCache::new();
        let mut service = scripted_service(4, "svc4");
        service.command = String::new();

        let result = cache
            .get_or_create(
                &service,
                &InstanceCache::global_key(4),
                "global-shared-svc-4",
                "{}",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(cache.len().await, 0);
    }

    #[test]
    fn test_cache_keys() {
        assert_eq!(InstanceCache::global_key(5), "global-service-5-shared");
        assert_eq!(InstanceCache::user_key(2, 5), "user-2-service-5-shared");
    }
}
