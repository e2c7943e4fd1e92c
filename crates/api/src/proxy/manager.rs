//! Service manager: the top-level registry of running services. Owns the
//! health supervisor and the auto-restart daemon.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use mcpgate_shared::{GatewayError, Kv, McpService, ServiceHealth, ServiceStatus, ServiceType};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::registry;

use super::handlers::HandlerCache;
use super::health::{HealthChecker, DEFAULT_CHECK_INTERVAL};
use super::instance::InstanceCache;
use super::service::MonitoredService;

/// Deadline for a full unregister (stop + evict + cleanup).
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(30);
/// Cadence of the stopped-service auto-restart daemon.
const AUTO_RESTART_INTERVAL: Duration = Duration::from_secs(600);

/// Top-level registry of `MonitoredService` objects.
pub struct ServiceManager {
    services: StdRwLock<HashMap<i64, Arc<MonitoredService>>>,
    checker: Arc<HealthChecker>,
    instances: Arc<InstanceCache>,
    handlers: Arc<HandlerCache>,
    pool: SqlitePool,
    cancel: CancellationToken,
}

impl ServiceManager {
    pub fn new(
        pool: SqlitePool,
        kv: Kv,
        instances: Arc<InstanceCache>,
        handlers: Arc<HandlerCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services: StdRwLock::new(HashMap::new()),
            checker: Arc::new(HealthChecker::new(DEFAULT_CHECK_INTERVAL, kv)),
            instances,
            handlers,
            pool,
            cancel: CancellationToken::new(),
        })
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn instances(&self) -> &Arc<InstanceCache> {
        &self.instances
    }

    /// Start supervision and register every enabled, live service. A failing
    /// registration is logged and skipped; the rest still come up.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.checker.start();
        self.spawn_auto_restart();

        let services = registry::list_enabled(&self.pool).await?;
        for config in services {
            if let Err(err) = self.register_service(&config).await {
                tracing::error!(
                    service = %config.name,
                    id = config.id,
                    error = %err,
                    "failed to register service at startup"
                );
            }
        }
        Ok(())
    }

    /// Build a monitored service for the config and add it to the registry.
    ///
    /// The factory never fails: when the shared instance cannot be created the
    /// service is registered anyway with an `Unhealthy` initial health, so the
    /// supervisor can keep retrying it.
    pub async fn register_service(&self, config: &McpService) -> Result<(), GatewayError> {
        if self.services.read().unwrap().contains_key(&config.id) {
            return Err(GatewayError::Conflict("service already exists".to_string()));
        }

        let key = InstanceCache::global_key(config.id);
        let label = InstanceCache::global_label(config.id);
        let instance = match self
            .instances
            .get_or_create(config, &key, &label, &config.default_envs_json)
            .await
        {
            Ok(instance) => Some(instance),
            Err(err) => {
                tracing::error!(
                    service = %config.name,
                    id = config.id,
                    error = %err,
                    "shared instance creation failed; registering unhealthy"
                );
                None
            }
        };

        let creation_error = instance.is_none();
        let service = Arc::new(MonitoredService::new(
            config.clone(),
            instance,
            self.instances.clone(),
        ));
        if creation_error {
            service.update_health(
                ServiceStatus::Unhealthy,
                0,
                "Failed to initialize shared MCP instance",
            );
        }

        {
            let mut services = self.services.write().unwrap();
            if services.contains_key(&config.id) {
                return Err(GatewayError::Conflict("service already exists".to_string()));
            }
            services.insert(config.id, service.clone());
        }
        self.checker.register(service.clone());

        if config.default_on && config.enabled {
            if let Err(err) = service.start().await {
                tracing::error!(service = %config.name, id = config.id, error = %err, "start failed");
            }
        }

        Ok(())
    }

    /// Remove a service under a 30 s deadline. A deadline overrun surfaces as
    /// `Timeout` so the uninstall path can skip physical uninstall and still
    /// soft-delete.
    pub async fn unregister_service(&self, service_id: i64) -> Result<(), GatewayError> {
        match tokio::time::timeout(UNREGISTER_TIMEOUT, self.unregister_inner(service_id)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "unregistering service {} exceeded {:?}",
                service_id, UNREGISTER_TIMEOUT
            ))),
        }
    }

    async fn unregister_inner(&self, service_id: i64) -> Result<(), GatewayError> {
        let service = self
            .get_service(service_id)
            .ok_or_else(|| GatewayError::NotFound(format!("service {} not found", service_id)))?;

        if service.is_running() {
            service.stop().await;
        }

        self.instances.evict_service(service_id).await;
        self.handlers.invalidate_service(service_id);
        self.checker.unregister(service_id);
        self.checker.delete_health(service_id);
        self.services.write().unwrap().remove(&service_id);

        tracing::info!(id = service_id, "service unregistered");
        Ok(())
    }

    pub fn get_service(&self, service_id: i64) -> Option<Arc<MonitoredService>> {
        self.services.read().unwrap().get(&service_id).cloned()
    }

    pub fn all_services(&self) -> Vec<Arc<MonitoredService>> {
        self.services.read().unwrap().values().cloned().collect()
    }

    /// Specialised SSE lookup used by admin paths.
    pub fn get_sse_service_by_name(&self, name: &str) -> Option<Arc<MonitoredService>> {
        self.services
            .read()
            .unwrap()
            .values()
            .find(|s| s.name() == name && s.config().service_type == ServiceType::Sse)
            .cloned()
    }

    pub async fn start_service(&self, service_id: i64) -> Result<(), GatewayError> {
        let service = self
            .get_service(service_id)
            .ok_or_else(|| GatewayError::NotFound(format!("service {} not found", service_id)))?;
        if service.is_running() {
            return Ok(());
        }
        service
            .start()
            .await
            .map_err(GatewayError::Unavailable)
    }

    pub async fn stop_service(&self, service_id: i64) -> Result<(), GatewayError> {
        let service = self
            .get_service(service_id)
            .ok_or_else(|| GatewayError::NotFound(format!("service {} not found", service_id)))?;
        if service.is_running() {
            service.stop().await;
        }
        Ok(())
    }

    pub async fn restart_service(&self, service_id: i64) -> Result<(), GatewayError> {
        let service = self
            .get_service(service_id)
            .ok_or_else(|| GatewayError::NotFound(format!("service {} not found", service_id)))?;
        if service.is_running() {
            service.stop().await;
        }
        service
            .start()
            .await
            .map_err(GatewayError::Unavailable)
    }

    pub async fn force_check(&self, service_id: i64) -> Result<ServiceHealth, GatewayError> {
        self.checker.force_check(service_id).await
    }

    pub fn service_health(&self, service_id: i64) -> Result<ServiceHealth, GatewayError> {
        self.checker.service_health(service_id)
    }

    /// Push the service's current health into the KV cache.
    pub async fn refresh_health_snapshot(&self, service_id: i64) -> Result<(), GatewayError> {
        let health = self.service_health(service_id)?;
        self.checker.force_write(service_id, &health);
        Ok(())
    }

    /// Every ten minutes, force-check each service and restart stopped ones.
    /// Failures are logged and never abort the loop.
    fn spawn_auto_restart(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTO_RESTART_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for service in manager.all_services() {
                            let health = match manager.force_check(service.id()).await {
                                Ok(health) => health,
                                Err(_) => continue,
                            };
                            if health.status == ServiceStatus::Stopped {
                                match manager.restart_service(service.id()).await {
                                    Ok(()) => tracing::info!(
                                        service = %service.name(),
                                        id = service.id(),
                                        "auto-restarted stopped service"
                                    ),
                                    Err(err) => tracing::error!(
                                        service = %service.name(),
                                        id = service.id(),
                                        error = %err,
                                        "auto-restart failed"
                                    ),
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// Graceful shutdown: stop supervision, stop services, close instances.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.checker.stop();

        let services = self.all_services();
        for service in services {
            if service.is_running() {
                service.stop().await;
            }
        }

        self.instances.shutdown_all().await;
        self.services.write().unwrap().clear();
        tracing::info!("service manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::instance::tests::scripted_service;
    use crate::registry::NewService;
    use mcpgate_shared::db::{create_memory_pool, run_migrations};

    async fn test_manager() -> (Arc<ServiceManager>, SqlitePool) {
        let pool = create_memory_pool().await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        let manager = ServiceManager::new(
            pool.clone(),
            Kv::new(),
            Arc::new(InstanceCache::new()),
            Arc::new(HandlerCache::new()),
        );
        (manager, pool)
    }

    #[tokio::test]
    async fn test_register_starts_default_on_service() {
        let (manager, _pool) = test_manager().await;
        let config = scripted_service(50, "svc50");

        manager.register_service(&config).await.expect("register");
        let service = manager.get_service(50).expect("registered");
        assert!(service.is_running());
        assert_eq!(manager.instances().len().await, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let (manager, _pool) = test_manager().await;
        let config = scripted_service(51, "svc51");

        manager.register_service(&config).await.expect("register");
        let result = manager.register_service(&config).await;
        assert!(matches!(result, Err(GatewayError::Conflict(_))));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_factory_registers_unhealthy_on_creation_failure() {
        let (manager, _pool) = test_manager().await;
        let mut config = scripted_service(52, "svc52");
        config.command = String::new(); // stdio with no command cannot build

        manager.register_service(&config).await.expect("still registers");
        let service = manager.get_service(52).expect("registered");
        assert_eq!(service.get_health().status, ServiceStatus::Unhealthy);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_clears_everything() {
        let (manager, _pool) = test_manager().await;
        let config = scripted_service(53, "svc53");

        manager.register_service(&config).await.expect("register");
        manager.unregister_service(53).await.expect("unregister");

        assert!(manager.get_service(53).is_none());
        assert_eq!(manager.instances().len().await, 0);
        assert!(manager.force_check(53).await.is_err());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_and_restart_are_idempotent() {
        let (manager, _pool) = test_manager().await;
        let config = scripted_service(54, "svc54");

        manager.register_service(&config).await.expect("register");
        manager.stop_service(54).await.expect("stop");
        manager.stop_service(54).await.expect("stop again");
        assert!(!manager.get_service(54).unwrap().is_running());

        manager.restart_service(54).await.expect("restart");
        assert!(manager.get_service(54).unwrap().is_running());
        manager.start_service(54).await.expect("start is a no-op while running");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_loads_enabled_services() {
        let (manager, pool) = test_manager().await;

        // One enabled scripted service in the DB; one disabled.
        let scripted = scripted_service(0, "ignored");
        crate::registry::create(
            &pool,
            &NewService {
                name: "alpha".to_string(),
                display_name: "alpha".to_string(),
                command: scripted.command.clone(),
                args_json: scripted.args_json.clone(),
                package_manager: "custom".to_string(),
                ..NewService::default()
            },
        )
        .await
        .expect("create alpha");
        crate::registry::create(
            &pool,
            &NewService {
                name: "beta".to_string(),
                display_name: "beta".to_string(),
                enabled: false,
                command: "sh".to_string(),
                package_manager: "custom".to_string(),
                ..NewService::default()
            },
        )
        .await
        .expect("create beta");

        manager.initialize().await.expect("initialize");
        assert_eq!(manager.all_services().len(), 1);

        manager.shutdown().await;
    }
}
