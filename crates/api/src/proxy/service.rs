//! Monitored service: a registered service plus its shared instance and the
//! originating config needed to rebuild it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use mcpgate_shared::{McpService, ServiceHealth, ServiceStatus};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::instance::{InstanceCache, SharedInstance};

/// Health-check deadline hints per transport; stdio backends may need to cold
/// start a package runner.
pub const STDIO_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

struct ServiceState {
    running: bool,
    health: ServiceHealth,
    last_start: Option<Instant>,
}

/// A service under management, health-checked through its shared instance.
pub struct MonitoredService {
    config: McpService,
    cache: Arc<InstanceCache>,
    instance: Mutex<Option<Arc<SharedInstance>>>,
    state: StdMutex<ServiceState>,
}

impl MonitoredService {
    pub fn new(
        config: McpService,
        instance: Option<Arc<SharedInstance>>,
        cache: Arc<InstanceCache>,
    ) -> Self {
        Self {
            config,
            cache,
            instance: Mutex::new(instance),
            state: StdMutex::new(ServiceState {
                running: false,
                health: ServiceHealth::unknown(),
                last_start: None,
            }),
        }
    }

    pub fn id(&self) -> i64 {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &McpService {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Suggested deadline for one health check of this service.
    pub fn health_check_timeout(&self) -> Duration {
        if self.config.service_type == mcpgate_shared::ServiceType::Stdio {
            STDIO_CHECK_TIMEOUT
        } else {
            DEFAULT_CHECK_TIMEOUT
        }
    }

    /// Last recorded health, with uptime recomputed for running services.
    pub fn get_health(&self) -> ServiceHealth {
        let state = self.state.lock().unwrap();
        let mut health = state.health.clone();
        if state.running {
            if let Some(last_start) = state.last_start {
                health.up_time_seconds = last_start.elapsed().as_secs() as i64;
            }
        }
        health
    }

    /// Record an externally observed health transition (used by the factory
    /// when instance creation fails at registration time).
    pub fn update_health(&self, status: ServiceStatus, response_time_ms: i64, error: &str) {
        let mut state = self.state.lock().unwrap();
        state.health.status = status;
        state.health.last_checked = OffsetDateTime::now_utc();
        state.health.response_time_ms = response_time_ms;
        state.health.error_message = error.to_string();
        match status {
            ServiceStatus::Healthy => state.health.success_count += 1,
            ServiceStatus::Unhealthy => state.health.failure_count += 1,
            _ => {}
        }
        state.health.recompute_warning_level();
    }

    pub async fn instance(&self) -> Option<Arc<SharedInstance>> {
        self.instance.lock().await.clone()
    }

    /// Start the service: mark running and make sure the shared instance
    /// exists. Idempotent.
    pub async fn start(&self) -> Result<(), String> {
        {
            let mut state = self.state.lock().unwrap();
            state.running = true;
            state.last_start = Some(Instant::now());
            state.health.status = ServiceStatus::Starting;
            state.health.start_time = Some(OffsetDateTime::now_utc());
        }

        let mut slot = self.instance.lock().await;
        if slot.is_none() {
            if let Err(err) = self.rebuild(&mut slot, "start").await {
                let message = format!("Failed to recreate shared instance on start: {}", err);
                self.update_health(ServiceStatus::Unhealthy, 0, &message);
                tracing::error!(service = %self.config.name, error = %err, "start failed");
                return Err(message);
            }
        }

        let mut state = self.state.lock().unwrap();
        state.health.status = ServiceStatus::Healthy;
        state.health.error_message.clear();
        Ok(())
    }

    /// Stop the service. The shared instance itself is cleaned up by cache
    /// management (eviction or unregister).
    pub async fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.health.status = ServiceStatus::Stopped;
    }

    async fn rebuild(
        &self,
        slot: &mut Option<Arc<SharedInstance>>,
        tag: &str,
    ) -> Result<(), String> {
        let key = InstanceCache::global_key(self.config.id);
        let label = format!("{}-{}", InstanceCache::global_label(self.config.id), tag);
        match self
            .cache
            .get_or_create(&self.config, &key, &label, &self.config.default_envs_json)
            .await
        {
            Ok(instance) => {
                *slot = Some(instance);
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    /// Deep health check through the shared instance.
    ///
    /// A missing instance is rebuilt and immediately re-pinged. A ping failure
    /// on a remote transport evicts, rebuilds, and re-pings once; stdio ping
    /// failures are left to the auto-restart daemon. Returns the updated
    /// snapshot plus the error message when the check ultimately failed.
    pub async fn check_health(&self) -> (ServiceHealth, Option<String>) {
        let started = Instant::now();
        let mut slot = self.instance.lock().await;

        // Ok(reset) means healthy; reset clears the failure streak after a
        // successful rebuild.
        let outcome: Result<bool, String> = match slot.clone() {
            None => match self.rebuild(&mut slot, "reinit").await {
                Err(err) => Err(format!("Initial re-creation attempt failed: {}", err)),
                Ok(()) => {
                    let instance = slot.as_ref().expect("instance just set").clone();
                    match instance.client.ping().await {
                        Err(err) => Err(format!(
                            "Re-ping after initial client creation failed: {}",
                            err
                        )),
                        Ok(()) => Ok(true),
                    }
                }
            },

            Some(instance) => match instance.client.ping().await {
                Ok(()) => Ok(false),
                Err(ping_err) if self.config.service_type.is_remote() => {
                    tracing::info!(
                        service = %self.config.name,
                        error = %ping_err,
                        "ping failed for remote service, re-establishing client"
                    );

                    *slot = None;
                    self.cache
                        .evict(&InstanceCache::global_key(self.config.id))
                        .await;

                    match self.rebuild(&mut slot, "recreated").await {
                        Err(err) => Err(format!(
                            "Client re-creation failed after ping error '{}': {}",
                            ping_err, err
                        )),
                        Ok(()) => {
                            let instance = slot.as_ref().expect("instance just set").clone();
                            match instance.client.ping().await {
                                Err(err) => Err(format!(
                                    "Re-ping after client re-creation failed: {} (original ping error: {})",
                                    err, ping_err
                                )),
                                Ok(()) => Ok(true),
                            }
                        }
                    }
                }
                Err(ping_err) => Err(format!("Ping failed: {}", ping_err)),
            },
        };

        drop(slot);

        let mut state = self.state.lock().unwrap();
        let error = match &outcome {
            Ok(reset) => {
                state.health.status = ServiceStatus::Healthy;
                state.health.error_message.clear();
                if *reset {
                    state.health.failure_count = 0;
                }
                state.health.success_count += 1;
                None
            }
            Err(message) => {
                state.health.status = ServiceStatus::Unhealthy;
                state.health.error_message = message.clone();
                state.health.failure_count += 1;
                Some(message.clone())
            }
        };

        state.health.last_checked = OffsetDateTime::now_utc();
        state.health.response_time_ms = started.elapsed().as_millis() as i64;
        state.health.recompute_warning_level();
        if state.running {
            if let Some(last_start) = state.last_start {
                state.health.up_time_seconds = last_start.elapsed().as_secs() as i64;
            }
        }

        (state.health.clone(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::instance::tests::scripted_service;

    #[tokio::test]
    async fn test_start_creates_instance_and_marks_healthy() {
        let cache = Arc::new(InstanceCache::new());
        let service = MonitoredService::new(scripted_service(10, "svc10"), None, cache.clone());

        assert!(!service.is_running());
        service.start().await.expect("start");
        assert!(service.is_running());
        assert_eq!(service.get_health().status, ServiceStatus::Healthy);
        assert!(service.instance().await.is_some());

        service.stop().await;
        assert!(!service.is_running());
        assert_eq!(service.get_health().status, ServiceStatus::Stopped);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_check_health_rebuilds_missing_instance() {
        let cache = Arc::new(InstanceCache::new());
        let service = MonitoredService::new(scripted_service(11, "svc11"), None, cache.clone());

        let (health, error) = service.check_health().await;
        assert!(error.is_none());
        assert_eq!(health.status, ServiceStatus::Healthy);
        assert_eq!(health.failure_count, 0);
        assert!(health.success_count >= 1);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_check_health_failure_counts_up() {
        let cache = Arc::new(InstanceCache::new());
        let mut config = scripted_service(12, "svc12");
        config.command = "false".to_string(); // exits immediately, ping gets EOF
        config.args_json = "[]".to_string();
        let service = MonitoredService::new(config, None, cache.clone());

        let (health, error) = service.check_health().await;
        assert!(error.is_some());
        assert_eq!(health.status, ServiceStatus::Unhealthy);
        assert_eq!(health.failure_count, 1);
        assert_eq!(health.warning_level, 1);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_timeout_hints() {
        let cache = Arc::new(InstanceCache::new());
        let stdio = MonitoredService::new(scripted_service(13, "svc13"), None, cache.clone());
        assert_eq!(stdio.health_check_timeout(), STDIO_CHECK_TIMEOUT);

        let mut remote_config = scripted_service(14, "svc14");
        remote_config.service_type = mcpgate_shared::ServiceType::Sse;
        remote_config.command = "http://127.0.0.1:9/sse".to_string();
        let remote = MonitoredService::new(remote_config, None, cache.clone());
        assert_eq!(remote.health_check_timeout(), DEFAULT_CHECK_TIMEOUT);
    }
}
