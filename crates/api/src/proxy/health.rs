//! Health supervisor: periodic checks over every registered service, with
//! KV-backed snapshots and a forced-check path for management APIs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use mcpgate_shared::kv::health_key;
use mcpgate_shared::{GatewayError, Kv, ServiceHealth, ServiceStatus};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::service::MonitoredService;

/// How long a snapshot stays in the KV cache.
const HEALTH_TTL: Duration = Duration::from_secs(60 * 60);
/// Background checks skip the KV write when the last one was this recent.
const WRITE_THROTTLE: Duration = Duration::from_secs(5);
/// Deadline for a forced (synchronous) check.
const FORCE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default background check cadence.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically pings every registered service and stores snapshots in KV.
pub struct HealthChecker {
    services: StdRwLock<HashMap<i64, Arc<MonitoredService>>>,
    check_interval: Duration,
    kv: Kv,
    cancel: CancellationToken,
    running: AtomicBool,
    last_updates: StdMutex<HashMap<i64, Instant>>,
}

impl HealthChecker {
    pub fn new(check_interval: Duration, kv: Kv) -> Self {
        let check_interval = if check_interval.is_zero() {
            DEFAULT_CHECK_INTERVAL
        } else {
            check_interval
        };

        Self {
            services: StdRwLock::new(HashMap::new()),
            check_interval,
            kv,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            last_updates: StdMutex::new(HashMap::new()),
        }
    }

    /// Start the background ticker. Performs an immediate pass first.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let checker = self.clone();
        tokio::spawn(async move {
            checker.check_all();

            let mut ticker = tokio::time::interval(checker.check_interval);
            ticker.tick().await; // immediate tick consumed above

            loop {
                tokio::select! {
                    _ = checker.cancel.cancelled() => break,
                    _ = ticker.tick() => checker.check_all(),
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Register a service. When the checker is already running a new service
    /// gets an immediate one-shot check.
    pub fn register(self: &Arc<Self>, service: Arc<MonitoredService>) {
        let existed = self
            .services
            .write()
            .unwrap()
            .insert(service.id(), service.clone())
            .is_some();

        if !existed && self.running.load(Ordering::SeqCst) {
            tracing::info!(service = %service.name(), id = service.id(), "scheduling immediate check for new service");
            let checker = self.clone();
            tokio::spawn(async move {
                checker.check_service(service).await;
            });
        }
    }

    pub fn unregister(&self, service_id: i64) {
        self.services.write().unwrap().remove(&service_id);
        self.last_updates.lock().unwrap().remove(&service_id);
    }

    fn check_all(self: &Arc<Self>) {
        let services: Vec<Arc<MonitoredService>> =
            self.services.read().unwrap().values().cloned().collect();
        for service in services {
            let checker = self.clone();
            tokio::spawn(async move {
                checker.check_service(service).await;
            });
        }
    }

    async fn check_service(&self, service: Arc<MonitoredService>) {
        let deadline = service.health_check_timeout();
        let health = match tokio::time::timeout(deadline, service.check_health()).await {
            Ok((health, error)) => {
                if let Some(error) = error {
                    tracing::warn!(
                        service = %service.name(),
                        id = service.id(),
                        error = %error,
                        "health check failed"
                    );
                }
                health
            }
            Err(_) => ServiceHealth::unhealthy(format!(
                "health check timed out after {:?}",
                deadline
            )),
        };

        self.write_health_throttled(service.id(), &health);
    }

    fn write_health_throttled(&self, service_id: i64, health: &ServiceHealth) {
        {
            let last_updates = self.last_updates.lock().unwrap();
            if let Some(last) = last_updates.get(&service_id) {
                if last.elapsed() < WRITE_THROTTLE {
                    return;
                }
            }
        }
        self.write_health(service_id, health);
    }

    fn write_health(&self, service_id: i64, health: &ServiceHealth) {
        match serde_json::to_string(health) {
            Ok(json) => {
                self.kv.set(&health_key(service_id), &json, Some(HEALTH_TTL));
                self.last_updates
                    .lock()
                    .unwrap()
                    .insert(service_id, Instant::now());
            }
            Err(err) => {
                tracing::error!(id = service_id, error = %err, "failed to encode health snapshot");
            }
        }
    }

    /// Cached snapshot for a service, if present and decodable.
    pub fn health_snapshot(&self, service_id: i64) -> Option<ServiceHealth> {
        let raw = self.kv.get(&health_key(service_id))?;
        match serde_json::from_str(&raw) {
            Ok(health) => Some(health),
            Err(err) => {
                tracing::warn!(id = service_id, error = %err, "dropping undecodable health snapshot");
                self.kv.delete(&health_key(service_id));
                None
            }
        }
    }

    pub fn delete_health(&self, service_id: i64) {
        self.kv.delete(&health_key(service_id));
    }

    /// Unthrottled snapshot write, for callers that just produced a fresh
    /// health object.
    pub fn force_write(&self, service_id: i64, health: &ServiceHealth) {
        self.write_health(service_id, health);
    }

    /// Last health reported by the service object itself (not the KV cache).
    pub fn service_health(&self, service_id: i64) -> Result<ServiceHealth, GatewayError> {
        let service = self
            .services
            .read()
            .unwrap()
            .get(&service_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::NotFound("service not registered to health checker".to_string())
            })?;
        Ok(service.get_health())
    }

    /// Synchronous check bypassing the write throttle. Check errors never
    /// propagate: they are materialised as an `Unhealthy` snapshot and the
    /// call returns `Ok`.
    pub async fn force_check(&self, service_id: i64) -> Result<ServiceHealth, GatewayError> {
        let service = self
            .services
            .read()
            .unwrap()
            .get(&service_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::NotFound("service not registered to health checker".to_string())
            })?;

        let started = Instant::now();
        let mut health = match tokio::time::timeout(FORCE_CHECK_TIMEOUT, service.check_health()).await
        {
            Ok((health, error)) => {
                if let Some(error) = error {
                    tracing::warn!(
                        service = %service.name(),
                        id = service_id,
                        error = %error,
                        "forced health check reported an error"
                    );
                }
                health
            }
            Err(_) => {
                let mut timed_out = ServiceHealth::unhealthy(format!(
                    "health check timed out after {:?}",
                    FORCE_CHECK_TIMEOUT
                ));
                timed_out.response_time_ms = started.elapsed().as_millis() as i64;
                timed_out
            }
        };

        health.last_checked = OffsetDateTime::now_utc();
        if health.status != ServiceStatus::Healthy && health.error_message.is_empty() {
            health.error_message = "health check failed".to_string();
        }

        self.write_health(service_id, &health);
        Ok(health)
    }
}
