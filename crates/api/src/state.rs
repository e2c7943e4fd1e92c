//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use mcpgate_shared::db::{create_pool, run_migrations};
use mcpgate_shared::{GatewayError, Kv};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::install::batch::BatchImportManager;
use crate::install::InstallationManager;
use crate::options::Options;
use crate::proxy::{HandlerCache, InstanceCache, ServiceManager, SessionRegistry};

/// Process-wide state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub kv: Kv,
    pub config: Arc<Config>,
    pub options: Arc<Options>,
    pub manager: Arc<ServiceManager>,
    pub instances: Arc<InstanceCache>,
    pub handlers: Arc<HandlerCache>,
    pub sessions: Arc<SessionRegistry>,
    pub installer: Arc<InstallationManager>,
    pub batch: Arc<BatchImportManager>,
    /// Outbound client for registry/GitHub calls (per-request timeouts apply).
    pub http: reqwest::Client,
}

impl AppState {
    /// Open the database, run migrations, and wire the component graph.
    pub async fn build(config: Config) -> Result<Self, GatewayError> {
        let pool = create_pool(&config.sqlite_path)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to open database: {}", e)))?;
        run_migrations(&pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to run migrations: {}", e)))?;

        Self::from_pool(config, pool).await
    }

    /// Build on an existing pool; tests use this with in-memory SQLite.
    pub async fn from_pool(config: Config, pool: SqlitePool) -> Result<Self, GatewayError> {
        let kv = Kv::new();
        let options = Arc::new(Options::load(pool.clone()).await?);
        let instances = Arc::new(InstanceCache::new());
        let handlers = Arc::new(HandlerCache::new());
        let manager = ServiceManager::new(
            pool.clone(),
            kv.clone(),
            instances.clone(),
            handlers.clone(),
        );
        let installer = InstallationManager::new(pool.clone(), kv.clone());

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Ok(Self {
            pool,
            kv,
            config: Arc::new(config),
            options,
            manager,
            instances,
            handlers,
            sessions: Arc::new(SessionRegistry::new()),
            installer,
            batch: BatchImportManager::new(),
            http,
        })
    }

    /// External callback base for SSE handlers: `<ServerAddress>/proxy`.
    pub fn proxy_base_url(&self) -> String {
        format!("{}/proxy", self.options.server_address(self.config.port))
    }
}
