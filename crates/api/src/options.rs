//! Persisted key/value settings (`options` table) with an in-memory map.

use std::collections::HashMap;
use std::sync::RwLock;

use mcpgate_shared::GatewayError;
use sqlx::SqlitePool;

pub const OPT_SERVER_ADDRESS: &str = "ServerAddress";
pub const OPT_ENABLE_GZIP: &str = "EnableGzip";

/// Options store. Reads come from the cached map; writes go through to the
/// database and refresh the map.
pub struct Options {
    pool: SqlitePool,
    map: RwLock<HashMap<String, String>>,
}

impl Options {
    pub async fn load(pool: SqlitePool) -> Result<Self, GatewayError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM options")
            .fetch_all(&pool)
            .await
            .map_err(GatewayError::from)?;

        Ok(Self {
            pool,
            map: RwLock::new(rows.into_iter().collect()),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.map.read().unwrap().clone()
    }

    /// External base URL of this gateway, used to build SSE callback URLs.
    /// Falls back to localhost with the configured port. A single trailing
    /// slash is trimmed so joined paths stay canonical.
    pub fn server_address(&self, port: u16) -> String {
        let address = self
            .get(OPT_SERVER_ADDRESS)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("http://localhost:{}", port));
        address.trim_end_matches('/').to_string()
    }

    /// Gzip is on unless explicitly set to "false".
    pub fn gzip_enabled(&self) -> bool {
        self.get(OPT_ENABLE_GZIP).as_deref() != Some("false")
    }

    /// Upsert one option. Returns true when the value actually changed, so
    /// the caller can invalidate anything derived from it.
    pub async fn set(&self, key: &str, value: &str) -> Result<bool, GatewayError> {
        let previous = self.get(key);
        if previous.as_deref() == Some(value) {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO options (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;

        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(true)
    }
}
