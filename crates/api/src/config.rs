//! Application configuration

use std::env;

/// Gateway configuration assembled from environment variables and CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port.
    pub port: u16,
    /// SQLite database file path.
    pub sqlite_path: String,
    /// Upload directory (used by the excluded UI layer; accepted for parity).
    pub upload_path: String,
    /// HS256 secret for access tokens.
    pub jwt_secret: String,
    /// Whether gzip response compression is enabled.
    pub enable_gzip: bool,
    /// Optional GitHub token for star enrichment.
    pub github_token: Option<String>,
    /// Optional directory for file logging.
    pub log_dir: Option<String>,
}

impl Config {
    /// Load configuration from environment variables. CLI flags are applied on
    /// top by `main`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid("PORT"))?,
            Err(_) => 3000,
        };

        Ok(Self {
            port,
            sqlite_path: env::var("SQLITE_PATH").unwrap_or_else(|_| "data/mcpgate.db".to_string()),
            upload_path: env::var("UPLOAD_PATH").unwrap_or_else(|_| "data/upload".to_string()),
            jwt_secret: env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?,
            enable_gzip: env::var("ENABLE_GZIP")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            github_token: env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            log_dir: None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests mutate shared process env and must run serially.
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_and_required_secret() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        env::remove_var("PORT");
        env::remove_var("SQLITE_PATH");
        env::remove_var("ENABLE_GZIP");
        env::remove_var("JWT_SECRET");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("JWT_SECRET"))
        ));

        env::set_var("JWT_SECRET", "test-secret");
        let config = Config::from_env().expect("config");
        assert_eq!(config.port, 3000);
        assert_eq!(config.sqlite_path, "data/mcpgate.db");
        assert!(config.enable_gzip);

        env::set_var("ENABLE_GZIP", "false");
        let config = Config::from_env().expect("config");
        assert!(!config.enable_gzip);

        env::remove_var("ENABLE_GZIP");
        env::remove_var("JWT_SECRET");
    }

    #[test]
    fn test_invalid_port_rejected() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        env::set_var("JWT_SECRET", "test-secret");
        env::set_var("PORT", "not-a-port");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("PORT"))
        ));
        env::remove_var("PORT");
        env::remove_var("JWT_SECRET");
    }
}
