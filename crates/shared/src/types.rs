//! Domain and row types shared across the mcpgate platform.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// Roles
// =============================================================================

pub const ROLE_COMMON: i64 = 1;
pub const ROLE_ADMIN: i64 = 10;
pub const ROLE_ROOT: i64 = 100;

// =============================================================================
// Service types
// =============================================================================

/// Transport kind of an MCP backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ServiceType {
    Stdio,
    Sse,
    StreamableHttp,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Stdio => "stdio",
            ServiceType::Sse => "sse",
            ServiceType::StreamableHttp => "streamable_http",
        }
    }

    /// Remote transports hold their URL in the `command` column.
    pub fn is_remote(&self) -> bool {
        matches!(self, ServiceType::Sse | ServiceType::StreamableHttp)
    }
}

/// A registered MCP service row (`mcp_services`).
///
/// For SSE / streamable-HTTP services the backend URL is co-stored in
/// `command`; `args_json`, `default_envs_json` and `headers_json` hold
/// JSON-encoded values so the row stays flat.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct McpService {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
    pub default_on: bool,
    pub enabled: bool,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub command: String,
    pub args_json: String,
    pub default_envs_json: String,
    pub headers_json: String,
    pub allow_user_override: bool,
    pub required_env_vars_json: String,
    pub package_manager: String,
    pub source_package_name: String,
    pub installed_version: String,
    pub installer_user_id: i64,
    pub rpd_limit: i64,
    pub deleted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl McpService {
    /// Parsed argument list; malformed JSON yields an empty list.
    pub fn args(&self) -> Vec<String> {
        if self.args_json.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.args_json).unwrap_or_default()
    }

    /// Parsed default environment map; malformed JSON yields an empty map.
    pub fn default_envs(&self) -> HashMap<String, String> {
        if self.default_envs_json.is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&self.default_envs_json).unwrap_or_default()
    }

    /// Parsed custom request headers for remote transports.
    pub fn headers(&self) -> HashMap<String, String> {
        if self.headers_json.is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&self.headers_json).unwrap_or_default()
    }

    pub fn required_env_vars(&self) -> Vec<EnvVarDefinition> {
        if self.required_env_vars_json.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.required_env_vars_json).unwrap_or_default()
    }

    /// Backend URL for remote transports.
    pub fn url(&self) -> &str {
        &self.command
    }
}

/// A required environment variable discovered for a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVarDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default_value: String,
}

/// Names containing token/key/secret material are treated as secrets.
pub fn is_secret_env_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    lowered.contains("token") || lowered.contains("key") || lowered.contains("secret")
}

// =============================================================================
// Name sanitisation
// =============================================================================

/// Slugify a user-supplied service name: trim, map whitespace and `/` to `-`,
/// collapse repeated dashes, trim leading/trailing dashes, lowercase ASCII.
/// Non-ASCII letters pass through untouched. Idempotent.
pub fn sanitize_service_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut name = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            ' ' | '\t' | '\n' | '\r' | '/' => name.push('-'),
            c => name.push(c.to_ascii_lowercase()),
        }
    }
    while name.contains("--") {
        name = name.replace("--", "-");
    }
    name.trim_matches('-').to_string()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

/// Point-in-time health snapshot for a service. Stored JSON-encoded in the KV
/// cache under `health:service:<id>` with a 1 h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: ServiceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_checked: OffsetDateTime,
    #[serde(default, rename = "response_time_ms")]
    pub response_time_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    /// Informational note, e.g. the install probe's protocol version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub failure_count: i64,
    #[serde(default, rename = "up_time_seconds")]
    pub up_time_seconds: i64,
    #[serde(default)]
    pub warning_level: u8,
}

impl ServiceHealth {
    pub fn unknown() -> Self {
        Self {
            status: ServiceStatus::Unknown,
            last_checked: OffsetDateTime::now_utc(),
            response_time_ms: 0,
            error_message: String::new(),
            message: String::new(),
            start_time: None,
            success_count: 0,
            failure_count: 0,
            up_time_seconds: 0,
            warning_level: 0,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        let mut health = Self::unknown();
        health.status = ServiceStatus::Unhealthy;
        health.error_message = message.into();
        health.failure_count = 1;
        health.recompute_warning_level();
        health
    }

    /// Warning level: 0 when healthy, then 1 / 2 / 3 as failures accumulate
    /// past the 3 and 10 thresholds.
    pub fn recompute_warning_level(&mut self) {
        self.warning_level = if self.status == ServiceStatus::Healthy {
            0
        } else if self.failure_count <= 3 {
            1
        } else if self.failure_count <= 10 {
            2
        } else {
            3
        };
    }
}

// =============================================================================
// Proxy request statistics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProxyRequestType {
    Sse,
    Http,
}

/// One recorded proxied call (`proxy_request_stats`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProxyRequestStat {
    pub id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub user_id: i64,
    pub request_type: ProxyRequestType,
    pub method: String,
    pub request_path: String,
    pub response_time_ms: i64,
    pub status_code: i64,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Per-service config definitions and per-user values
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Secret,
}

/// Env-var definition scoped to a service (`config_services`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigService {
    pub id: i64,
    pub service_id: i64,
    pub key: String,
    pub display_name: String,
    pub description: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub config_type: ConfigType,
    pub required: bool,
    pub order_num: i64,
}

/// Per-user override value for one config definition (`user_configs`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserConfig {
    pub id: i64,
    pub user_id: i64,
    pub service_id: i64,
    pub config_id: i64,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_service_name("My Service"), "my-service");
        assert_eq!(sanitize_service_name("  a/b  "), "a-b");
        assert_eq!(sanitize_service_name("A--B"), "a-b");
        assert_eq!(sanitize_service_name("--x--"), "x");
        assert_eq!(sanitize_service_name(""), "");
        assert_eq!(sanitize_service_name("   "), "");
    }

    #[test]
    fn test_sanitize_preserves_non_ascii() {
        assert_eq!(sanitize_service_name("Café Server"), "café-server");
        assert_eq!(sanitize_service_name("服务 one"), "服务-one");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in [
            "My Service",
            "  a / b / c ",
            "@scope/pkg-name",
            "UPPER lower\tmix",
            "--already-clean--",
            "服务 one",
        ] {
            let once = sanitize_service_name(raw);
            assert_eq!(sanitize_service_name(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_service_json_helpers_tolerate_garbage() {
        let now = OffsetDateTime::now_utc();
        let service = McpService {
            id: 1,
            name: "svc".into(),
            display_name: "svc".into(),
            description: String::new(),
            category: "utility".into(),
            icon: String::new(),
            default_on: false,
            enabled: true,
            service_type: ServiceType::Stdio,
            command: "npx".into(),
            args_json: "not json".into(),
            default_envs_json: "{broken".into(),
            headers_json: String::new(),
            allow_user_override: false,
            required_env_vars_json: "[]".into(),
            package_manager: "npm".into(),
            source_package_name: "pkg".into(),
            installed_version: String::new(),
            installer_user_id: 0,
            rpd_limit: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        };

        assert!(service.args().is_empty());
        assert!(service.default_envs().is_empty());
        assert!(service.headers().is_empty());
    }

    #[test]
    fn test_warning_level_thresholds() {
        let mut health = ServiceHealth::unknown();
        health.status = ServiceStatus::Healthy;
        health.failure_count = 50;
        health.recompute_warning_level();
        assert_eq!(health.warning_level, 0);

        health.status = ServiceStatus::Unhealthy;
        health.failure_count = 2;
        health.recompute_warning_level();
        assert_eq!(health.warning_level, 1);

        health.failure_count = 10;
        health.recompute_warning_level();
        assert_eq!(health.warning_level, 2);

        health.failure_count = 11;
        health.recompute_warning_level();
        assert_eq!(health.warning_level, 3);
    }

    #[test]
    fn test_secret_env_name_heuristic() {
        assert!(is_secret_env_name("GITHUB_TOKEN"));
        assert!(is_secret_env_name("api_key"));
        assert!(is_secret_env_name("CLIENT_SECRET"));
        assert!(!is_secret_env_name("PORT"));
    }

    #[test]
    fn test_health_round_trips_through_json() {
        let mut health = ServiceHealth::unknown();
        health.status = ServiceStatus::Healthy;
        health.success_count = 4;
        let json = serde_json::to_string(&health).unwrap();
        let parsed: ServiceHealth = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, ServiceStatus::Healthy);
        assert_eq!(parsed.success_count, 4);
    }
}
