//! Service registry: persistence for `mcp_services` rows.
//!
//! Name lookups ignore soft-deleted rows, and creation rejects a duplicate
//! sanitised name among live rows.

use mcpgate_shared::{sanitize_service_name, GatewayError, McpService, ServiceType};
use sqlx::SqlitePool;
use time::OffsetDateTime;

/// Insertable service definition; `create` sanitises the name and stamps
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
    pub default_on: bool,
    pub enabled: bool,
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
}

impl Default for NewService {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            description: String::new(),
            category: "utility".to_string(),
            icon: String::new(),
            default_on: true,
            enabled: true,
            service_type: ServiceType::Stdio,
            command: String::new(),
            args_json: "[]".to_string(),
            default_envs_json: "{}".to_string(),
            headers_json: "{}".to_string(),
            allow_user_override: false,
            required_env_vars_json: "[]".to_string(),
            package_manager: String::new(),
            source_package_name: String::new(),
            installed_version: String::new(),
            installer_user_id: 0,
            rpd_limit: 0,
        }
    }
}

/// Fetch by id, including soft-deleted rows; callers that care check the
/// `deleted` flag (the install completion path must observe it).
pub async fn get(pool: &SqlitePool, id: i64) -> Result<McpService, GatewayError> {
    sqlx::query_as::<_, McpService>("SELECT * FROM mcp_services WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("service {} not found", id)))
}

/// Fetch a live row by sanitised name.
pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<McpService, GatewayError> {
    sqlx::query_as::<_, McpService>("SELECT * FROM mcp_services WHERE name = ? AND deleted = 0")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("service {} not found", name)))
}

pub async fn list_enabled(pool: &SqlitePool) -> Result<Vec<McpService>, GatewayError> {
    Ok(sqlx::query_as::<_, McpService>(
        "SELECT * FROM mcp_services WHERE enabled = 1 AND deleted = 0 ORDER BY category ASC, name ASC",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<McpService>, GatewayError> {
    Ok(sqlx::query_as::<_, McpService>(
        "SELECT * FROM mcp_services WHERE deleted = 0 ORDER BY category ASC, name ASC",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn get_by_package(
    pool: &SqlitePool,
    package_manager: &str,
    package_name: &str,
) -> Result<Vec<McpService>, GatewayError> {
    Ok(sqlx::query_as::<_, McpService>(
        "SELECT * FROM mcp_services \
         WHERE package_manager = ? AND source_package_name = ? AND deleted = 0",
    )
    .bind(package_manager)
    .bind(package_name)
    .fetch_all(pool)
    .await?)
}

/// Insert a new service. Fails with `Conflict` when a live row already holds
/// the sanitised name.
pub async fn create(pool: &SqlitePool, new: &NewService) -> Result<McpService, GatewayError> {
    let name = sanitize_service_name(&new.name);
    if name.is_empty() {
        return Err(GatewayError::Validation(
            "service name cannot be empty".to_string(),
        ));
    }

    if get_by_name(pool, &name).await.is_ok() {
        return Err(GatewayError::Conflict(format!(
            "service name already exists: {}",
            name
        )));
    }

    let now = OffsetDateTime::now_utc();
    let id = sqlx::query(
        "INSERT INTO mcp_services \
         (name, display_name, description, category, icon, default_on, enabled, type, \
          command, args_json, default_envs_json, headers_json, allow_user_override, \
          required_env_vars_json, package_manager, source_package_name, installed_version, \
          installer_user_id, rpd_limit, deleted, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&name)
    .bind(&new.display_name)
    .bind(&new.description)
    .bind(&new.category)
    .bind(&new.icon)
    .bind(new.default_on)
    .bind(new.enabled)
    .bind(new.service_type)
    .bind(&new.command)
    .bind(&new.args_json)
    .bind(&new.default_envs_json)
    .bind(&new.headers_json)
    .bind(new.allow_user_override)
    .bind(&new.required_env_vars_json)
    .bind(&new.package_manager)
    .bind(&new.source_package_name)
    .bind(&new.installed_version)
    .bind(new.installer_user_id)
    .bind(new.rpd_limit)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get(pool, id).await
}

/// Persist every mutable column of the row.
pub async fn update(pool: &SqlitePool, service: &McpService) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE mcp_services SET \
         name = ?, display_name = ?, description = ?, category = ?, icon = ?, \
         default_on = ?, enabled = ?, type = ?, command = ?, args_json = ?, \
         default_envs_json = ?, headers_json = ?, allow_user_override = ?, \
         required_env_vars_json = ?, package_manager = ?, source_package_name = ?, \
         installed_version = ?, installer_user_id = ?, rpd_limit = ?, deleted = ?, \
         updated_at = ? \
         WHERE id = ?",
    )
    .bind(&service.name)
    .bind(&service.display_name)
    .bind(&service.description)
    .bind(&service.category)
    .bind(&service.icon)
    .bind(service.default_on)
    .bind(service.enabled)
    .bind(service.service_type)
    .bind(&service.command)
    .bind(&service.args_json)
    .bind(&service.default_envs_json)
    .bind(&service.headers_json)
    .bind(service.allow_user_override)
    .bind(&service.required_env_vars_json)
    .bind(&service.package_manager)
    .bind(&service.source_package_name)
    .bind(&service.installed_version)
    .bind(service.installer_user_id)
    .bind(service.rpd_limit)
    .bind(service.deleted)
    .bind(OffsetDateTime::now_utc())
    .bind(service.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flip the enabled flag; returns the new value.
pub async fn toggle_enabled(pool: &SqlitePool, id: i64) -> Result<bool, GatewayError> {
    let service = get(pool, id).await?;
    let enabled = !service.enabled;
    sqlx::query("UPDATE mcp_services SET enabled = ?, updated_at = ? WHERE id = ?")
        .bind(enabled)
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(enabled)
}

/// Soft-delete: the row stays for auditing but disappears from lookups.
/// The installed version is cleared so a later re-install starts clean.
pub async fn soft_delete(pool: &SqlitePool, id: i64) -> Result<(), GatewayError> {
    sqlx::query(
        "UPDATE mcp_services SET enabled = 0, deleted = 1, installed_version = '', updated_at = ? \
         WHERE id = ?",
    )
    .bind(OffsetDateTime::now_utc())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
