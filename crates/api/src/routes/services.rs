//! Service management endpoints: health check, toggle, update.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use mcpgate_shared::ServiceType;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;

use crate::auth::{require_admin, require_user, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::registry;
use crate::routes::{success, success_message};
use crate::state::AppState;

/// `POST /api/mcp_services/:id/health/check` — force a fresh health check,
/// registering the service with the manager first if needed.
pub async fn check_health(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Path(service_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    require_user(user.as_ref().map(|Extension(u)| u))?;

    let service = registry::get(&state.pool, service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;
    if service.deleted {
        return Err(ApiError::NotFound("service not found".to_string()));
    }

    if state.manager.get_service(service_id).is_none() {
        state.manager.register_service(&service).await?;
    }

    let health = state.manager.force_check(service_id).await?;

    Ok(success(json!({
        "service_id": service.id,
        "service_name": service.name,
        "health_status": health.status,
        "last_checked": health.last_checked.format(&Rfc3339).unwrap_or_default(),
        "health_details": health,
    })))
}

/// `POST /api/mcp_services/:id/toggle` (admin)
pub async fn toggle(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Path(service_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    registry::get(&state.pool, service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;

    let enabled = registry::toggle_enabled(&state.pool, service_id).await?;
    let status = if enabled { "enabled" } else { "disabled" };
    Ok(success_message(&format!("service toggled: {}", status)))
}

/// Partial update body for `PUT /api/mcp_services/:id`.
#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub icon: Option<String>,
    pub default_on: Option<bool>,
    pub enabled: Option<bool>,
    #[serde(rename = "type")]
    pub service_type: Option<ServiceType>,
    pub command: Option<String>,
    pub args_json: Option<String>,
    pub default_envs_json: Option<String>,
    pub headers_json: Option<String>,
    pub allow_user_override: Option<bool>,
    pub required_env_vars_json: Option<String>,
    pub package_manager: Option<String>,
    pub source_package_name: Option<String>,
    pub rpd_limit: Option<i64>,
}

/// `PUT /api/mcp_services/:id` (admin)
pub async fn update(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Path(service_id): Path<i64>,
    Json(request): Json<UpdateServiceRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    let mut service = registry::get(&state.pool, service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;

    if let Some(name) = request.name {
        service.name = mcpgate_shared::sanitize_service_name(&name);
    }
    if let Some(display_name) = request.display_name {
        service.display_name = display_name;
    }
    if let Some(description) = request.description {
        service.description = description;
    }
    if let Some(category) = request.category {
        service.category = category;
    }
    if let Some(icon) = request.icon {
        service.icon = icon;
    }
    if let Some(default_on) = request.default_on {
        service.default_on = default_on;
    }
    if let Some(enabled) = request.enabled {
        service.enabled = enabled;
    }
    if let Some(service_type) = request.service_type {
        service.service_type = service_type;
    }
    if let Some(command) = request.command {
        service.command = command;
    }
    if let Some(args_json) = request.args_json {
        service.args_json = args_json;
    }
    if let Some(default_envs_json) = request.default_envs_json {
        service.default_envs_json = default_envs_json;
    }
    if let Some(headers_json) = request.headers_json {
        service.headers_json = headers_json;
    }
    if let Some(allow_user_override) = request.allow_user_override {
        service.allow_user_override = allow_user_override;
    }
    if let Some(required_env_vars_json) = request.required_env_vars_json {
        validate_required_env_vars_json(&required_env_vars_json)?;
        service.required_env_vars_json = required_env_vars_json;
    }
    if let Some(package_manager) = request.package_manager {
        service.package_manager = package_manager;
    }
    if let Some(source_package_name) = request.source_package_name {
        service.source_package_name = source_package_name;
    }
    if let Some(rpd_limit) = request.rpd_limit {
        service.rpd_limit = rpd_limit;
    }

    if service.name.is_empty() || service.display_name.is_empty() {
        return Err(ApiError::Validation(
            "name and display_name are required".to_string(),
        ));
    }

    // Marketplace stdio services need a source package; keep command/args
    // consistent with the package manager.
    if service.service_type == ServiceType::Stdio && !service.package_manager.is_empty() {
        if service.package_manager != "custom" && service.source_package_name.is_empty() {
            return Err(ApiError::Validation(
                "source_package_name is required for marketplace services".to_string(),
            ));
        }
        match service.package_manager.as_str() {
            "npm" => {
                service.command = "npx".to_string();
                if service.args_json.is_empty() && !service.source_package_name.is_empty() {
                    service.args_json =
                        format!(r#"["-y", "{}"]"#, service.source_package_name);
                }
            }
            "pypi" => {
                service.command = "uvx".to_string();
                if service.args_json.is_empty() && !service.source_package_name.is_empty() {
                    service.args_json = format!(
                        r#"["--from", "{}", "{}"]"#,
                        service.source_package_name, service.source_package_name
                    );
                }
            }
            _ => {}
        }
    }

    registry::update(&state.pool, &service).await?;
    let updated = registry::get(&state.pool, service_id).await?;
    Ok(Json(serde_json::to_value(updated).unwrap_or_default()))
}

fn validate_required_env_vars_json(raw: &str) -> Result<(), ApiError> {
    if raw.is_empty() {
        return Ok(());
    }
    let parsed: Vec<mcpgate_shared::EnvVarDefinition> = serde_json::from_str(raw)
        .map_err(|e| ApiError::Validation(format!("invalid env vars JSON: {}", e)))?;
    for definition in &parsed {
        if definition.name.is_empty() {
            return Err(ApiError::Validation(
                "missing name field in env var definition".to_string(),
            ));
        }
    }
    Ok(())
}
