//! Market endpoints: search, package details, install/uninstall, custom
//! services, batch import, and env-var management.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use mcpgate_market as market;
use mcpgate_shared::{
    is_secret_env_name, sanitize_service_name, EnvVarDefinition, GatewayError, ServiceType,
};
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::{require_admin, require_user, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::install::{InstallStatus, InstallationTask};
use crate::registry::{self, NewService};
use crate::routes::{success, success_message};
use crate::state::AppState;
use crate::user_config;
use crate::{install, stats};

// =============================================================================
// Search
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub sources: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
}

/// `GET /api/mcp_market/search` — unified npm search with installed markers.
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let sources = params.sources.unwrap_or_else(|| "npm".to_string());
    let page = params.page.unwrap_or(1);
    let size = params.size.unwrap_or(20);

    // MCP servers on npm overwhelmingly tag themselves with "mcp".
    let mut query = params.query.trim().to_string();
    if !query.is_empty() {
        query.push_str(" mcp");
    }

    let mut results = Vec::new();
    if sources.contains("npm") {
        let npm_result = market::search_packages(&state.http, &query, size, page)
            .await
            .map_err(|e| ApiError::Internal(format!("market search failed: {}", e)))?;

        let installed = installed_package_ids(&state).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load installed package ids");
            HashMap::new()
        });

        results = market::convert_npm_to_search_results(
            &state.http,
            &state.kv,
            state.config.github_token.as_deref(),
            &npm_result,
            &installed,
        )
        .await;
    }

    Ok(success(results))
}

/// Enabled, live services keyed by source package name.
async fn installed_package_ids(state: &AppState) -> Result<HashMap<String, i64>, GatewayError> {
    let services = registry::list_enabled(&state.pool).await?;
    Ok(services
        .into_iter()
        .filter(|s| !s.source_package_name.is_empty())
        .map(|s| (s.source_package_name, s.id))
        .collect())
}

// =============================================================================
// Package details and env-var discovery
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PackageQuery {
    pub package_name: String,
    pub package_manager: String,
}

/// The discovery pipeline: config-block env vars, then README guesses, then
/// the package's own `requiresEnv` declarations.
fn discover_env_vars(
    details: &market::NpmPackageDetails,
    readme: &str,
    config: Option<&market::McpConfig>,
) -> Vec<String> {
    let mut vars = config
        .map(market::get_env_vars_from_mcp_config)
        .unwrap_or_default();
    if vars.is_empty() && !readme.is_empty() {
        vars = market::guess_env_vars_from_readme(readme);
    }
    for declared in &details.requires_env {
        if !vars.contains(declared) {
            vars.push(declared.clone());
        }
    }
    vars
}

fn env_var_definitions(names: Vec<String>, description: &str) -> Vec<EnvVarDefinition> {
    names
        .into_iter()
        .map(|name| EnvVarDefinition {
            is_secret: is_secret_env_name(&name),
            name,
            description: description.to_string(),
            optional: false,
            default_value: String::new(),
        })
        .collect()
}

/// `GET /api/mcp_market/package_details`
pub async fn package_details(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Query(params): Query<PackageQuery>,
) -> ApiResult<Json<Value>> {
    if params.package_manager != "npm" {
        return Err(ApiError::BadRequest(format!(
            "unsupported package manager: {}",
            params.package_manager
        )));
    }

    let details = market::get_package_details(&state.http, &params.package_name)
        .await
        .map_err(|e| match e {
            market::MarketError::NotFound => {
                ApiError::NotFound(format!("package not found: {}", params.package_name))
            }
            other => ApiError::Internal(format!("failed to get npm package details: {}", other)),
        })?;
    let readme = details.readme.clone();

    let mut stars = 0;
    let repository_url = details.repository.url.clone();
    if repository_url.contains("github.com") {
        if let Some((owner, repo)) = market::parse_github_repo(&repository_url) {
            stars = market::fetch_github_stars(
                &state.http,
                &state.kv,
                state.config.github_token.as_deref(),
                &owner,
                &repo,
            )
            .await;
        }
    }

    let installed = registry::get_by_package(&state.pool, &params.package_manager, &params.package_name)
        .await
        .unwrap_or_default();
    let installed_service = installed.first();

    let mut mcp_config = market::extract_mcp_config(&readme);

    // For installed packages the caller sees the effective env values:
    // service defaults overlaid with their own overrides.
    if let (Some(service), Some(config)) = (installed_service, mcp_config.as_mut()) {
        let user_id = user.as_ref().map(|Extension(u)| u.user_id).unwrap_or(0);
        let service_row = registry::get(&state.pool, service.id).await?;
        let effective = user_config::effective_envs_for_user(&state.pool, &service_row, user_id)
            .await
            .unwrap_or_default();
        for server in config.mcp_servers.values_mut() {
            for (key, value) in &effective {
                server.env.insert(key.clone(), value.clone());
            }
        }
    }

    let env_vars = env_var_definitions(
        discover_env_vars(&details, &readme, mcp_config.as_ref()),
        "Discovered from package information",
    );

    let mut response = json!({
        "details": {
            "name": details.name,
            "version": details.latest_version(),
            "description": details.description,
            "homepage": details.homepage,
            "repository_url": repository_url,
            "keywords": details.keywords,
            "license": details.license,
            "dependencies": details.dependencies,
            "devDependencies": details.dev_dependencies,
            "stars": stars,
        },
        "env_vars": env_vars,
        "mcp_config": mcp_config,
        "readme": readme,
        "stars": stars,
        "repository_url": repository_url,
        "is_installed": installed_service.is_some(),
    });
    if let Some(service) = installed_service {
        response["installed_service_id"] = json!(service.id);
    }

    Ok(success(response))
}

/// `GET /api/mcp_market/discover_env_vars`
pub async fn discover_env_vars_route(
    State(state): State<AppState>,
    Query(params): Query<PackageQuery>,
) -> ApiResult<Json<Value>> {
    if params.package_manager != "npm" {
        return Err(ApiError::BadRequest(format!(
            "unsupported package manager: {}",
            params.package_manager
        )));
    }

    let details = market::get_package_details(&state.http, &params.package_name)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to get npm package details: {}", e)))?;
    let readme = details.readme.clone();
    let config = market::extract_mcp_config(&readme);

    let env_vars = env_var_definitions(
        discover_env_vars(&details, &readme, config.as_ref()),
        "Auto discovered from package information",
    );

    Ok(success(json!({ "env_vars": env_vars })))
}

// =============================================================================
// Installed listing
// =============================================================================

/// `GET /api/mcp_market/installed` — installed services with effective envs,
/// per-user quota usage, and cached health.
pub async fn list_installed(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
) -> ApiResult<Json<Value>> {
    let user_id = user.as_ref().map(|Extension(u)| u.user_id).unwrap_or(0);
    let services = registry::list_all(&state.pool).await?;

    let mut result = Vec::with_capacity(services.len());
    for service in services {
        let env_vars = user_config::effective_envs_for_user(&state.pool, &service, user_id)
            .await
            .unwrap_or_default();

        let mut entry = serde_json::to_value(&service).unwrap_or_else(|_| json!({}));
        entry["env_vars"] = json!(env_vars);

        if service.rpd_limit > 0 && user_id > 0 {
            let used = stats::user_today_request_count(&state.kv, service.id, user_id);
            entry["user_daily_request_count"] = json!(used);
            entry["remaining_requests"] = json!(service.rpd_limit - used);
        } else {
            entry["user_daily_request_count"] = json!(0);
            entry["remaining_requests"] = json!(-1);
        }

        match state.manager.checker().health_snapshot(service.id) {
            Some(health) => {
                entry["health_status"] = json!(health.status);
                entry["last_health_check"] =
                    json!(health.last_checked.format(&Rfc3339).unwrap_or_default());
                entry["health_details"] =
                    json!(serde_json::to_string(&health).unwrap_or_else(|_| "{}".to_string()));
            }
            None => {
                entry["health_status"] = json!("unknown");
                entry["last_health_check"] = Value::Null;
                entry["health_details"] =
                    json!(r#"{"status":"unknown","error_message":"Health status not found in cache."}"#);
            }
        }

        result.push(entry);
    }

    Ok(success(result))
}

// =============================================================================
// Install / add
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub source_type: String,
    #[serde(default)]
    pub mcp_service_id: i64,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub package_manager: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub user_provided_env_vars: HashMap<String, Value>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub service_description: String,
    #[serde(default)]
    pub service_icon_url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub custom_args: Vec<String>,
}

/// Env-var values arrive as arbitrary JSON; only strings are acceptable.
fn convert_env_vars(input: &HashMap<String, Value>) -> Result<HashMap<String, String>, ApiError> {
    let mut output = HashMap::new();
    for (key, value) in input {
        match value.as_str() {
            Some(value) => {
                output.insert(key.clone(), value.to_string());
            }
            None => {
                return Err(ApiError::Validation(format!(
                    "environment variable {} must be a string",
                    key
                )))
            }
        }
    }
    Ok(output)
}

/// `POST /api/mcp_market/install_or_add_service` (admin)
pub async fn install_or_add_service(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(request): Json<InstallRequest>,
) -> ApiResult<Json<Value>> {
    let user = require_admin(user.as_ref().map(|Extension(u)| u))?.clone();
    let env_vars = convert_env_vars(&request.user_provided_env_vars)?;

    match request.source_type.as_str() {
        "predefined" => {
            if request.mcp_service_id == 0 {
                return Err(ApiError::BadRequest("mcp_service_id is required".to_string()));
            }
            add_service_instance_for_user(&state, user.user_id, request.mcp_service_id, &env_vars)
                .await?;
            Ok(success_message("service added successfully"))
        }
        "marketplace" => install_from_marketplace(&state, &user, &request, env_vars).await,
        other => Err(ApiError::BadRequest(format!(
            "invalid source_type: {}",
            other
        ))),
    }
}

async fn install_from_marketplace(
    state: &AppState,
    user: &AuthUser,
    request: &InstallRequest,
    env_vars: HashMap<String, String>,
) -> ApiResult<Json<Value>> {
    if request.package_name.is_empty() || request.package_manager.is_empty() {
        return Err(ApiError::BadRequest(
            "package_name and package_manager are required".to_string(),
        ));
    }

    let clean_name = market::extract_package_name_without_version(&request.package_name);

    match request.package_manager.as_str() {
        "npm" => {
            if !install::check_npx_available().await {
                return Err(ApiError::Internal("npx is not available".to_string()));
            }
        }
        "pypi" | "uv" | "pip" => {
            if !install::check_uv_available().await {
                return Err(ApiError::Internal("uv is not available".to_string()));
            }
        }
        other => {
            return Err(ApiError::Validation(format!(
                "unknown package manager: {}",
                other
            )))
        }
    }

    // Already installed: attach the caller's env values to the existing row.
    let mut existing =
        registry::get_by_package(&state.pool, &request.package_manager, &clean_name).await?;
    if existing.is_empty() {
        existing =
            registry::get_by_package(&state.pool, &request.package_manager, &request.package_name)
                .await?;
    }
    if let Some(service) = existing.first() {
        add_service_instance_for_user(state, user.user_id, service.id, &env_vars).await?;
        return Ok(success(json!({
            "message": "service instance added successfully",
            "mcp_service_id": service.id,
            "status": "already_installed_instance_added",
        })));
    }

    // Validate the package upstream and learn its env requirements.
    let mut package_description = String::new();
    let mut required: Vec<String> = Vec::new();
    match request.package_manager.as_str() {
        "npm" => {
            let details = market::get_package_details(&state.http, &clean_name)
                .await
                .map_err(|e| {
                    ApiError::BadRequest(format!("package not found: {} ({})", request.package_name, e))
                })?;
            package_description = details.description.clone();
            let readme = details.readme.clone();
            let config = market::extract_mcp_config(&readme);
            required = discover_env_vars(&details, &readme, config.as_ref());
        }
        _ => {
            let (summary, _version) =
                market::validate_and_get_package_info(&state.http, &clean_name)
                    .await
                    .map_err(|e| {
                        ApiError::BadRequest(format!(
                            "package not found: {} ({})",
                            request.package_name, e
                        ))
                    })?;
            package_description = summary;
        }
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|name| !name.is_empty() && !env_vars.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::MissingEnvVars(missing));
    }

    let display_name = if request.display_name.is_empty() {
        request.package_name.clone()
    } else {
        request.display_name.clone()
    };
    let description = if request.service_description.is_empty() {
        package_description
    } else {
        request.service_description.clone()
    };
    let category = if request.category.is_empty() {
        "ai".to_string()
    } else {
        request.category.clone()
    };

    let (command, args) = match request.package_manager.as_str() {
        "npm" => {
            let mut args = if request.custom_args.is_empty() {
                vec!["-y".to_string(), request.package_name.clone()]
            } else {
                request.custom_args.clone()
            };
            if !args.contains(&request.package_name) {
                args.push(request.package_name.clone());
            }
            ("npx".to_string(), args)
        }
        _ => {
            let args = if request.custom_args.is_empty() {
                vec![
                    "--from".to_string(),
                    request.package_name.clone(),
                    request.package_name.clone(),
                ]
            } else {
                request.custom_args.clone()
            };
            ("uvx".to_string(), args)
        }
    };

    let new_service = NewService {
        name: request.package_name.clone(),
        display_name,
        description,
        category,
        icon: request.service_icon_url.clone(),
        default_on: false,
        enabled: true,
        service_type: ServiceType::Stdio,
        command: command.clone(),
        args_json: serde_json::to_string(&args).unwrap_or_else(|_| "[]".to_string()),
        default_envs_json: serde_json::to_string(&env_vars).unwrap_or_else(|_| "{}".to_string()),
        headers_json: serde_json::to_string(&request.headers).unwrap_or_else(|_| "{}".to_string()),
        package_manager: request.package_manager.clone(),
        source_package_name: request.package_name.clone(),
        installer_user_id: user.user_id,
        ..NewService::default()
    };

    let created = registry::create(&state.pool, &new_service).await?;
    tracing::info!(service = %created.name, id = created.id, "created service for marketplace install");

    state.installer.submit(InstallationTask {
        service_id: created.id,
        user_id: user.user_id,
        package_name: request.package_name.clone(),
        package_manager: request.package_manager.clone(),
        version: request.version.clone(),
        command,
        args,
        env_vars,
        status: InstallStatus::Pending,
        start_time: time::OffsetDateTime::now_utc(),
        end_time: None,
        output: String::new(),
        error: String::new(),
    });

    Ok(success(json!({
        "message": "installation submitted",
        "mcp_service_id": created.id,
        "task_id": created.id,
        "status": "pending",
    })))
}

/// Attach user-provided env values to a service: ensure definitions exist and
/// upsert the user's values.
async fn add_service_instance_for_user(
    state: &AppState,
    user_id: i64,
    service_id: i64,
    env_vars: &HashMap<String, String>,
) -> ApiResult<()> {
    if user_id == 0 {
        return Ok(());
    }

    let service = registry::get(&state.pool, service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;

    for (key, value) in env_vars {
        let option =
            user_config::ensure_config_option(&state.pool, service_id, key, &service.display_name)
                .await?;
        user_config::save_user_config(&state.pool, user_id, service_id, option.id, value).await?;
    }
    Ok(())
}

// =============================================================================
// Install status / uninstall
// =============================================================================

/// `GET /api/mcp_market/install_status/:id`
pub async fn install_status(
    State(state): State<AppState>,
    Path(service_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    if let Some(task) = state.installer.task_status(service_id) {
        let mut response = json!({
            "service_id": task.service_id,
            "package_name": task.package_name,
            "status": task.status,
            "start_time": task.start_time.format(&Rfc3339).unwrap_or_default(),
        });
        if let Some(end_time) = task.end_time {
            response["end_time"] = json!(end_time.format(&Rfc3339).unwrap_or_default());
            response["duration"] = json!((end_time - task.start_time).as_seconds_f64());
            if task.status == InstallStatus::Failed {
                response["error"] = json!(task.error);
            }
        }
        return Ok(success(response));
    }

    // No live task: derive a coarse status from the row itself.
    let service = registry::get(&state.pool, service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;
    let status = if service.installed_version.is_empty() {
        "unknown"
    } else {
        "completed"
    };

    Ok(success(json!({
        "service_id": service.id,
        "service_name": service.name,
        "status": status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UninstallRequest {
    pub service_id: i64,
}

/// `POST /api/mcp_market/uninstall` (admin). Always soft-deletes; physical
/// uninstall is skipped for services still installing (or that never finished)
/// and when unregistration times out.
pub async fn uninstall(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(request): Json<UninstallRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;
    if request.service_id == 0 {
        return Err(ApiError::BadRequest("invalid service_id".to_string()));
    }

    let service = registry::get(&state.pool, request.service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;

    let mut skip_physical = false;
    if service.installed_version.is_empty() {
        match state.installer.task_status(service.id) {
            Some(task) if task.status.is_live() => {
                skip_physical = true;
                tracing::info!(
                    service_id = service.id,
                    status = ?task.status,
                    "service is mid-install; skipping physical uninstall"
                );
            }
            Some(_) => {}
            None => {
                // Leftover from an earlier failed install.
                skip_physical = true;
                tracing::info!(
                    service_id = service.id,
                    "service has no installed version and no live task; skipping physical uninstall"
                );
            }
        }
    }

    // Always unregister so the supervisor stops rebuilding instances for a
    // row that is about to be soft-deleted. A timeout here additionally
    // downgrades to soft-delete-only.
    match state.manager.unregister_service(service.id).await {
        Ok(()) => {}
        Err(GatewayError::Timeout(msg)) => {
            tracing::warn!(service_id = service.id, error = %msg, "unregistration timed out; skipping physical uninstall");
            skip_physical = true;
        }
        Err(GatewayError::NotFound(_)) => {
            // Never registered with the manager; nothing to stop.
        }
        Err(err) => {
            tracing::error!(service_id = service.id, error = %err, "unregistration failed");
        }
    }

    if !skip_physical
        && service.service_type == ServiceType::Stdio
        && !service.package_manager.is_empty()
        && !service.source_package_name.is_empty()
    {
        match service.package_manager.as_str() {
            "npm" => {
                // npx-launched packages leave nothing behind; stopping the
                // child was the uninstall.
                tracing::info!(package = %service.source_package_name, "npm package marked uninstalled");
            }
            "pypi" | "uv" | "pip" => {
                let venv_base = std::path::Path::new(install::PYTHON_VENVS_DIR)
                    .join(&service.source_package_name);
                if let Err(err) = tokio::fs::remove_dir_all(&venv_base).await {
                    tracing::warn!(
                        package = %service.source_package_name,
                        error = %err,
                        "failed to remove python venv"
                    );
                }
            }
            other => {
                tracing::info!(package_manager = %other, "no physical uninstall for package manager");
            }
        }
    }

    registry::soft_delete(&state.pool, service.id).await?;
    state.manager.checker().delete_health(service.id);

    Ok(success_message("service uninstalled successfully"))
}

// =============================================================================
// Custom services
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CustomServiceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub environments: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: String,
}

/// Strip query parameters and fragments for display.
fn sanitize_url_for_display(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Parse newline-separated `KEY=VALUE` lines into a map.
fn parse_kv_lines(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in raw.replace("\r\n", "\n").lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// `POST /api/mcp_market/custom_service` (admin) — manual stdio / SSE /
/// streamable HTTP entry.
pub async fn create_custom_service(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(request): Json<CustomServiceRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    let sanitized = sanitize_service_name(&request.name);
    if sanitized.is_empty() {
        return Err(ApiError::BadRequest("service name cannot be empty".to_string()));
    }
    if registry::get_by_name(&state.pool, &sanitized).await.is_ok() {
        return Err(ApiError::Conflict(format!(
            "service name already exists: {}",
            sanitized
        )));
    }

    let service_type = match request.service_type.as_str() {
        "stdio" => ServiceType::Stdio,
        "sse" => ServiceType::Sse,
        "streamableHttp" => ServiceType::StreamableHttp,
        other => {
            return Err(ApiError::BadRequest(format!("invalid service type: {}", other)))
        }
    };

    let description = match service_type {
        ServiceType::Stdio => {
            let args = if request.arguments.is_empty() {
                "no args".to_string()
            } else {
                request.arguments.clone()
            };
            format!("{}/{} (stdio)", request.command, args)
        }
        _ => {
            if request.url.is_empty() {
                format!("Custom proxy service - URL not set ({})", request.service_type)
            } else {
                format!(
                    "Custom proxy service to {} ({})",
                    sanitize_url_for_display(&request.url),
                    request.service_type
                )
            }
        }
    };

    let mut new_service = NewService {
        name: sanitized.clone(),
        display_name: request.name.clone(),
        description,
        service_type,
        package_manager: "custom".to_string(),
        source_package_name: sanitized.clone(),
        ..NewService::default()
    };

    match service_type {
        ServiceType::Stdio => {
            if request.command.is_empty() {
                return Err(ApiError::Validation(
                    "command is required for stdio services".to_string(),
                ));
            }
            new_service.command = request.command.clone();
            let args: Vec<String> = request
                .arguments
                .replace("\r\n", "\n")
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            new_service.args_json =
                serde_json::to_string(&args).unwrap_or_else(|_| "[]".to_string());
            let envs = parse_kv_lines(&request.environments);
            new_service.default_envs_json =
                serde_json::to_string(&envs).unwrap_or_else(|_| "{}".to_string());
        }
        _ => {
            if request.url.is_empty() {
                return Err(ApiError::Validation(
                    "url is required for remote services".to_string(),
                ));
            }
            new_service.command = request.url.clone();
            let headers = parse_kv_lines(&request.headers);
            new_service.headers_json =
                serde_json::to_string(&headers).unwrap_or_else(|_| "{}".to_string());
        }
    }

    let created = registry::create(&state.pool, &new_service).await?;

    // Register for health checking right away; failure to register does not
    // fail the create.
    if let Err(err) = state.manager.register_service(&created).await {
        tracing::warn!(service = %created.name, error = %err, "failed to register custom service");
        return Ok(success(json!({
            "message": "custom service created with registration warning",
            "mcp_service_id": created.id,
            "service": created,
            "warning": err.to_string(),
        })));
    }

    if let Err(err) = state.manager.force_check(created.id).await {
        tracing::warn!(service = %created.name, error = %err, "initial health check failed");
    }

    Ok(success(json!({
        "message": "custom service created successfully",
        "mcp_service_id": created.id,
        "service": created,
    })))
}

// =============================================================================
// Batch import
// =============================================================================

/// `POST /api/mcp_market/batch-import` (admin). Accepts either a direct
/// `{name: {...}}` map or the mcp.json `{mcpServers: {...}}` wrapper.
pub async fn start_batch_import(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    let object = body
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("request body must be an object".to_string()))?;

    let services = match object.get("mcpServers") {
        Some(Value::Object(wrapped)) => wrapped.clone(),
        Some(_) => {
            return Err(ApiError::BadRequest(
                "mcpServers field must be an object".to_string(),
            ))
        }
        None => object.clone(),
    };

    if services.is_empty() {
        return Err(ApiError::BadRequest("no services provided".to_string()));
    }

    let task_id = state
        .batch
        .start(state.pool.clone(), state.installer.clone(), services);
    Ok(Json(json!({ "task_id": task_id })))
}

/// `GET /api/mcp_market/batch-import/progress/:task_id?token=<jwt>` — SSE
/// progress stream; authenticates via query token since EventSource cannot
/// set headers (the auth middleware resolves `?token=`).
pub async fn batch_import_progress(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    let receiver = state
        .batch
        .take_progress(&task_id)
        .ok_or_else(|| ApiError::NotFound("task not found".to_string()))?;

    let stream = ReceiverStream::new(receiver).map(|update| {
        let data = serde_json::to_string(&update).unwrap_or_default();
        Ok::<Event, std::convert::Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream).into_response())
}

// =============================================================================
// Env-var patching
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PatchEnvVarRequest {
    pub service_id: i64,
    pub var_name: String,
    pub var_value: String,
}

/// `PATCH /api/mcp_market/env_var` — admins update the service defaults,
/// everyone else upserts their personal override.
pub async fn patch_env_var(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(request): Json<PatchEnvVarRequest>,
) -> ApiResult<Json<Value>> {
    let user = require_user(user.as_ref().map(|Extension(u)| u))?.clone();
    if request.var_name.is_empty() {
        return Err(ApiError::Validation("var_name is required".to_string()));
    }

    let mut service = registry::get(&state.pool, request.service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;

    if user.is_admin() {
        let mut defaults = service.default_envs();
        defaults.insert(request.var_name.clone(), request.var_value.clone());
        service.default_envs_json =
            serde_json::to_string(&defaults).unwrap_or_else(|_| "{}".to_string());
        registry::update(&state.pool, &service).await?;

        tracing::info!(
            service = %service.name,
            var = %request.var_name,
            admin = user.user_id,
            "updated default env var"
        );
        Ok(success_message("default environment variable updated successfully"))
    } else {
        let option = user_config::ensure_config_option(
            &state.pool,
            request.service_id,
            &request.var_name,
            &service.display_name,
        )
        .await?;
        user_config::save_user_config(
            &state.pool,
            user.user_id,
            request.service_id,
            option.id,
            &request.var_value,
        )
        .await?;

        tracing::info!(
            service = %service.name,
            var = %request.var_name,
            user = user.user_id,
            "saved personal env var"
        );
        Ok(success_message("environment variable saved successfully"))
    }
}
