//! HTTP route assembly.

pub mod analytics;
pub mod market;
pub mod options;
pub mod proxy;
pub mod services;

use axum::middleware;
use axum::routing::{any, get, patch, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use mcpgate_shared::rate_limit::{check, RateLimitConfig, RateLimitDecision};

use crate::auth::token_auth;
use crate::error::ApiError;
use crate::state::AppState;

/// Client IP for rate limiting: proxy headers first, else unknown. The
/// gateway normally sits behind a reverse proxy that sets these.
fn client_ip(request: &Request) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = request.headers().get(header).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Fixed-window rate limit over the management API.
async fn api_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let ip = client_ip(&request);
    if check(&state.kv, &RateLimitConfig::global_api(), &ip) == RateLimitDecision::Limited {
        return ApiError::RateLimited.into_response();
    }
    next.run(request).await
}

/// Standard success envelope used by the management API.
pub(crate) fn success(data: impl serde::Serialize) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "",
        "data": data,
    }))
}

/// Success envelope carrying only a message.
pub(crate) fn success_message(message: &str) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": message,
    }))
}

/// Build the full router. Gzip is attached only when enabled; the default
/// compression predicate already refuses `text/event-stream` responses.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Market
        .route("/mcp_market/search", get(market::search))
        .route("/mcp_market/package_details", get(market::package_details))
        .route(
            "/mcp_market/discover_env_vars",
            get(market::discover_env_vars_route),
        )
        .route("/mcp_market/installed", get(market::list_installed))
        .route(
            "/mcp_market/install_or_add_service",
            post(market::install_or_add_service),
        )
        .route("/mcp_market/install_status/:id", get(market::install_status))
        .route("/mcp_market/uninstall", post(market::uninstall))
        .route("/mcp_market/custom_service", post(market::create_custom_service))
        .route("/mcp_market/batch-import", post(market::start_batch_import))
        .route(
            "/mcp_market/batch-import/progress/:task_id",
            get(market::batch_import_progress),
        )
        .route("/mcp_market/env_var", patch(market::patch_env_var))
        // Service management
        .route("/mcp_services/:id/health/check", post(services::check_health))
        .route("/mcp_services/:id/toggle", post(services::toggle))
        .route("/mcp_services/:id", put(services::update))
        // Options
        .route("/option/", get(options::get_options).put(options::update_option))
        // Analytics
        .route(
            "/analytics/services/utilization",
            get(analytics::service_utilization),
        )
        .route("/analytics/services/metrics", get(analytics::service_metrics))
        .route("/analytics/system/overview", get(analytics::system_overview))
        .layer(middleware::from_fn_with_state(state.clone(), api_rate_limit));

    let mut router = Router::new()
        .nest("/api", api)
        .route("/proxy/:name/*action", any(proxy::dispatch))
        .layer(middleware::from_fn_with_state(state.clone(), token_auth))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    if state.config.enable_gzip && state.options.gzip_enabled() {
        router = router.layer(CompressionLayer::new());
    }

    router.with_state(state)
}
