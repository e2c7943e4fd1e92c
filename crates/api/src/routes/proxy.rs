//! Request dispatcher for `ANY /proxy/:name/*action`.
//!
//! Resolves the service, enforces auth and the per-user daily quota, picks
//! the per-user or global handler, serves the request, and records stats.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, RawQuery, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use mcpgate_shared::{McpService, ProxyRequestType, ServiceType};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::proxy::handlers::{HttpProxyHandler, ProxyKind, SseProxyHandler};
use crate::proxy::instance::{InstanceCache, SharedInstance};
use crate::state::AppState;
use crate::user_config::effective_envs_for_user;
use crate::{stats, registry};

/// What will serve this request: a cached global handler or a per-user one
/// minted for this call.
enum ResolvedHandler {
    Sse(Arc<SseProxyHandler>, Arc<SharedInstance>),
    Http(Arc<HttpProxyHandler>, Arc<SharedInstance>),
}

pub async fn dispatch(
    State(state): State<AppState>,
    Path((service_name, action)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    user: Option<Extension<AuthUser>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let action = normalize_action(&action);
    let request_path = format!("/proxy/{}{}", service_name, action);

    let service = registry::get_by_name(&state.pool, &service_name)
        .await
        .map_err(|_| ApiError::NotFound(format!("Service not found: {}", service_name)))?;
    if !service.enabled {
        return Err(ApiError::ServiceUnavailable(format!(
            "Service not enabled: {}",
            service_name
        )));
    }

    // Authentication is mandatory on the proxy surface.
    let user = user.map(|Extension(u)| u).ok_or(ApiError::Unauthorized)?;

    // Daily quota; counter reads fail open, the limit check does not.
    if service.rpd_limit > 0 {
        let used = stats::user_today_request_count(&state.kv, service.id, user.user_id);
        if used >= service.rpd_limit {
            tracing::info!(
                service = %service.name,
                user = user.user_id,
                used,
                limit = service.rpd_limit,
                "daily request limit reached"
            );
            return Err(ApiError::DailyLimitExceeded {
                message: format!(
                    "daily request limit exceeded: {}/{} requests used today",
                    used, service.rpd_limit
                ),
            });
        }
    }

    let (kind, recognised) = ProxyKind::from_action(&action);
    if !recognised {
        tracing::warn!(service = %service.name, action = %action, "unrecognised action, using SSE proxy");
    }

    let handler = resolve_handler(&state, &service, &user, kind).await?;

    // Only tools/call POSTs to the message sinks are stats-eligible; the body
    // is parsed best-effort and passed through untouched either way.
    let stat = stat_eligibility(&method, &action, &body);

    let session_id = query.as_deref().and_then(session_id_from_query);
    let started = Instant::now();
    let response = match &handler {
        ResolvedHandler::Sse(handler, instance) => {
            handler
                .serve(instance, &method, &action, session_id, body)
                .await
        }
        ResolvedHandler::Http(handler, instance) => {
            handler.serve(instance, &method, body).await
        }
    };

    if let Some((request_type, rpc_method)) = stat {
        let duration_ms = started.elapsed().as_millis() as i64;
        let status = response.status().as_u16();
        let success = response.status().is_success();

        let pool = state.pool.clone();
        let kv = state.kv.clone();
        let service_id = service.id;
        let name = service.name.clone();
        let user_id = user.user_id;
        tokio::spawn(async move {
            stats::record_stat(
                &pool,
                &kv,
                service_id,
                &name,
                user_id,
                request_type,
                &rpc_method,
                &request_path,
                duration_ms,
                status,
                success,
            )
            .await;
        });
    }

    Ok(response.into_response())
}

fn normalize_action(raw: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    }
}

fn session_id_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "sessionId" && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn stat_eligibility(
    method: &Method,
    action: &str,
    body: &Bytes,
) -> Option<(ProxyRequestType, String)> {
    if *method != Method::POST || (action != "/message" && action != "/mcp") {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_slice(body).ok()?;
    if parsed.get("method").and_then(|m| m.as_str()) != Some("tools/call") {
        return None;
    }
    let request_type = if action == "/message" {
        ProxyRequestType::Sse
    } else {
        ProxyRequestType::Http
    };
    Some((request_type, "tools/call".to_string()))
}

/// Prefer a per-user handler for overridable stdio services; fall back to the
/// global handler on any failure. A second failure is a 503.
async fn resolve_handler(
    state: &AppState,
    service: &McpService,
    user: &AuthUser,
    kind: ProxyKind,
) -> Result<ResolvedHandler, ApiError> {
    if user.user_id > 0
        && service.allow_user_override
        && service.service_type == ServiceType::Stdio
    {
        match user_scoped_handler(state, service, user.user_id, kind).await {
            Ok(handler) => return Ok(handler),
            Err(err) => {
                tracing::error!(
                    service = %service.name,
                    user = user.user_id,
                    error = %err,
                    "user-specific handler failed, falling back to global"
                );
            }
        }
    }

    global_handler(state, service, kind).await
}

async fn user_scoped_handler(
    state: &AppState,
    service: &McpService,
    user_id: i64,
    kind: ProxyKind,
) -> Result<ResolvedHandler, ApiError> {
    let merged = effective_envs_for_user(&state.pool, service, user_id).await?;
    let envs_json = serde_json::to_string(&merged)
        .map_err(|e| ApiError::Internal(format!("failed to encode merged envs: {}", e)))?;

    let instance = state
        .instances
        .get_or_create(
            service,
            &InstanceCache::user_key(user_id, service.id),
            &InstanceCache::user_label(user_id, service.id),
            &envs_json,
        )
        .await
        .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;

    // Per-user handlers are minted per request, never cached.
    Ok(match kind {
        ProxyKind::SseProxy => ResolvedHandler::Sse(
            Arc::new(SseProxyHandler::new(
                &service.name,
                &state.proxy_base_url(),
                state.sessions.clone(),
            )),
            instance,
        ),
        ProxyKind::HttpProxy => {
            ResolvedHandler::Http(Arc::new(HttpProxyHandler::new(&service.name)), instance)
        }
    })
}

async fn global_handler(
    state: &AppState,
    service: &McpService,
    kind: ProxyKind,
) -> Result<ResolvedHandler, ApiError> {
    let instance = state
        .instances
        .get_or_create(
            service,
            &InstanceCache::global_key(service.id),
            &InstanceCache::global_label(service.id),
            &service.default_envs_json,
        )
        .await
        .map_err(|e| {
            ApiError::ServiceUnavailable(format!(
                "Service handler unavailable for {}: {}",
                service.name, e
            ))
        })?;

    Ok(match kind {
        ProxyKind::SseProxy => ResolvedHandler::Sse(
            state
                .handlers
                .get_or_create_sse(service, &state.proxy_base_url(), &state.sessions),
            instance,
        ),
        ProxyKind::HttpProxy => {
            ResolvedHandler::Http(state.handlers.get_or_create_http(service), instance)
        }
    })
}
