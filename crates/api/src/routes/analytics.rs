//! Analytics endpoints over the request statistics.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use mcpgate_shared::ServiceStatus;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{require_user, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::registry;
use crate::routes::success;
use crate::state::AppState;
use crate::stats::{p95_latency, today_bounds, today_request_count};

/// `GET /api/analytics/services/utilization` — per service: today's request
/// count (KV) and today's average latency (DB).
pub async fn service_utilization(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
) -> ApiResult<Json<Value>> {
    require_user(user.as_ref().map(|Extension(u)| u))?;

    let services = registry::list_all(&state.pool).await?;
    let (start, end) = today_bounds();

    let mut result = Vec::with_capacity(services.len());
    for service in services {
        let today_count = today_request_count(&state.kv, service.id);

        let avg_latency: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(response_time_ms) FROM proxy_request_stats \
             WHERE service_id = ? AND created_at >= ? AND created_at < ?",
        )
        .bind(service.id)
        .bind(start)
        .bind(end)
        .fetch_one(&state.pool)
        .await
        .unwrap_or(None);

        result.push(json!({
            "service_id": service.id,
            "service_name": service.name,
            "display_name": service.display_name,
            "enabled": service.enabled,
            "today_request_count": today_count,
            "today_avg_latency_ms": avg_latency.unwrap_or(0.0),
        }));
    }

    result.sort_by(|a, b| {
        a["service_name"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["service_name"].as_str().unwrap_or_default())
    });

    Ok(success(result))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub service_id: i64,
}

/// `GET /api/analytics/services/metrics?service_id` — totals, error rate and
/// P95 latency for one service.
pub async fn service_metrics(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Query(params): Query<MetricsQuery>,
) -> ApiResult<Json<Value>> {
    require_user(user.as_ref().map(|Extension(u)| u))?;

    let service = registry::get(&state.pool, params.service_id)
        .await
        .map_err(|_| ApiError::NotFound("service not found".to_string()))?;

    let rows: Vec<(i64, bool, String)> = sqlx::query_as(
        "SELECT response_time_ms, success, created_at FROM proxy_request_stats \
         WHERE service_id = ? ORDER BY created_at ASC",
    )
    .bind(service.id)
    .fetch_all(&state.pool)
    .await?;

    let total = rows.len() as i64;
    let successful = rows.iter().filter(|(_, success, _)| *success).count() as i64;
    let mut latencies: Vec<i64> = rows.iter().map(|(latency, _, _)| *latency).collect();
    let p95 = p95_latency(&mut latencies);
    let error_rate = if total > 0 {
        ((total - successful) as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    let requests_over_time: Vec<Value> = rows
        .iter()
        .map(|(latency, success, created_at)| {
            json!({
                "timestamp": created_at,
                "count": 1,
                "success": success,
                "latency_ms": latency,
            })
        })
        .collect();

    Ok(success(json!({
        "service_id": service.id.to_string(),
        "service_name": service.display_name,
        "requests_over_time": requests_over_time,
        "latency_p95_ms": p95,
        "error_rate_percentage": error_rate,
        "total_requests": total,
        "successful_requests": successful,
    })))
}

/// `GET /api/analytics/system/overview` — fleet counts, cached health split,
/// today's totals.
pub async fn system_overview(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
) -> ApiResult<Json<Value>> {
    require_user(user.as_ref().map(|Extension(u)| u))?;

    let services = registry::list_all(&state.pool).await?;
    let total_services = services.len();
    let mut enabled_services = 0;
    let mut healthy_services = 0;
    let mut unhealthy_services = 0;
    let mut today_total_requests = 0;

    for service in &services {
        if !service.enabled {
            continue;
        }
        enabled_services += 1;
        today_total_requests += today_request_count(&state.kv, service.id);

        match state.manager.checker().health_snapshot(service.id) {
            Some(health) if health.status == ServiceStatus::Healthy => healthy_services += 1,
            _ => unhealthy_services += 1,
        }
    }

    let (start, end) = today_bounds();
    let today_avg_latency: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(response_time_ms) FROM proxy_request_stats \
         WHERE created_at >= ? AND created_at < ?",
    )
    .bind(start)
    .bind(end)
    .fetch_one(&state.pool)
    .await
    .unwrap_or(None);

    Ok(success(json!({
        "total_services": total_services,
        "enabled_services": enabled_services,
        "healthy_services": healthy_services,
        "unhealthy_services": unhealthy_services,
        "today_total_requests": today_total_requests,
        "today_avg_response_time_ms": today_avg_latency.unwrap_or(0.0),
    })))
}
