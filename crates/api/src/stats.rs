//! Request statistics and daily quota counters.
//!
//! Every flagged proxied call is persisted; only 200/202 responses bump the
//! daily counters. Counter writes pair the `new == 1` transition with a 24 h
//! TTL so the windows roll over at most a day later.

use std::time::Duration;

use mcpgate_shared::kv::{daily_request_key, today_stamp, user_daily_request_key};
use mcpgate_shared::{Kv, ProxyRequestType};
use sqlx::SqlitePool;
use time::OffsetDateTime;

const DAILY_TTL: Duration = Duration::from_secs(24 * 3600);

/// Record one proxied call. Persistence and counter failures are logged and
/// swallowed; callers fire-and-forget from the dispatcher.
#[allow(clippy::too_many_arguments)]
pub async fn record_stat(
    pool: &SqlitePool,
    kv: &Kv,
    service_id: i64,
    service_name: &str,
    user_id: i64,
    request_type: ProxyRequestType,
    method: &str,
    request_path: &str,
    response_time_ms: i64,
    status_code: u16,
    success: bool,
) {
    let insert = sqlx::query(
        "INSERT INTO proxy_request_stats \
         (service_id, service_name, user_id, request_type, method, request_path, \
          response_time_ms, status_code, success, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(service_id)
    .bind(service_name)
    .bind(user_id)
    .bind(request_type)
    .bind(method)
    .bind(request_path)
    .bind(response_time_ms)
    .bind(status_code as i64)
    .bind(success)
    .bind(OffsetDateTime::now_utc())
    .execute(pool)
    .await;

    if let Err(err) = insert {
        tracing::error!(service = %service_name, error = %err, "failed to persist request stat");
    }

    if status_code != 200 && status_code != 202 {
        tracing::debug!(
            service = %service_name,
            status = status_code,
            "daily counters not bumped for non-2xx status"
        );
        return;
    }

    let today = today_stamp();

    let global_key = daily_request_key(&today, service_id);
    let count = kv.incr(&global_key);
    if count == 1 {
        kv.expire(&global_key, DAILY_TTL);
    }

    if user_id > 0 {
        let user_key = user_daily_request_key(&today, service_id, user_id);
        let user_count = kv.incr(&user_key);
        if user_count == 1 {
            kv.expire(&user_key, DAILY_TTL);
        }
    }
}

/// Today's global request count for a service.
pub fn today_request_count(kv: &Kv, service_id: i64) -> i64 {
    kv.get(&daily_request_key(&today_stamp(), service_id))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Today's per-user request count for a service. A missing or unreadable
/// counter reads as zero (quota checks fail open).
pub fn user_today_request_count(kv: &Kv, service_id: i64, user_id: i64) -> i64 {
    kv.get(&user_daily_request_key(&today_stamp(), service_id, user_id))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// P95 latency: sort ascending and take `floor(n * 0.95)` clamped to `n - 1`.
pub fn p95_latency(latencies: &mut [i64]) -> i64 {
    if latencies.is_empty() {
        return 0;
    }
    latencies.sort_unstable();
    let mut index = (latencies.len() as f64 * 0.95) as usize;
    if index >= latencies.len() {
        index = latencies.len() - 1;
    }
    latencies[index]
}

/// Start of today and tomorrow, UTC, for day-bounded aggregation queries.
pub fn today_bounds() -> (OffsetDateTime, OffsetDateTime) {
    let start = OffsetDateTime::now_utc()
        .replace_time(time::Time::MIDNIGHT);
    (start, start + time::Duration::days(1))
}
