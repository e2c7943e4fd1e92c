//! Fixed-window rate limiting over the KV cache.
//!
//! Windows live under `rateLimit:<bucket>:<clientIP>`; the first hit in a
//! window sets the TTL, later hits only bump the counter.

use std::time::Duration;

use crate::kv::{rate_limit_key, Kv};

/// Configuration for one rate-limit bucket.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Short bucket tag embedded in the cache key, e.g. "GA" (global API).
    pub bucket: String,
    pub max_requests: i64,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(bucket: &str, max_requests: i64, window: Duration) -> Self {
        Self {
            bucket: bucket.to_string(),
            max_requests,
            window,
        }
    }

    /// Default global API bucket: 180 requests per 180 seconds.
    pub fn global_api() -> Self {
        Self::new("GA", 180, Duration::from_secs(180))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Counts a hit from `client_ip` against the bucket and decides whether the
/// request may proceed.
pub fn check(kv: &Kv, config: &RateLimitConfig, client_ip: &str) -> RateLimitDecision {
    let key = rate_limit_key(&config.bucket, client_ip);
    let count = kv.incr(&key);
    if count == 1 {
        kv.expire(&key, config.window);
    }
    if count > config.max_requests {
        RateLimitDecision::Limited
    } else {
        RateLimitDecision::Allowed
    }
}
