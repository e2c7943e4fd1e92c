//! Embedded key-value cache with per-entry TTL.
//!
//! Backs daily request counters, rate-limit windows, health snapshots, the
//! GitHub-stars memo, and the JWT blacklist. The store is process-local; all
//! mutation goes through this adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-wide TTL key-value store.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Clone, Default)]
pub struct Kv {
    inner: Arc<DashMap<String, Entry>>,
}

impl Kv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key` if present and not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let expired = match self.inner.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if expired {
            self.inner.remove(key);
        }
        None
    }

    /// Sets `key` to `value`, replacing any previous TTL.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.inner.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    /// Atomically increments the integer stored at `key` and returns the new
    /// count. A missing, expired, or non-numeric value counts from zero. The
    /// caller is responsible for pairing a `new == 1` result with `expire`.
    pub fn incr(&self, key: &str) -> i64 {
        let mut entry = self.inner.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        if entry.is_expired() {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        next
    }

    /// Sets the TTL for an existing key. Returns false when the key is absent.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.inner.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    pub fn delete(&self, key: &str) {
        self.inner.remove(key);
    }

    /// Remaining TTL for `key`; `None` when absent, expired, or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.inner.get(key)?;
        if entry.is_expired() {
            return None;
        }
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Today's date stamp used in daily counter keys (`YYYY-MM-DD`, UTC).
pub fn today_stamp() -> String {
    let fmt = format_description!("[year]-[month]-[day]");
    OffsetDateTime::now_utc()
        .date()
        .format(&fmt)
        .unwrap_or_default()
}

/// `request:<day>:<serviceID>:count`
pub fn daily_request_key(day: &str, service_id: i64) -> String {
    format!("request:{}:{}:count", day, service_id)
}

/// `user_request:<day>:<serviceID>:<userID>:count`
pub fn user_daily_request_key(day: &str, service_id: i64, user_id: i64) -> String {
    format!("user_request:{}:{}:{}:count", day, service_id, user_id)
}

/// `health:service:<serviceID>`
pub fn health_key(service_id: i64) -> String {
    format!("health:service:{}", service_id)
}

/// `jwt:blacklist:<token>`
pub fn jwt_blacklist_key(token: &str) -> String {
    format!("jwt:blacklist:{}", token)
}

/// `github_stars:<owner>:<repo>`
pub fn github_stars_key(owner: &str, repo: &str) -> String {
    format!("github_stars:{}:{}", owner, repo)
}

/// `rateLimit:<bucket>:<clientIP>`
pub fn rate_limit_key(bucket: &str, client_ip: &str) -> String {
    format!("rateLimit:{}:{}", bucket, client_ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let kv = Kv::new();
        kv.set("a", "1", None);
        assert_eq!(kv.get("a").as_deref(), Some("1"));
        kv.delete("a");
        assert_eq!(kv.get("a"), None);
    }

    #[test]
    fn test_expired_entry_is_gone() {
        let kv = Kv::new();
        kv.set("a", "1", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(kv.get("a"), None);
    }

    #[test]
    fn test_incr_counts_from_zero_and_pairs_with_expire() {
        let kv = Kv::new();
        assert_eq!(kv.incr("c"), 1);
        assert!(kv.expire("c", Duration::from_secs(24 * 3600)));
        assert_eq!(kv.incr("c"), 2);

        let ttl = kv.ttl("c").expect("ttl set");
        assert!(ttl > Duration::ZERO);
        assert!(ttl <= Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_incr_resets_after_expiry() {
        let kv = Kv::new();
        kv.incr("c");
        kv.expire("c", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(kv.incr("c"), 1);
    }

    #[test]
    fn test_expire_on_missing_key() {
        let kv = Kv::new();
        assert!(!kv.expire("missing", Duration::from_secs(1)));
    }

    #[test]
    fn test_concurrent_incr_is_atomic() {
        let kv = Kv::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let kv = kv.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    kv.incr("shared");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(kv.get("shared").as_deref(), Some("800"));
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(daily_request_key("2025-01-02", 7), "request:2025-01-02:7:count");
        assert_eq!(
            user_daily_request_key("2025-01-02", 7, 3),
            "user_request:2025-01-02:7:3:count"
        );
        assert_eq!(health_key(9), "health:service:9");
        assert_eq!(rate_limit_key("GA", "1.2.3.4"), "rateLimit:GA:1.2.3.4");
    }

    #[test]
    fn test_today_stamp_shape() {
        let stamp = today_stamp();
        assert_eq!(stamp.len(), 10);
        assert_eq!(stamp.as_bytes()[4], b'-');
        assert_eq!(stamp.as_bytes()[7], b'-');
    }
}
