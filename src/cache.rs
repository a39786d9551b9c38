//! In-memory TTL cache for response payloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    expires_at: Instant,
}

/// Response cache keyed by request fingerprint.
///
/// Entries are only served while `now < expiry`; an expired entry is evicted
/// by the read that finds it.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached payload if present and not yet expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut map = self.inner.lock();
        let expired = match map.get(key) {
            None => return None,
            Some(entry) => Instant::now() >= entry.expires_at,
        };
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).map(|entry| entry.payload.clone())
    }

    /// Stores `payload` under `key` for `ttl`.
    pub fn put(&self, key: impl Into<String>, payload: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + ttl;
        self.inner
            .lock()
            .insert(key.into(), CacheEntry { payload, expires_at });
    }

    /// Removes entries whose key matches `pattern`, or everything when `None`.
    ///
    /// Returns the number of removed entries.
    pub fn clear(&self, pattern: Option<&Regex>) -> usize {
        let mut map = self.inner.lock();
        let before = map.len();
        match pattern {
            None => map.clear(),
            Some(pattern) => map.retain(|key, _| !pattern.is_match(key)),
        }
        before - map.len()
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let before = map.len();
        map.retain(|_, entry| entry.expires_at > now);
        before - map.len()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::CacheStore;
    use regex::Regex;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = CacheStore::new();
        cache.put("GET:/users:{}:{}", json!({"id": 1}), Duration::from_millis(5_000));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(cache.get("GET:/users:{}:{}"), Some(json!({"id": 1})));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("GET:/users:{}:{}"), None);
        assert!(cache.is_empty(), "expired entry must be evicted on read");
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let cache = CacheStore::new();
        cache.put("short", json!(1), Duration::from_millis(10));
        cache.put("long", json!(2), Duration::from_secs(60));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = CacheStore::new();
        cache.put("key", json!(true), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_by_pattern() {
        let cache = CacheStore::new();
        let ttl = Duration::from_secs(60);
        cache.put("GET:/users:{}:{}", json!(1), ttl);
        cache.put("GET:/users/7:{}:{}", json!(2), ttl);
        cache.put("GET:/products:{}:{}", json!(3), ttl);

        let pattern = Regex::new("/users").expect("valid regex");
        assert_eq!(cache.clear(Some(&pattern)), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(None), 1);
        assert!(cache.is_empty());
    }
}
