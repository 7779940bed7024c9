//! Key-value store abstraction and the fixed-window rate limiter built on it.
//!
//! Callers only see `Arc<dyn KeyValueStore>`, so the in-process map can be
//! swapped for a shared cache without touching the limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Vec<String>;

    /// Set a time to live on an existing key. False when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> bool;

    /// Add one to an integer value, creating it at 1. Returns the new value.
    async fn incr(&self, key: &str) -> i64;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local store. Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
    }

    async fn scan(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }

    async fn incr(&self, key: &str) -> i64 {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    e.value = "0".into();
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: "0".into(),
                expires_at: None,
            });
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        next
    }
}

/// Fixed-window request counter per user.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    window: Duration,
    max_requests: i64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, window: Duration, max_requests: i64) -> Self {
        Self {
            store,
            window,
            max_requests,
        }
    }

    /// Count one request for `user_id`. False once the window's budget is spent.
    pub async fn check(&self, user_id: Uuid) -> bool {
        let key = format!("rl:{}", user_id);
        let count = self.store.incr(&key).await;
        if count == 1 {
            self.store.expire(&key, self.window).await;
        }
        if count > self.max_requests {
            debug!("Rate limit hit for {} ({} requests)", user_id, count);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_scan() {
        let store = MemoryStore::new();
        store.set("rl:a", "1".into(), None).await;
        store.set("rl:b", "2".into(), None).await;
        store.set("other", "3".into(), None).await;

        assert_eq!(store.get("rl:a").await.as_deref(), Some("1"));
        assert_eq!(store.get("missing").await, None);
        assert_eq!(store.scan("rl:").await, vec!["rl:a", "rl:b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_secs(10)))
            .await;
        assert!(store.expire("k", Duration::from_secs(5)).await);
        assert!(!store.expire("nope", Duration::from_secs(5)).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await, None);
        assert!(store.scan("").await.is_empty());
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_restarts_after_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await, 1);
        assert_eq!(store.incr("n").await, 2);
        store.expire("n", Duration::from_secs(1)).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.incr("n").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_blocks_until_the_window_resets() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), Duration::from_secs(60), 3);
        let user = Uuid::new_v4();
        for _ in 0..3 {
            assert!(limiter.check(user).await);
        }
        assert!(!limiter.check(user).await);
        // Other users have their own budget.
        assert!(limiter.check(Uuid::new_v4()).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(user).await);
    }
}
