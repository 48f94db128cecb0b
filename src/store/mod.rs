//! Key-value counter/result store capability.
//!
//! Usage counters, cached orchestrator results, and prompt stats all live in
//! a fast key-value store with TTL semantics. Redis is the reference backend;
//! [`MemoryStore`] is the in-process implementation used by default and in
//! tests. Mutation of shared counters is restricted to atomic float
//! increments, never read-modify-write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Key prefix for per-user usage counters.
pub fn usage_key(user_id: &str, window: &str) -> String {
    format!("usage:{user_id}:{window}")
}

/// Key for a cached orchestrator result.
pub fn result_key(hash: &str) -> String {
    format!("airesult:{hash}")
}

/// Key for prompt performance stats.
pub fn stats_key(prompt_type: &str, version: &str) -> String {
    format!("prompt:stats:{prompt_type}:{version}")
}

/// Minimal key-value store surface required by the core.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a value, or None if absent/expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set a value with a TTL only if the key is absent. Returns whether the
    /// write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically increment a float counter, creating it at `delta` if
    /// absent. Returns the new value.
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64>;

    /// Set the TTL on an existing key. No-op if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remove every key. Tests only.
    async fn flush_all(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process TTL store.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let live = entries.get(key).is_some_and(|e| !e.is_expired());
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| {
                e.value
                    .parse::<f64>()
                    .map_err(|_| Error::Cache(format!("counter {key} holds a non-float value")))
            })
            .transpose()?
            .unwrap_or(0.0);

        let next = current + delta;
        let expires_at = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_by_float_creates_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by_float("c", 0.5).await.unwrap(), 0.5);
        let after = store.incr_by_float("c", 0.25).await.unwrap();
        assert!((after - 0.75).abs() < 1e-9);
        assert_eq!(store.get("c").await.unwrap(), Some("0.75".to_string()));
    }

    #[tokio::test]
    async fn test_set_nx_respects_live_entry() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex("k", "first", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("k", "second", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_expire_extends_counter() {
        let store = MemoryStore::new();
        store.incr_by_float("c", 1.0).await.unwrap();
        store.expire("c", Duration::from_secs(60)).await.unwrap();
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flush_all() {
        let store = MemoryStore::new();
        store
            .set_ex("a", "1", Duration::from_secs(60))
            .await
            .unwrap();
        store.flush_all().await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(usage_key("u1", "2026-08-01"), "usage:u1:2026-08-01");
        assert_eq!(result_key("abc"), "airesult:abc");
        assert_eq!(
            stats_key("graph-generation", "production"),
            "prompt:stats:graph-generation:production"
        );
    }
}
