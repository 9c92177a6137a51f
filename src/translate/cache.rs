//! Result cache keyed by fingerprint.
//! L1: in-memory LRU with per-entry TTL. L2 (optional): SQLite, see `sqlite_cache`.
//! Default TTL: 7 days. Writes are best-effort; callers log and continue.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default TTL for cached results: 7 days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// A translation stored under a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub translated_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider_or_model: String,
    /// Unix seconds.
    pub cached_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(String),
    #[error("cache payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Store(e.to_string())
    }
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError>;

    async fn set(&self, key: &str, value: CachedResult, ttl: Duration) -> Result<(), CacheError>;

    /// Like `get`, plus the lifetime the entry has left when the store knows it.
    async fn get_expiring(&self, key: &str) -> Result<Option<(CachedResult, Option<Duration>)>, CacheError> {
        Ok(self.get(key).await?.map(|hit| (hit, None)))
    }

    /// Parallel fan-out over `get`. Missing or failing keys are simply absent.
    async fn batch_get(&self, keys: &[String]) -> HashMap<String, CachedResult> {
        let lookups = keys.iter().map(|key| async move { (key, self.get(key).await) });
        let mut found = HashMap::new();
        for (key, result) in join_all(lookups).await {
            match result {
                Ok(Some(hit)) => {
                    found.insert(key.clone(), hit);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cache batch lookup failed for one key"),
            }
        }
        found
    }
}

struct CacheEntry {
    value: CachedResult,
    expires_at: Instant,
}

/// In-memory LRU cache with TTL.
pub struct MemoryResultCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryResultCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<CachedResult> {
        self.lookup_expiring(key).map(|(value, _)| value)
    }

    /// Live entry and its remaining lifetime; expired entries are evicted here.
    pub fn lookup_expiring(&self, key: &str) -> Option<(CachedResult, Duration)> {
        let mut cache = self.inner.lock();
        let now = Instant::now();
        match cache.get(key) {
            Some(entry) if now < entry.expires_at => {
                Some((entry.value.clone(), entry.expires_at - now))
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: CachedResult, ttl: Duration) {
        let mut cache = self.inner.lock();
        cache.put(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, value: CachedResult, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn get_expiring(&self, key: &str) -> Result<Option<(CachedResult, Option<Duration>)>, CacheError> {
        Ok(self.lookup_expiring(key).map(|(value, left)| (value, Some(left))))
    }
}

/// L1 in front of a slower persistent L2. An L2 hit backfills L1 for the
/// lifetime the L2 entry has left, never longer.
pub struct TieredCache {
    l1: MemoryResultCache,
    l2: Arc<dyn ResultCache>,
    l1_ttl: Duration,
}

impl TieredCache {
    pub fn new(l1: MemoryResultCache, l2: Arc<dyn ResultCache>, l1_ttl: Duration) -> Self {
        Self { l1, l2, l1_ttl }
    }
}

#[async_trait]
impl ResultCache for TieredCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        Ok(self.get_expiring(key).await?.map(|(value, _)| value))
    }

    async fn get_expiring(&self, key: &str) -> Result<Option<(CachedResult, Option<Duration>)>, CacheError> {
        if let Some((hit, left)) = self.l1.lookup_expiring(key) {
            return Ok(Some((hit, Some(left))));
        }
        let Some((value, left)) = self.l2.get_expiring(key).await? else {
            return Ok(None);
        };
        let left = left
            .unwrap_or_else(|| remaining_from(value.cached_at, self.l1_ttl))
            .min(self.l1_ttl);
        if !left.is_zero() {
            debug!(remaining_ms = left.as_millis() as u64, "L2 hit, backfilling L1");
            self.l1.insert(key, value.clone(), left);
        }
        Ok(Some((value, Some(left))))
    }

    async fn set(&self, key: &str, value: CachedResult, ttl: Duration) -> Result<(), CacheError> {
        self.l1.insert(key, value.clone(), ttl.min(self.l1_ttl));
        self.l2.set(key, value, ttl).await
    }
}

/// Lifetime left for an entry written at `cached_at` (Unix seconds) with `ttl`.
fn remaining_from(cached_at: i64, ttl: Duration) -> Duration {
    let age = u64::try_from(now_unix().saturating_sub(cached_at)).unwrap_or(0);
    ttl.saturating_sub(Duration::from_secs(age))
}

/// Current time as Unix timestamp (seconds).
pub fn now_unix() -> i64 {
    now_unix_ms() / 1000
}

pub fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str) -> CachedResult {
        CachedResult {
            translated_text: text.to_string(),
            source_lang: "en".into(),
            target_lang: "fr".into(),
            provider_or_model: "google".into(),
            cached_at: now_unix(),
        }
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryResultCache::new(8);
        cache.set("k1", result("Bonjour"), DEFAULT_TTL).await.unwrap();
        let hit = cache.get("k1").await.unwrap().unwrap();
        assert_eq!(hit.translated_text, "Bonjour");
        assert!(cache.get("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache = MemoryResultCache::new(8);
        cache.set("k1", result("Bonjour"), Duration::ZERO).await.unwrap();
        assert!(cache.get("k1").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn batch_get_tolerates_partial_hits() {
        let cache = MemoryResultCache::new(8);
        cache.set("a", result("A"), DEFAULT_TTL).await.unwrap();
        cache.set("c", result("C"), DEFAULT_TTL).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = cache.batch_get(&keys).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"].translated_text, "A");
        assert!(!found.contains_key("b"));
    }

    #[tokio::test]
    async fn lru_evicts_oldest() {
        let cache = MemoryResultCache::new(2);
        cache.insert("a", result("A"), DEFAULT_TTL);
        cache.insert("b", result("B"), DEFAULT_TTL);
        cache.insert("c", result("C"), DEFAULT_TTL);
        assert!(cache.lookup("a").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn tiered_backfills_l1_from_l2() {
        let l2 = Arc::new(MemoryResultCache::new(8));
        l2.insert("k", result("Salut"), DEFAULT_TTL);
        let tiered = TieredCache::new(MemoryResultCache::new(8), l2.clone(), DEFAULT_TTL);

        let hit = tiered.get("k").await.unwrap().unwrap();
        assert_eq!(hit.translated_text, "Salut");
        assert!(tiered.l1.lookup("k").is_some());

        tiered.set("n", result("Neuf"), DEFAULT_TTL).await.unwrap();
        assert!(l2.lookup("n").is_some());
    }

    #[tokio::test]
    async fn backfill_keeps_the_l2_expiry() {
        let l2 = Arc::new(MemoryResultCache::new(8));
        l2.insert("k", result("x"), Duration::from_millis(300));
        let tiered = TieredCache::new(MemoryResultCache::new(8), l2.clone(), DEFAULT_TTL);

        assert!(tiered.get("k").await.unwrap().is_some());
        let (_, left) = tiered.l1.lookup_expiring("k").unwrap();
        assert!(left <= Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(tiered.get("k").await.unwrap().is_none());
        assert!(tiered.l1.lookup("k").is_none());
    }

    #[tokio::test]
    async fn backfill_without_known_expiry_uses_cached_at() {
        struct Plain(CachedResult);

        #[async_trait]
        impl ResultCache for Plain {
            async fn get(&self, _key: &str) -> Result<Option<CachedResult>, CacheError> {
                Ok(Some(self.0.clone()))
            }

            async fn set(&self, _key: &str, _value: CachedResult, _ttl: Duration) -> Result<(), CacheError> {
                Ok(())
            }
        }

        let mut stale = result("old");
        stale.cached_at = now_unix() - 3600;
        let tiered = TieredCache::new(MemoryResultCache::new(8), Arc::new(Plain(stale)), Duration::from_secs(60));
        assert!(tiered.get("k").await.unwrap().is_some());
        assert!(tiered.l1.lookup("k").is_none());
    }
}
