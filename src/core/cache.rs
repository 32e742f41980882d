//! Shared cache abstraction.
//!
//! Health records, rate-limit windows and the API key cache all live behind
//! [`CacheStore`]. Production runs against [`RedisCache`](crate::core::redis_cache::RedisCache);
//! tests and single-node deployments use [`MemoryCache`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache command timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache value could not be decoded: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Minimal key/value contract the gateway needs from its shared cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value and TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Atomically increment a counter. The TTL is applied when the
    /// increment creates the key, in the same operation.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64>;

    async fn del(&self, key: &str) -> CacheResult<()>;

    async fn ping(&self) -> CacheResult<()>;
}

pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn CacheStore,
    key: &str,
) -> CacheResult<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::Decode(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> CacheResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Decode(e.to_string()))?;
    cache.set_ex(key, &raw, ttl).await
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Writes between two sweeps of expired entries.
const SWEEP_EVERY_WRITES: u64 = 256;

/// In-process cache with per-entry expiry.
///
/// Expired entries are dropped lazily on access, the same way a read against
/// Redis would miss once the TTL has elapsed. Keys that are never read again
/// (past rate-limit buckets) are reclaimed by a sweep every
/// [`SWEEP_EVERY_WRITES`] writes.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// The entry guard is released before this returns.
    fn incr_entry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            });

        if entry.is_expired(now) {
            *entry = MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            };
        }

        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| CacheError::Decode(format!("{} is not an integer", key)))?;
        let next = current + 1;
        entry.value = next.to_string();
        if next == 1 {
            entry.expires_at = Some(now + ttl);
        }
        Ok(next)
    }

    /// Must not be called while holding a guard into `entries`.
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::trace!(removed, "Swept expired cache entries");
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        self.after_write();
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let next = self.incr_entry(key, ttl)?;
        self.after_write();
        Ok(next)
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set_ex("short", "v", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_incr_sets_ttl_only_on_first_increment() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(50);
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 2);

        // The second increment must not have pushed the deadline out.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let cache = MemoryCache::new();
        cache.set_ex("c", "abc", Duration::from_secs(60)).await.unwrap();
        assert!(matches!(
            cache.incr_with_expiry("c", Duration::from_secs(60)).await,
            Err(CacheError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .incr_with_expiry("shared", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.get("shared").await.unwrap(), Some("50".to_string()));
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = MemoryCache::new();
        let value = Sample {
            name: "a".to_string(),
            count: 3,
        };
        set_json(&cache, "json", &value, Duration::from_secs(60))
            .await
            .unwrap();
        let loaded: Option<Sample> = get_json(&cache, "json").await.unwrap();
        assert_eq!(loaded, Some(value));

        cache.set_ex("bad", "{not json", Duration::from_secs(60)).await.unwrap();
        let bad: CacheResult<Option<Sample>> = get_json(&cache, "bad").await;
        assert!(matches!(bad, Err(CacheError::Decode(_))));
    }

    #[tokio::test]
    async fn test_past_rate_buckets_are_reclaimed() {
        let cache = MemoryCache::new();
        for bucket in 0..1000 {
            cache
                .incr_with_expiry(&format!("ratelimit:1:{}", bucket), Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Only the current bucket keeps being written.
        for _ in 0..SWEEP_EVERY_WRITES {
            cache
                .incr_with_expiry("ratelimit:1:1000", Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(cache.entries.len(), 1);
        assert_eq!(
            cache.get("ratelimit:1:1000").await.unwrap(),
            Some(SWEEP_EVERY_WRITES.to_string())
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.set_ex("old", "v", Duration::from_millis(1)).await.unwrap();
        cache.set_ex("live", "v", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.entries.len(), 1);
        assert_eq!(cache.get("live").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_del() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.del("k").await.unwrap();
    }
}
