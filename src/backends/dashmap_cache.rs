//! `DashMap` Cache - Concurrent `HashMap` Fast Tier
//!
//! Lightweight in-memory fast tier. No eviction policy beyond TTL, so the
//! scheduler's sweep calls [`CacheBackend::purge_expired`] to reclaim memory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, expires_after};
use crate::traits::{CacheBackend, CacheEntry};

/// Stored entry plus the instant this tier stops holding it
#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    evict_at: DateTime<Utc>,
}

/// Concurrent fast tier backed by `DashMap`
///
/// **Use Case**: single-process deployments and tests
///
/// **Features**:
/// - Sharded concurrent reads/writes
/// - Per-key TTL measured on the injected [`Clock`]
/// - Prefix removal via `retain`, which locks one shard at a time
///
/// **Example**:
/// ```rust
/// use monitor_cache::backends::DashMapCache;
/// use monitor_cache::traits::{CacheBackend, CacheEntry};
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let cache = DashMapCache::new();
/// let entry = CacheEntry::new("user:1", b"alice".to_vec(), chrono::Utc::now(), None);
///
/// cache.set_with_ttl(&entry, Duration::from_secs(60)).await?;
/// assert_eq!(cache.get("user:1").await?, Some(entry));
/// # Ok(())
/// # }
/// ```
pub struct DashMapCache {
    map: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DashMapCache {
    /// Create new `DashMap` cache on the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create new `DashMap` cache measuring TTLs on `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        info!("Initializing DashMap fast tier");

        Self {
            map: Arc::new(DashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// (hits, misses) observed by this tier
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl DashMapCache {
    /// Remove `key` only if the stored slot is still stale at `now`
    ///
    /// A `set` racing with the read that saw the stale slot wins.
    fn drop_stale(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.map
            .remove_if(key, |_, slot| slot.evict_at <= now || slot.entry.is_expired_at(now))
            .is_some()
    }
}

impl Default for DashMapCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for DashMapCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();
        let found = self.map.get(key).map(|slot| {
            let live = slot.evict_at > now && !slot.entry.is_expired_at(now);
            (live, slot.entry.clone())
        });

        match found {
            Some((true, entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            Some((false, _)) => {
                self.drop_stale(key, now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set_with_ttl(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let evict_at = expires_after(self.clock.now(), ttl);
        self.map.insert(
            entry.key.clone(),
            Slot {
                entry: entry.clone(),
                evict_at,
            },
        );
        debug!(key = %entry.key, ttl_secs = ttl.as_secs(), "[DashMap] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let mut removed = 0;
        self.map.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(prefix = %prefix, removed, "[DashMap] Removed keys by prefix");
        Ok(removed)
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.map.len() as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        self.map.retain(|_, slot| {
            if slot.evict_at <= now || slot.entry.is_expired_at(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[DashMap] Cleaned up expired entries");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "DashMap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn entry(key: &str, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(key, key.as_bytes().to_vec(), now, None)
    }

    #[tokio::test]
    async fn tier_ttl_evicts_without_entry_expiry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = DashMapCache::with_clock(clock.clone());

        cache
            .set_with_ttl(&entry("a", clock.now()), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.get("a").await.unwrap().is_some());

        clock.advance(Duration::from_secs(5));
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_removal_spares_a_fresh_overwrite() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = DashMapCache::with_clock(clock.clone());

        cache
            .set_with_ttl(&entry("a", clock.now()), Duration::from_secs(5))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        let seen_stale_at = clock.now();

        cache
            .set_with_ttl(&entry("a", clock.now()), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!cache.drop_stale("a", seen_stale_at));
        assert!(cache.get("a").await.unwrap().is_some());

        clock.advance(Duration::from_secs(60));
        assert!(cache.drop_stale("a", clock.now()));
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_prefix_only_touches_matching_keys() {
        let cache = DashMapCache::new();
        let now = Utc::now();
        for key in ["slot:7d:a", "slot:7d:b", "slot:3d:a", "other"] {
            cache
                .set_with_ttl(&entry(key, now), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(cache.remove_prefix("slot:7d:").await.unwrap(), 2);
        assert_eq!(cache.len().await.unwrap(), 2);
        assert!(cache.get("slot:3d:a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_expired_counts_removed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = DashMapCache::with_clock(clock.clone());
        let now = clock.now();

        cache
            .set_with_ttl(&entry("short", now), Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set_with_ttl(&entry("long", now), Duration::from_secs(100))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(clock.now()).await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 1);
    }
}
