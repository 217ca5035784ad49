//! Moka Cache - In-Memory Fast Tier
//!
//! High-performance in-memory cache using Moka for hot data storage.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, expires_after};
use crate::traits::{CacheBackend, CacheEntry};

/// Cached entry with the instant this tier stops serving it
#[derive(Debug, Clone)]
struct MokaSlot {
    entry: CacheEntry,
    evict_at: DateTime<Utc>,
}

impl MokaSlot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.evict_at > now && !self.entry.is_expired_at(now)
    }
}

/// Configuration for `MokaCache`
#[derive(Debug, Clone, Copy)]
pub struct MokaCacheConfig {
    /// Max capacity of the cache
    pub max_capacity: u64,
    /// Upper bound on any entry's lifetime, whatever TTL it was written with
    pub time_to_live: Duration,
}

impl Default for MokaCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            time_to_live: Duration::from_secs(3600),
        }
    }
}

/// Moka in-memory fast tier with per-key TTL support
///
/// This is the default fast tier, providing:
/// - Sub-millisecond in-memory access
/// - Automatic size-bounded eviction
/// - Per-key TTL measured on the injected [`Clock`]
pub struct MokaCache {
    cache: Cache<String, MokaSlot>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MokaCache {
    /// Create new Moka cache on the system clock
    #[must_use]
    pub fn new(config: MokaCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create new Moka cache measuring per-key TTLs on `clock`
    #[must_use]
    pub fn with_clock(config: MokaCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.time_to_live)
            .build();

        info!(
            capacity = config.max_capacity,
            "Moka fast tier initialized with per-key TTL support"
        );

        Self {
            cache,
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

#[async_trait]
impl CacheBackend for MokaCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.cache.get(key).await {
            Some(slot) if slot.is_live(self.clock.now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(slot.entry))
            }
            Some(_) => {
                self.cache.invalidate(key).await;
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
        let slot = MokaSlot {
            entry: entry.clone(),
            evict_at: expires_after(self.clock.now(), ttl),
        };
        self.cache.insert(entry.key.clone(), slot).await;
        debug!(key = %entry.key, ttl_secs = ttl.as_secs(), "[Moka] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        // Weakly consistent iteration: keys inserted mid-scan may survive,
        // which is acceptable for upsert-only data.
        let matching: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &matching {
            self.cache.invalidate(key.as_str()).await;
        }
        debug!(prefix = %prefix, removed = matching.len(), "[Moka] Removed keys by prefix");
        Ok(matching.len() as u64)
    }

    async fn len(&self) -> Result<u64> {
        self.cache.run_pending_tasks().await;
        Ok(self.cache.entry_count())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let stale: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, slot)| !slot.is_live(now))
            .map(|(key, _)| key)
            .collect();

        for key in &stale {
            self.cache.invalidate(key.as_str()).await;
        }
        Ok(stale.len() as u64)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Moka"
    }
}
