//! Tiered Cache - Unified Cache Operations
//!
//! Read-through/write-through store over an optional fast tier and a
//! required durable tier.
//!
//! ```text
//! get → fast tier ──hit──▶ return
//!         │ miss / unavailable
//!         ▼
//!       durable tier ──hit──▶ back-fill fast tier (short fixed TTL) ▶ return
//!         │ miss
//!         ▼
//!       Ok(None)
//! ```
//!
//! The durable tier is the source of truth for warm restarts: a failed
//! durable write fails the call, a failed fast-tier write is logged and the
//! store carries on durable-only until [`TieredCache::health_check`] sees the
//! fast tier recover.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, expires_after};
use crate::codecs::JsonCodec;
use crate::error::{MonitorError, Result};
use crate::traits::{CacheBackend, CacheCodec, CacheEntry, DurableBackend};

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Counts of entries removed by one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub fast: u64,
    pub durable: u64,
}

/// Cache statistics
///
/// Hit/miss counters live for the process lifetime and are not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub fast_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub backfills: u64,
    pub fast_tier_errors: u64,
    /// `None` when no fast tier is configured or it could not be counted
    pub fast_items: Option<u64>,
    pub durable_items: u64,
    pub fast_tier_available: bool,
    pub in_flight_requests: usize,
}

impl CacheStats {
    /// Hits over all lookups, in percent
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.fast_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }
}

/// Tiered cache store - unified operations across the fast and durable tiers
pub struct TieredCache<C: CacheCodec = JsonCodec> {
    fast: Option<Arc<dyn CacheBackend>>,
    durable: Arc<dyn DurableBackend>,
    codec: C,
    clock: Arc<dyn Clock>,
    backfill_ttl: Duration,
    fast_available: AtomicBool,
    fast_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    backfills: AtomicU64,
    fast_tier_errors: AtomicU64,
    /// In-flight computations, to prevent a stampede on the source store
    in_flight_requests: DashMap<String, Arc<Mutex<()>>>,
}

impl TieredCache<JsonCodec> {
    /// Create a store using the JSON codec
    pub fn new(
        fast: Option<Arc<dyn CacheBackend>>,
        durable: Arc<dyn DurableBackend>,
        clock: Arc<dyn Clock>,
        backfill_ttl: Duration,
    ) -> Self {
        Self::with_codec(fast, durable, JsonCodec, clock, backfill_ttl)
    }
}

impl<C: CacheCodec> TieredCache<C> {
    /// Create a store with an explicit codec
    pub fn with_codec(
        fast: Option<Arc<dyn CacheBackend>>,
        durable: Arc<dyn DurableBackend>,
        codec: C,
        clock: Arc<dyn Clock>,
        backfill_ttl: Duration,
    ) -> Self {
        info!(
            fast_tier = fast.as_ref().map_or("none", |f| f.name()),
            durable_tier = durable.name(),
            codec = codec.name(),
            backfill_ttl_secs = backfill_ttl.as_secs(),
            "Initializing tiered cache"
        );

        Self {
            fast,
            durable,
            codec,
            clock,
            backfill_ttl,
            fast_available: AtomicBool::new(true),
            fast_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backfills: AtomicU64::new(0),
            fast_tier_errors: AtomicU64::new(0),
            in_flight_requests: DashMap::new(),
        }
    }

    /// Clock used for every expiry decision
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether a fast tier is configured and currently considered healthy
    #[must_use]
    pub fn fast_tier_available(&self) -> bool {
        self.fast.is_some() && self.fast_available.load(Ordering::Relaxed)
    }

    fn usable_fast(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.fast
            .as_ref()
            .filter(|_| self.fast_available.load(Ordering::Relaxed))
    }

    /// Record a fast-tier failure; logs only on the healthy → degraded edge
    fn mark_fast_degraded(&self, op: &str, err: &anyhow::Error) {
        self.fast_tier_errors.fetch_add(1, Ordering::Relaxed);
        if self.fast_available.swap(false, Ordering::Relaxed) {
            let unavailable = MonitorError::TierUnavailable {
                tier: self.fast.as_ref().map_or("fast", |f| f.name()),
                reason: format!("{op}: {err:#}"),
            };
            warn!(error = %unavailable, "Fast tier degraded, serving from durable tier only");
        }
    }

    /// Fast-tier TTL for a copy of `entry`: fixed, and never past its expiry
    fn backfill_ttl_for(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Option<Duration> {
        match entry.remaining_ttl(now) {
            Some(remaining) if remaining.is_zero() => None,
            Some(remaining) => Some(remaining.min(self.backfill_ttl)),
            None => Some(self.backfill_ttl),
        }
    }

    async fn backfill(&self, entry: &CacheEntry, now: DateTime<Utc>) {
        let Some(fast) = self.usable_fast() else {
            return;
        };
        let Some(ttl) = self.backfill_ttl_for(entry, now) else {
            return;
        };

        match fast.set_with_ttl(entry, ttl).await {
            Ok(()) => {
                self.backfills.fetch_add(1, Ordering::Relaxed);
                debug!(key = %entry.key, ttl_secs = ttl.as_secs(), "Back-filled fast tier from durable tier");
            }
            Err(e) => self.mark_fast_degraded("backfill", &e),
        }
    }

    /// Locate a live entry across tiers, back-filling on a durable hit
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();

        if let Some(fast) = self.usable_fast() {
            match fast.get(key).await {
                Ok(Some(entry)) if !entry.is_expired_at(now) => {
                    self.fast_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry));
                }
                Ok(Some(_)) => {
                    if let Err(e) = fast.remove(key).await {
                        self.mark_fast_degraded("remove", &e);
                    }
                }
                Ok(None) => {}
                Err(e) => self.mark_fast_degraded("get", &e),
            }
        }

        match self.durable.get(key).await? {
            Some(entry) if !entry.is_expired_at(now) => {
                self.durable_hits.fetch_add(1, Ordering::Relaxed);
                self.backfill(&entry, now).await;
                Ok(Some(entry))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, entry: &CacheEntry) -> Result<T> {
        self.codec
            .deserialize(&entry.payload)
            .map_err(|e| MonitorError::serialization(&entry.key, e))
    }

    /// Get value from cache (fast tier first, then durable tier with back-fill)
    ///
    /// # Returns
    /// * `Ok(Some(value))` - Live value found in either tier
    /// * `Ok(None)` - Miss: absent or expired in every tier
    ///
    /// # Errors
    ///
    /// Returns an error if the durable tier fails or the stored payload does
    /// not decode to `T`. Fast-tier failures are absorbed.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.lookup(key).await? {
            Some(entry) => self.decode(&entry).map(Some),
            None => Ok(None),
        }
    }

    /// Whether a live entry exists for `key` in any tier
    ///
    /// # Errors
    ///
    /// Returns an error if the durable tier fails.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key).await?.is_some())
    }

    /// Serialize and store `value` in both tiers for `ttl`
    ///
    /// # Errors
    ///
    /// * `InvalidTtl` - `ttl` is zero
    /// * `Serialization` - the value cannot be encoded (nothing is cached)
    /// * durable-tier failure - the value is not cached in either tier
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(MonitorError::InvalidTtl {
                key: key.to_string(),
                ttl,
            });
        }

        let payload = self
            .codec
            .serialize(value)
            .map_err(|e| MonitorError::serialization(key, e))?;
        let now = self.clock.now();
        let entry = CacheEntry::new(key, payload, now, Some(expires_after(now, ttl)));

        self.durable.set_with_ttl(&entry, ttl).await?;

        if let Some(fast) = self.usable_fast() {
            if let Err(e) = fast.set_with_ttl(&entry, ttl).await {
                self.mark_fast_degraded("set", &e);
            }
        }

        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached key in tiered store");
        Ok(())
    }

    /// Remove `key` from both tiers
    ///
    /// # Errors
    ///
    /// Returns an error if the durable delete fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if let Some(fast) = self.fast.as_ref() {
            if let Err(e) = fast.remove(key).await {
                self.mark_fast_degraded("remove", &e);
            }
        }
        self.durable.remove(key).await?;
        Ok(())
    }

    /// Remove every key starting with `prefix` from both tiers
    ///
    /// Returns the number of durable entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable delete fails.
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        if let Some(fast) = self.fast.as_ref() {
            match fast.remove_prefix(prefix).await {
                Ok(n) => debug!(prefix = %prefix, removed = n, "Removed prefix from fast tier"),
                Err(e) => self.mark_fast_degraded("remove_prefix", &e),
            }
        }
        let removed = self.durable.remove_prefix(prefix).await?;
        info!(prefix = %prefix, removed, "Invalidated cache prefix");
        Ok(removed)
    }

    /// Get or compute a value with stampede protection
    ///
    /// Concurrent callers for the same missing key are coalesced: one runs
    /// `compute_fn`, the others wait and read its result from the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if `compute_fn` fails or the durable tier fails.
    /// A failure to cache the computed value is logged, not returned.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, compute_fn: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let lock = self
            .in_flight_requests
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let _cleanup_guard = CleanupGuard {
            map: &self.in_flight_requests,
            key: key.to_string(),
        };

        // Another request may have populated it while we were waiting
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        debug!(key = %key, "Computing fresh value (stampede protected)");
        let value = compute_fn().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            warn!(key = %key, error = %e, "Failed to cache computed value");
        }
        Ok(value)
    }

    /// Copy every live durable entry into the fast tier
    ///
    /// Used by the restore warmup step after a restart. Returns the number of
    /// entries copied; zero when no fast tier is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable tier cannot be scanned.
    pub async fn restore_fast_tier(&self) -> Result<usize> {
        if self.usable_fast().is_none() {
            debug!("No usable fast tier, restore is a no-op");
            return Ok(0);
        }

        let now = self.clock.now();
        let entries = self.durable.load_live(now).await?;
        let before = self.backfills.load(Ordering::Relaxed);
        for entry in &entries {
            self.backfill(entry, now).await;
        }
        let restored = usize::try_from(self.backfills.load(Ordering::Relaxed) - before).unwrap_or(0);

        info!(restored, scanned = entries.len(), "Restored fast tier from durable tier");
        Ok(restored)
    }

    /// Purge expired entries from both tiers
    ///
    /// # Errors
    ///
    /// Returns an error if the durable purge fails.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        if let Some(fast) = self.usable_fast() {
            match fast.purge_expired(now).await {
                Ok(n) => report.fast = n,
                Err(e) => self.mark_fast_degraded("purge_expired", &e),
            }
        }
        report.durable = self.durable.purge_expired(now).await?;

        debug!(fast = report.fast, durable = report.durable, "Expired entries swept");
        Ok(report)
    }

    /// Probe both tiers, re-enabling a recovered fast tier
    ///
    /// Returns `true` if the durable tier is healthy. Fast-tier failure is
    /// tolerated (graceful degradation).
    pub async fn health_check(&self) -> bool {
        if let Some(fast) = self.fast.as_ref() {
            // Writes skipped the fast tier while it was degraded, so whatever it
            // still holds may be stale: flush before serving from it again.
            let fast_ok = fast.health_check().await
                && (self.fast_available.load(Ordering::Relaxed) || fast.remove_prefix("").await.is_ok());
            let was_available = self.fast_available.swap(fast_ok, Ordering::Relaxed);
            match (was_available, fast_ok) {
                (false, true) => info!(tier = fast.name(), "Fast tier recovered and flushed"),
                (true, false) => {
                    self.fast_tier_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(tier = fast.name(), "Fast tier failed health check, degrading");
                }
                _ => {}
            }
        }

        self.durable.health_check().await
    }

    /// Get comprehensive cache statistics
    pub async fn stats(&self) -> CacheStats {
        let fast_items = match self.fast.as_ref() {
            Some(fast) => fast.len().await.ok(),
            None => None,
        };
        let durable_items = self.durable.len().await.unwrap_or(0);

        CacheStats {
            fast_hits: self.fast_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backfills: self.backfills.load(Ordering::Relaxed),
            fast_tier_errors: self.fast_tier_errors.load(Ordering::Relaxed),
            fast_items,
            durable_items,
            fast_tier_available: self.fast_tier_available(),
            in_flight_requests: self.in_flight_requests.len(),
        }
    }
}
