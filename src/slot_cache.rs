//! Slot Cache - time-sliced incremental aggregation
//!
//! A sliding window (e.g. `7d`) is cut into fixed-size slots anchored to the
//! wall-clock slot boundary. Each slot's aggregate is fetched once and cached
//! under `(window, sort_key, slot_start)`, so recomputing the window only
//! fetches slots that rotated in since the last pass.
//!
//! Aggregation is all-or-nothing: if any slot of the window is missing,
//! [`SlotCache::aggregate_slot_data`] returns [`MonitorError::CacheMiss`]
//! instead of a partial answer. Callers warm the window first or fall back to
//! a direct computation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::tiered_cache::TieredCache;

const SLOT_KEY_PREFIX: &str = "slot";
const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Static layout of one named window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    /// Declared length of the window
    pub window: Duration,
    pub slot_size: Duration,
    pub slot_count: u32,
    /// Lifetime of a completed slot; must exceed the window so slots survive rotation
    pub ttl: Duration,
}

impl SlotDefinition {
    #[must_use]
    pub const fn new(window: Duration, slot_size: Duration, slot_count: u32, ttl: Duration) -> Self {
        Self {
            window,
            slot_size,
            slot_count,
            ttl,
        }
    }

    /// Total span covered by the slots
    #[must_use]
    pub fn coverage(&self) -> Duration {
        self.slot_size.saturating_mul(self.slot_count)
    }

    fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| MonitorError::InvalidSlotConfig {
            window: name.to_string(),
            reason,
        };

        if self.slot_size.as_secs() == 0 || self.slot_count == 0 || self.window.is_zero() {
            return Err(invalid(
                "slot size (whole seconds), slot count and window must be non-zero".to_string(),
            ));
        }
        if self.coverage() < self.window {
            return Err(invalid(format!(
                "slot_size x slot_count = {:?} does not cover window {:?}",
                self.coverage(),
                self.window
            )));
        }
        if self.ttl <= self.window {
            return Err(invalid(format!(
                "ttl {:?} must exceed window {:?}",
                self.ttl, self.window
            )));
        }
        Ok(())
    }
}

/// All supported windows plus the TTL of the in-progress slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub windows: BTreeMap<String, SlotDefinition>,
    /// TTL of the slot still being written to (`slot_end > now`), so it refreshes
    pub live_slot_ttl: Duration,
}

impl Default for SlotConfig {
    fn default() -> Self {
        let hours = |h: u64| Duration::from_secs(h * HOUR);
        let days = |d: u64| Duration::from_secs(d * DAY);

        let windows = BTreeMap::from([
            ("24h".to_string(), SlotDefinition::new(hours(24), hours(1), 24, hours(25))),
            ("3d".to_string(), SlotDefinition::new(days(3), hours(6), 12, days(4))),
            ("7d".to_string(), SlotDefinition::new(days(7), hours(12), 14, days(8))),
            ("14d".to_string(), SlotDefinition::new(days(14), days(1), 14, days(15))),
        ]);

        Self {
            windows,
            live_slot_ttl: Duration::from_secs(60),
        }
    }
}

impl SlotConfig {
    /// Check every window covers its declared length and outlives it
    ///
    /// Run once at startup; a failure must abort the process.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSlotConfig` naming the first offending window.
    pub fn validate(&self) -> Result<()> {
        for (name, definition) in &self.windows {
            definition.validate(name)?;
        }
        if self.live_slot_ttl.is_zero() {
            return Err(MonitorError::InvalidSlotConfig {
                window: "*".to_string(),
                reason: "live slot ttl must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Definition for `window`, rejecting unknown names
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` if no definition exists.
    pub fn definition(&self, window: &str) -> Result<&SlotDefinition> {
        self.windows
            .get(window)
            .ok_or_else(|| MonitorError::UnsupportedWindow(window.to_string()))
    }
}

/// One time bucket `[start, end)` of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Cached aggregate of one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord<T> {
    pub window: String,
    pub sort_key: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Cached and missing slots of a window, computed from one clock reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPartition {
    pub cached: Vec<Slot>,
    pub missing: Vec<Slot>,
}

/// Outcome of [`SlotCache::warmup_slot_cache`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotWarmupReport {
    pub fetched: usize,
    pub already_cached: usize,
    pub failed: usize,
}

/// Computes the aggregate of one slot from the source store
#[async_trait]
pub trait SlotFetcher<T>: Send + Sync {
    async fn fetch(&self, window: &str, sort_key: &str, slot: &Slot) -> anyhow::Result<T>;
}

/// Folds per-slot payloads into a window aggregate
pub trait SlotCombiner<T> {
    type Output;

    fn empty(&self) -> Self::Output;

    fn fold(&self, acc: Self::Output, slot: &Slot, payload: T) -> Self::Output;
}

/// Sums numeric slot payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct SumCombiner;

impl<T> SlotCombiner<T> for SumCombiner
where
    T: std::ops::Add<Output = T> + Default,
{
    type Output = T;

    fn empty(&self) -> T {
        T::default()
    }

    fn fold(&self, acc: T, _slot: &Slot, payload: T) -> T {
        acc + payload
    }
}

/// One ranked row of a leaderboard slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub id: String,
    pub score: i64,
    pub requests: u64,
}

/// Merges per-slot leaderboards by id and keeps the top `n` by score
#[derive(Debug, Clone, Copy)]
pub struct TopNCombiner {
    pub n: usize,
}

impl TopNCombiner {
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self { n }
    }

    /// Order merged totals and cut to `n`; ties break on id for stable output
    #[must_use]
    pub fn finish(&self, merged: BTreeMap<String, LeaderboardEntry>) -> Vec<LeaderboardEntry> {
        let mut ranked: Vec<LeaderboardEntry> = merged.into_values().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        ranked.truncate(self.n);
        ranked
    }
}

impl SlotCombiner<Vec<LeaderboardEntry>> for TopNCombiner {
    type Output = BTreeMap<String, LeaderboardEntry>;

    fn empty(&self) -> Self::Output {
        BTreeMap::new()
    }

    fn fold(
        &self,
        mut acc: Self::Output,
        _slot: &Slot,
        payload: Vec<LeaderboardEntry>,
    ) -> Self::Output {
        for row in payload {
            acc.entry(row.id.clone())
                .and_modify(|total| {
                    total.score += row.score;
                    total.requests += row.requests;
                })
                .or_insert(row);
        }
        acc
    }
}

/// Slot cache over the tiered store
pub struct SlotCache {
    cache: Arc<TieredCache>,
    config: SlotConfig,
}

impl SlotCache {
    /// Build a slot cache, validating the slot layout
    ///
    /// # Errors
    ///
    /// Returns `InvalidSlotConfig` if any window is malformed.
    pub fn new(cache: Arc<TieredCache>, config: SlotConfig) -> Result<Self> {
        config.validate()?;
        info!(windows = ?config.windows.keys().collect::<Vec<_>>(), "Slot cache configured");
        Ok(Self { cache, config })
    }

    #[must_use]
    pub fn config(&self) -> &SlotConfig {
        &self.config
    }

    /// Cache key of one slot
    #[must_use]
    pub fn slot_key(window: &str, sort_key: &str, slot: &Slot) -> String {
        format!(
            "{SLOT_KEY_PREFIX}:{window}:{sort_key}:{}",
            slot.start.timestamp()
        )
    }

    /// Slots of `window` at `now`, newest first
    ///
    /// Slot `i` is `[anchor - i*slot_size, anchor - i*slot_size + slot_size)`
    /// where `anchor = floor(now / slot_size) * slot_size`; slot 0 is the one
    /// currently being written to.
    fn slots_at(definition: &SlotDefinition, now: DateTime<Utc>) -> Vec<Slot> {
        let size = i64::try_from(definition.slot_size.as_secs()).unwrap_or(i64::MAX);
        let anchor = now.timestamp().div_euclid(size) * size;

        (0..i64::from(definition.slot_count))
            .filter_map(|i| {
                let start = anchor.checked_sub(i.checked_mul(size)?)?;
                Some(Slot {
                    start: DateTime::from_timestamp(start, 0)?,
                    end: DateTime::from_timestamp(start.checked_add(size)?, 0)?,
                })
            })
            .collect()
    }

    /// Slots covering `window` right now, newest first
    ///
    /// Deterministic within one slot boundary: two calls in the same slot
    /// return identical lists.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` for an unconfigured window.
    pub fn calculate_slots(&self, window: &str) -> Result<Vec<Slot>> {
        let definition = self.config.definition(window)?;
        Ok(Self::slots_at(definition, self.cache.clock().now()))
    }

    /// Split the window's slots into cached and missing
    ///
    /// Both sets come from a single slot computation, so together they are
    /// exactly [`calculate_slots`](Self::calculate_slots) and never overlap.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` or a durable-tier failure.
    pub async fn partition_slots(&self, window: &str, sort_key: &str) -> Result<SlotPartition> {
        let slots = self.calculate_slots(window)?;
        let mut partition = SlotPartition::default();

        for slot in slots {
            if self.cache.contains(&Self::slot_key(window, sort_key, &slot)).await? {
                partition.cached.push(slot);
            } else {
                partition.missing.push(slot);
            }
        }
        Ok(partition)
    }

    /// Slots of the window that have no cached aggregate
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` or a durable-tier failure.
    pub async fn get_missing_slots(&self, window: &str, sort_key: &str) -> Result<Vec<Slot>> {
        Ok(self.partition_slots(window, sort_key).await?.missing)
    }

    /// Slots of the window whose aggregate is cached
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` or a durable-tier failure.
    pub async fn get_cached_slots(&self, window: &str, sort_key: &str) -> Result<Vec<Slot>> {
        Ok(self.partition_slots(window, sort_key).await?.cached)
    }

    /// Store one slot's aggregate
    async fn store_slot<T: Serialize + Sync>(
        &self,
        window: &str,
        sort_key: &str,
        definition: &SlotDefinition,
        slot: &Slot,
        payload: T,
    ) -> Result<()> {
        let now = self.cache.clock().now();
        let ttl = if slot.end > now {
            self.config.live_slot_ttl
        } else {
            definition.ttl
        };

        let record = SlotRecord {
            window: window.to_string(),
            sort_key: sort_key.to_string(),
            slot_start: slot.start,
            slot_end: slot.end,
            payload,
            created_at: now,
            expires_at: crate::clock::expires_after(now, ttl),
        };
        self.cache
            .set(&Self::slot_key(window, sort_key, slot), &record, ttl)
            .await
    }

    /// Fetch and cache only the missing slots
    ///
    /// Idempotent: with every slot cached, `fetcher` is not called at all.
    /// A failing slot is logged and counted; the remaining slots still load.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` or a durable-tier failure while partitioning.
    pub async fn warmup_slot_cache<T, F>(
        &self,
        window: &str,
        sort_key: &str,
        fetcher: &F,
    ) -> Result<SlotWarmupReport>
    where
        T: Serialize + Send + Sync,
        F: SlotFetcher<T> + ?Sized,
    {
        let definition = *self.config.definition(window)?;
        let partition = self.partition_slots(window, sort_key).await?;
        let mut report = SlotWarmupReport {
            already_cached: partition.cached.len(),
            ..SlotWarmupReport::default()
        };

        for slot in &partition.missing {
            let stored = match fetcher.fetch(window, sort_key, slot).await {
                Ok(payload) => {
                    self.store_slot(window, sort_key, &definition, slot, payload)
                        .await
                }
                Err(e) => Err(MonitorError::Backend(e)),
            };

            match stored {
                Ok(()) => report.fetched += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(window, sort_key, slot = %slot, error = %e, "Slot warmup failed");
                }
            }
        }

        info!(
            window,
            sort_key,
            fetched = report.fetched,
            already_cached = report.already_cached,
            failed = report.failed,
            "Slot cache warmed"
        );
        Ok(report)
    }

    /// Fold every slot of the window with `combiner`
    ///
    /// # Errors
    ///
    /// * `CacheMiss` - at least one slot is not cached (no partial result)
    /// * `UnsupportedWindow` - unconfigured window
    /// * `Serialization` - a cached payload does not decode to `T`
    pub async fn aggregate_slot_data<T, C>(
        &self,
        window: &str,
        sort_key: &str,
        combiner: &C,
    ) -> Result<C::Output>
    where
        T: DeserializeOwned,
        C: SlotCombiner<T> + ?Sized,
    {
        let slots = self.calculate_slots(window)?;
        let mut records = Vec::with_capacity(slots.len());
        let mut missing = Vec::new();

        for slot in &slots {
            let key = Self::slot_key(window, sort_key, slot);
            match self.cache.get::<SlotRecord<T>>(&key).await? {
                Some(record) => records.push((*slot, record.payload)),
                None => missing.push(slot.to_string()),
            }
        }

        if !missing.is_empty() {
            debug!(window, sort_key, missing = missing.len(), "Slot aggregation miss");
            return Err(MonitorError::CacheMiss(format!(
                "{window}/{sort_key}: {} of {} slots missing ({})",
                missing.len(),
                slots.len(),
                missing.join(", ")
            )));
        }

        Ok(records
            .into_iter()
            .fold(combiner.empty(), |acc, (slot, payload)| {
                combiner.fold(acc, &slot, payload)
            }))
    }

    /// Drop every cached slot of `window` (all sort keys)
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedWindow` or a durable-tier failure.
    pub async fn invalidate_window(&self, window: &str) -> Result<u64> {
        self.config.definition(window)?;
        self.cache
            .delete_by_prefix(&format!("{SLOT_KEY_PREFIX}:{window}:"))
            .await
    }
}
