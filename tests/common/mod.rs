//! Common utilities for integration tests
//!
//! Everything runs in-process:
//! - in-memory SQLite durable tier
//! - `DashMap` fast tier (or a switchable one that can be taken down)
//! - `ManualClock` so TTL expiry and slot boundaries are simulated

#![allow(dead_code)]

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use monitor_cache::analytics::LogRow;
use monitor_cache::backends::{DashMapCache, SqliteCache};
use monitor_cache::{CacheBackend, CacheEntry, Clock, ManualClock, TieredCache, async_trait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 2023-11-14T22:13:20Z, deliberately not on a slot boundary
pub const T0: i64 = 1_700_000_000;

pub const BACKFILL_TTL: Duration = Duration::from_secs(60);

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(T0, 0).expect("valid timestamp")
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

pub fn as_clock(clock: &Arc<ManualClock>) -> Arc<dyn Clock> {
    Arc::clone(clock) as Arc<dyn Clock>
}

/// Fast tier that fails every call while `down` is set
pub struct SwitchableFastTier {
    inner: DashMapCache,
    down: AtomicBool,
}

impl SwitchableFastTier {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: DashMapCache::with_clock(clock),
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for SwitchableFastTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set_with_ttl(entry, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        self.check()?;
        self.inner.remove_prefix(prefix).await
    }

    async fn len(&self) -> Result<u64> {
        self.check()?;
        self.inner.len().await
    }

    async fn health_check(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "switchable"
    }
}

/// Tiered cache with handles on each tier
pub struct TestTiers {
    pub clock: Arc<ManualClock>,
    pub fast: Option<Arc<SwitchableFastTier>>,
    pub durable: Arc<SqliteCache>,
    pub cache: Arc<TieredCache>,
}

impl TestTiers {
    pub fn fast(&self) -> &SwitchableFastTier {
        self.fast.as_deref().expect("fast tier configured")
    }
}

/// Fast + durable tiers on a manual clock
pub async fn setup_tiers() -> TestTiers {
    let clock = manual_clock();
    let fast = Arc::new(SwitchableFastTier::new(as_clock(&clock)));
    let durable = Arc::new(
        SqliteCache::in_memory(as_clock(&clock))
            .await
            .expect("Failed to open in-memory SQLite"),
    );
    let cache = Arc::new(TieredCache::new(
        Some(Arc::clone(&fast) as Arc<dyn CacheBackend>),
        Arc::clone(&durable) as _,
        as_clock(&clock),
        BACKFILL_TTL,
    ));

    TestTiers {
        clock,
        fast: Some(fast),
        durable,
        cache,
    }
}

/// Durable tier only
pub async fn setup_durable_only() -> TestTiers {
    let clock = manual_clock();
    let durable = Arc::new(
        SqliteCache::in_memory(as_clock(&clock))
            .await
            .expect("Failed to open in-memory SQLite"),
    );
    let cache = Arc::new(TieredCache::new(
        None,
        Arc::clone(&durable) as _,
        as_clock(&clock),
        BACKFILL_TTL,
    ));

    TestTiers {
        clock,
        fast: None,
        durable,
        cache,
    }
}

/// Log row `id` for `user_id` at `created_at`
pub fn log_row(id: i64, user_id: i64, quota: i64, created_at: DateTime<Utc>) -> LogRow {
    LogRow {
        id,
        user_id,
        username: format!("user{user_id}"),
        model_name: if id % 2 == 0 { "gpt-4o" } else { "claude" }.to_string(),
        quota,
        prompt_tokens: 10,
        completion_tokens: 20,
        created_at,
    }
}

/// Rows `1..=count`, spread over the last `count` seconds before `now`
pub fn log_rows(count: i64, now: DateTime<Utc>) -> Vec<LogRow> {
    (1..=count)
        .map(|id| log_row(id, id % 7, id % 13, now - chrono::Duration::seconds(count - id + 1)))
        .collect()
}
