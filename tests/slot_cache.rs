//! Integration tests for the slot cache
//!
//! Slot boundaries are driven by the manual clock.

mod common;

use anyhow::bail;
use chrono::{DateTime, Utc};
use common::*;
use monitor_cache::slot_cache::SlotRecord;
use monitor_cache::{
    Clock, LeaderboardEntry, MonitorError, Slot, SlotCache, SlotConfig, SlotFetcher, SumCombiner,
    TopNCombiner, async_trait,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const HOUR: u64 = 3600;

fn payload_for(slot: &Slot) -> u64 {
    u64::try_from(slot.start.timestamp() / 3600 % 1000).unwrap_or(0)
}

/// Deterministic per-slot counter, optionally failing for one slot
#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
    fail_start: Option<DateTime<Utc>>,
}

impl CountingFetcher {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlotFetcher<u64> for CountingFetcher {
    async fn fetch(&self, _window: &str, _sort_key: &str, slot: &Slot) -> anyhow::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start == Some(slot.start) {
            bail!("source query timed out");
        }
        Ok(payload_for(slot))
    }
}

/// Per-slot leaderboard: user "a" always scores 1, user "b" scores 3 in even hours
struct LeaderboardFetcher;

#[async_trait]
impl SlotFetcher<Vec<LeaderboardEntry>> for LeaderboardFetcher {
    async fn fetch(
        &self,
        _window: &str,
        _sort_key: &str,
        slot: &Slot,
    ) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let mut rows = vec![LeaderboardEntry {
            id: "a".to_string(),
            score: 1,
            requests: 1,
        }];
        if (slot.start.timestamp() / 3600) % 2 == 0 {
            rows.push(LeaderboardEntry {
                id: "b".to_string(),
                score: 3,
                requests: 1,
            });
        }
        Ok(rows)
    }
}

async fn setup_slots() -> (TestTiers, SlotCache) {
    let tiers = setup_tiers().await;
    let slots = SlotCache::new(Arc::clone(&tiers.cache), SlotConfig::default())
        .expect("default slot layout is valid");
    (tiers, slots)
}

async fn prepopulate(tiers: &TestTiers, window: &str, sort_key: &str, slot: &Slot) {
    let now = tiers.clock.now();
    let record = SlotRecord {
        window: window.to_string(),
        sort_key: sort_key.to_string(),
        slot_start: slot.start,
        slot_end: slot.end,
        payload: payload_for(slot),
        created_at: now,
        expires_at: now + chrono::Duration::days(8),
    };
    tiers
        .cache
        .set(
            &SlotCache::slot_key(window, sort_key, slot),
            &record,
            Duration::from_secs(8 * 24 * HOUR),
        )
        .await
        .expect("Failed to prepopulate slot");
}

/// Test slot list shape for the 7d window
#[tokio::test]
async fn test_calculate_slots_7d() {
    let (_tiers, slots) = setup_slots().await;

    let first = slots.calculate_slots("7d").unwrap();
    let second = slots.calculate_slots("7d").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 14);

    let size = 12 * 3600;
    let anchor = T0.div_euclid(size) * size;
    for (i, slot) in (0_i64..).zip(&first) {
        assert_eq!(slot.start.timestamp(), anchor - i * size);
        assert_eq!((slot.end - slot.start).num_seconds(), size);
    }
    let unique: HashSet<_> = first.iter().map(|s| s.start).collect();
    assert_eq!(unique.len(), 14);
}

/// Test unknown windows are rejected everywhere
#[tokio::test]
async fn test_unsupported_window() {
    let (_tiers, slots) = setup_slots().await;

    assert!(matches!(
        slots.calculate_slots("30d"),
        Err(MonitorError::UnsupportedWindow(ref w)) if w == "30d"
    ));
    let fetcher = CountingFetcher::default();
    assert!(matches!(
        slots.warmup_slot_cache("30d", "quota", &fetcher).await,
        Err(MonitorError::UnsupportedWindow(_))
    ));
    assert_eq!(fetcher.calls(), 0);
}

/// Test the 7d scenario: 3 oldest slots cached, 11 fetched, sum over 14
#[tokio::test]
async fn test_partial_window_warmup_and_sum() {
    let (tiers, slots) = setup_slots().await;
    let all = slots.calculate_slots("7d").unwrap();
    for slot in &all[11..] {
        prepopulate(&tiers, "7d", "quota", slot).await;
    }

    let missing = slots.get_missing_slots("7d", "quota").await.unwrap();
    let cached = slots.get_cached_slots("7d", "quota").await.unwrap();
    assert_eq!(missing, all[..11].to_vec());
    assert_eq!(cached, all[11..].to_vec());

    let err = slots
        .aggregate_slot_data::<u64, _>("7d", "quota", &SumCombiner)
        .await
        .unwrap_err();
    assert!(err.is_cache_miss());

    let fetcher = CountingFetcher::default();
    let report = slots.warmup_slot_cache("7d", "quota", &fetcher).await.unwrap();
    assert_eq!(report.fetched, 11);
    assert_eq!(report.already_cached, 3);
    assert_eq!(fetcher.calls(), 11);

    let total = slots
        .aggregate_slot_data::<u64, _>("7d", "quota", &SumCombiner)
        .await
        .unwrap();
    assert_eq!(total, all.iter().map(payload_for).sum::<u64>());
}

/// Test warmup is idempotent once every slot is cached
#[tokio::test]
async fn test_warmup_idempotent() {
    let (_tiers, slots) = setup_slots().await;
    let fetcher = CountingFetcher::default();

    slots.warmup_slot_cache("24h", "requests", &fetcher).await.unwrap();
    assert_eq!(fetcher.calls(), 24);

    let report = slots.warmup_slot_cache("24h", "requests", &fetcher).await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(report.already_cached, 24);
    assert_eq!(fetcher.calls(), 24);
}

/// Test sort keys are cached independently
#[tokio::test]
async fn test_sort_keys_are_independent() {
    let (_tiers, slots) = setup_slots().await;
    let fetcher = CountingFetcher::default();

    slots.warmup_slot_cache("3d", "quota", &fetcher).await.unwrap();
    assert_eq!(slots.get_missing_slots("3d", "quota").await.unwrap().len(), 0);
    assert_eq!(slots.get_missing_slots("3d", "tokens").await.unwrap().len(), 12);
}

/// Test a failing slot is counted and the rest still load
#[tokio::test]
async fn test_failed_slot_does_not_stop_warmup() {
    let (_tiers, slots) = setup_slots().await;
    let all = slots.calculate_slots("14d").unwrap();
    let fetcher = CountingFetcher {
        fail_start: Some(all[5].start),
        ..CountingFetcher::default()
    };

    let report = slots.warmup_slot_cache("14d", "quota", &fetcher).await.unwrap();
    assert_eq!(report.fetched, 13);
    assert_eq!(report.failed, 1);
    assert_eq!(
        slots.get_missing_slots("14d", "quota").await.unwrap(),
        vec![all[5]]
    );
}

/// Test the in-progress slot refreshes while completed slots stay cached
#[tokio::test]
async fn test_live_slot_expires_quickly() {
    let (tiers, slots) = setup_slots().await;
    let fetcher = CountingFetcher::default();
    slots.warmup_slot_cache("7d", "quota", &fetcher).await.unwrap();

    tiers.clock.advance(Duration::from_secs(61));
    let all = slots.calculate_slots("7d").unwrap();
    let missing = slots.get_missing_slots("7d", "quota").await.unwrap();
    assert_eq!(missing, vec![all[0]]);
}

/// Test rotation across a slot boundary reuses every older slot
#[tokio::test]
async fn test_rotation_fetches_only_new_slot() {
    let (tiers, slots) = setup_slots().await;
    let fetcher = CountingFetcher::default();
    slots.warmup_slot_cache("7d", "quota", &fetcher).await.unwrap();
    let before = slots.calculate_slots("7d").unwrap();

    tiers.clock.advance(Duration::from_secs(12 * HOUR));
    let after = slots.calculate_slots("7d").unwrap();
    assert_ne!(before, after);
    assert_eq!(after[1..], before[..13]);

    let report = slots.warmup_slot_cache("7d", "quota", &fetcher).await.unwrap();
    // new live slot plus the previous live slot, whose short-lived copy lapsed
    assert_eq!(report.fetched, 2);
    assert_eq!(report.already_cached, 12);
}

/// Test missing ∪ cached == all slots and the sets are disjoint
#[tokio::test]
async fn test_partition_is_exact() {
    let (tiers, slots) = setup_slots().await;
    let all = slots.calculate_slots("24h").unwrap();
    for slot in all.iter().step_by(3) {
        prepopulate(&tiers, "24h", "quota", slot).await;
    }

    let partition = slots.partition_slots("24h", "quota").await.unwrap();
    let cached: HashSet<_> = partition.cached.iter().collect();
    let missing: HashSet<_> = partition.missing.iter().collect();
    assert!(cached.is_disjoint(&missing));
    assert_eq!(cached.len() + missing.len(), all.len());
    assert!(all.iter().all(|s| cached.contains(s) || missing.contains(s)));
    assert_eq!(cached.len(), 8);
}

/// Test leaderboard top-N merge across a window
#[tokio::test]
async fn test_leaderboard_aggregation() {
    let (_tiers, slots) = setup_slots().await;
    slots
        .warmup_slot_cache("24h", "quota", &LeaderboardFetcher)
        .await
        .unwrap();

    let combiner = TopNCombiner::new(1);
    let merged = slots
        .aggregate_slot_data::<Vec<LeaderboardEntry>, _>("24h", "quota", &combiner)
        .await
        .unwrap();
    let top = combiner.finish(merged);

    assert_eq!(top.len(), 1);
    assert_eq!(top[0].id, "b");
    assert_eq!(top[0].score, 36);
    assert_eq!(top[0].requests, 12);
}

/// Test window invalidation drops every sort key of that window only
#[tokio::test]
async fn test_invalidate_window() {
    let (_tiers, slots) = setup_slots().await;
    let fetcher = CountingFetcher::default();
    slots.warmup_slot_cache("24h", "quota", &fetcher).await.unwrap();
    slots.warmup_slot_cache("24h", "tokens", &fetcher).await.unwrap();
    slots.warmup_slot_cache("3d", "quota", &fetcher).await.unwrap();

    let removed = slots.invalidate_window("24h").await.unwrap();
    assert_eq!(removed, 48);
    assert_eq!(slots.get_missing_slots("24h", "quota").await.unwrap().len(), 24);
    assert!(slots.get_missing_slots("3d", "quota").await.unwrap().is_empty());
}

/// Test malformed layouts are rejected at construction
#[tokio::test]
async fn test_invalid_layout_rejected() {
    let tiers = setup_tiers().await;
    let mut config = SlotConfig::default();
    if let Some(def) = config.windows.get_mut("14d") {
        def.slot_count = 13;
    }

    let result = SlotCache::new(Arc::clone(&tiers.cache), config);
    assert!(matches!(result, Err(MonitorError::InvalidSlotConfig { ref window, .. }) if window == "14d"));
}
