//! Benchmarks for slot calculation, slot aggregation and tiered reads

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use monitor_cache::backends::{DashMapCache, SqliteCache};
use monitor_cache::{
    Clock, LeaderboardEntry, Slot, SlotCache, SlotConfig, SlotFetcher, SumCombiner,
    SystemClock, TieredCache, TopNCombiner, async_trait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Random per-slot totals
struct RandomTotals;

#[async_trait]
impl SlotFetcher<u64> for RandomTotals {
    async fn fetch(&self, _window: &str, _sort_key: &str, _slot: &Slot) -> anyhow::Result<u64> {
        Ok(rand::random::<u32>().into())
    }
}

/// Random per-slot leaderboard over `users` users
struct RandomLeaderboard {
    users: usize,
}

#[async_trait]
impl SlotFetcher<Vec<LeaderboardEntry>> for RandomLeaderboard {
    async fn fetch(
        &self,
        _window: &str,
        _sort_key: &str,
        _slot: &Slot,
    ) -> anyhow::Result<Vec<LeaderboardEntry>> {
        Ok((0..self.users)
            .map(|user| LeaderboardEntry {
                id: format!("user{user}"),
                score: rand::random::<u16>().into(),
                requests: 1,
            })
            .collect())
    }
}

/// Helper to build a DashMap + in-memory SQLite tiered cache
fn setup_cache(rt: &Runtime) -> Arc<TieredCache> {
    rt.block_on(async {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let durable = SqliteCache::in_memory(Arc::clone(&clock))
            .await
            .unwrap_or_else(|_| panic!("Failed to open SQLite"));
        Arc::new(TieredCache::new(
            Some(Arc::new(DashMapCache::with_clock(Arc::clone(&clock)))),
            Arc::new(durable),
            clock,
            Duration::from_secs(60),
        ))
    })
}

fn setup_slots(rt: &Runtime) -> (Arc<TieredCache>, SlotCache) {
    let cache = setup_cache(rt);
    let slots = SlotCache::new(Arc::clone(&cache), SlotConfig::default())
        .unwrap_or_else(|_| panic!("Failed to create slot cache"));
    (cache, slots)
}

/// Benchmark slot list calculation per window
fn bench_calculate_slots(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let (_cache, slots) = setup_slots(&rt);

    let mut group = c.benchmark_group("calculate_slots");
    for window in ["24h", "3d", "7d", "14d"] {
        group.bench_with_input(BenchmarkId::from_parameter(window), window, |b, window| {
            b.iter(|| slots.calculate_slots(black_box(window)));
        });
    }
    group.finish();
}

/// Benchmark folding fully cached windows
fn bench_aggregate_sum(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let (_cache, slots) = setup_slots(&rt);

    let mut group = c.benchmark_group("aggregate_sum");
    group.measurement_time(Duration::from_secs(10));

    for window in ["24h", "7d", "14d"] {
        rt.block_on(slots.warmup_slot_cache(window, "quota", &RandomTotals))
            .unwrap_or_else(|_| panic!("Failed to warm {window}"));

        group.bench_with_input(BenchmarkId::from_parameter(window), window, |b, window| {
            b.iter(|| {
                rt.block_on(async {
                    slots
                        .aggregate_slot_data::<u64, _>(black_box(window), "quota", &SumCombiner)
                        .await
                        .unwrap_or_else(|_| panic!("Failed to aggregate"))
                })
            });
        });
    }
    group.finish();
}

/// Benchmark top-N merge over 24 hourly leaderboards
fn bench_aggregate_leaderboard(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));

    let mut group = c.benchmark_group("aggregate_leaderboard");
    group.measurement_time(Duration::from_secs(10));

    for users in [10, 100, 1000] {
        let (_cache, slots) = setup_slots(&rt);
        rt.block_on(slots.warmup_slot_cache("24h", "quota", &RandomLeaderboard { users }))
            .unwrap_or_else(|_| panic!("Failed to warm leaderboard"));
        let combiner = TopNCombiner::new(10);

        group.bench_with_input(BenchmarkId::from_parameter(users), &users, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let merged = slots
                        .aggregate_slot_data::<Vec<LeaderboardEntry>, _>("24h", "quota", &combiner)
                        .await
                        .unwrap_or_else(|_| panic!("Failed to aggregate"));
                    combiner.finish(merged)
                })
            });
        });
    }
    group.finish();
}

/// Benchmark fast-tier hits against durable hits with back-fill
fn bench_tiered_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let cache = setup_cache(&rt);
    let durable_only = rt.block_on(async {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let durable = SqliteCache::in_memory(Arc::clone(&clock))
            .await
            .unwrap_or_else(|_| panic!("Failed to open SQLite"));
        TieredCache::new(None, Arc::new(durable), clock, Duration::from_secs(60))
    });

    rt.block_on(async {
        for i in 0..100 {
            let key = format!("bench:panel:{i}");
            cache
                .set(&key, &i, Duration::from_secs(3600))
                .await
                .unwrap_or_else(|_| panic!("Failed to set"));
            durable_only
                .set(&key, &i, Duration::from_secs(3600))
                .await
                .unwrap_or_else(|_| panic!("Failed to set"));
        }
    });

    let mut group = c.benchmark_group("tiered_get");
    group.bench_function("fast_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let key = format!("bench:panel:{}", rand::random::<u8>() % 100);
                let _: Option<u64> = cache.get(black_box(&key)).await.unwrap_or_default();
            });
        });
    });
    group.bench_function("durable_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let key = format!("bench:panel:{}", rand::random::<u8>() % 100);
                let _: Option<u64> = durable_only.get(black_box(&key)).await.unwrap_or_default();
            });
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_calculate_slots,
    bench_aggregate_sum,
    bench_aggregate_leaderboard,
    bench_tiered_get
);
criterion_main!(benches);
