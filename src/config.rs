//! Configuration
//!
//! Every section has a `Default` and a `from_env()` reading `MONITOR_*`
//! variables. Unparseable values fall back to the default rather than
//! failing startup; only the slot layout is validated strictly (see
//! [`SlotConfig::validate`]).
//!
//! # Environment Variables
//! - `MONITOR_FAST_TIER`: `moka` (default), `dashmap`, `redis`, or `none`
//! - `REDIS_URL`: Redis URL when the fast tier is `redis`
//! - `MONITOR_CACHE_DB`: durable SQLite path (default `data/monitor-cache.db`)
//! - `MONITOR_BACKFILL_TTL_SECS`, `MONITOR_SWEEP_INTERVAL_SECS`, `MONITOR_FAST_CAPACITY`
//! - `MONITOR_LIVE_SLOT_TTL_SECS`
//! - `MONITOR_WARMUP_RERUN_SECS` (0 disables), `MONITOR_WARMUP_STEP_TIMEOUT_SECS`
//! - `MONITOR_ANALYTICS_INTERVAL_SECS`, `MONITOR_ANALYTICS_MAX_BATCHES`,
//!   `MONITOR_ANALYTICS_BATCH_SIZE`, `MONITOR_CONSISTENCY_WINDOW_SECS`
//! - `MONITOR_SHUTDOWN_GRACE_SECS`

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::slot_cache::SlotConfig;

const DEFAULT_BACKFILL_TTL_SECS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_FAST_CAPACITY: u64 = 10_000;
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_ANALYTICS_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_BATCHES: usize = 10;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_CONSISTENCY_WINDOW_SECS: u64 = 3600;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

/// Which fast tier to run in front of the durable tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastTierKind {
    /// Durable-only operation
    Disabled,
    Moka,
    DashMap,
    Redis { url: String },
}

/// Tiered cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub fast_tier: FastTierKind,
    /// Max entries for the Moka fast tier
    pub fast_capacity: u64,
    /// Durable SQLite file; `None` keeps the durable tier in memory
    pub durable_path: Option<PathBuf>,
    /// Fixed TTL for fast-tier copies back-filled from the durable tier
    pub backfill_ttl: Duration,
    /// How often expired entries are purged from both tiers
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_tier: if cfg!(feature = "moka") {
                FastTierKind::Moka
            } else {
                FastTierKind::DashMap
            },
            fast_capacity: DEFAULT_FAST_CAPACITY,
            durable_path: Some(PathBuf::from("data/monitor-cache.db")),
            backfill_ttl: Duration::from_secs(DEFAULT_BACKFILL_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let fast_tier = match std::env::var("MONITOR_FAST_TIER")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("none" | "disabled") => FastTierKind::Disabled,
            Ok("dashmap") => FastTierKind::DashMap,
            Ok("moka") => FastTierKind::Moka,
            Ok("redis") => FastTierKind::Redis {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            _ => defaults.fast_tier,
        };

        Self {
            fast_tier,
            fast_capacity: env_parse("MONITOR_FAST_CAPACITY").unwrap_or(defaults.fast_capacity),
            durable_path: std::env::var("MONITOR_CACHE_DB")
                .ok()
                .map(PathBuf::from)
                .or(defaults.durable_path),
            backfill_ttl: env_secs("MONITOR_BACKFILL_TTL_SECS").unwrap_or(defaults.backfill_ttl),
            sweep_interval: env_secs("MONITOR_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
        }
    }
}

/// Warmup pipeline settings
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Periodic re-run; `None` runs only at startup and on demand
    pub rerun_interval: Option<Duration>,
    /// Upper bound for a single step before it is recorded as failed
    pub step_timeout: Duration,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            rerun_interval: None,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
        }
    }
}

impl WarmupConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rerun_interval: match env_secs("MONITOR_WARMUP_RERUN_SECS") {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => defaults.rerun_interval,
            },
            step_timeout: env_secs("MONITOR_WARMUP_STEP_TIMEOUT_SECS")
                .unwrap_or(defaults.step_timeout),
        }
    }
}

/// Analytics checkpoint settings
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub interval: Duration,
    pub max_batches: usize,
    pub batch_size: usize,
    /// Length of the recent window re-aggregated by the consistency check
    pub consistency_window: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_ANALYTICS_INTERVAL_SECS),
            max_batches: DEFAULT_MAX_BATCHES,
            batch_size: DEFAULT_BATCH_SIZE,
            consistency_window: Duration::from_secs(DEFAULT_CONSISTENCY_WINDOW_SECS),
        }
    }
}

impl AnalyticsConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_secs("MONITOR_ANALYTICS_INTERVAL_SECS").unwrap_or(defaults.interval),
            max_batches: env_parse("MONITOR_ANALYTICS_MAX_BATCHES")
                .unwrap_or(defaults.max_batches),
            batch_size: env_parse("MONITOR_ANALYTICS_BATCH_SIZE").unwrap_or(defaults.batch_size),
            consistency_window: env_secs("MONITOR_CONSISTENCY_WINDOW_SECS")
                .unwrap_or(defaults.consistency_window),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub cache: CacheConfig,
    pub slots: SlotConfig,
    pub warmup: WarmupConfig,
    pub analytics: AnalyticsConfig,
    /// How long in-flight background work may run after shutdown is signalled
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            slots: SlotConfig::default(),
            warmup: WarmupConfig::default(),
            analytics: AnalyticsConfig::default(),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mut slots = SlotConfig::default();
        if let Some(ttl) = env_secs("MONITOR_LIVE_SLOT_TTL_SECS") {
            slots.live_slot_ttl = ttl;
        }

        Self {
            cache: CacheConfig::from_env(),
            slots,
            warmup: WarmupConfig::from_env(),
            analytics: AnalyticsConfig::from_env(),
            shutdown_grace: env_secs("MONITOR_SHUTDOWN_GRACE_SECS")
                .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)),
        }
    }

    /// In-memory durable tier with a `DashMap` fast tier, for tests and demos
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            cache: CacheConfig {
                fast_tier: FastTierKind::DashMap,
                durable_path: None,
                ..CacheConfig::default()
            },
            ..Self::default()
        }
    }
}
