//! Monitor System Builder
//!
//! Assembles the tiers, the slot cache, the warmup pipeline and the analytics
//! checkpoint from a [`MonitorConfig`], with hooks to swap any backend or
//! collaborator.
//!
//! # Example
//!
//! ```rust,no_run
//! use monitor_cache::{MonitorConfig, MonitorSystemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> monitor_cache::Result<()> {
//!     let system = MonitorSystemBuilder::new(MonitorConfig::from_env())
//!         .build()
//!         .await?;
//!     println!("fast tier available: {}", system.cache().fast_tier_available());
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::analytics::{
    AggregateSink, Analytics, CheckpointStore, LogSource, MemoryAggregateSink,
    MemoryCheckpointStore, SqliteAggregateSink, SqliteCheckpointStore,
};
use crate::backends::{DashMapCache, SqliteCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{FastTierKind, MonitorConfig};
use crate::error::Result;
use crate::slot_cache::SlotCache;
use crate::tiered_cache::TieredCache;
use crate::traits::{CacheBackend, DurableBackend};
use crate::warmup::{RestoreRunner, StepRunner, ValidityCheckRunner, Warmup, WarmupStep};
use crate::MonitorSystem;

/// Builder for [`MonitorSystem`]
///
/// Anything not supplied is created from the configuration:
/// - **Fast tier**: per [`FastTierKind`]; a Redis tier that cannot connect
///   is dropped and the store runs durable-only
/// - **Durable tier**: SQLite at `durable_path`, or in-memory
/// - **Checkpoint store**: SQLite on the durable tier's pool when the
///   durable tier is the built-in one, in-memory otherwise
/// - **Aggregate sink**: [`SqliteAggregateSink`] next to the checkpoint on
///   the built-in durable tier, [`MemoryAggregateSink`] otherwise
///
/// The analytics checkpoint is only built when a [`LogSource`] is supplied.
pub struct MonitorSystemBuilder {
    config: MonitorConfig,
    clock: Option<Arc<dyn Clock>>,
    fast_tier: Option<Arc<dyn CacheBackend>>,
    durable_tier: Option<Arc<dyn DurableBackend>>,
    log_source: Option<Arc<dyn LogSource>>,
    aggregate_sink: Option<Arc<dyn AggregateSink>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    step_runners: Vec<(WarmupStep, Arc<dyn StepRunner>)>,
}

impl MonitorSystemBuilder {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            clock: None,
            fast_tier: None,
            durable_tier: None,
            log_source: None,
            aggregate_sink: None,
            checkpoint_store: None,
            step_runners: Vec::new(),
        }
    }

    /// Time source for expiry and slot boundaries (tests pass a `ManualClock`)
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Custom fast tier, overriding `cache.fast_tier`
    #[must_use]
    pub fn with_fast_tier(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.fast_tier = Some(backend);
        self
    }

    /// Custom durable tier, overriding `cache.durable_path`
    #[must_use]
    pub fn with_durable_tier(mut self, backend: Arc<dyn DurableBackend>) -> Self {
        self.durable_tier = Some(backend);
        self
    }

    #[must_use]
    pub fn with_log_source(mut self, source: Arc<dyn LogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    #[must_use]
    pub fn with_aggregate_sink(mut self, sink: Arc<dyn AggregateSink>) -> Self {
        self.aggregate_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Runner for a warmup step; replaces the built-in one for restore/validity
    #[must_use]
    pub fn with_step_runner(mut self, step: WarmupStep, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runners.push((step, runner));
        self
    }

    async fn default_fast_tier(&self, clock: &Arc<dyn Clock>) -> Option<Arc<dyn CacheBackend>> {
        match &self.config.cache.fast_tier {
            FastTierKind::Disabled => None,
            FastTierKind::DashMap => Some(Arc::new(DashMapCache::with_clock(Arc::clone(clock)))),
            #[cfg(feature = "moka")]
            FastTierKind::Moka => {
                let config = crate::backends::MokaCacheConfig {
                    max_capacity: self.config.cache.fast_capacity,
                    ..crate::backends::MokaCacheConfig::default()
                };
                Some(Arc::new(crate::backends::MokaCache::with_clock(
                    config,
                    Arc::clone(clock),
                )))
            }
            #[cfg(not(feature = "moka"))]
            FastTierKind::Moka => {
                warn!("Built without the `moka` feature, using DashMap fast tier");
                Some(Arc::new(DashMapCache::with_clock(Arc::clone(clock))))
            }
            #[cfg(feature = "redis")]
            FastTierKind::Redis { url } => {
                match crate::backends::RedisCache::with_url(url, "monitor:").await {
                    Ok(redis) => Some(Arc::new(redis)),
                    Err(e) => {
                        warn!(error = %e, "Redis fast tier unavailable, running durable-only");
                        None
                    }
                }
            }
            #[cfg(not(feature = "redis"))]
            FastTierKind::Redis { .. } => {
                warn!("Built without the `redis` feature, running durable-only");
                None
            }
        }
    }

    /// Build the system
    ///
    /// # Errors
    ///
    /// * `InvalidSlotConfig` - malformed slot layout; startup must abort
    /// * `Storage` - the durable tier or checkpoint table cannot be opened
    pub async fn build(self) -> Result<MonitorSystem> {
        info!("Building monitor system");
        self.config.slots.validate()?;

        let clock: Arc<dyn Clock> = self
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock));

        let mut sqlite_pool = None;
        let durable: Arc<dyn DurableBackend> = match self.durable_tier.clone() {
            Some(backend) => {
                info!(tier = backend.name(), "Using custom durable tier");
                backend
            }
            None => {
                let sqlite = match &self.config.cache.durable_path {
                    Some(path) => SqliteCache::open(path, Arc::clone(&clock)).await?,
                    None => SqliteCache::in_memory(Arc::clone(&clock)).await?,
                };
                sqlite_pool = Some(sqlite.pool().clone());
                Arc::new(sqlite)
            }
        };

        let fast = match self.fast_tier.clone() {
            Some(backend) => {
                info!(tier = backend.name(), "Using custom fast tier");
                Some(backend)
            }
            None => self.default_fast_tier(&clock).await,
        };

        let cache = Arc::new(TieredCache::new(
            fast,
            durable,
            Arc::clone(&clock),
            self.config.cache.backfill_ttl,
        ));
        let slots = Arc::new(SlotCache::new(Arc::clone(&cache), self.config.slots.clone())?);

        let mut warmup = Warmup::new(Arc::clone(&clock), self.config.warmup.clone())
            .with_runner(
                WarmupStep::RestoreFromDurable,
                Arc::new(RestoreRunner::new(Arc::clone(&cache))),
            )
            .with_runner(
                WarmupStep::ValidityCheck,
                Arc::new(ValidityCheckRunner::new(
                    Arc::clone(&cache),
                    self.config.slots.clone(),
                )),
            );
        for (step, runner) in self.step_runners {
            warmup = warmup.with_runner(step, runner);
        }

        let analytics = match self.log_source {
            Some(source) => {
                // The default sink and checkpoint share the durable pool, so the
                // derived tables and the watermark always describe the same rows.
                let sink: Arc<dyn AggregateSink> = match (self.aggregate_sink, &sqlite_pool) {
                    (Some(sink), _) => sink,
                    (None, Some(pool)) => Arc::new(SqliteAggregateSink::new(pool.clone()).await?),
                    (None, None) => Arc::new(MemoryAggregateSink::new()),
                };
                let store: Arc<dyn CheckpointStore> = match (self.checkpoint_store, sqlite_pool) {
                    (Some(store), _) => store,
                    (None, Some(pool)) => Arc::new(SqliteCheckpointStore::new(pool).await?),
                    (None, None) => {
                        warn!("No checkpoint store, analytics watermark will not survive restarts");
                        Arc::new(MemoryCheckpointStore::new())
                    }
                };
                Some(Arc::new(
                    Analytics::new(
                        source,
                        sink,
                        store,
                        Arc::clone(&cache),
                        self.config.analytics.clone(),
                    )
                    .await?,
                ))
            }
            None => {
                info!("No log source configured, analytics checkpoint disabled");
                None
            }
        };

        info!("Monitor system built");
        Ok(MonitorSystem::from_parts(
            self.config,
            cache,
            slots,
            Arc::new(warmup),
            analytics,
        ))
    }
}
