//! Monitor Cache
//!
//! Cache and aggregation core for a monitoring middleware sitting in front of
//! an append-only usage log database:
//! - **Tiered Cache Store**: optional fast tier (Moka, `DashMap` or Redis) over
//!   a durable SQLite tier, read-through with fast-tier back-fill
//! - **Slot Cache**: sliding windows cut into fixed slots, each cached once
//!   and folded on demand
//! - **Warmup Orchestrator**: ordered population pipeline with live status
//! - **Analytics Checkpoint**: watermark-based incremental log processing
//!   with drift detection
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use monitor_cache::{MonitorConfig, MonitorSystemBuilder};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> monitor_cache::Result<()> {
//!     monitor_cache::logging::init_tracing("info,monitor_cache=debug");
//!
//!     let mut system = MonitorSystemBuilder::new(MonitorConfig::from_env())
//!         .build()
//!         .await?;
//!     system.start_background();
//!
//!     system.cache().set("dashboard:summary", &42_u64, Duration::from_secs(300)).await?;
//!     let hit: Option<u64> = system.cache().get("dashboard:summary").await?;
//!     tracing::info!(?hit, status = ?system.warmup().status().status, "Serving");
//!
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────── Warmup ────────────┐        Analytics (timer)
//!            │ restore → validity → domain…   │          │ id > watermark
//!            ▼                                ▼          ▼
//!  readers → SlotCache ──────────────▶ TieredCache ◀── derived keys
//!                                  fast tier → durable tier
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod analytics;
pub mod backends;
pub mod builder;
pub mod clock;
pub mod codecs;
pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod slot_cache;
pub mod tiered_cache;
pub mod traits;
pub mod warmup;

pub use analytics::{Analytics, AnalyticsState, BatchReport, ConsistencyReport};
pub use builder::MonitorSystemBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnalyticsConfig, CacheConfig, FastTierKind, MonitorConfig, WarmupConfig};
pub use error::{MonitorError, Result};
pub use scheduler::{Scheduler, Shutdown, ShutdownSignal};
pub use slot_cache::{
    LeaderboardEntry, Slot, SlotCache, SlotCombiner, SlotConfig, SlotDefinition, SlotFetcher,
    SumCombiner, TopNCombiner,
};
pub use tiered_cache::{CacheStats, TieredCache};
pub use traits::{CacheBackend, CacheCodec, CacheEntry, DurableBackend};
pub use warmup::{StepOutcome, StepRunner, Warmup, WarmupState, WarmupStatus, WarmupStep};

// Re-export async_trait for implementors of the collaborator traits
pub use async_trait::async_trait;

/// Process-wide monitor core, owned by the bootstrap
///
/// Holds the four components as explicit objects; consumers receive them by
/// reference (or `Arc` clone) from here rather than through globals.
pub struct MonitorSystem {
    config: MonitorConfig,
    cache: Arc<TieredCache>,
    slots: Arc<SlotCache>,
    warmup: Arc<Warmup>,
    analytics: Option<Arc<Analytics>>,
    scheduler: Option<Scheduler>,
}

impl MonitorSystem {
    pub(crate) fn from_parts(
        config: MonitorConfig,
        cache: Arc<TieredCache>,
        slots: Arc<SlotCache>,
        warmup: Arc<Warmup>,
        analytics: Option<Arc<Analytics>>,
    ) -> Self {
        Self {
            config,
            cache,
            slots,
            warmup,
            analytics,
            scheduler: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn slots(&self) -> &Arc<SlotCache> {
        &self.slots
    }

    #[must_use]
    pub fn warmup(&self) -> &Arc<Warmup> {
        &self.warmup
    }

    /// `None` when built without a log source
    #[must_use]
    pub fn analytics(&self) -> Option<&Arc<Analytics>> {
        self.analytics.as_ref()
    }

    fn signal(&self) -> ShutdownSignal {
        self.scheduler
            .as_ref()
            .map_or_else(ShutdownSignal::never, Scheduler::signal)
    }

    /// Start an on-demand warmup re-run
    ///
    /// # Errors
    ///
    /// Returns `WarmupInProgress` if a run is already going.
    pub fn trigger_warmup(&self) -> Result<JoinHandle<WarmupState>> {
        self.warmup.start(self.signal())
    }

    /// Spawn the startup warmup and the periodic tasks
    ///
    /// Calling it again while tasks are running is a no-op.
    pub fn start_background(&mut self) {
        if self.scheduler.is_some() {
            debug!("Background tasks already running");
            return;
        }
        let mut scheduler = Scheduler::new();

        let warmup = Arc::clone(&self.warmup);
        let signal = scheduler.signal();
        scheduler.track(
            "warmup",
            tokio::spawn(async move {
                if let Err(e) = warmup.run(signal).await {
                    warn!(error = %e, "Startup warmup not started");
                }
            }),
        );

        if let Some(period) = self.config.warmup.rerun_interval {
            let warmup = Arc::clone(&self.warmup);
            scheduler.spawn_periodic("warmup-rerun", period, move |signal| {
                let warmup = Arc::clone(&warmup);
                async move {
                    match warmup.run(signal).await {
                        Ok(_) | Err(MonitorError::WarmupInProgress) => {}
                        Err(e) => warn!(error = %e, "Scheduled warmup failed"),
                    }
                }
            });
        }

        let cache = Arc::clone(&self.cache);
        scheduler.spawn_periodic("cache-sweep", self.config.cache.sweep_interval, move |_| {
            let cache = Arc::clone(&cache);
            async move {
                if !cache.health_check().await {
                    warn!("Durable tier failed health check");
                }
                if let Err(e) = cache.sweep_expired().await {
                    warn!(error = %e, "Cache sweep failed, retrying next tick");
                }
            }
        });

        if let Some(analytics) = &self.analytics {
            let analytics = Arc::clone(analytics);
            let period = analytics.config().interval;
            scheduler.spawn_periodic("analytics-checkpoint", period, move |signal| {
                let analytics = Arc::clone(&analytics);
                async move { analytics.run_scheduled(&signal).await }
            });
        }

        info!(tasks = scheduler.active_tasks(), "Background tasks started");
        self.scheduler = Some(scheduler);
    }

    /// Stop background tasks, giving in-flight work `shutdown_grace` to finish
    ///
    /// Returns the names of tasks that were abandoned.
    pub async fn shutdown(&mut self) -> Vec<&'static str> {
        let Some(scheduler) = self.scheduler.take() else {
            return Vec::new();
        };
        let abandoned = scheduler.shutdown(self.config.shutdown_grace).await;
        if abandoned.is_empty() {
            info!("Monitor system stopped");
        } else {
            warn!(?abandoned, "Monitor system stopped with abandoned tasks");
        }
        abandoned
    }
}
