//! Analytics Checkpoint - incremental log processing
//!
//! Advances a monotonic watermark over the log table in bounded batches. For
//! each batch the derived tables are updated first and the watermark second:
//! a failed update leaves the watermark where it was, so the next pass
//! retries the same rows instead of skipping them.
//!
//! Cache entries computed from the derived tables live under
//! `analytics:e{epoch}:g{generation}:`. Every committed batch bumps the
//! generation together with the watermark, so a value computed from the
//! tables before a commit can only ever be written under a key nobody reads
//! any more. [`Analytics::reset`] bumps the epoch in the same critical section
//! that rewinds the watermark; old namespaces are purged afterwards.
//!
//! A checkpoint is only meaningful next to the tables it was applied to: if
//! the stored watermark is ahead of a sink that does not persist, the
//! watermark is rewound so every row is replayed.

pub mod sink;
pub mod source;
pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, to_chrono};
use crate::config::AnalyticsConfig;
use crate::error::{MonitorError, Result};
use crate::scheduler::ShutdownSignal;
use crate::tiered_cache::TieredCache;

pub use sink::{AggregateSink, MemoryAggregateSink, ModelStats, SqliteAggregateSink, UserRanking};
pub use source::{LogRow, LogSource, MemoryLogSource, SqliteLogSource, WindowAggregate};
pub use store::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};

const DERIVED_KEY_PREFIX: &str = "analytics";

/// Persisted checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsState {
    /// Watermark: highest id whose batch has been fully applied
    pub last_processed_id: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub total_processed: u64,
    /// Namespace generation for derived cache keys, bumped by every reset
    pub epoch: u64,
    /// Bumped by every committed batch within an epoch
    pub generation: u64,
}

/// Outcome of one [`Analytics::process_batch`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batches: usize,
    pub rows: usize,
    pub last_processed_id: i64,
}

/// Source vs. derived totals over the same recent window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Only rows up to this id were compared
    pub watermark: i64,
    pub source: WindowAggregate,
    pub derived: WindowAggregate,
    pub drift: bool,
}

fn floor_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp().div_euclid(60) * 60, 0).unwrap_or(at)
}

/// Checkpointed processor over the log table
pub struct Analytics {
    source: Arc<dyn LogSource>,
    sink: Arc<dyn AggregateSink>,
    store: Arc<dyn CheckpointStore>,
    cache: Arc<TieredCache>,
    config: AnalyticsConfig,
    state: RwLock<AnalyticsState>,
    /// Held by a batch pass, a reset and a consistency check
    batch_lock: Mutex<()>,
}

impl Analytics {
    /// Build the processor, resuming from the stored checkpoint if any
    ///
    /// A stored watermark is rewound to zero when `sink` does not persist
    /// what was applied before the restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded or rewritten.
    pub async fn new(
        source: Arc<dyn LogSource>,
        sink: Arc<dyn AggregateSink>,
        store: Arc<dyn CheckpointStore>,
        cache: Arc<TieredCache>,
        config: AnalyticsConfig,
    ) -> Result<Self> {
        let mut state = store.load().await?.unwrap_or_default();
        if state.last_processed_id > 0 && !sink.is_persistent() {
            let stale_epoch = state.epoch;
            warn!(
                last_processed_id = state.last_processed_id,
                "Stored watermark has no matching derived tables, replaying the log from the start"
            );
            state = AnalyticsState {
                epoch: stale_epoch + 1,
                ..AnalyticsState::default()
            };
            store.save(&state).await?;
            if let Err(e) = cache.delete_by_prefix(&Self::derived_prefix(stale_epoch)).await {
                warn!(epoch = stale_epoch, error = %e, "Failed to purge previous analytics epoch");
            }
        }
        info!(
            last_processed_id = state.last_processed_id,
            total_processed = state.total_processed,
            epoch = state.epoch,
            "Analytics checkpoint loaded"
        );

        Ok(Self {
            source,
            sink,
            store,
            cache,
            config,
            state: RwLock::new(state),
            batch_lock: Mutex::new(()),
        })
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.cache.clock()
    }

    #[must_use]
    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    #[must_use]
    pub fn get_state(&self) -> AnalyticsState {
        self.state.read().clone()
    }

    fn derived_prefix(epoch: u64) -> String {
        format!("{DERIVED_KEY_PREFIX}:e{epoch}:")
    }

    /// Cache key for a derived aggregate at the current epoch and generation
    #[must_use]
    pub fn derived_key(&self, name: &str) -> String {
        let (epoch, generation) = {
            let state = self.state.read();
            (state.epoch, state.generation)
        };
        format!("{}g{generation}:{name}", Self::derived_prefix(epoch))
    }

    /// Cached derived aggregate, computed on miss
    ///
    /// The key is fixed before `compute` runs, so a batch committed while it
    /// reads the tables leaves the result under a superseded generation.
    ///
    /// # Errors
    ///
    /// Returns an error if `compute` fails or the durable tier fails.
    pub async fn derived<T, F, Fut>(&self, name: &str, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let key = self.derived_key(name);
        self.cache.get_or_compute(&key, ttl, compute).await
    }

    /// Process up to `max_batches` batches of at most `batch_size` rows
    ///
    /// Stops early when a fetch returns no rows or shutdown is signalled
    /// between batches.
    ///
    /// # Errors
    ///
    /// * `BatchInProgress` - another pass holds the checkpoint
    /// * source or sink failure - the watermark stays at the last committed batch
    pub async fn process_batch(
        &self,
        max_batches: usize,
        batch_size: usize,
        signal: &ShutdownSignal,
    ) -> Result<BatchReport> {
        let Ok(_guard) = self.batch_lock.try_lock() else {
            return Err(MonitorError::BatchInProgress);
        };

        let mut report = BatchReport {
            last_processed_id: self.state.read().last_processed_id,
            ..BatchReport::default()
        };
        if batch_size == 0 {
            return Ok(report);
        }

        let result = self.run_batches(max_batches, batch_size, signal, &mut report).await;

        if report.rows > 0 {
            let epoch = self.state.read().epoch;
            if let Err(e) = self.cache.delete_by_prefix(&Self::derived_prefix(epoch)).await {
                warn!(epoch, error = %e, "Failed to invalidate derived analytics keys");
            }
            info!(
                batches = report.batches,
                rows = report.rows,
                last_processed_id = report.last_processed_id,
                "Analytics batches committed"
            );
        }

        result.map(|()| report)
    }

    async fn run_batches(
        &self,
        max_batches: usize,
        batch_size: usize,
        signal: &ShutdownSignal,
        report: &mut BatchReport,
    ) -> Result<()> {
        while report.batches < max_batches {
            if signal.is_triggered() {
                info!(batches = report.batches, "Shutdown signalled, stopping analytics pass");
                break;
            }

            let after = report.last_processed_id;
            let rows = self.source.fetch_after(after, batch_size).await?;
            let Some(max_id) = rows.iter().map(|r| r.id).max() else {
                debug!(after, "No new log rows");
                break;
            };
            if max_id <= after {
                return Err(MonitorError::Backend(anyhow::anyhow!(
                    "log source returned ids at or below watermark {after}"
                )));
            }

            if let Err(e) = self.sink.apply(&rows).await {
                warn!(after, rows = rows.len(), error = %e, "Aggregate update failed, watermark unchanged");
                return Err(MonitorError::Backend(e));
            }

            let committed = {
                let mut state = self.state.write();
                state.last_processed_id = max_id;
                state.generation += 1;
                state.total_processed += rows.len() as u64;
                state.last_processed_at = Some(self.clock().now());
                state.clone()
            };
            report.batches += 1;
            report.rows += rows.len();
            report.last_processed_id = max_id;
            debug!(batch = report.batches, rows = rows.len(), max_id, "Analytics batch applied");

            // The sink already holds this batch, so the in-memory watermark
            // stays advanced even if persisting it fails.
            self.store.save(&committed).await?;
        }
        Ok(())
    }

    /// Rewind the watermark to zero and drop every derived aggregate
    ///
    /// Waits for a running batch pass to finish first.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink or the checkpoint store fails; on a sink
    /// failure nothing has changed.
    pub async fn reset(&self) -> Result<AnalyticsState> {
        let _guard = self.batch_lock.lock().await;

        self.sink.reset().await?;
        let (previous, next) = {
            let mut state = self.state.write();
            let previous = state.clone();
            *state = AnalyticsState {
                epoch: previous.epoch + 1,
                ..AnalyticsState::default()
            };
            (previous, state.clone())
        };
        warn!(
            previous_id = previous.last_processed_id,
            previous_total = previous.total_processed,
            epoch = next.epoch,
            "Analytics checkpoint reset"
        );
        self.store.save(&next).await?;

        if let Err(e) = self
            .cache
            .delete_by_prefix(&Self::derived_prefix(previous.epoch))
            .await
        {
            warn!(epoch = previous.epoch, error = %e, "Failed to purge previous analytics epoch");
        }
        Ok(next)
    }

    /// Compare the derived tables with the source over the recent window
    ///
    /// The window is minute-aligned and only rows up to the watermark are
    /// counted on the source side. Drift is reported, never corrected.
    ///
    /// # Errors
    ///
    /// Returns an error if either side cannot be queried.
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let _guard = self.batch_lock.lock().await;

        let watermark = self.state.read().last_processed_id;
        let window_end = floor_to_minute(self.clock().now());
        let window_start = floor_to_minute(
            window_end
                .checked_sub_signed(to_chrono(self.config.consistency_window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        );

        let source = self
            .source
            .window_aggregate(window_start, window_end, watermark)
            .await?;
        let derived = self.sink.window_aggregate(window_start, window_end).await?;

        let report = ConsistencyReport {
            window_start,
            window_end,
            watermark,
            source,
            derived,
            drift: source != derived,
        };

        if report.drift {
            let drift = MonitorError::ConsistencyDrift {
                window: self.config.consistency_window,
                detail: format!("source {source:?} != derived {derived:?}"),
            };
            warn!(error = %drift, watermark, "Analytics consistency check found drift");
        } else {
            debug!(watermark, requests = source.requests, "Analytics consistent");
        }
        Ok(report)
    }

    /// One scheduled pass with the configured limits; failures are logged
    pub async fn run_scheduled(&self, signal: &ShutdownSignal) {
        match self
            .process_batch(self.config.max_batches, self.config.batch_size, signal)
            .await
        {
            Ok(_) => {}
            Err(MonitorError::BatchInProgress) => {
                debug!("Previous analytics pass still running, skipping tick");
            }
            Err(e) => warn!(error = %e, "Analytics pass failed, retrying next tick"),
        }
    }
}
