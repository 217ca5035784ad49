//! Step runners
//!
//! A [`StepRunner`] performs one pipeline step. The restore and validity
//! steps are bound to the tiered cache; the domain steps are supplied by the
//! bootstrap through the adapters below.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::slot_cache::{SlotCache, SlotConfig, SlotFetcher};
use crate::tiered_cache::TieredCache;

/// How a step finished when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed(Option<String>),
    /// Nothing to do; recorded as completed with the reason as detail
    Skipped(String),
}

/// One population step of the warmup pipeline
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self) -> anyhow::Result<StepOutcome>;
}

/// Copies live durable entries into the fast tier after a restart
pub struct RestoreRunner {
    cache: Arc<TieredCache>,
}

impl RestoreRunner {
    #[must_use]
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl StepRunner for RestoreRunner {
    async fn run(&self) -> anyhow::Result<StepOutcome> {
        if !self.cache.fast_tier_available() {
            return Ok(StepOutcome::Skipped("no fast tier".to_string()));
        }
        let restored = self.cache.restore_fast_tier().await?;
        Ok(StepOutcome::Completed(Some(format!("restored {restored} entries"))))
    }
}

/// Checks the slot layout and tier health, then drops expired entries
pub struct ValidityCheckRunner {
    cache: Arc<TieredCache>,
    slots: SlotConfig,
}

impl ValidityCheckRunner {
    #[must_use]
    pub fn new(cache: Arc<TieredCache>, slots: SlotConfig) -> Self {
        Self { cache, slots }
    }
}

#[async_trait]
impl StepRunner for ValidityCheckRunner {
    async fn run(&self) -> anyhow::Result<StepOutcome> {
        self.slots.validate()?;
        if !self.cache.health_check().await {
            return Err(anyhow!("durable tier failed health check"));
        }
        let swept = self.cache.sweep_expired().await?;
        Ok(StepOutcome::Completed(Some(format!(
            "purged {} durable and {} fast entries",
            swept.durable, swept.fast
        ))))
    }
}

/// Warms slot windows through a [`SlotFetcher`], e.g. for the leaderboard step
pub struct SlotWarmupRunner<T> {
    slot_cache: Arc<SlotCache>,
    /// `(window, sort_key)` pairs to warm
    targets: Vec<(String, String)>,
    fetcher: Arc<dyn SlotFetcher<T>>,
}

impl<T> SlotWarmupRunner<T> {
    #[must_use]
    pub fn new(
        slot_cache: Arc<SlotCache>,
        targets: Vec<(String, String)>,
        fetcher: Arc<dyn SlotFetcher<T>>,
    ) -> Self {
        Self {
            slot_cache,
            targets,
            fetcher,
        }
    }
}

#[async_trait]
impl<T> StepRunner for SlotWarmupRunner<T>
where
    T: Serialize + Send + Sync + 'static,
{
    async fn run(&self) -> anyhow::Result<StepOutcome> {
        let mut fetched = 0;
        let mut failed = Vec::new();

        for (window, sort_key) in &self.targets {
            let report = self
                .slot_cache
                .warmup_slot_cache(window, sort_key, self.fetcher.as_ref())
                .await
                .with_context(|| format!("warming {window}/{sort_key}"))?;
            fetched += report.fetched;
            if report.failed > 0 {
                failed.push(format!("{window}/{sort_key}: {} slots", report.failed));
            }
        }

        if failed.is_empty() {
            Ok(StepOutcome::Completed(Some(format!("fetched {fetched} slots"))))
        } else {
            Err(anyhow!("slot fetch failed for {}", failed.join(", ")))
        }
    }
}

/// Produces one cached document (dashboard panel, IP table, model status...)
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<serde_json::Value>;
}

/// A cache key filled by a query
pub struct FillTarget {
    pub key: String,
    pub ttl: Duration,
    pub fetcher: Arc<dyn QueryFetcher>,
}

/// Runs each query and stores its result; every target is attempted
pub struct CacheFillRunner {
    cache: Arc<TieredCache>,
    targets: Vec<FillTarget>,
}

impl CacheFillRunner {
    #[must_use]
    pub fn new(cache: Arc<TieredCache>, targets: Vec<FillTarget>) -> Self {
        Self { cache, targets }
    }
}

#[async_trait]
impl StepRunner for CacheFillRunner {
    async fn run(&self) -> anyhow::Result<StepOutcome> {
        let mut failed = Vec::new();

        for target in &self.targets {
            let result = match target.fetcher.fetch().await {
                Ok(value) => self
                    .cache
                    .set(&target.key, &value, target.ttl)
                    .await
                    .map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(key = %target.key, error = %e, "Cache fill target failed");
                failed.push(target.key.as_str());
            }
        }

        if failed.is_empty() {
            Ok(StepOutcome::Completed(Some(format!(
                "filled {} keys",
                self.targets.len()
            ))))
        } else {
            Err(anyhow!(
                "{} of {} keys failed: {}",
                failed.len(),
                self.targets.len(),
                failed.join(", ")
            ))
        }
    }
}

/// Reports deployment size so expensive steps can be skipped on small installs
#[async_trait]
pub trait DeploymentProbe: Send + Sync {
    async fn user_count(&self) -> anyhow::Result<u64>;
}

/// Runs `inner` only when the deployment has at least `min_users` users
pub struct DeploymentGate {
    probe: Arc<dyn DeploymentProbe>,
    min_users: u64,
    inner: Arc<dyn StepRunner>,
}

impl DeploymentGate {
    #[must_use]
    pub fn new(probe: Arc<dyn DeploymentProbe>, min_users: u64, inner: Arc<dyn StepRunner>) -> Self {
        Self {
            probe,
            min_users,
            inner,
        }
    }
}

#[async_trait]
impl StepRunner for DeploymentGate {
    async fn run(&self) -> anyhow::Result<StepOutcome> {
        let users = self.probe.user_count().await?;
        if users < self.min_users {
            info!(users, min_users = self.min_users, "Small deployment, skipping step");
            return Ok(StepOutcome::Skipped(format!(
                "small deployment: {users} users < {}",
                self.min_users
            )));
        }
        self.inner.run().await
    }
}
