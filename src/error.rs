//! Error taxonomy
//!
//! Collaborator traits (backends, log sources, sinks, step runners) return
//! `anyhow::Result`; the core converts those into [`MonitorError`] at its
//! public boundary so callers can match on the failure class.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the monitor cache core
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Expected absence. Callers choose the fallback (warm, recompute, or serve direct).
    #[error("cache miss: {0}")]
    CacheMiss(String),

    /// Fast tier is down; the store keeps serving from the durable tier.
    #[error("cache tier '{tier}' unavailable: {reason}")]
    TierUnavailable { tier: &'static str, reason: String },

    /// Value could not be encoded or decoded; nothing was cached.
    #[error("serialization failed for key '{key}': {reason}")]
    Serialization { key: String, reason: String },

    /// Window name has no slot definition.
    #[error("unsupported window '{0}'")]
    UnsupportedWindow(String),

    /// Static slot configuration cannot cover its declared window.
    #[error("invalid slot configuration for window '{window}': {reason}")]
    InvalidSlotConfig { window: String, reason: String },

    /// TTL must be strictly positive at write time.
    #[error("invalid ttl {ttl:?} for key '{key}'")]
    InvalidTtl { key: String, ttl: Duration },

    /// A warmup step failed. Recorded in the step state, never fatal to the pipeline.
    #[error("warmup step '{step}' failed: {reason}")]
    StepExecution { step: &'static str, reason: String },

    /// A warmup run is already in flight.
    #[error("warmup run already in progress")]
    WarmupInProgress,

    /// Another `process_batch` holds the checkpoint.
    #[error("analytics batch already in progress")]
    BatchInProgress,

    /// Checkpoint-derived aggregate disagrees with the source table.
    #[error("consistency drift over {window:?}: {detail}")]
    ConsistencyDrift { window: Duration, detail: String },

    /// Durable tier or source store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Failure reported by a pluggable collaborator.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl MonitorError {
    /// Whether this error is the expected cache-miss signal
    #[must_use]
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss(_))
    }

    pub(crate) fn serialization(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MonitorError>;
