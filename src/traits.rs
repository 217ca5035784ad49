//! Cache Backend Traits
//!
//! Trait abstractions for the two cache tiers and the value codec.
//!
//! # Architecture
//!
//! - `CacheCodec`: pluggable serialization of cached values
//! - `CacheBackend`: operations every tier supports (fast tier uses only this)
//! - `DurableBackend`: extra operations of the persistent tier that backs restarts
//!
//! # Example: Custom Fast Tier
//!
//! ```rust,ignore
//! use monitor_cache::{CacheBackend, CacheEntry, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyFastTier {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheBackend for MyFastTier {
//!     async fn get(&self, key: &str) -> Result<Option<CacheEntry>> { todo!() }
//!     async fn set_with_ttl(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> { todo!() }
//!     async fn remove(&self, key: &str) -> Result<()> { todo!() }
//!     async fn remove_prefix(&self, prefix: &str) -> Result<u64> { todo!() }
//!     async fn len(&self) -> Result<u64> { todo!() }
//!     async fn health_check(&self) -> bool { todo!() }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// One cached value as stored in any tier
///
/// `expires_at` is the authoritative expiry: a tier may hold the entry for a
/// shorter time (fast-tier backfill) but never serves it past this instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at,
            expires_at,
        }
    }

    /// Whether the entry must be treated as absent at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Time left before expiry, `None` for entries without an expiry
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| crate::clock::remaining(now, at).unwrap_or(Duration::ZERO))
    }
}

/// Trait for cache value serialization/deserialization
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access
/// across async tasks.
///
/// # Example: Custom Codec
///
/// ```rust,ignore
/// use monitor_cache::CacheCodec;
/// use anyhow::Result;
/// use serde::{Serialize, de::DeserializeOwned};
///
/// #[derive(Debug)]
/// struct MyCustomCodec;
///
/// impl CacheCodec for MyCustomCodec {
///     fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
///         Ok(mycodec::serialize(value)?)
///     }
///
///     fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
///         Ok(mycodec::deserialize(bytes)?)
///     }
///
///     fn name(&self) -> &'static str {
///         "mycodec"
///     }
/// }
/// ```
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode to `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Name of the codec, for logging
    fn name(&self) -> &'static str;
}

/// Core cache backend trait for both tiers
///
/// # Required Operations
///
/// - `get`: Retrieve an entry by key
/// - `set_with_ttl`: Upsert an entry, held by this tier for at most `ttl`
/// - `remove` / `remove_prefix`: Delete one key or every key under a prefix
/// - `len`: Number of entries currently held
/// - `health_check`: Verify the backend is operational
///
/// `get` returns `Err` only when the tier itself failed; an absent key is
/// `Ok(None)`. The tiered store relies on this split to tell a miss from an
/// outage.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Every write is an upsert keyed by a
/// stable key, so concurrent writers need no coordination beyond the backend's own.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get entry by key
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Upsert an entry, kept by this tier for at most `ttl`
    ///
    /// # Errors
    ///
    /// Returns an error if the write failed.
    async fn set_with_ttl(&self, entry: &CacheEntry, ttl: Duration) -> Result<()>;

    /// Remove an entry (absent keys are not an error)
    ///
    /// # Errors
    ///
    /// Returns an error if the delete failed.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every entry whose key starts with `prefix`, returning how many went
    ///
    /// Implementations must not hold a global lock for the whole scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or delete failed.
    async fn remove_prefix(&self, prefix: &str) -> Result<u64>;

    /// Number of entries currently held
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    async fn len(&self) -> Result<u64>;

    /// Drop entries whose expiry is at or before `now`
    ///
    /// Backends with native expiry keep the default no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the purge failed.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }

    /// Check if cache backend is healthy
    async fn health_check(&self) -> bool;

    /// Name of this backend, for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Persistent tier that survives restarts
///
/// Extends `CacheBackend` with a bulk read of live entries, used to refill
/// the fast tier after a restart.
#[async_trait]
pub trait DurableBackend: CacheBackend {
    /// All entries not yet expired at `now`
    ///
    /// # Errors
    ///
    /// Returns an error if the scan failed.
    async fn load_live(&self, now: DateTime<Utc>) -> Result<Vec<CacheEntry>>;
}
