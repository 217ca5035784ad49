//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! ## Fast tier (optional)
//! - **Moka** - Size-bounded concurrent cache with eviction (default, feature `moka`)
//! - **`DashMap`** - Simple concurrent map, swept by the scheduler
//! - **Redis** - Shared fast tier for multi-instance deployments (feature `redis`)
//!
//! ## Durable tier (required)
//! - **SQLite** - Local file via `sqlx`, survives restarts
//!
//! # Usage
//!
//! ```rust,no_run
//! use monitor_cache::backends::{DashMapCache, SqliteCache};
//! use monitor_cache::clock::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> monitor_cache::Result<()> {
//! let fast = DashMapCache::new();
//! let durable = SqliteCache::open("data/cache.db", Arc::new(SystemClock)).await?;
//! # Ok(())
//! # }
//! ```

pub mod dashmap_cache;
pub mod sqlite_cache;

#[cfg(feature = "moka")]
pub mod moka_cache;

#[cfg(feature = "redis")]
pub mod redis_cache;

pub use dashmap_cache::DashMapCache;
pub use sqlite_cache::SqliteCache;

#[cfg(feature = "moka")]
pub use moka_cache::{MokaCache, MokaCacheConfig};

#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;
