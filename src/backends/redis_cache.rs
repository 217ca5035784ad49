//! Redis Cache - Distributed Fast Tier
//!
//! Lets several monitor instances share one fast tier. Entries are stored as
//! JSON-encoded [`CacheEntry`] values under a namespace prefix so prefix
//! deletes and counts never touch foreign keys.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, info};

use crate::traits::{CacheBackend, CacheEntry};

const SCAN_BATCH: usize = 100;
/// About a century; well inside what `SET EX` accepts
const MAX_EXPIRE_SECS: u64 = 100 * 365 * 24 * 3600;

/// Redis fast tier with `ConnectionManager` for automatic reconnection
pub struct RedisCache {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    namespace: String,
}

impl RedisCache {
    /// Connect using `REDIS_URL` (default `redis://127.0.0.1:6379`)
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url, "monitor:").await
    }

    /// Connect to `redis_url`, storing keys under `namespace`
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str, namespace: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis fast tier with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redis_url, "Redis fast tier connected");

        Ok(Self {
            conn_manager,
            namespace: namespace.to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    /// Scan keys matching a glob pattern with cursor-based `SCAN`
    ///
    /// Never uses `KEYS`, so the server is not blocked for the whole keyspace.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }
}

/// Escape glob metacharacters so a literal prefix can be used in `MATCH`
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<Vec<u8>> = conn.get(self.namespaced(key)).await?;

        match raw {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    async fn set_with_ttl(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let bytes = serde_json::to_vec(entry)?;
        // SETEX rejects 0 and expiries past i64 milliseconds; the entry's own
        // expires_at still governs what is served.
        let secs = ttl.as_secs().clamp(1, MAX_EXPIRE_SECS);

        let _: () = conn.set_ex(self.namespaced(&entry.key), bytes, secs).await?;
        debug!(key = %entry.key, ttl_secs = secs, "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(self.namespaced(key)).await?;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}*", escape_glob(&self.namespaced(prefix)));
        let keys = self.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn_manager.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let count: u64 = conn.del(chunk).await?;
            removed += count;
        }
        debug!(prefix = %prefix, removed, "[Redis] Removed keys by prefix");
        Ok(removed)
    }

    async fn len(&self) -> Result<u64> {
        let pattern = format!("{}*", escape_glob(&self.namespace));
        Ok(self.scan_keys(&pattern).await?.len() as u64)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
