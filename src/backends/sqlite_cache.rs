//! SQLite Cache - Durable Tier
//!
//! Local, restart-surviving cache substrate. One row per key; timestamps are
//! stored as unix milliseconds so expiry filters run inside SQLite.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{Clock, expires_after};
use crate::traits::{CacheBackend, CacheEntry, DurableBackend};

type EntryRow = (String, Vec<u8>, i64, Option<i64>);

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn row_to_entry((key, payload, created_at, expires_at): EntryRow) -> CacheEntry {
    CacheEntry::new(
        key,
        payload,
        from_millis(created_at),
        expires_at.map(from_millis),
    )
}

/// Durable tier on SQLite via `sqlx`
pub struct SqliteCache {
    pool: Pool<Sqlite>,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    /// Open (creating if missing) a cache database file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> crate::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        info!(path = %path.display(), "Opening SQLite durable tier");
        Self::connect(opts, clock).await
    }

    /// Private in-memory database, lost when the value is dropped
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> crate::Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(opts, clock).await
    }

    async fn connect(opts: SqliteConnectOptions, clock: Arc<dyn Clock>) -> crate::Result<Self> {
        // One long-lived connection: SQLite serializes writers anyway, and an
        // in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                evict_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_entries_evict ON cache_entries (evict_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, clock })
    }

    /// Connection pool, shared with the checkpoint store
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl CacheBackend for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = to_millis(self.clock.now());
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, payload, created_at, expires_at FROM cache_entries
             WHERE key = ? AND evict_at > ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_entry))
    }

    async fn set_with_ttl(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let evict_at = expires_after(self.clock.now(), ttl);
        sqlx::query(
            "INSERT INTO cache_entries (key, payload, created_at, expires_at, evict_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                evict_at = excluded.evict_at",
        )
        .bind(&entry.key)
        .bind(&entry.payload)
        .bind(to_millis(entry.created_at))
        .bind(entry.expires_at.map(to_millis))
        .bind(to_millis(evict_at))
        .execute(&self.pool)
        .await?;

        debug!(key = %entry.key, ttl_secs = ttl.as_secs(), "[SQLite] Persisted key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE substr(key, 1, ?) = ?")
            .bind(i64::try_from(prefix.chars().count())?)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        debug!(prefix = %prefix, removed = result.rows_affected(), "[SQLite] Removed keys by prefix");
        Ok(result.rows_affected())
    }

    async fn len(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let now = to_millis(now);
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE evict_at <= ? OR (expires_at IS NOT NULL AND expires_at <= ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }
}

#[async_trait]
impl DurableBackend for SqliteCache {
    async fn load_live(&self, now: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let now = to_millis(now);
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT key, payload, created_at, expires_at FROM cache_entries
             WHERE evict_at > ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY key",
        )
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn cache() -> (SqliteCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(from_millis(1_700_000_000_000)));
        let cache = SqliteCache::in_memory(clock.clone()).await.unwrap();
        (cache, clock)
    }

    #[tokio::test]
    async fn upsert_keeps_last_write() {
        let (cache, clock) = cache().await;
        let now = clock.now();
        let first = CacheEntry::new("k", b"one".to_vec(), now, None);
        let second = CacheEntry::new("k", b"two".to_vec(), now, None);

        cache.set_with_ttl(&first, Duration::from_secs(60)).await.unwrap();
        cache.set_with_ttl(&second, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(second));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_rows_are_hidden_then_purged() {
        let (cache, clock) = cache().await;
        let now = clock.now();
        let entry = CacheEntry::new(
            "k",
            b"v".to_vec(),
            now,
            Some(now + chrono::Duration::seconds(30)),
        );
        cache.set_with_ttl(&entry, Duration::from_secs(30)).await.unwrap();

        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.load_live(clock.now()).await.unwrap().is_empty());
        assert_eq!(cache.purge_expired(clock.now()).await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prefix_delete_is_literal() {
        let (cache, clock) = cache().await;
        let now = clock.now();
        for key in ["slot:7d:quota:1", "slot:7d:quota:2", "slot:7dx:quota:1", "slot_7d"] {
            let entry = CacheEntry::new(key, vec![1], now, None);
            cache.set_with_ttl(&entry, Duration::from_secs(60)).await.unwrap();
        }

        assert_eq!(cache.remove_prefix("slot:7d:").await.unwrap(), 2);
        assert_eq!(cache.len().await.unwrap(), 2);
    }
}
