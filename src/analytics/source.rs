//! Log table read contract
//!
//! The source of truth is an append-mostly `logs` table with a monotonically
//! increasing integer id. The checkpoint only ever reads it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

/// One usage log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRow {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub created_at: DateTime<Utc>,
}

/// Totals over a set of log rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub requests: u64,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl WindowAggregate {
    pub fn absorb(&mut self, row: &LogRow) {
        self.requests += 1;
        self.quota += row.quota;
        self.prompt_tokens += row.prompt_tokens;
        self.completion_tokens += row.completion_tokens;
    }

    pub fn merge(&mut self, other: &WindowAggregate) {
        self.requests += other.requests;
        self.quota += other.quota;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Read access to the log table
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Up to `limit` rows with `id > after_id`, ascending by id
    async fn fetch_after(&self, after_id: i64, limit: usize) -> anyhow::Result<Vec<LogRow>>;

    /// Totals of rows with `since <= created_at < until` and `id <= max_id`
    async fn window_aggregate(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        max_id: i64,
    ) -> anyhow::Result<WindowAggregate>;
}

/// In-memory log table for tests and demos
#[derive(Debug, Default)]
pub struct MemoryLogSource {
    rows: RwLock<Vec<LogRow>>,
}

impl MemoryLogSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, row: LogRow) {
        self.rows.write().push(row);
    }

    pub fn extend(&self, rows: impl IntoIterator<Item = LogRow>) {
        self.rows.write().extend(rows);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn fetch_after(&self, after_id: i64, limit: usize) -> anyhow::Result<Vec<LogRow>> {
        let mut rows: Vec<LogRow> = self
            .rows
            .read()
            .iter()
            .filter(|r| r.id > after_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn window_aggregate(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        max_id: i64,
    ) -> anyhow::Result<WindowAggregate> {
        let mut total = WindowAggregate::default();
        for row in self.rows.read().iter() {
            if row.id <= max_id && row.created_at >= since && row.created_at < until {
                total.absorb(row);
            }
        }
        Ok(total)
    }
}

type LogTuple = (i64, i64, String, String, i64, i64, i64, i64);

fn tuple_to_row(
    (id, user_id, username, model_name, quota, prompt_tokens, completion_tokens, created_at): LogTuple,
) -> LogRow {
    LogRow {
        id,
        user_id,
        username,
        model_name,
        quota,
        prompt_tokens,
        completion_tokens,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    }
}

/// `logs` table in a SQLite database, `created_at` in unix seconds
#[derive(Debug, Clone)]
pub struct SqliteLogSource {
    pool: Pool<Sqlite>,
}

impl SqliteLogSource {
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create the `logs` table if missing (local development and tests)
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn create_schema(&self) -> crate::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                model_name TEXT NOT NULL DEFAULT '',
                quota INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs (created_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert rows (seeding tests and demos; the checkpoint never writes here)
    ///
    /// # Errors
    ///
    /// Returns an error if an insert fails.
    pub async fn insert(&self, rows: &[LogRow]) -> crate::Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO logs (id, user_id, username, model_name, quota, prompt_tokens, completion_tokens, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.id)
            .bind(row.user_id)
            .bind(&row.username)
            .bind(&row.model_name)
            .bind(row.quota)
            .bind(row.prompt_tokens)
            .bind(row.completion_tokens)
            .bind(row.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LogSource for SqliteLogSource {
    async fn fetch_after(&self, after_id: i64, limit: usize) -> anyhow::Result<Vec<LogRow>> {
        let rows: Vec<LogTuple> = sqlx::query_as(
            "SELECT id, user_id, username, model_name, quota, prompt_tokens, completion_tokens, created_at
             FROM logs WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(tuple_to_row).collect())
    }

    async fn window_aggregate(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        max_id: i64,
    ) -> anyhow::Result<WindowAggregate> {
        let (requests, quota, prompt_tokens, completion_tokens): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(quota), 0), COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0)
             FROM logs WHERE created_at >= ? AND created_at < ? AND id <= ?",
        )
        .bind(since.timestamp())
        .bind(until.timestamp())
        .bind(max_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowAggregate {
            requests: u64::try_from(requests).unwrap_or(0),
            quota,
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, secs: i64) -> LogRow {
        LogRow {
            id,
            user_id: id % 3,
            username: format!("user{}", id % 3),
            model_name: "gpt-4o".to_string(),
            quota: 10,
            prompt_tokens: 5,
            completion_tokens: 7,
            created_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn memory_source_pages_in_id_order() {
        let source = MemoryLogSource::new();
        source.extend([row(3, 0), row(1, 0), row(2, 0), row(4, 0)]);

        let page = source.fetch_after(1, 2).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn memory_window_respects_bounds_and_watermark() {
        let source = MemoryLogSource::new();
        source.extend([row(1, 59), row(2, 60), row(3, 119), row(4, 120), row(5, 61)]);

        let since = DateTime::from_timestamp(60, 0).unwrap_or_default();
        let until = DateTime::from_timestamp(120, 0).unwrap_or_default();
        let total = source.window_aggregate(since, until, 4).await.unwrap();

        assert_eq!(total.requests, 2);
        assert_eq!(total.quota, 20);
    }
}
