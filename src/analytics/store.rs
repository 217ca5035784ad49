//! Checkpoint persistence

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{Pool, Sqlite};

use super::AnalyticsState;
use crate::backends::sqlite_cache::{from_millis, to_millis};

/// Loads and saves the checkpoint so the watermark survives restarts
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` on first startup
    async fn load(&self) -> anyhow::Result<Option<AnalyticsState>>;

    async fn save(&self, state: &AnalyticsState) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<Option<AnalyticsState>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> anyhow::Result<Option<AnalyticsState>> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &AnalyticsState) -> anyhow::Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

type StateRow = (i64, Option<i64>, i64, i64, i64);

/// Single-row checkpoint table, usually sharing the durable tier's pool
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: Pool<Sqlite>,
}

impl SqliteCheckpointStore {
    /// Wrap `pool`, creating the checkpoint table if missing
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn new(pool: Pool<Sqlite>) -> crate::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS analytics_checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_processed_id INTEGER NOT NULL,
                last_processed_at INTEGER,
                total_processed INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self) -> anyhow::Result<Option<AnalyticsState>> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT last_processed_id, last_processed_at, total_processed, epoch, generation
             FROM analytics_checkpoint WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(last_processed_id, last_processed_at, total_processed, epoch, generation)| AnalyticsState {
                last_processed_id,
                last_processed_at: last_processed_at.map(from_millis),
                total_processed: u64::try_from(total_processed).unwrap_or(0),
                epoch: u64::try_from(epoch).unwrap_or(0),
                generation: u64::try_from(generation).unwrap_or(0),
            },
        ))
    }

    async fn save(&self, state: &AnalyticsState) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO analytics_checkpoint
                (id, last_processed_id, last_processed_at, total_processed, epoch, generation)
             VALUES (1, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                last_processed_id = excluded.last_processed_id,
                last_processed_at = excluded.last_processed_at,
                total_processed = excluded.total_processed,
                epoch = excluded.epoch,
                generation = excluded.generation",
        )
        .bind(state.last_processed_id)
        .bind(state.last_processed_at.map(to_millis))
        .bind(i64::try_from(state.total_processed).unwrap_or(i64::MAX))
        .bind(i64::try_from(state.epoch).unwrap_or(i64::MAX))
        .bind(i64::try_from(state.generation).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
