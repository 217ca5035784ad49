//! Derived aggregate tables fed by the checkpoint

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use super::source::{LogRow, WindowAggregate};

/// Receives committed batches and answers window queries over them
#[async_trait]
pub trait AggregateSink: Send + Sync {
    /// Fold one batch into the derived tables; all or nothing
    async fn apply(&self, rows: &[LogRow]) -> anyhow::Result<()>;

    /// Totals of applied rows with `since <= created_at < until`
    ///
    /// Bounds are minute-aligned by the caller.
    async fn window_aggregate(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<WindowAggregate>;

    /// Drop every derived table
    async fn reset(&self) -> anyhow::Result<()>;

    /// Whether applied batches outlive the process
    ///
    /// A stored watermark is only trusted next to a persistent sink.
    fn is_persistent(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRanking {
    pub user_id: i64,
    pub username: String,
    pub requests: u64,
    pub quota: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStats {
    pub model_name: String,
    pub requests: u64,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<i64, UserRanking>,
    models: HashMap<String, ModelStats>,
    /// Keyed by minute start (unix seconds)
    minutes: BTreeMap<i64, WindowAggregate>,
}

fn minute_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60) * 60
}

/// In-process ranking, per-model and per-minute tables
#[derive(Debug, Default)]
pub struct MemoryAggregateSink {
    tables: Mutex<Tables>,
}

impl MemoryAggregateSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Top `n` users by quota, ties broken by user id
    #[must_use]
    pub fn top_users(&self, n: usize) -> Vec<UserRanking> {
        let mut users: Vec<UserRanking> = self.tables.lock().users.values().cloned().collect();
        users.sort_by(|a, b| b.quota.cmp(&a.quota).then_with(|| a.user_id.cmp(&b.user_id)));
        users.truncate(n);
        users
    }

    /// Per-model totals, ordered by model name
    #[must_use]
    pub fn model_stats(&self) -> Vec<ModelStats> {
        let mut models: Vec<ModelStats> = self.tables.lock().models.values().cloned().collect();
        models.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        models
    }
}

#[async_trait]
impl AggregateSink for MemoryAggregateSink {
    async fn apply(&self, rows: &[LogRow]) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        for row in rows {
            let user = tables.users.entry(row.user_id).or_insert_with(|| UserRanking {
                user_id: row.user_id,
                username: row.username.clone(),
                requests: 0,
                quota: 0,
                tokens: 0,
            });
            user.requests += 1;
            user.quota += row.quota;
            user.tokens += row.prompt_tokens + row.completion_tokens;

            let model = tables
                .models
                .entry(row.model_name.clone())
                .or_insert_with(|| ModelStats {
                    model_name: row.model_name.clone(),
                    requests: 0,
                    quota: 0,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                });
            model.requests += 1;
            model.quota += row.quota;
            model.prompt_tokens += row.prompt_tokens;
            model.completion_tokens += row.completion_tokens;

            tables
                .minutes
                .entry(minute_of(row.created_at))
                .or_default()
                .absorb(row);
        }
        Ok(())
    }

    async fn window_aggregate(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<WindowAggregate> {
        let mut total = WindowAggregate::default();
        if since >= until {
            return Ok(total);
        }
        let tables = self.tables.lock();
        for bucket in tables.minutes.range(since.timestamp()..until.timestamp()).map(|(_, b)| b) {
            total.merge(bucket);
        }
        Ok(total)
    }

    async fn reset(&self) -> anyhow::Result<()> {
        *self.tables.lock() = Tables::default();
        Ok(())
    }
}

type UserTuple = (i64, String, i64, i64, i64);
type ModelTuple = (String, i64, i64, i64, i64);

/// Ranking, per-model and per-minute tables in SQLite
///
/// Usually shares the durable tier's pool with the checkpoint store, so the
/// tables and the watermark live and die together. Each batch is applied in
/// one transaction that also records the highest id applied; rows at or
/// below it are ignored, which makes replaying a batch whose checkpoint save
/// was lost harmless.
#[derive(Debug, Clone)]
pub struct SqliteAggregateSink {
    pool: Pool<Sqlite>,
}

impl SqliteAggregateSink {
    /// Wrap `pool`, creating the derived tables if missing
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn new(pool: Pool<Sqlite>) -> crate::Result<Self> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS analytics_user_rankings (
                user_id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                requests INTEGER NOT NULL,
                quota INTEGER NOT NULL,
                tokens INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS analytics_model_stats (
                model_name TEXT PRIMARY KEY,
                requests INTEGER NOT NULL,
                quota INTEGER NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS analytics_minute_buckets (
                minute INTEGER PRIMARY KEY,
                requests INTEGER NOT NULL,
                quota INTEGER NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS analytics_sink_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                applied_through INTEGER NOT NULL
            )",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Top `n` users by quota, ties broken by user id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn top_users(&self, n: usize) -> crate::Result<Vec<UserRanking>> {
        let rows: Vec<UserTuple> = sqlx::query_as(
            "SELECT user_id, username, requests, quota, tokens FROM analytics_user_rankings
             ORDER BY quota DESC, user_id ASC LIMIT ?",
        )
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, username, requests, quota, tokens)| UserRanking {
                user_id,
                username,
                requests: u64::try_from(requests).unwrap_or(0),
                quota,
                tokens,
            })
            .collect())
    }

    /// Per-model totals, ordered by model name
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn model_stats(&self) -> crate::Result<Vec<ModelStats>> {
        let rows: Vec<ModelTuple> = sqlx::query_as(
            "SELECT model_name, requests, quota, prompt_tokens, completion_tokens
             FROM analytics_model_stats ORDER BY model_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(model_name, requests, quota, prompt_tokens, completion_tokens)| ModelStats {
                    model_name,
                    requests: u64::try_from(requests).unwrap_or(0),
                    quota,
                    prompt_tokens,
                    completion_tokens,
                },
            )
            .collect())
    }
}

#[async_trait]
impl AggregateSink for SqliteAggregateSink {
    async fn apply(&self, rows: &[LogRow]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let applied: Option<(i64,)> =
            sqlx::query_as("SELECT applied_through FROM analytics_sink_meta WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?;
        let applied_through = applied.map_or(0, |(id,)| id);

        let mut max_id = applied_through;
        let mut skipped = 0_usize;
        for row in rows {
            if row.id <= applied_through {
                skipped += 1;
                continue;
            }
            max_id = max_id.max(row.id);

            sqlx::query(
                "INSERT INTO analytics_user_rankings (user_id, username, requests, quota, tokens)
                 VALUES (?, ?, 1, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    requests = requests + 1,
                    quota = quota + excluded.quota,
                    tokens = tokens + excluded.tokens",
            )
            .bind(row.user_id)
            .bind(&row.username)
            .bind(row.quota)
            .bind(row.prompt_tokens + row.completion_tokens)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO analytics_model_stats
                    (model_name, requests, quota, prompt_tokens, completion_tokens)
                 VALUES (?, 1, ?, ?, ?)
                 ON CONFLICT(model_name) DO UPDATE SET
                    requests = requests + 1,
                    quota = quota + excluded.quota,
                    prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                    completion_tokens = completion_tokens + excluded.completion_tokens",
            )
            .bind(&row.model_name)
            .bind(row.quota)
            .bind(row.prompt_tokens)
            .bind(row.completion_tokens)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO analytics_minute_buckets
                    (minute, requests, quota, prompt_tokens, completion_tokens)
                 VALUES (?, 1, ?, ?, ?)
                 ON CONFLICT(minute) DO UPDATE SET
                    requests = requests + 1,
                    quota = quota + excluded.quota,
                    prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                    completion_tokens = completion_tokens + excluded.completion_tokens",
            )
            .bind(minute_of(row.created_at))
            .bind(row.quota)
            .bind(row.prompt_tokens)
            .bind(row.completion_tokens)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO analytics_sink_meta (id, applied_through) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET applied_through = excluded.applied_through",
        )
        .bind(max_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if skipped > 0 {
            debug!(skipped, applied_through, "[SQLite] Ignored rows already in the derived tables");
        }
        Ok(())
    }

    async fn window_aggregate(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<WindowAggregate> {
        let (requests, quota, prompt_tokens, completion_tokens): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(requests), 0), COALESCE(SUM(quota), 0),
                    COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0)
             FROM analytics_minute_buckets WHERE minute >= ? AND minute < ?",
        )
        .bind(since.timestamp())
        .bind(until.timestamp())
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowAggregate {
            requests: u64::try_from(requests).unwrap_or(0),
            quota,
            prompt_tokens,
            completion_tokens,
        })
    }

    async fn reset(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "analytics_user_rankings",
            "analytics_model_stats",
            "analytics_minute_buckets",
            "analytics_sink_meta",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
