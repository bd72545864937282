/*!
# SQLite Store

Durable store implementation on top of a SQLite pool.

Records live in a single `retry_deliveries` table keyed by delivery id.
Timestamps are stored as epoch milliseconds so that range queries compare
integers rather than formatted strings.
*/

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{HookRelayError, Result};
use crate::payload::Priority;
use crate::store::{DurableStore, StoredDelivery};

type DeliveryRow = (String, String, i64, i64, i64, Option<String>, String, i64);

/// SQLite-backed durable store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and ensure the schema exists
    #[tracing::instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| HookRelayError::Config(format!("invalid database URL: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::with_pool(pool).await?;

        debug!("sqlite store ready");
        Ok(store)
    }

    /// Use an existing pool, creating the schema if needed
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_deliveries (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                next_due_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_error TEXT,
                priority TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_retry_deliveries_next_due_at ON retry_deliveries (next_due_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| HookRelayError::Store(format!("invalid timestamp: {millis}")))
}

fn row_to_record(row: DeliveryRow) -> Result<StoredDelivery> {
    let (id, payload, attempt_count, next_due_at, created_at, last_error, priority, updated_at) = row;

    Ok(StoredDelivery {
        id,
        payload,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| HookRelayError::Store(format!("invalid attempt count: {attempt_count}")))?,
        next_due_at: from_millis(next_due_at)?,
        created_at: from_millis(created_at)?,
        last_error,
        priority: Priority::from_str(&priority)?,
        updated_at: from_millis(updated_at)?,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    #[tracing::instrument(skip(self, record), fields(delivery_id = %record.id))]
    async fn upsert(&self, record: &StoredDelivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_deliveries (id, payload, attempt_count, next_due_at, created_at, last_error, priority, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                attempt_count = excluded.attempt_count,
                next_due_at = excluded.next_due_at,
                created_at = excluded.created_at,
                last_error = excluded.last_error,
                priority = excluded.priority,
                updated_at = excluded.updated_at
            WHERE excluded.updated_at >= retry_deliveries.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.payload)
        .bind(i64::from(record.attempt_count))
        .bind(record.next_due_at.timestamp_millis())
        .bind(record.created_at.timestamp_millis())
        .bind(&record.last_error)
        .bind(record.priority.as_str())
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM retry_deliveries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_due_at_or_after(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT id, payload, attempt_count, next_due_at, created_at, last_error, priority, updated_at
            FROM retry_deliveries
            WHERE next_due_at >= ?
            ORDER BY next_due_at ASC
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.0.clone();
                match row_to_record(row) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(delivery_id = %id, error = %e, "skipping unreadable stored delivery");
                        None
                    }
                }
            })
            .collect();

        Ok(records)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM retry_deliveries WHERE created_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM retry_deliveries WHERE updated_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
