//! `SQLite`-backed attempt store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{AdmissionGuard, AttemptRecord, AttemptStore, Metadata};
use crate::error::{BulwarkError, Result};
use crate::ratelimit::{Action, AttemptKey, Identifier};

/// Schema statements, applied in order by [`SqliteStore::migrate`].
///
/// `created_at` is stored as Unix epoch milliseconds so range filters compare
/// integers rather than formatted text. Sub-millisecond precision is dropped on
/// write.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS attempt_records (
        id TEXT PRIMARY KEY NOT NULL,
        identifier TEXT NOT NULL,
        action TEXT NOT NULL,
        success INTEGER NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_attempt_records_key_created
        ON attempt_records (identifier, action, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_attempt_records_created
        ON attempt_records (created_at)",
];

/// Attempt log persisted in a `SQLite` database.
///
/// Suitable for single-host deployments; every instance pointed at the same
/// database file shares one log.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url`.
    ///
    /// In-memory databases live and die with their connection, so they are
    /// pinned to a single connection that is never recycled.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        debug!(database_url = %database_url, "SQLite pool initialized");
        Ok(Self::new(pool))
    }

    /// Create the attempt table and its indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    identifier: String,
    action: String,
    success: bool,
    metadata: String,
    created_at: i64,
}

impl TryFrom<AttemptRow> for AttemptRecord {
    type Error = BulwarkError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| BulwarkError::Storage(format!("invalid attempt id {}: {}", row.id, e)))?;
        let metadata: Metadata = serde_json::from_str(&row.metadata)?;

        Ok(AttemptRecord {
            id,
            identifier: Identifier::new(row.identifier)?,
            action: Action::new(row.action)?,
            success: row.success,
            metadata,
            created_at: from_millis(row.created_at)?,
        })
    }
}

/// Smallest stored millisecond value at or after `at`.
fn millis_ceil(at: DateTime<Utc>) -> i64 {
    let millis = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| BulwarkError::Storage(format!("timestamp out of range: {}", millis)))
}

#[async_trait]
impl AttemptStore for SqliteStore {
    async fn append(&self, record: &AttemptRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;

        sqlx::query(
            "INSERT INTO attempt_records (id, identifier, action, success, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.identifier.as_str())
        .bind(record.action.as_str())
        .bind(record.success)
        .bind(metadata)
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_if_admitted(
        &self,
        record: &AttemptRecord,
        guard: &AdmissionGuard,
    ) -> Result<bool> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let max_attempts = i64::from(guard.max_attempts);

        // A single INSERT ... SELECT is atomic, so concurrent callers cannot
        // both pass the count check for the last remaining slot.
        let result = sqlx::query(
            "INSERT INTO attempt_records (id, identifier, action, success, metadata, created_at)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE (SELECT COUNT(*) FROM attempt_records
                    WHERE identifier = ? AND action = ? AND created_at >= ?) < ?
               AND (SELECT COUNT(*) FROM attempt_records
                    WHERE identifier = ? AND action = ? AND success = 0 AND created_at >= ?) < ?",
        )
        .bind(record.id.to_string())
        .bind(record.identifier.as_str())
        .bind(record.action.as_str())
        .bind(record.success)
        .bind(metadata)
        .bind(record.created_at.timestamp_millis())
        .bind(record.identifier.as_str())
        .bind(record.action.as_str())
        .bind(millis_ceil(guard.window_start))
        .bind(max_attempts)
        .bind(record.identifier.as_str())
        .bind(record.action.as_str())
        .bind(millis_ceil(guard.lockout_start))
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn attempts_since(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT id, identifier, action, success, metadata, created_at
             FROM attempt_records
             WHERE identifier = ? AND action = ? AND created_at >= ?
             ORDER BY created_at DESC, rowid DESC",
        )
        .bind(key.identifier.as_str())
        .bind(key.action.as_str())
        .bind(millis_ceil(since))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AttemptRecord::try_from).collect()
    }

    async fn latest_attempt(&self, key: &AttemptKey) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM attempt_records WHERE identifier = ? AND action = ?",
        )
        .bind(key.identifier.as_str())
        .bind(key.action.as_str())
        .fetch_one(&self.pool)
        .await?;

        latest.map(from_millis).transpose()
    }

    async fn delete(&self, identifier: &Identifier, action: Option<&Action>) -> Result<u64> {
        let result = match action {
            Some(action) => {
                sqlx::query("DELETE FROM attempt_records WHERE identifier = ? AND action = ?")
                    .bind(identifier.as_str())
                    .bind(action.as_str())
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM attempt_records WHERE identifier = ?")
                    .bind(identifier.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM attempt_records WHERE created_at < ?")
            .bind(millis_ceil(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
