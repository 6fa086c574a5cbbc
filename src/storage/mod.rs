//! Attempt log storage.
//!
//! The log is append-only: records are written once and only ever removed
//! by an explicit clear or by retention cleanup.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::ratelimit::{Action, AttemptKey, Identifier};

/// A metadata value. Opaque to the limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value.into())
    }
}

/// Contextual data attached to an attempt (IP address, user agent, ...).
pub type Metadata = BTreeMap<String, MetadataValue>;

/// One recorded attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub identifier: Identifier,
    pub action: Action,
    pub success: bool,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(
        key: &AttemptKey,
        success: bool,
        metadata: Metadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: key.identifier.clone(),
            action: key.action.clone(),
            success,
            metadata,
            created_at,
        }
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(self.identifier.clone(), self.action.clone())
    }
}

/// Bounds a conditional append is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionGuard {
    /// Attempts of any outcome at or after this instant use up the budget
    pub window_start: DateTime<Utc>,
    /// Failures at or after this instant count toward a lockout
    pub lockout_start: DateTime<Utc>,
    pub max_attempts: u32,
}

impl AdmissionGuard {
    /// Whether a key with these counts may take one more attempt.
    pub fn admits(&self, window_attempts: usize, recent_failures: usize) -> bool {
        let max = self.max_attempts as usize;
        window_attempts < max && recent_failures < max
    }
}

/// Storage backend for the attempt log.
///
/// Implement this trait for custom storage. Every method may fail; the rate
/// limiter decides how each failure degrades.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Append a record.
    async fn append(&self, record: &AttemptRecord) -> Result<()>;

    /// Append a record only if `guard` admits the key's current log, as one
    /// atomic operation. Returns whether the record was written.
    async fn append_if_admitted(
        &self,
        record: &AttemptRecord,
        guard: &AdmissionGuard,
    ) -> Result<bool>;

    /// All records for `key` created at or after `since`, newest first.
    async fn attempts_since(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>>;

    /// Timestamp of the newest record for `key`, if any.
    async fn latest_attempt(&self, key: &AttemptKey) -> Result<Option<DateTime<Utc>>>;

    /// Delete an identifier's records, for one action or all of them.
    async fn delete(&self, identifier: &Identifier, action: Option<&Action>) -> Result<u64>;

    /// Delete every record created before `cutoff`.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Open the store described by `config`.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn AttemptStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory attempt store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let store = SqliteStore::connect(&config.database_url, config.max_connections).await?;
            store.migrate().await?;
            info!(database_url = %config.database_url, "Using SQLite attempt store");
            Ok(Arc::new(store))
        }
    }
}
