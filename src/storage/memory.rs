//! In-memory attempt store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{AdmissionGuard, AttemptRecord, AttemptStore};
use crate::error::Result;
use crate::ratelimit::{Action, AttemptKey, Identifier};

/// Attempt log held in process memory.
///
/// State is lost on restart and is not shared between instances; use
/// [`SqliteStore`](super::SqliteStore) when either matters. Each key's records
/// are kept sorted oldest first.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<AttemptKey, Vec<AttemptRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all keys.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert_sorted(records: &mut Vec<AttemptRecord>, record: AttemptRecord) {
    let at = records.partition_point(|r| r.created_at <= record.created_at);
    records.insert(at, record);
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn append(&self, record: &AttemptRecord) -> Result<()> {
        let mut records = self.entries.entry(record.key()).or_default();
        insert_sorted(&mut records, record.clone());
        Ok(())
    }

    async fn append_if_admitted(
        &self,
        record: &AttemptRecord,
        guard: &AdmissionGuard,
    ) -> Result<bool> {
        // The entry guard holds the shard lock, so counting and inserting is atomic per key.
        let mut records = self.entries.entry(record.key()).or_default();

        let window_attempts = records
            .iter()
            .filter(|r| r.created_at >= guard.window_start)
            .count();
        let recent_failures = records
            .iter()
            .filter(|r| !r.success && r.created_at >= guard.lockout_start)
            .count();

        if !guard.admits(window_attempts, recent_failures) {
            return Ok(false);
        }

        insert_sorted(&mut records, record.clone());
        Ok(true)
    }

    async fn attempts_since(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>> {
        let Some(records) = self.entries.get(key) else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .rev()
            .take_while(|r| r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn latest_attempt(&self, key: &AttemptKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .entries
            .get(key)
            .and_then(|records| records.last().map(|r| r.created_at)))
    }

    async fn delete(&self, identifier: &Identifier, action: Option<&Action>) -> Result<u64> {
        let mut removed = 0u64;
        self.entries.retain(|key, records| {
            let matches =
                &key.identifier == identifier && action.map_or(true, |a| &key.action == a);
            if matches {
                removed += records.len() as u64;
            }
            !matches
        });
        Ok(removed)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        self.entries.retain(|_, records| {
            let before = records.len();
            records.retain(|r| r.created_at >= cutoff);
            removed += (before - records.len()) as u64;
            !records.is_empty()
        });
        Ok(removed)
    }
}
