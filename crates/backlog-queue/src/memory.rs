//! In-memory record store, for tests and single-process embedding

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use crate::record::{NewRecord, QueueRecord, RecordId, RecordStatus, StorageKey};
use crate::store::{Condition, RecordStore, RecordUpdate, StoreError};

/// A single named collection held in memory. Storage keys are assigned from
/// a monotonic counter; the ordered map gives insertion order as the natural
/// retrieval order.
pub struct MemoryStore {
    collection: String,
    next_key: AtomicI64,
    records: RwLock<BTreeMap<i64, QueueRecord>>,
}

impl MemoryStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            next_key: AtomicI64::new(1),
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Total records currently held, any status.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: NewRecord) -> Result<QueueRecord, StoreError> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let stored = record.into_record(StorageKey(key));
        self.records.write().await.insert(key, stored.clone());
        Ok(stored)
    }

    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        condition: Option<&Condition>,
    ) -> Result<Vec<QueueRecord>, StoreError> {
        let records = self.records.read().await;
        let selected = records
            .values()
            .filter(|record| record.is_eligible(now))
            .filter(|record| condition.is_none_or(|matches| matches(record)))
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(selected)
    }

    async fn apply(&self, key: StorageKey, update: RecordUpdate) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key.0)
            .ok_or_else(|| StoreError::NotFound(format!("storage key {key}")))?;
        update.apply_to(record);
        Ok(())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            !(record.status == RecordStatus::Processed
                && record.processed_date.is_some_and(|at| at <= cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn fetch(&self, id: RecordId) -> Result<Option<QueueRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.values().find(|record| record.id == id).cloned())
    }
}
