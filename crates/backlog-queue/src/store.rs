//! Record store trait and error types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::record::{NewRecord, QueueRecord, RecordId, RecordStatus, StorageKey};

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),
}

/// Extra selection predicate intersected into batch eligibility.
///
/// The engine resolves the configured condition factory once per batch call;
/// the store applies the resulting predicate during selection, before the
/// batch limit is taken.
pub type Condition = Arc<dyn Fn(&QueueRecord) -> bool + Send + Sync>;

/// One atomic single-record update: field sets, unsets, and the retry-count
/// increment, applied together.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub status: Option<RecordStatus>,
    pub processed_date: Option<DateTime<Utc>>,
    pub available_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub clear_available_at: bool,
    pub clear_retry_count: bool,
    pub clear_failure_reason: bool,
    pub bump_retry_count: bool,
}

impl RecordUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.processed_date.is_none()
            && self.available_at.is_none()
            && self.failure_reason.is_none()
            && !self.clear_available_at
            && !self.clear_retry_count
            && !self.clear_failure_reason
            && !self.bump_retry_count
    }

    /// Mutate an in-memory record accordingly. Increment runs after the
    /// clears, so a single update cannot both clear and bump.
    pub fn apply_to(&self, record: &mut QueueRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(at) = self.processed_date {
            record.processed_date = Some(at);
        }
        if let Some(at) = self.available_at {
            record.available_at = Some(at);
        }
        if let Some(ref reason) = self.failure_reason {
            record.failure_reason = Some(reason.clone());
        }
        if self.clear_available_at {
            record.available_at = None;
        }
        if self.clear_retry_count {
            record.retry_count = None;
        }
        if self.clear_failure_reason {
            record.failure_reason = None;
        }
        if self.bump_retry_count {
            record.retry_count = Some(record.retry_count.unwrap_or(0) + 1);
        }
    }
}

/// Persistent record collection boundary (object safe).
///
/// The engine issues exactly these primitives and assumes each `apply` is an
/// atomic single-record write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record and return it with its store-assigned identity.
    async fn insert(&self, record: NewRecord) -> Result<QueueRecord, StoreError>;

    /// Select up to `limit` records eligible at `now` (status in
    /// {received, failed, skipped}, availability elapsed), intersected with
    /// `condition` when present. Natural retrieval order, not randomized.
    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        condition: Option<&Condition>,
    ) -> Result<Vec<QueueRecord>, StoreError>;

    /// Apply one atomic update to the record with the given key.
    async fn apply(&self, key: StorageKey, update: RecordUpdate) -> Result<(), StoreError>;

    /// Delete every `processed` record whose `processed_date` is at or before
    /// `cutoff`. Returns the number deleted. Records in any other status are
    /// untouched regardless of age.
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Point lookup by record id.
    async fn fetch(&self, id: RecordId) -> Result<Option<QueueRecord>, StoreError>;
}
