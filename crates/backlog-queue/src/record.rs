//! Queue record definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record identifier, generated at enqueue time
pub type RecordId = Uuid;

/// Store-assigned identity, opaque to callers, used for targeted updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey(pub i64);

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Freshly enqueued, never attempted
    Received,
    /// Successfully completed (terminal)
    Processed,
    /// Failed a retryable attempt, waiting out its backoff window
    Failed,
    /// Explicitly deferred by the processor, no retry budget consumed
    Skipped,
    /// Permanent failure delivered to the caller (terminal)
    Notified,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Notified => "notified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "notified" => Some(Self::Notified),
            _ => None,
        }
    }

    /// Whether the record may still be selected for a batch
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Received | Self::Failed | Self::Skipped)
    }

    /// No further transitions happen from these without external intervention
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Notified)
    }
}

/// A persisted queue record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub storage_key: StorageKey,
    pub id: RecordId,
    pub status: RecordStatus,
    /// Set at enqueue, immutable
    pub received_date: DateTime<Utc>,
    /// Overwritten on every terminal-for-this-attempt transition
    pub processed_date: Option<DateTime<Utc>>,
    /// Eligible for selection only once this has elapsed; cleared on success
    pub available_at: Option<DateTime<Utc>>,
    /// Count of completed failed attempts; cleared on success, never decremented
    pub retry_count: Option<u32>,
    pub failure_reason: Option<String>,
    /// Caller-opaque payload
    pub data: serde_json::Value,
}

impl QueueRecord {
    /// Eligibility: status in {received, failed, skipped} and availability reached
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_eligible() && self.available_at.is_some_and(|at| at <= now)
    }
}

/// Fields the engine provides when inserting; the store assigns the key
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: RecordId,
    pub status: RecordStatus,
    pub received_date: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl NewRecord {
    pub fn into_record(self, storage_key: StorageKey) -> QueueRecord {
        QueueRecord {
            storage_key,
            id: self.id,
            status: self.status,
            received_date: self.received_date,
            processed_date: None,
            available_at: Some(self.available_at),
            retry_count: None,
            failure_reason: None,
            data: self.data,
        }
    }
}
