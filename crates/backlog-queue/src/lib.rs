//! # Backlog Queue
//!
//! Durable, at-least-once work queue engine over a persistent document store.
//!
//! Features:
//! - Record lifecycle state machine (received / processed / failed / skipped / notified)
//! - Bounded batch retrieval with strictly sequential per-record dispatch
//! - Retry with exponential backoff and terminal-failure notification
//! - Pluggable record store (in-memory here, SQLite in `backlog-persist`)

pub mod config;
pub mod engine;
pub mod memory;
pub mod outcome;
pub mod record;
pub mod store;

pub use config::{ConditionFactory, ConfigError, QueueConfig};
pub use engine::QueueEngine;
pub use memory::MemoryStore;
pub use outcome::{Outcome, Processor};
pub use record::{NewRecord, QueueRecord, RecordId, RecordStatus, StorageKey};
pub use store::{Condition, RecordStore, RecordUpdate, StoreError};
