//! Queue processing engine
//!
//! One engine instance wraps a record store and a validated configuration.
//! A driver (scheduler, cron, ...) calls `process_next_batch` and `cleanup`
//! on its own cadence; producers call `enqueue`. The engine holds no
//! in-memory state across calls: eligibility, retry counters, and
//! availability windows all live in the store, so two overlapping batch
//! calls may select the same record. Callers wanting single-runner
//! semantics serialize batch calls externally.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ConfigError, QueueConfig};
use crate::outcome::Outcome;
use crate::record::{NewRecord, QueueRecord, RecordStatus};
use crate::store::{RecordStore, RecordUpdate, StoreError};

pub struct QueueEngine {
    store: Arc<dyn RecordStore>,
    config: QueueConfig,
}

impl QueueEngine {
    /// Validates the configuration once; it is immutable afterwards.
    pub fn new(store: Arc<dyn RecordStore>, config: QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Insert a new record with status `received`, immediately available.
    /// Accepts any serializable payload, unvalidated. Returns the stored
    /// record, including its store-assigned identity.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<QueueRecord, StoreError> {
        let now = Utc::now();
        let stored = self
            .store
            .insert(NewRecord {
                id: Uuid::new_v4(),
                status: RecordStatus::Received,
                received_date: now,
                available_at: now,
                data: payload,
            })
            .await?;

        debug!(
            collection = %self.config.collection,
            record_id = %stored.id,
            "Enqueued record"
        );
        Ok(stored)
    }

    /// Select up to `batch_size` eligible records and resolve each one,
    /// strictly in selection order, waiting for every record's store write
    /// before starting the next.
    ///
    /// Processor and notification errors are absorbed into per-record
    /// outcomes; only a store failure propagates, aborting the remainder of
    /// the batch and leaving already-resolved records in their written
    /// states.
    pub async fn process_next_batch(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        // Resolved once per batch call, not per record.
        let condition = self.config.condition.as_ref().map(|factory| factory());

        let batch = self
            .store
            .find_eligible(now, self.config.batch_size, condition.as_ref())
            .await?;

        debug!(
            collection = %self.config.collection,
            selected = batch.len(),
            "Processing batch"
        );

        for record in batch {
            self.resolve_record(record).await?;
        }
        Ok(())
    }

    async fn resolve_record(&self, record: QueueRecord) -> Result<(), StoreError> {
        // A record that arrives already exhausted is never handed to the
        // processor again.
        if self.retries_exhausted(&record) {
            return self.notify_and_mark(record).await;
        }

        match self.config.processor.process(&record).await {
            Outcome::Success => {
                debug!(record_id = %record.id, "Record processed");
                self.store
                    .apply(
                        record.storage_key,
                        RecordUpdate {
                            status: Some(RecordStatus::Processed),
                            processed_date: Some(Utc::now()),
                            clear_available_at: true,
                            clear_retry_count: true,
                            clear_failure_reason: true,
                            ..Default::default()
                        },
                    )
                    .await
            }
            Outcome::Skip { delay_ms } => {
                // Not a failure: retry count and failure reason stay as-is.
                let now = Utc::now();
                debug!(record_id = %record.id, delay_ms, "Record skipped");
                self.store
                    .apply(
                        record.storage_key,
                        RecordUpdate {
                            status: Some(RecordStatus::Skipped),
                            processed_date: Some(now),
                            available_at: Some(now + Duration::milliseconds(delay_ms as i64)),
                            ..Default::default()
                        },
                    )
                    .await
            }
            Outcome::Fail { reason } => {
                // Record the signaled reason, then deliver the terminal
                // failure without touching the retry budget.
                debug!(record_id = %record.id, reason = %reason, "Record failed immediately");
                self.store
                    .apply(
                        record.storage_key,
                        RecordUpdate {
                            failure_reason: Some(reason.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;

                let mut record = record;
                record.failure_reason = Some(reason);
                self.notify_and_mark(record).await
            }
            Outcome::Retry(err) => {
                let attempts = record.retry_count.unwrap_or(0) + 1;
                let now = Utc::now();
                let delay = self.backoff(attempts);
                debug!(
                    record_id = %record.id,
                    retry_count = attempts,
                    delay_ms = delay.num_milliseconds(),
                    "Record failed, scheduling retry with backoff"
                );
                self.store
                    .apply(
                        record.storage_key,
                        RecordUpdate {
                            status: Some(RecordStatus::Failed),
                            processed_date: Some(now),
                            available_at: Some(now + delay),
                            failure_reason: Some(format!("{err:?}")),
                            bump_retry_count: true,
                            ..Default::default()
                        },
                    )
                    .await
            }
        }
    }

    /// Exhausted when the limit is non-negative and the completed failure
    /// count has reached it. A negative limit never triggers.
    fn retries_exhausted(&self, record: &QueueRecord) -> bool {
        self.config.retry_limit >= 0
            && record
                .retry_count
                .is_some_and(|count| count >= self.config.retry_limit as u32)
    }

    /// `attempts^coefficient * backoff_ms`, with `attempts` counted after
    /// the increment. The failure that brings the count up to the retry
    /// limit gets a forced zero delay: the record is immediately eligible,
    /// so the next batch call routes it to notification without waiting
    /// out a backoff window.
    fn backoff(&self, attempts: u32) -> Duration {
        if self.config.retry_limit >= 0 && attempts == self.config.retry_limit as u32 {
            return Duration::zero();
        }
        let millis = (attempts as f64).powf(self.config.backoff_coefficient)
            * self.config.backoff_ms as f64;
        Duration::milliseconds(millis as i64)
    }

    /// Terminal failure delivery: hand the full record (with any failure
    /// reason already set) to the caller's notification function, then mark
    /// it `notified` in one write. Retry count and failure reason are left
    /// as they are.
    async fn notify_and_mark(&self, record: QueueRecord) -> Result<(), StoreError> {
        if let Err(err) = self.config.processor.notify_failure(&record).await {
            warn!(
                record_id = %record.id,
                error = %err,
                "Failure notification returned an error"
            );
        }
        self.store
            .apply(
                record.storage_key,
                RecordUpdate {
                    status: Some(RecordStatus::Notified),
                    processed_date: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
    }

    /// Delete processed records older than the configured max age, in one
    /// store call. Returns the deleted count. Records in any other state
    /// are retained regardless of age.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::milliseconds(self.config.max_record_age_ms as i64);
        let deleted = self.store.delete_processed_before(cutoff).await?;
        if deleted > 0 {
            debug!(
                collection = %self.config.collection,
                deleted,
                "Removed expired processed records"
            );
        }
        Ok(deleted)
    }

    #[cfg(test)]
    fn backoff_ms_for(&self, attempts: u32) -> i64 {
        self.backoff(attempts).num_milliseconds()
    }
}
