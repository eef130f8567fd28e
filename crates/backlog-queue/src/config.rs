//! Engine configuration

use std::sync::Arc;

use crate::outcome::Processor;
use crate::store::Condition;

/// Factory invoked once per `process_next_batch` call to produce the extra
/// selection predicate for that batch.
pub type ConditionFactory = Arc<dyn Fn() -> Condition + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Collection name must not be empty")]
    EmptyCollection,

    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("Backoff coefficient must be finite and non-negative, got {0}")]
    InvalidBackoffCoefficient(f64),
}

/// Immutable option set consumed at engine construction.
#[derive(Clone)]
pub struct QueueConfig {
    /// Target collection identifier; the store adapter is opened with the
    /// same name, the engine uses it as a logging field.
    pub collection: String,
    /// Max records selected per `process_next_batch` call
    pub batch_size: u32,
    /// Max retryable attempts before notification; negative = unlimited
    pub retry_limit: i32,
    /// Age threshold for `cleanup` deletion of processed records
    pub max_record_age_ms: u64,
    /// Caller-supplied processing and failure-notification logic
    pub processor: Arc<dyn Processor>,
    /// Base unit multiplied into the backoff formula; 0 = immediate reprocessing
    pub backoff_ms: u64,
    /// Exponent in the backoff formula
    pub backoff_coefficient: f64,
    /// Optional extra per-batch-call selection filter
    pub condition: Option<ConditionFactory>,
}

impl QueueConfig {
    /// Required options, with defaulted backoff knobs and no extra condition.
    pub fn new(
        collection: impl Into<String>,
        batch_size: u32,
        retry_limit: i32,
        max_record_age_ms: u64,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            collection: collection.into(),
            batch_size,
            retry_limit,
            max_record_age_ms,
            processor,
            backoff_ms: 0,
            backoff_coefficient: 1.5,
            condition: None,
        }
    }

    pub fn with_backoff(mut self, backoff_ms: u64, backoff_coefficient: f64) -> Self {
        self.backoff_ms = backoff_ms;
        self.backoff_coefficient = backoff_coefficient;
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_condition(mut self, factory: ConditionFactory) -> Self {
        self.condition = Some(factory);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_empty() {
            return Err(ConfigError::EmptyCollection);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 0.0 {
            return Err(ConfigError::InvalidBackoffCoefficient(
                self.backoff_coefficient,
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("collection", &self.collection)
            .field("batch_size", &self.batch_size)
            .field("retry_limit", &self.retry_limit)
            .field("max_record_age_ms", &self.max_record_age_ms)
            .field("backoff_ms", &self.backoff_ms)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("condition", &self.condition.is_some())
            .finish_non_exhaustive()
    }
}
