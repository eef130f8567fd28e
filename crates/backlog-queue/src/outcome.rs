//! Processing outcome signals and the caller-supplied processor seam

use crate::record::QueueRecord;

/// Outcome of one processing attempt.
///
/// Constructed explicitly by the processor; the engine pattern-matches on the
/// variant, never on the structure of an error value.
#[derive(Debug)]
pub enum Outcome {
    /// Record handled; it will not be selected again.
    Success,
    /// Defer the record without consuming retry budget. It becomes eligible
    /// again after `delay_ms`.
    Skip { delay_ms: u64 },
    /// Terminal failure: route straight to notification, bypassing the retry
    /// budget entirely.
    Fail { reason: String },
    /// Retryable failure: consumes one unit of retry budget and backs off.
    Retry(anyhow::Error),
}

impl Outcome {
    /// Defer with no delay (eligible again on the next batch call).
    pub fn skip() -> Self {
        Self::Skip { delay_ms: 0 }
    }

    pub fn skip_for_ms(delay_ms: u64) -> Self {
        Self::Skip { delay_ms }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self::Retry(err.into())
    }
}

impl From<anyhow::Error> for Outcome {
    fn from(err: anyhow::Error) -> Self {
        Self::Retry(err)
    }
}

/// Caller-supplied processing logic.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    /// Handle one eligible record. Runs at most once per batch selection of
    /// the record; any outcome other than [`Outcome::Success`] leaves the
    /// record for a later batch or for notification.
    async fn process(&self, record: &QueueRecord) -> Outcome;

    /// Called exactly once for a record that will never be processed again,
    /// either because its retry budget is exhausted or because processing
    /// signaled an immediate failure. Errors are logged and absorbed.
    async fn notify_failure(&self, record: &QueueRecord) -> anyhow::Result<()>;
}
