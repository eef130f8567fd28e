//! End-to-end engine tests over the in-memory store

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use backlog_queue::{
    MemoryStore, Outcome, Processor, QueueConfig, QueueEngine, QueueRecord, RecordStatus,
};

/// Replays a scripted sequence of outcomes, one per processing invocation,
/// defaulting to success once the script runs out. Records every processed
/// id and every notified record.
struct ScriptedProcessor {
    outcomes: Mutex<VecDeque<Outcome>>,
    calls: AtomicU32,
    processed_ids: Mutex<Vec<uuid::Uuid>>,
    notified: Mutex<Vec<QueueRecord>>,
    notify_error: bool,
}

impl ScriptedProcessor {
    fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicU32::new(0),
            processed_ids: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
            notify_error: false,
        })
    }

    fn with_failing_notify(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicU32::new(0),
            processed_ids: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
            notify_error: true,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn notified(&self) -> Vec<QueueRecord> {
        self.notified.lock().unwrap().clone()
    }

    fn processed_ids(&self) -> Vec<uuid::Uuid> {
        self.processed_ids.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, record: &QueueRecord) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.processed_ids.lock().unwrap().push(record.id);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Success)
    }

    async fn notify_failure(&self, record: &QueueRecord) -> anyhow::Result<()> {
        self.notified.lock().unwrap().push(record.clone());
        if self.notify_error {
            anyhow::bail!("notification channel down");
        }
        Ok(())
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    engine: QueueEngine,
    processor: Arc<ScriptedProcessor>,
}

fn fixture(processor: Arc<ScriptedProcessor>, config: QueueConfig) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new(config.collection.clone()));
    let engine = QueueEngine::new(store.clone(), config).unwrap();
    Fixture {
        store,
        engine,
        processor,
    }
}

fn config(processor: Arc<ScriptedProcessor>, retry_limit: i32) -> QueueConfig {
    QueueConfig::new("outbox", 10, retry_limit, 60_000, processor)
}

async fn stored(fx: &Fixture, record: &QueueRecord) -> QueueRecord {
    use backlog_queue::RecordStore;
    fx.store.fetch(record.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn enqueue_yields_received_record_with_payload() {
    let processor = ScriptedProcessor::new(vec![]);
    let fx = fixture(processor.clone(), config(processor, 3));

    let payload = json!({"order": 42, "items": ["a", "b"]});
    let record = fx.engine.enqueue(payload.clone()).await.unwrap();

    assert_eq!(record.status, RecordStatus::Received);
    assert_eq!(record.data, payload);
    assert!(!record.id.is_nil());
    assert!(record.available_at.is_some());
    assert!(record.retry_count.is_none());
    assert!(record.processed_date.is_none());
}

#[tokio::test]
async fn processed_record_is_never_reprocessed() {
    let processor = ScriptedProcessor::new(vec![]);
    let fx = fixture(processor.clone(), config(processor.clone(), 3));

    let record = fx.engine.enqueue(json!({})).await.unwrap();
    fx.engine.process_next_batch().await.unwrap();
    fx.engine.process_next_batch().await.unwrap();

    assert_eq!(processor.calls(), 1);
    let record = stored(&fx, &record).await;
    assert_eq!(record.status, RecordStatus::Processed);
    assert!(record.processed_date.is_some());
    assert!(record.available_at.is_none());
}

#[tokio::test]
async fn batch_size_one_processes_in_selection_order() {
    let processor = ScriptedProcessor::new(vec![]);
    let mut cfg = config(processor.clone(), 3);
    cfg.batch_size = 1;
    let fx = fixture(processor.clone(), cfg);

    let first = fx.engine.enqueue(json!({"n": 1})).await.unwrap();
    let second = fx.engine.enqueue(json!({"n": 2})).await.unwrap();

    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 1);
    assert_eq!(processor.processed_ids(), vec![first.id]);

    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 2);
    assert_eq!(processor.processed_ids(), vec![first.id, second.id]);
}

#[tokio::test]
async fn retry_limit_one_fails_then_notifies_without_reprocessing() {
    let processor = ScriptedProcessor::new(vec![Outcome::retry(anyhow::anyhow!("boom"))]);
    let fx = fixture(processor.clone(), config(processor.clone(), 1));

    let record = fx.engine.enqueue(json!({})).await.unwrap();

    fx.engine.process_next_batch().await.unwrap();
    let failed = stored(&fx, &record).await;
    assert_eq!(failed.status, RecordStatus::Failed);
    assert_eq!(failed.retry_count, Some(1));
    assert!(failed.failure_reason.as_deref().unwrap().contains("boom"));

    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 1, "exhausted record must not be reprocessed");

    let notified = stored(&fx, &record).await;
    assert_eq!(notified.status, RecordStatus::Notified);
    // Retry bookkeeping survives notification
    assert_eq!(notified.retry_count, Some(1));
    assert!(notified.failure_reason.is_some());
    assert_eq!(processor.notified().len(), 1);
}

#[tokio::test]
async fn fails_once_then_succeeds_clears_retry_state() {
    let processor = ScriptedProcessor::new(vec![Outcome::retry(anyhow::anyhow!("transient"))]);
    let fx = fixture(processor.clone(), config(processor.clone(), 2));

    let record = fx.engine.enqueue(json!({})).await.unwrap();

    fx.engine.process_next_batch().await.unwrap();
    let failed = stored(&fx, &record).await;
    assert_eq!(failed.status, RecordStatus::Failed);
    assert_eq!(failed.retry_count, Some(1));

    fx.engine.process_next_batch().await.unwrap();
    let done = stored(&fx, &record).await;
    assert_eq!(done.status, RecordStatus::Processed);
    assert_eq!(done.retry_count, None);
    assert_eq!(done.failure_reason, None);
    assert!(processor.notified().is_empty());
}

#[tokio::test]
async fn backoff_window_excludes_record_until_elapsed() {
    let processor = ScriptedProcessor::new(vec![Outcome::retry(anyhow::anyhow!("flaky"))]);
    // retry_limit high enough that the first failure is not the forced-zero
    // final attempt: delay = 1^1.5 * 50ms = 50ms
    let cfg = config(processor.clone(), 3).with_backoff_ms(50);
    let fx = fixture(processor.clone(), cfg);

    let record = fx.engine.enqueue(json!({})).await.unwrap();
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 1);

    // Still inside the backoff window
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 1);
    assert_eq!(stored(&fx, &record).await.status, RecordStatus::Failed);

    tokio::time::sleep(Duration::from_millis(70)).await;
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 2);
    assert_eq!(stored(&fx, &record).await.status, RecordStatus::Processed);
}

#[tokio::test]
async fn exhausting_failure_is_immediately_eligible_for_notification() {
    let processor = ScriptedProcessor::new(vec![Outcome::retry(anyhow::anyhow!("fatal-ish"))]);
    // Large base backoff: only the forced-zero tie-break can make the record
    // eligible again without waiting
    let cfg = config(processor.clone(), 1).with_backoff_ms(60_000);
    let fx = fixture(processor.clone(), cfg);

    let record = fx.engine.enqueue(json!({})).await.unwrap();
    fx.engine.process_next_batch().await.unwrap();
    fx.engine.process_next_batch().await.unwrap();

    assert_eq!(processor.calls(), 1);
    assert_eq!(stored(&fx, &record).await.status, RecordStatus::Notified);
}

#[tokio::test]
async fn cleanup_deletes_only_old_processed_records() {
    let processor = ScriptedProcessor::new(vec![]);
    let mut cfg = config(processor.clone(), 3);
    cfg.max_record_age_ms = 100;
    let fx = fixture(processor.clone(), cfg);

    let processed = fx.engine.enqueue(json!({"kind": "done"})).await.unwrap();
    fx.engine.process_next_batch().await.unwrap();
    let pending = fx.engine.enqueue(json!({"kind": "waiting"})).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let deleted = fx.engine.cleanup().await.unwrap();

    assert_eq!(deleted, 1);
    assert!(stored_maybe(&fx, &processed).await.is_none());
    // Still received, retained regardless of age
    assert_eq!(
        stored_maybe(&fx, &pending).await.unwrap().status,
        RecordStatus::Received
    );
}

async fn stored_maybe(fx: &Fixture, record: &QueueRecord) -> Option<QueueRecord> {
    use backlog_queue::RecordStore;
    fx.store.fetch(record.id).await.unwrap()
}

#[tokio::test]
async fn immediate_fail_notifies_after_a_single_attempt() {
    let processor = ScriptedProcessor::new(vec![Outcome::fail("no handler for payload")]);
    let fx = fixture(processor.clone(), config(processor.clone(), 5));

    let record = fx.engine.enqueue(json!({})).await.unwrap();
    fx.engine.process_next_batch().await.unwrap();

    assert_eq!(processor.calls(), 1);
    let record = stored(&fx, &record).await;
    assert_eq!(record.status, RecordStatus::Notified);
    assert_eq!(record.failure_reason.as_deref(), Some("no handler for payload"));
    assert_eq!(record.retry_count, None, "immediate failure must not consume retry budget");

    let notified = processor.notified();
    assert_eq!(notified.len(), 1);
    assert_eq!(
        notified[0].failure_reason.as_deref(),
        Some("no handler for payload"),
        "notification must see the signaled reason"
    );

    // Terminal: nothing further happens
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 1);
    assert_eq!(processor.notified().len(), 1);
}

#[tokio::test]
async fn skip_defers_without_consuming_retry_budget() {
    let processor = ScriptedProcessor::new(vec![
        Outcome::retry(anyhow::anyhow!("warm-up failure")),
        Outcome::skip_for_ms(80),
    ]);
    let fx = fixture(processor.clone(), config(processor.clone(), 5));

    let record = fx.engine.enqueue(json!({})).await.unwrap();

    // First attempt fails (immediate retry, backoff base is 0)
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(stored(&fx, &record).await.retry_count, Some(1));

    // Second attempt skips for 80ms
    fx.engine.process_next_batch().await.unwrap();
    let skipped = stored(&fx, &record).await;
    assert_eq!(skipped.status, RecordStatus::Skipped);
    assert_eq!(skipped.retry_count, Some(1), "skip is not a failure");
    assert!(skipped.processed_date.is_some());

    // Excluded from selection until the delay elapses
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 3);
    let done = stored(&fx, &record).await;
    assert_eq!(done.status, RecordStatus::Processed);
    assert_eq!(done.retry_count, None);
}

#[tokio::test]
async fn condition_narrows_selection_and_resolves_once_per_batch() {
    let processor = ScriptedProcessor::new(vec![]);
    let factory_calls = Arc::new(AtomicU32::new(0));
    let counter = factory_calls.clone();

    let cfg = config(processor.clone(), 3).with_condition(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(|record: &QueueRecord| record.data["kind"] == "a")
    }));
    let fx = fixture(processor.clone(), cfg);

    let wanted = fx.engine.enqueue(json!({"kind": "a"})).await.unwrap();
    let excluded = fx.engine.enqueue(json!({"kind": "b"})).await.unwrap();

    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    assert_eq!(processor.processed_ids(), vec![wanted.id]);
    assert_eq!(stored(&fx, &excluded).await.status, RecordStatus::Received);

    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(factory_calls.load(Ordering::SeqCst), 2);
    assert_eq!(processor.calls(), 1, "non-matching record stays unselected");
}

#[tokio::test]
async fn notification_errors_are_absorbed() {
    let processor = ScriptedProcessor::with_failing_notify(vec![Outcome::fail("poison pill")]);
    let fx = fixture(processor.clone(), config(processor.clone(), 3));

    let record = fx.engine.enqueue(json!({})).await.unwrap();
    fx.engine.process_next_batch().await.unwrap();

    assert_eq!(processor.notified().len(), 1);
    assert_eq!(stored(&fx, &record).await.status, RecordStatus::Notified);
}

#[tokio::test]
async fn one_records_failure_does_not_abort_the_batch() {
    let processor = ScriptedProcessor::new(vec![
        Outcome::retry(anyhow::anyhow!("first record fails")),
        Outcome::Success,
    ]);
    let fx = fixture(processor.clone(), config(processor.clone(), 3));

    let failing = fx.engine.enqueue(json!({"n": 1})).await.unwrap();
    let fine = fx.engine.enqueue(json!({"n": 2})).await.unwrap();

    fx.engine.process_next_batch().await.unwrap();
    assert_eq!(processor.calls(), 2);
    assert_eq!(stored(&fx, &failing).await.status, RecordStatus::Failed);
    assert_eq!(stored(&fx, &fine).await.status, RecordStatus::Processed);
}

#[tokio::test]
async fn unlimited_retries_never_notify() {
    let processor = ScriptedProcessor::new(vec![
        Outcome::retry(anyhow::anyhow!("1")),
        Outcome::retry(anyhow::anyhow!("2")),
        Outcome::retry(anyhow::anyhow!("3")),
    ]);
    let fx = fixture(processor.clone(), config(processor.clone(), -1));

    let record = fx.engine.enqueue(json!({})).await.unwrap();
    for _ in 0..4 {
        fx.engine.process_next_batch().await.unwrap();
    }

    assert_eq!(processor.calls(), 4);
    assert!(processor.notified().is_empty());
    let record = stored(&fx, &record).await;
    assert_eq!(record.status, RecordStatus::Processed);
    assert_eq!(record.retry_count, None);
}
