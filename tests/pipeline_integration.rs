//! Ingestion pipeline integration tests
//!
//! End-to-end tests for buffering, flush triggers, retries, overflow,
//! shutdown draining, health evaluation and file persistence.

use a3s_audit::{
    AuditCategory, AuditError, AuditRecord, FileSink, HealthStatus, IngestionPipeline,
    IntegrityLedger, LedgerConfig, ManualClock, MemoryDlqHandler, MemorySink, PipelineConfig,
    PipelineEvent, RecordSink, Severity, SinkInfo,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn ledger() -> IntegrityLedger {
    IntegrityLedger::new(LedgerConfig::new("pipeline-secret")).unwrap()
}

fn record(action: &str) -> AuditRecord {
    AuditRecord::new(AuditCategory::Authentication, Severity::Info, "alice", action)
}

fn pipeline(config: PipelineConfig, sink: Arc<dyn RecordSink>) -> IngestionPipeline {
    IngestionPipeline::new(config, ledger(), sink).unwrap()
}

fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Sink whose writes take a fixed time
struct SlowSink {
    delay: Duration,
    inner: MemorySink,
}

impl SlowSink {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: MemorySink::new(),
        }
    }
}

#[async_trait]
impl RecordSink for SlowSink {
    async fn write(&self, record: &AuditRecord) -> a3s_audit::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(record).await
    }

    async fn info(&self) -> a3s_audit::Result<SinkInfo> {
        self.inner.info().await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

// ─── Ingestion & Flush Triggers ──────────────────────────────────

#[tokio::test]
async fn test_capacity_triggers_flush() {
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        buffer_capacity: 5,
        batch_size: 10,
        ..Default::default()
    };
    let p = pipeline(config, sink.clone());
    let mut rx = p.subscribe();

    for i in 0..7 {
        tokio_test::assert_ok!(p.ingest(record(&format!("login.{}", i))).await);
    }

    assert_eq!(sink.len().await, 5);
    assert_eq!(p.queue_size(), 2);

    let events = drain(&mut rx);
    assert_eq!(events.iter().filter(|e| e.name() == "ingested").count(), 7);
    assert_eq!(events.iter().filter(|e| e.name() == "flushed").count(), 1);
    assert!(events.iter().all(|e| e.name() != "overflow"));

    let m = p.metrics();
    assert_eq!(m.ingested, 7);
    assert_eq!(m.persisted, 5);
    assert_eq!(m.dropped, 0);
}

#[tokio::test]
async fn test_batch_rejected_as_a_whole() {
    let sink = Arc::new(MemorySink::new());
    let p = pipeline(PipelineConfig::default(), sink);

    let mut bad = record("bad");
    bad.timestamp = 0;
    let err = p
        .ingest_batch(vec![record("a"), bad, record("c")])
        .await
        .unwrap_err();

    match err {
        AuditError::Validation { fields } => assert_eq!(fields, vec!["records[1].timestamp"]),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(p.queue_size(), 0);
}

#[tokio::test]
async fn test_batch_ingest_emits_summary() {
    let sink = Arc::new(MemorySink::new());
    let p = pipeline(PipelineConfig::default(), sink);
    let mut rx = p.subscribe();

    let count = p
        .ingest_batch((0..4).map(|i| record(&format!("b{}", i))).collect())
        .await
        .unwrap();
    assert_eq!(count, 4);

    let events = drain(&mut rx);
    match events.last() {
        Some(PipelineEvent::BatchIngested {
            count, queue_size, ..
        }) => {
            assert_eq!(*count, 4);
            assert_eq!(*queue_size, 4);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timer_flush() {
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        flush_interval_ms: 1_000,
        ..Default::default()
    };
    let p = pipeline(config, sink.clone());
    p.start().await.unwrap();
    assert!(p.is_running());

    for i in 0..3 {
        p.ingest(record(&format!("t{}", i))).await.unwrap();
    }
    assert_eq!(sink.len().await, 0);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(sink.len().await, 3);
    assert_eq!(p.queue_size(), 0);

    p.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_flush_is_skipped() {
    let sink = Arc::new(SlowSink::new(Duration::from_secs(1)));
    let p = Arc::new(pipeline(PipelineConfig::default(), sink));
    p.ingest(record("slow")).await.unwrap();

    let background = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.flush().await })
    };
    tokio::task::yield_now().await;

    assert!(p.flush().await.is_none());

    let summary = background.await.unwrap().unwrap();
    assert_eq!(summary.processed, 1);
}

// ─── Retries & Failures ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_retry_then_give_up() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(usize::MAX);
    let config = PipelineConfig {
        max_retries: 3,
        retry_delay_ms: 100,
        ..Default::default()
    };
    let p = pipeline(config, sink.clone());
    let mut rx = p.subscribe();

    p.ingest(record("doomed")).await.unwrap();
    p.flush().await.unwrap();

    let mut retries = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("pipeline went quiet")
            .unwrap();
        match event {
            PipelineEvent::Retry { attempt, delay, .. } => retries.push((attempt, delay)),
            PipelineEvent::Failed {
                record, attempts, ..
            } => {
                assert_eq!(record.action, "doomed");
                assert_eq!(attempts, 4);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(
        retries,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
            (3, Duration::from_millis(400)),
        ]
    );

    // No further attempts once the record has failed
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.attempts(), 4);
    assert_eq!(p.queue_size(), 0);

    let m = p.metrics();
    assert_eq!(m.retries, 3);
    assert_eq!(m.failed, 1);
    assert_eq!(m.persisted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_and_keeps_chain() {
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        retry_delay_ms: 100,
        ..Default::default()
    };
    let p = pipeline(config, sink.clone());

    p.ingest(record("first")).await.unwrap();
    sink.fail_next(1);
    p.flush().await.unwrap();
    assert_eq!(p.queue_size(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(p.queue_size(), 0);

    p.ingest(record("second")).await.unwrap();
    p.flush().await.unwrap();

    let written = sink.records().await;
    assert_eq!(written.len(), 2);
    assert!(ledger().audit_sequence(&written).chain_breaks == 0);
}

#[tokio::test]
async fn test_permanent_failure_dead_lettered() {
    let sink = Arc::new(MemorySink::new());
    let dlq = Arc::new(MemoryDlqHandler::default());
    let config = PipelineConfig {
        max_retries: 0,
        ..Default::default()
    };
    let p = IngestionPipeline::builder(config, ledger(), sink.clone())
        .dlq(dlq.clone())
        .build()
        .unwrap();
    let mut rx = p.subscribe();

    sink.fail_next(1);
    p.ingest(record("lost")).await.unwrap();
    let summary = p.flush().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.requeued, 0);

    let parked = dlq.records().await;
    assert_eq!(parked.len(), 1);
    let dead = &parked[0];
    assert_eq!(dead.record.action, "lost");
    assert_eq!(dead.attempts, 1);
    assert!(dead.record.integrity.is_some());

    let failed = drain(&mut rx)
        .into_iter()
        .find(|e| e.name() == "failed")
        .unwrap();
    if let PipelineEvent::Failed { error, .. } = failed {
        assert!(error.contains("injected failure"));
    }
}

#[tokio::test]
async fn test_replayed_dead_letters_rejoin_the_chain() {
    let sink = Arc::new(MemorySink::new());
    let dlq = Arc::new(MemoryDlqHandler::default());
    let config = PipelineConfig {
        max_retries: 0,
        ..Default::default()
    };
    let p = IngestionPipeline::builder(config, ledger(), sink.clone())
        .dlq(dlq.clone())
        .build()
        .unwrap();

    sink.fail_next(1);
    p.ingest(record("outage")).await.unwrap();
    p.flush().await.unwrap();
    assert_eq!(dlq.len().await, 1);

    p.ingest(record("recovered")).await.unwrap();
    p.flush().await.unwrap();
    assert_eq!(sink.len().await, 1);

    assert_eq!(p.replay_dead_letters().await.unwrap(), 1);
    assert!(dlq.is_empty().await);
    assert_eq!(p.queue_size(), 1);

    let summary = p.flush().await.unwrap();
    assert_eq!(summary.processed, 1);

    let written = sink.records().await;
    let actions: Vec<_> = written.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["recovered", "outage"]);
    assert!(ledger().audit_sequence(&written).is_intact());

    // Nothing left to replay
    assert_eq!(p.replay_dead_letters().await.unwrap(), 0);
}

#[tokio::test]
async fn test_replay_without_dlq_is_noop() {
    let p = pipeline(PipelineConfig::default(), Arc::new(MemorySink::new()));
    assert_eq!(p.replay_dead_letters().await.unwrap(), 0);

    p.stop().await;
    let err = tokio_test::assert_err!(p.replay_dead_letters().await);
    assert!(matches!(err, AuditError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_counts_as_failure() {
    let sink = Arc::new(SlowSink::new(Duration::from_secs(10)));
    let config = PipelineConfig {
        max_retries: 0,
        write_timeout_ms: Some(50),
        ..Default::default()
    };
    let p = pipeline(config, sink);
    let mut rx = p.subscribe();

    p.ingest(record("stuck")).await.unwrap();
    let summary = p.flush().await.unwrap();
    assert_eq!(summary.failed, 1);

    let error = drain(&mut rx).into_iter().find_map(|e| match e {
        PipelineEvent::Failed { error, .. } => Some(error),
        _ => None,
    });
    assert!(error.unwrap().contains("exceeded 50ms"));
}

// ─── Overflow ────────────────────────────────────────────────────

#[tokio::test]
async fn test_overflow_drops_oldest() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(usize::MAX);
    let config = PipelineConfig {
        buffer_capacity: 10,
        batch_size: 10,
        max_retries: 100,
        retry_delay_ms: 60_000,
        ..Default::default()
    };
    let p = pipeline(config, sink);
    let mut rx = p.subscribe();

    for i in 0..20 {
        p.ingest(record(&format!("r{}", i))).await.unwrap();
    }

    // Bounded at 110% of capacity
    assert_eq!(p.queue_size(), 11);
    assert_eq!(p.metrics().dropped, 9);

    let overflows: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::Overflow { dropped, .. } => Some(dropped),
            _ => None,
        })
        .collect();
    assert_eq!(overflows, vec![1; 9]);

    let actions: Vec<_> = p.buffered().into_iter().map(|b| b.record.action).collect();
    let expected: Vec<_> = (9..20).map(|i| format!("r{}", i)).collect();
    assert_eq!(actions, expected);
}

// ─── Shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_drains_buffer() {
    let sink = Arc::new(MemorySink::new());
    let p = pipeline(PipelineConfig::default(), sink.clone());
    p.start().await.unwrap();
    let mut rx = p.subscribe();

    for i in 0..250 {
        p.ingest(record(&format!("s{}", i))).await.unwrap();
    }

    let summary = p.stop().await;
    assert_eq!(summary.processed, 250);
    assert_eq!(summary.remaining, 0);
    assert!(!p.is_running());
    assert_eq!(sink.len().await, 250);

    let events = drain(&mut rx);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Stopped { remaining: 0 })
    ));

    // Second stop is a no-op
    assert_eq!(p.stop().await.processed, 0);
    let err = tokio_test::assert_err!(p.ingest(record("late")).await);
    assert!(matches!(err, AuditError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_background_flush_keeps_everything() {
    let sink = Arc::new(SlowSink::new(Duration::from_secs(1)));
    let config = PipelineConfig {
        batch_size: 2,
        ..Default::default()
    };
    let p = Arc::new(pipeline(config, sink.clone()));

    for i in 0..5 {
        p.ingest(record(&format!("d{}", i))).await.unwrap();
    }

    let background = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.flush().await })
    };
    tokio::task::yield_now().await;

    // Waits for the in-flight batch, then drains the rest
    let summary = p.stop().await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.remaining, 0);

    let first = background.await.unwrap().unwrap();
    assert_eq!(first.processed, 2);

    let written = sink.inner.records().await;
    assert_eq!(written.len(), 5);
    let actions: Vec<_> = written.iter().map(|r| r.action.clone()).collect();
    let expected: Vec<_> = (0..5).map(|i| format!("d{}", i)).collect();
    assert_eq!(actions, expected);
    assert!(ledger().audit_sequence(&written).is_intact());
}

#[tokio::test]
async fn test_stop_reports_undeliverable_records() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(usize::MAX);
    let p = pipeline(PipelineConfig::default(), sink);

    p.ingest(record("a")).await.unwrap();
    p.ingest(record("b")).await.unwrap();

    let summary = p.stop().await;
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.remaining, 2);
}

// ─── Health ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_tracks_queue_and_flush() {
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        buffer_capacity: 10,
        ..Default::default()
    };
    let p = pipeline(config, sink);

    let report = p.get_health_status();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.checks.len(), 4);

    for i in 0..9 {
        p.ingest(record(&format!("h{}", i))).await.unwrap();
    }
    let report = p.get_health_status();
    assert_eq!(report.status, HealthStatus::Critical);
    assert_eq!(report.failing_checks(), vec!["queue", "flush"]);

    p.flush().await.unwrap();
    let report = p.get_health_status();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.last_flush_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_idle_period_does_not_mark_flush_stale() {
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(ManualClock::default());
    let config = PipelineConfig {
        flush_interval_ms: 1_000,
        ..Default::default()
    };
    let p = IngestionPipeline::builder(config, ledger(), sink.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    p.start().await.unwrap();

    p.ingest(record("busy")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(sink.len().await, 1);

    // A quiet minute: the timer keeps firing on an empty queue
    for _ in 0..60 {
        clock.advance(chrono::Duration::seconds(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    p.ingest(record("after.quiet")).await.unwrap();
    let report = p.get_health_status();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.failing_checks().is_empty());

    p.stop().await;
    assert_eq!(sink.len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_health_events() {
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        health_check_interval_ms: 500,
        ..Default::default()
    };
    let p = pipeline(config, sink);
    let mut rx = p.subscribe();
    p.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let checks = drain(&mut rx)
        .into_iter()
        .filter(|e| e.name() == "healthCheck")
        .count();
    assert_eq!(checks, 2);

    p.stop().await;
}

// ─── File Persistence ────────────────────────────────────────────

#[tokio::test]
async fn test_file_sink_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit").join("records.jsonl");
    let ledger = ledger();

    let p = IngestionPipeline::new(
        PipelineConfig::default(),
        IntegrityLedger::new(LedgerConfig::new("pipeline-secret")).unwrap(),
        Arc::new(FileSink::new(&path)),
    )
    .unwrap();
    p.start().await.unwrap();

    for i in 0..10 {
        p.ingest(record(&format!("f{}", i)).with_metadata("seq", i.to_string()))
            .await
            .unwrap();
    }
    p.stop().await;

    let persisted = FileSink::read_all(&path).unwrap();
    assert_eq!(persisted.len(), 10);
    assert_eq!(persisted[0].action, "f0");
    assert!(persisted[0].integrity.as_ref().unwrap().previous_hash.is_none());

    let audit = ledger.audit_sequence(&persisted);
    assert!(audit.is_intact());
    assert_eq!(audit.valid_entries, 10);

    assert_eq!(
        p.chain_head().as_deref(),
        Some(persisted[9].integrity.as_ref().unwrap().hash.as_str())
    );
}
