//! Buffered ingestion pipeline
//!
//! Records are validated, buffered in an ordered queue and flushed in
//! batches: each record is stamped by the [`IntegrityLedger`], linked to
//! the previously persisted record, and written to a [`RecordSink`].
//!
//! Flushes are single-flight. The periodic timer, the capacity trigger and
//! deferred retries all go through one async guard, so two flushes never
//! overlap. Failed writes are requeued at the head of the queue with
//! exponential backoff until `max_retries` is exhausted, after which the
//! record is reported as failed (and dead-lettered when a DLQ is set).
//!
//! The only lossy path is overflow protection: when the queue grows past
//! 110% of capacity the oldest ~10% of entries are dropped and an
//! `overflow` event is emitted.

pub mod events;
pub mod health;

pub use events::{FlushSummary, PipelineEvent};
pub use health::{HealthCheck, HealthReport, HealthStatus};

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::dlq::{should_dead_letter, DeadLetterRecord, DlqHandler};
use crate::error::{AuditError, Result};
use crate::ledger::IntegrityLedger;
use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use crate::sink::RecordSink;
use crate::types::AuditRecord;
use health::HealthInputs;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A record waiting in the buffer
#[derive(Debug, Clone)]
pub struct BufferedRecord {
    pub record: AuditRecord,
    /// Unix ms when the record was accepted
    pub enqueued_at: u64,
    /// Failed delivery attempts so far
    pub retry_count: u32,
    pub original_size_bytes: usize,
    seq: u64,
    retry_at: Option<Instant>,
}

impl BufferedRecord {
    fn new(record: AuditRecord, enqueued_at: u64, seq: u64) -> Self {
        let original_size_bytes = record.size_bytes();
        Self {
            record,
            enqueued_at,
            retry_count: 0,
            original_size_bytes,
            seq,
            retry_at: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Up to `batch_size` records whose backoff has elapsed
    Batch,
    /// Every queued record, backoff ignored (shutdown)
    Drain,
}

enum DeliveryFailure {
    Stamp(AuditError),
    Write(AuditError),
}

/// Builder for [`IngestionPipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    ledger: IntegrityLedger,
    sink: Arc<dyn RecordSink>,
    dlq: Option<Arc<dyn DlqHandler>>,
    clock: Arc<dyn Clock>,
}

impl PipelineBuilder {
    /// Route permanently failed records to a dead letter queue
    pub fn dlq(mut self, handler: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(handler);
        self
    }

    /// Use an explicit clock for timestamps and health evaluation
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and build the pipeline
    pub fn build(self) -> Result<IngestionPipeline> {
        self.config.validate().into_result("pipeline")?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(IngestionPipeline {
            inner: Arc::new(Inner {
                config: self.config,
                ledger: self.ledger,
                sink: self.sink,
                dlq: self.dlq,
                clock: self.clock,
                queue: Mutex::new(VecDeque::new()),
                next_seq: AtomicU64::new(0),
                flush_guard: tokio::sync::Mutex::new(()),
                chain_head: Mutex::new(None),
                metrics: PipelineMetrics::default(),
                events,
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Buffered, retrying ingestion of audit records into a durable sink
pub struct IngestionPipeline {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl IngestionPipeline {
    /// Build a pipeline with the system clock and no DLQ
    pub fn new(
        config: PipelineConfig,
        ledger: IntegrityLedger,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        Self::builder(config, ledger, sink).build()
    }

    /// Start configuring a pipeline
    pub fn builder(
        config: PipelineConfig,
        ledger: IntegrityLedger,
        sink: Arc<dyn RecordSink>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config,
            ledger,
            sink,
            dlq: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and buffer one record
    ///
    /// Flushes immediately when the queue reaches capacity. Delivery
    /// failures are never returned here; they surface as events.
    pub async fn ingest(&self, record: AuditRecord) -> Result<()> {
        self.ensure_open()?;

        if let Err(e) = record.validate() {
            self.inner.metrics.record_validation_error();
            tracing::debug!(record_id = %record.id, error = %e, "Record rejected");
            return Err(e);
        }

        let queue_size = self.inner.enqueue(record)?;
        if queue_size >= self.inner.config.buffer_capacity {
            self.inner.try_flush().await;
        }
        Ok(())
    }

    /// Validate and buffer a batch of records
    ///
    /// All records are validated first; one invalid record rejects the
    /// whole batch and nothing is buffered.
    pub async fn ingest_batch(&self, records: Vec<AuditRecord>) -> Result<usize> {
        self.ensure_open()?;
        let started = Instant::now();

        let mut invalid = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if let Err(AuditError::Validation { fields }) = record.validate() {
                invalid.extend(fields.into_iter().map(|f| format!("records[{}].{}", index, f)));
            }
        }
        if !invalid.is_empty() {
            self.inner.metrics.record_validation_error();
            tracing::debug!(count = records.len(), "Batch rejected");
            return Err(AuditError::Validation { fields: invalid });
        }

        let count = records.len();
        for record in records {
            let queue_size = self.inner.enqueue(record)?;
            if queue_size >= self.inner.config.buffer_capacity {
                self.inner.try_flush().await;
            }
        }

        self.inner.emit(PipelineEvent::BatchIngested {
            count,
            latency: started.elapsed(),
            queue_size: self.queue_size(),
        });
        Ok(count)
    }

    /// Flush one batch now
    ///
    /// Returns `None` without waiting when another flush is in flight.
    pub async fn flush(&self) -> Option<FlushSummary> {
        self.inner.try_flush().await
    }

    /// Move every dead-lettered record back into the buffer
    ///
    /// Records are requeued with a fresh retry budget and re-stamped onto
    /// the current chain head when flushed. Returns the number requeued;
    /// without a DLQ this is always zero.
    pub async fn replay_dead_letters(&self) -> Result<usize> {
        self.ensure_open()?;
        let Some(dlq) = &self.inner.dlq else {
            return Ok(0);
        };

        let dead = dlq.drain().await?;
        let total = dead.len();
        let mut pending = dead.into_iter();
        while let Some(entry) = pending.next() {
            match self.inner.enqueue(entry.record.clone()) {
                Ok(queue_size) => {
                    if queue_size >= self.inner.config.buffer_capacity {
                        self.inner.try_flush().await;
                    }
                }
                Err(e) => {
                    // Stopped mid-replay: park the rest again
                    for rest in std::iter::once(entry).chain(pending) {
                        if let Err(err) = dlq.handle(rest).await {
                            tracing::error!(error = %err, "Failed to re-park dead-lettered record");
                        }
                    }
                    return Err(e);
                }
            }
        }

        if total > 0 {
            tracing::info!(count = total, "Dead-lettered records requeued");
        }
        Ok(total)
    }

    /// Start the periodic flush and health-check timers
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AuditError::ShutDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flush_task = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.flush_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            inner.try_flush().await;
                        }
                    }
                }
            })
        };

        let health_task = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.health_check_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let report = inner.health_report();
                            if report.status != HealthStatus::Healthy {
                                tracing::warn!(
                                    status = ?report.status,
                                    failing = ?report.failing_checks(),
                                    "Ingestion pipeline degraded"
                                );
                            }
                            inner.emit(PipelineEvent::HealthCheck(report));
                        }
                    }
                }
            })
        };

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([flush_task, health_task]);

        tracing::info!(
            sink = %self.inner.sink.name(),
            capacity = self.inner.config.buffer_capacity,
            batch_size = self.inner.config.batch_size,
            flush_interval_ms = self.inner.config.flush_interval_ms,
            "Ingestion pipeline started"
        );
        self.inner.emit(PipelineEvent::Started);
        Ok(())
    }

    /// Cancel timers and drain the queue with one final flush
    ///
    /// An in-flight flush is allowed to finish first. Every queued record
    /// gets one delivery attempt; records that still fail stay queued and
    /// are reported in the `stopped` event.
    pub async fn stop(&self) -> FlushSummary {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return FlushSummary {
                remaining: self.queue_size(),
                ..Default::default()
            };
        }

        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Pipeline task ended abnormally");
            }
        }

        let summary = {
            let _guard = self.inner.flush_guard.lock().await;
            self.inner.flush_locked(FlushMode::Drain).await
        };
        self.running.store(false, Ordering::SeqCst);

        if summary.remaining > 0 {
            tracing::warn!(
                remaining = summary.remaining,
                "Records still undelivered at shutdown"
            );
        }
        tracing::info!(
            processed = summary.processed,
            remaining = summary.remaining,
            "Ingestion pipeline stopped"
        );
        self.inner.emit(PipelineEvent::Stopped {
            remaining: summary.remaining,
        });
        summary
    }

    /// Evaluate the four health checks now
    pub fn get_health_status(&self) -> HealthReport {
        self.inner.health_report()
    }

    /// Point-in-time pipeline counters
    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Records currently buffered
    pub fn queue_size(&self) -> usize {
        self.inner.queue().len()
    }

    /// Copy of the buffered records, head first
    pub fn buffered(&self) -> Vec<BufferedRecord> {
        self.inner.queue().iter().cloned().collect()
    }

    /// Hash of the last persisted record
    pub fn chain_head(&self) -> Option<String> {
        self.inner.chain_head().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(AuditError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

struct Inner {
    config: PipelineConfig,
    ledger: IntegrityLedger,
    sink: Arc<dyn RecordSink>,
    dlq: Option<Arc<dyn DlqHandler>>,
    clock: Arc<dyn Clock>,
    queue: Mutex<VecDeque<BufferedRecord>>,
    next_seq: AtomicU64,
    flush_guard: tokio::sync::Mutex<()>,
    chain_head: Mutex<Option<String>>,
    metrics: PipelineMetrics,
    events: broadcast::Sender<PipelineEvent>,
    shutdown: CancellationToken,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<BufferedRecord>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chain_head(&self) -> MutexGuard<'_, Option<String>> {
        self.chain_head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Append a validated record, applying overflow protection
    ///
    /// Shutdown is checked under the queue lock: once `stop()` has cancelled
    /// the token, its drain sees every record that was accepted.
    fn enqueue(&self, record: AuditRecord) -> Result<usize> {
        let record_id = record.id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let buffered = BufferedRecord::new(record, self.clock.now_millis(), seq);

        let (queue_size, dropped) = {
            let mut queue = self.queue();
            if self.shutdown.is_cancelled() {
                return Err(AuditError::ShutDown);
            }
            queue.push_back(buffered);
            let dropped = if queue.len() > self.config.overflow_threshold() {
                let count = (queue.len() / 10).max(1);
                queue.drain(..count).count()
            } else {
                0
            };
            (queue.len(), dropped)
        };

        self.metrics.record_ingested(1);
        tracing::debug!(record_id = %record_id, queue_size, "Record ingested");
        self.emit(PipelineEvent::Ingested {
            record_id,
            queue_size,
        });

        if dropped > 0 {
            self.metrics.record_dropped(dropped as u64);
            tracing::warn!(
                dropped,
                queue_size,
                capacity = self.config.buffer_capacity,
                "Buffer overflow, oldest records dropped"
            );
            self.emit(PipelineEvent::Overflow {
                dropped,
                queue_size,
            });
        }

        Ok(queue_size)
    }

    async fn try_flush(self: &Arc<Self>) -> Option<FlushSummary> {
        let Ok(_guard) = self.flush_guard.try_lock() else {
            tracing::debug!("Flush already in progress, skipping");
            return None;
        };
        Some(self.flush_locked(FlushMode::Batch).await)
    }

    /// Wait for any in-flight flush, then flush
    async fn flush_when_free(self: &Arc<Self>) -> Option<FlushSummary> {
        let _guard = self.flush_guard.lock().await;
        if self.shutdown.is_cancelled() {
            return None;
        }
        Some(self.flush_locked(FlushMode::Batch).await)
    }

    fn take_batch(&self, mode: FlushMode) -> Vec<BufferedRecord> {
        let mut queue = self.queue();
        if mode == FlushMode::Drain {
            return queue.drain(..).collect();
        }

        let now = Instant::now();
        let mut batch = Vec::new();
        let mut waiting = Vec::new();
        while batch.len() < self.config.batch_size {
            let Some(buffered) = queue.pop_front() else {
                break;
            };
            if buffered.is_due(now) {
                batch.push(buffered);
            } else {
                waiting.push(buffered);
            }
        }
        for buffered in waiting.into_iter().rev() {
            queue.push_front(buffered);
        }
        batch
    }

    /// Flush with the guard already held
    async fn flush_locked(self: &Arc<Self>, mode: FlushMode) -> FlushSummary {
        let started = Instant::now();
        let batch = self.take_batch(mode);
        if batch.is_empty() {
            self.metrics.record_idle_flush(self.clock.now_millis());
            return FlushSummary {
                remaining: self.queue().len(),
                ..Default::default()
            };
        }

        let mut summary = FlushSummary::default();
        let mut requeue = Vec::new();

        for mut buffered in batch {
            match self.deliver(&mut buffered.record).await {
                Ok(()) => {
                    summary.processed += 1;
                    self.metrics.record_persisted();
                }
                Err(failure) => {
                    summary.failed += 1;
                    if let Some(retry) = self.handle_failure(buffered, failure, mode).await {
                        requeue.push(retry);
                    }
                }
            }
        }

        summary.requeued = requeue.len();
        summary.remaining = {
            let mut queue = self.queue();
            if !requeue.is_empty() {
                for buffered in requeue.into_iter().rev() {
                    queue.push_front(buffered);
                }
                // Requeued records may be newer than ones still backing off
                queue.make_contiguous().sort_by_key(|b| b.seq);
            }
            queue.len()
        };

        let elapsed = started.elapsed();
        summary.latency_ms = elapsed.as_millis() as u64;
        self.metrics.record_flush(elapsed, self.clock.now_millis());

        tracing::debug!(
            processed = summary.processed,
            failed = summary.failed,
            remaining = summary.remaining,
            latency_ms = summary.latency_ms,
            "Flush completed"
        );
        self.emit(PipelineEvent::Flushed(summary.clone()));
        summary
    }

    /// Stamp a record onto the chain and write it
    async fn deliver(&self, record: &mut AuditRecord) -> std::result::Result<(), DeliveryFailure> {
        let previous = self.chain_head().clone();
        let hash = self
            .ledger
            .seal(record, previous.as_deref())
            .map_err(DeliveryFailure::Stamp)?;

        self.write(record).await.map_err(DeliveryFailure::Write)?;

        *self.chain_head() = Some(hash);
        Ok(())
    }

    async fn write(&self, record: &AuditRecord) -> Result<()> {
        match self.config.write_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.sink.write(record))
                .await
                .map_err(|_| {
                    AuditError::Timeout(format!(
                        "write to sink '{}' exceeded {}ms",
                        self.sink.name(),
                        limit.as_millis()
                    ))
                })?,
            None => self.sink.write(record).await,
        }
    }

    /// Requeue a failed record or fail it permanently
    ///
    /// Returns the record when it should go back to the head of the queue.
    async fn handle_failure(
        self: &Arc<Self>,
        mut buffered: BufferedRecord,
        failure: DeliveryFailure,
        mode: FlushMode,
    ) -> Option<BufferedRecord> {
        let (error, retriable) = match failure {
            DeliveryFailure::Stamp(e) => (e, false),
            DeliveryFailure::Write(e) => (e, true),
        };

        if retriable && !should_dead_letter(buffered.retry_count, self.config.max_retries) {
            let delay = self.config.retry_backoff(buffered.retry_count);
            buffered.retry_count += 1;
            buffered.retry_at = Some(Instant::now() + delay);

            tracing::warn!(
                record_id = %buffered.record.id,
                attempt = buffered.retry_count,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Sink write failed, record requeued"
            );

            if mode == FlushMode::Batch {
                self.metrics.record_retry();
                self.schedule_retry(buffered.record.id.clone(), buffered.retry_count, delay);
            }
            return Some(buffered);
        }

        let attempts = buffered.retry_count + 1;
        let reason = if retriable {
            format!(
                "{}: {}",
                AuditError::MaxRetriesExceeded {
                    record_id: buffered.record.id.clone(),
                    attempts,
                },
                error
            )
        } else {
            error.to_string()
        };

        self.metrics.record_failed();
        tracing::error!(
            record_id = %buffered.record.id,
            attempts,
            reason = %reason,
            "Record failed permanently"
        );

        if let Some(dlq) = &self.dlq {
            let dead = DeadLetterRecord::new(buffered.record.clone(), reason.clone(), attempts);
            if let Err(e) = dlq.handle(dead).await {
                tracing::error!(
                    record_id = %buffered.record.id,
                    error = %e,
                    "Failed to dead-letter record"
                );
            }
        }

        self.emit(PipelineEvent::Failed {
            record: Box::new(buffered.record),
            error: reason,
            attempts,
        });
        None
    }

    /// Emit `retry` and flush once the backoff has elapsed
    fn schedule_retry(self: &Arc<Self>, record_id: String, attempt: u32, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.emit(PipelineEvent::Retry {
                        record_id,
                        attempt,
                        delay,
                    });
                    inner.flush_when_free().await;
                }
            }
        });
    }

    fn health_report(&self) -> HealthReport {
        let queue_size = self.queue().len();
        health::evaluate(&HealthInputs {
            queue_size,
            capacity: self.config.buffer_capacity,
            last_flush_at: self.metrics.last_flush_at(),
            now_ms: self.clock.now_millis(),
            flush_interval: self.config.flush_interval(),
            failure_rate: self.metrics.failure_rate(),
            avg_latency: self.metrics.average_latency(),
            latency_threshold: Duration::from_millis(self.config.latency_threshold_ms),
        })
    }
}
