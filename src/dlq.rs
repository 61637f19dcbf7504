//! Dead-lettered audit records
//!
//! A record that exhausts its delivery attempts, or cannot be stamped, is
//! reported through the `failed` signal. When a `DlqHandler` is configured
//! the record is also parked here until an operator replays it with
//! [`IngestionPipeline::replay_dead_letters`](crate::IngestionPipeline::replay_dead_letters),
//! which re-stamps it onto the current chain head.

use crate::error::Result;
use crate::types::{now_millis, AuditRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;

/// A failed record with the reason it could not be persisted
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    /// The record as last attempted (stamped, if stamping succeeded)
    pub record: AuditRecord,

    pub reason: String,

    /// Delivery attempts made
    pub attempts: u32,

    /// Unix ms when the record was parked
    pub dead_lettered_at: u64,
}

impl DeadLetterRecord {
    pub fn new(record: AuditRecord, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            record,
            reason: reason.into(),
            attempts,
            dead_lettered_at: now_millis(),
        }
    }
}

/// Destination for permanently failed records
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Park a failed record
    async fn handle(&self, record: DeadLetterRecord) -> Result<()>;

    /// Remove and return every parked record, oldest first
    async fn drain(&self) -> Result<Vec<DeadLetterRecord>>;
}

/// In-memory dead letter store
///
/// Holds at most `max_records` entries. When full, the oldest entry is
/// evicted and counted in [`MemoryDlqHandler::evicted`].
pub struct MemoryDlqHandler {
    state: Mutex<MemoryDlqState>,
    max_records: usize,
}

#[derive(Default)]
struct MemoryDlqState {
    records: VecDeque<DeadLetterRecord>,
    evicted: u64,
}

impl MemoryDlqHandler {
    pub fn new(max_records: usize) -> Self {
        Self {
            state: Mutex::new(MemoryDlqState::default()),
            max_records,
        }
    }

    /// Copy of the parked records, oldest first
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().await.records.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Records lost to the capacity bound
    pub async fn evicted(&self) -> u64 {
        self.state.lock().await.evicted
    }

    /// Parked records per audit category
    pub async fn by_category(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for dead in &state.records {
            *counts.entry(dead.record.category.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, record: DeadLetterRecord) -> Result<()> {
        tracing::warn!(
            record_id = %record.record.id,
            category = %record.record.category,
            attempts = record.attempts,
            reason = %record.reason,
            "Record dead-lettered"
        );

        let mut state = self.state.lock().await;
        state.records.push_back(record);
        if self.max_records > 0 && state.records.len() > self.max_records {
            if let Some(evicted) = state.records.pop_front() {
                state.evicted += 1;
                tracing::error!(
                    record_id = %evicted.record.id,
                    "Dead letter store full, oldest record evicted"
                );
            }
        }
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.state.lock().await.records.drain(..).collect())
    }
}

/// Whether a record that has already been retried `retry_count` times
/// should be dead-lettered on its next failure
pub fn should_dead_letter(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}
