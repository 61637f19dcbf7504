//! In-memory sink for development and testing

use super::{RecordSink, SinkInfo};
use crate::error::{AuditError, Result};
use crate::types::AuditRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Stores records in a `Vec`
///
/// `fail_next` makes the following writes fail, which lets tests drive the
/// pipeline's retry path without a real backend.
#[derive(Default)]
pub struct MemorySink {
    records: RwLock<Vec<AuditRecord>>,
    bytes: AtomicU64,
    attempts: AtomicU64,
    failures_pending: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// All persisted records in write order
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    /// Number of persisted records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write calls received, including failed ones
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AuditError::Sink {
                sink: "memory".to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let size = serde_json::to_vec(record)?.len() as u64;
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            // Redelivery replaces the earlier copy
            Some(existing) => *existing = record.clone(),
            None => {
                records.push(record.clone());
                self.bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn info(&self) -> Result<SinkInfo> {
        Ok(SinkInfo {
            sink: "memory".to_string(),
            records: self.records.read().await.len() as u64,
            bytes: self.bytes.load(Ordering::Relaxed),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
