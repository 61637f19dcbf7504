//! Counters and latency samples for the encryption engine and pipeline
//!
//! Counters only ever increase for the lifetime of the owning instance.
//! Latency keeps the last [`LATENCY_WINDOW`] samples.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Number of latency samples retained
pub const LATENCY_WINDOW: usize = 100;

/// Bounded window of recent latency samples (microseconds)
#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyWindow {
    /// Record one sample, evicting the oldest when full
    pub fn record(&self, elapsed: Duration) {
        let Ok(mut samples) = self.samples.lock() else {
            tracing::error!("Latency window lock poisoned, dropping sample");
            return;
        };
        if samples.len() >= LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_micros() as u64);
    }

    /// Average of the retained samples in microseconds, 0 when empty
    pub fn average_us(&self) -> u64 {
        self.samples
            .lock()
            .map(|s| {
                if s.is_empty() {
                    0
                } else {
                    s.iter().sum::<u64>() / s.len() as u64
                }
            })
            .unwrap_or(0)
    }

    /// Number of retained samples
    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encryption engine counters
#[derive(Debug, Default)]
pub struct EncryptionMetrics {
    encrypt_count: AtomicU64,
    decrypt_count: AtomicU64,
    encrypt_errors: AtomicU64,
    decrypt_errors: AtomicU64,
    integrity_violations: AtomicU64,
    rotations: AtomicU64,
    latency: LatencyWindow,
}

impl EncryptionMetrics {
    pub(crate) fn record_encrypt(&self, elapsed: Duration) {
        self.encrypt_count.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    pub(crate) fn record_decrypt(&self, elapsed: Duration) {
        self.decrypt_count.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    pub(crate) fn record_encrypt_error(&self) {
        self.encrypt_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decrypt_error(&self) {
        self.decrypt_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_integrity_violation(&self) {
        self.integrity_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> EncryptionMetricsSnapshot {
        EncryptionMetricsSnapshot {
            encrypt_count: self.encrypt_count.load(Ordering::Relaxed),
            decrypt_count: self.decrypt_count.load(Ordering::Relaxed),
            encrypt_errors: self.encrypt_errors.load(Ordering::Relaxed),
            decrypt_errors: self.decrypt_errors.load(Ordering::Relaxed),
            integrity_violations: self.integrity_violations.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            avg_latency_us: self.latency.average_us(),
        }
    }
}

/// Serializable view of [`EncryptionMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetricsSnapshot {
    pub encrypt_count: u64,
    pub decrypt_count: u64,
    pub encrypt_errors: u64,
    pub decrypt_errors: u64,
    pub integrity_violations: u64,
    pub rotations: u64,
    pub avg_latency_us: u64,
}

/// Ingestion pipeline counters
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    ingested: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    validation_errors: AtomicU64,
    flush_count: AtomicU64,
    last_flush_at: AtomicU64,
    latency: LatencyWindow,
}

impl PipelineMetrics {
    pub(crate) fn record_ingested(&self, count: u64) {
        self.ingested.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, elapsed: Duration, finished_at_ms: u64) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.last_flush_at.store(finished_at_ms, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    /// A flush ran but found nothing to deliver
    ///
    /// Refreshes the completion time only; no latency sample is taken.
    pub(crate) fn record_idle_flush(&self, finished_at_ms: u64) {
        self.last_flush_at.store(finished_at_ms, Ordering::Relaxed);
    }

    /// Unix ms of the last completed flush, if any
    pub fn last_flush_at(&self) -> Option<u64> {
        match self.last_flush_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Permanent failures divided by ingested records
    pub fn failure_rate(&self) -> f64 {
        let ingested = self.ingested.load(Ordering::Relaxed);
        if ingested == 0 {
            return 0.0;
        }
        self.failed.load(Ordering::Relaxed) as f64 / ingested as f64
    }

    /// Average flush latency over the retained window
    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.latency.average_us())
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            last_flush_at: self.last_flush_at(),
            avg_flush_latency_us: self.latency.average_us(),
        }
    }
}

/// Serializable view of [`PipelineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetricsSnapshot {
    pub ingested: u64,
    pub persisted: u64,
    pub failed: u64,
    pub retries: u64,
    pub dropped: u64,
    pub validation_errors: u64,
    pub flush_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<u64>,
    pub avg_flush_latency_us: u64,
}
