//! Signals emitted by the ingestion pipeline
//!
//! Failures discovered during an asynchronous flush are reported here and
//! nowhere else; they are never returned to an unrelated `ingest` caller.

use super::health::HealthReport;
use crate::types::AuditRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline monitoring events
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Timers started
    Started,
    /// One record accepted into the buffer
    Ingested { record_id: String, queue_size: usize },
    /// A batch of records accepted into the buffer
    BatchIngested {
        count: usize,
        latency: Duration,
        queue_size: usize,
    },
    /// A flush finished, successfully or not
    Flushed(FlushSummary),
    /// A failed record's backoff elapsed and redelivery is starting
    Retry {
        record_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// A record failed permanently
    Failed {
        record: Box<AuditRecord>,
        error: String,
        attempts: u32,
    },
    /// Oldest records dropped to bound memory
    Overflow { dropped: usize, queue_size: usize },
    /// Periodic health evaluation
    HealthCheck(HealthReport),
    /// Timers cancelled and the final flush completed
    Stopped { remaining: usize },
}

impl PipelineEvent {
    /// Signal name as seen by monitoring collaborators
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Started => "started",
            PipelineEvent::Ingested { .. } => "ingested",
            PipelineEvent::BatchIngested { .. } => "batchIngested",
            PipelineEvent::Flushed(_) => "flushed",
            PipelineEvent::Retry { .. } => "retry",
            PipelineEvent::Failed { .. } => "failed",
            PipelineEvent::Overflow { .. } => "overflow",
            PipelineEvent::HealthCheck(_) => "healthCheck",
            PipelineEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushSummary {
    /// Records written to the sink
    pub processed: usize,
    /// Write failures during this flush, requeued or permanent
    pub failed: usize,
    /// Failed records put back at the head of the queue
    pub requeued: usize,
    /// Wall time of the flush in milliseconds
    pub latency_ms: u64,
    /// Queue length after the flush
    pub remaining: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(PipelineEvent::Started.name(), "started");
        assert_eq!(
            PipelineEvent::Overflow {
                dropped: 1,
                queue_size: 10
            }
            .name(),
            "overflow"
        );
        assert_eq!(
            PipelineEvent::Flushed(FlushSummary::default()).name(),
            "flushed"
        );
    }

    #[test]
    fn test_flush_summary_serialization() {
        let summary = FlushSummary {
            processed: 5,
            failed: 1,
            requeued: 1,
            latency_ms: 12,
            remaining: 3,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"latencyMs\":12"));
        assert!(json.contains("\"remaining\":3"));
    }
}
