//! Durable record sinks: where stamped records are persisted
//!
//! The pipeline hands every stamped record to a `RecordSink`. A sink may
//! receive the same logical record more than once after a retry, so
//! implementations must tolerate redelivery (records carry a stable `id`).

use crate::error::Result;
use crate::types::AuditRecord;
use async_trait::async_trait;

pub mod file;
pub mod memory;

/// Core trait for durable record writers
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one stamped record
    async fn write(&self, record: &AuditRecord) -> Result<()>;

    /// Sink status information
    async fn info(&self) -> Result<SinkInfo>;

    /// Sink name (e.g., "memory", "file")
    fn name(&self) -> &str;

    /// Health check, returns true if the sink can accept writes
    ///
    /// Default implementation delegates to `info()` and returns true if it succeeds.
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Sink status information
#[derive(Debug, Clone)]
pub struct SinkInfo {
    /// Sink name
    pub sink: String,
    /// Records persisted
    pub records: u64,
    /// Bytes persisted
    pub bytes: u64,
}
