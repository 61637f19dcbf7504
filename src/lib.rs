//! # a3s-audit
//!
//! Tamper-evident audit logging for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-audit` protects audit records for security and compliance:
//! records can be encrypted with versioned, rotating AES-256-GCM keys,
//! every persisted record is stamped with a salted SHA-256 hash linked to
//! its predecessor, and a buffered pipeline delivers records to a durable
//! sink with bounded memory, retries and health monitoring.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_audit::{
//!     AuditCategory, AuditRecord, IngestionPipeline, IntegrityLedger, LedgerConfig,
//!     PipelineConfig, Severity,
//! };
//! use a3s_audit::sink::memory::MemorySink;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let ledger = IntegrityLedger::new(LedgerConfig::new("ledger-secret"))?;
//! let sink = Arc::new(MemorySink::new());
//! let pipeline = IngestionPipeline::new(PipelineConfig::default(), ledger, sink.clone())?;
//! pipeline.start().await?;
//!
//! pipeline
//!     .ingest(AuditRecord::new(
//!         AuditCategory::Authentication,
//!         Severity::Info,
//!         "alice",
//!         "login",
//!     ))
//!     .await?;
//!
//! // Drains the buffer before returning
//! let summary = pipeline.stop().await;
//! assert_eq!(summary.remaining, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Sinks
//!
//! - **memory**: In-memory sink for testing and single-process use
//! - **file**: Append-only JSON-lines file
//!
//! ## Architecture
//!
//! - **EncryptionEngine**: record and field encryption over a versioned key ring
//! - **IntegrityLedger**: salted hashing, chain linking and sequence audits
//! - **IngestionPipeline**: buffering, batching, retries, overflow and health
//! - **RecordSink** trait: implemented by durable persistence backends
//! - **DlqHandler** trait: parks permanently failed records for later replay

pub mod canonical;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dlq;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod types;

// Re-export core types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuditConfig, ConfigReport, EncryptionConfig, LedgerConfig, PipelineConfig};
pub use crypto::keyring::{KeyInfo, KeyRing};
pub use crypto::{EncryptedField, EncryptedPayload, EncryptionEngine};
pub use dlq::{DeadLetterRecord, DlqHandler, MemoryDlqHandler};
pub use error::{AuditError, Result};
pub use ledger::{AuditDetail, ChainAudit, IntegrityLedger};
pub use metrics::{EncryptionMetricsSnapshot, PipelineMetricsSnapshot};
pub use pipeline::{
    BufferedRecord, FlushSummary, HealthCheck, HealthReport, HealthStatus, IngestionPipeline,
    PipelineBuilder, PipelineEvent,
};
pub use sink::{RecordSink, SinkInfo};
pub use types::{AuditCategory, AuditRecord, IntegrityStamp, Severity, Stamped};

// Re-export sinks for convenience
pub use sink::file::FileSink;
pub use sink::memory::MemorySink;
