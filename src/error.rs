//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Record rejected before buffering
    #[error("Validation failed, missing or invalid fields: {}", fields.join(", "))]
    Validation {
        fields: Vec<String>,
    },

    /// Encryption failure (no active key, unserializable input, cipher error)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Decryption failure (bad encoding, authentication tag mismatch)
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Payload references a key version that was never issued
    #[error("Encryption key version {version} not found")]
    KeyNotFound {
        version: u32,
    },

    /// Checksum or hash chain mismatch
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Value could not be brought into canonical form
    #[error("Canonicalization error: {0}")]
    Canonicalization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable sink rejected or failed a write
    #[error("Sink '{sink}' failed: {reason}")]
    Sink {
        sink: String,
        reason: String,
    },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The pipeline has been stopped and accepts no more records
    #[error("Pipeline is shut down")]
    ShutDown,

    /// A buffered record exhausted its delivery attempts
    #[error("Record '{record_id}' failed permanently after {attempts} attempts")]
    MaxRetriesExceeded {
        record_id: String,
        attempts: u32,
    },
}

impl AuditError {
    /// Whether this error must be surfaced as a security event
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            AuditError::IntegrityViolation(_) | AuditError::KeyNotFound { .. }
        )
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
