//! Static configuration for the audit core
//!
//! All sections deserialize from camelCase JSON with defaults for every
//! field except secrets. Constructors validate their section and fail fast.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Smallest key size accepted by policy
pub const MIN_KEY_SIZE_BITS: u32 = 256;

/// Longest rotation period accepted by policy
pub const MAX_ROTATION_PERIOD_DAYS: u32 = 90;

/// Key size supported by the AES-256-GCM cipher
pub const SUPPORTED_KEY_SIZE_BITS: u32 = 256;

/// Outcome of a configuration check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ConfigReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert into a `Result`, naming the section in the error
    pub fn into_result(self, section: &str) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(AuditError::Config(format!(
                "invalid {} configuration: {}",
                section,
                self.errors.join("; ")
            )))
        }
    }
}

/// Encryption policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// Symmetric key size in bits
    #[serde(default = "default_key_size_bits")]
    pub key_size_bits: u32,

    /// Maximum age of the active key before rotation is due
    #[serde(default = "default_rotation_period_days")]
    pub rotation_period_days: u32,

    /// Identifier of the master key this key ring is derived under
    #[serde(default = "default_master_key_id")]
    pub master_key_id: String,
}

fn default_key_size_bits() -> u32 {
    256
}

fn default_rotation_period_days() -> u32 {
    90
}

fn default_master_key_id() -> String {
    "a3s-audit-master".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_size_bits: default_key_size_bits(),
            rotation_period_days: default_rotation_period_days(),
            master_key_id: default_master_key_id(),
        }
    }
}

impl EncryptionConfig {
    /// Rotation period as a chrono duration
    pub fn rotation_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.rotation_period_days))
    }

    /// Check the policy invariants
    pub fn validate(&self) -> ConfigReport {
        let mut errors = Vec::new();

        if self.key_size_bits < MIN_KEY_SIZE_BITS {
            errors.push(format!(
                "key size {} bits is below the {}-bit minimum",
                self.key_size_bits, MIN_KEY_SIZE_BITS
            ));
        } else if self.key_size_bits != SUPPORTED_KEY_SIZE_BITS {
            errors.push(format!(
                "key size {} bits is not supported by aes-256-gcm",
                self.key_size_bits
            ));
        }

        if self.rotation_period_days == 0 {
            errors.push("rotation period must be at least 1 day".to_string());
        } else if self.rotation_period_days > MAX_ROTATION_PERIOD_DAYS {
            errors.push(format!(
                "rotation period {} days exceeds the {}-day maximum",
                self.rotation_period_days, MAX_ROTATION_PERIOD_DAYS
            ));
        }

        if self.master_key_id.trim().is_empty() {
            errors.push("master key id must not be empty".to_string());
        }

        ConfigReport::from_errors(errors)
    }
}

/// Integrity ledger settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// Secret mixed into every hash
    pub secret: String,

    /// Random salt length in bytes
    #[serde(default = "default_salt_bytes")]
    pub salt_bytes: usize,
}

fn default_salt_bytes() -> usize {
    16
}

impl LedgerConfig {
    /// Create a ledger config with the default salt length
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            salt_bytes: default_salt_bytes(),
        }
    }

    /// Check the ledger settings
    pub fn validate(&self) -> ConfigReport {
        let mut errors = Vec::new();
        if self.secret.is_empty() {
            errors.push("ledger secret must not be empty".to_string());
        }
        if self.salt_bytes < 8 {
            errors.push(format!(
                "salt length {} bytes is below the 8-byte minimum",
                self.salt_bytes
            ));
        }
        ConfigReport::from_errors(errors)
    }
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("secret", &"<redacted>")
            .field("salt_bytes", &self.salt_bytes)
            .finish()
    }
}

/// Ingestion pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Queue size that triggers an immediate flush
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Periodic flush interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Redelivery attempts before a record fails permanently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (`retry_delay * 2^retry_count`)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Records taken from the queue per flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval between health evaluations
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Average flush latency above which health degrades
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Per-write timeout, a timed out write counts as a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_latency_threshold_ms() -> u64 {
    1_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            batch_size: default_batch_size(),
            health_check_interval_ms: default_health_check_interval_ms(),
            latency_threshold_ms: default_latency_threshold_ms(),
            write_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff before redelivering a record that has already failed
    /// `retry_count` times: `retry_delay * 2^retry_count`
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u64 << retry_count.min(20);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    /// Queue length beyond which the oldest entries are dropped (110%)
    pub fn overflow_threshold(&self) -> usize {
        self.buffer_capacity + self.buffer_capacity / 10
    }

    /// Check the pipeline settings
    pub fn validate(&self) -> ConfigReport {
        let mut errors = Vec::new();
        if self.buffer_capacity == 0 {
            errors.push("buffer capacity must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch size must be greater than 0".to_string());
        }
        if self.flush_interval_ms == 0 {
            errors.push("flush interval must be greater than 0".to_string());
        }
        if self.health_check_interval_ms == 0 {
            errors.push("health check interval must be greater than 0".to_string());
        }
        if self.write_timeout_ms == Some(0) {
            errors.push("write timeout must be greater than 0 when set".to_string());
        }
        ConfigReport::from_errors(errors)
    }
}

/// Complete configuration for the audit core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default)]
    pub encryption: EncryptionConfig,

    pub ledger: LedgerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AuditConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AuditConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    /// Validate every section, failing on the first invalid one
    pub fn validate(&self) -> Result<()> {
        self.encryption.validate().into_result("encryption")?;
        self.ledger.validate().into_result("ledger")?;
        self.pipeline.validate().into_result("pipeline")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_defaults_are_valid() {
        let report = EncryptionConfig::default().validate();
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_encryption_policy_violations() {
        let config = EncryptionConfig {
            key_size_bits: 128,
            rotation_period_days: 120,
            master_key_id: "  ".to_string(),
        };
        let report = config.validate();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].contains("128"));
        assert!(report.errors[1].contains("120"));
    }

    #[test]
    fn test_encryption_unsupported_key_size() {
        let config = EncryptionConfig {
            key_size_bits: 512,
            ..Default::default()
        };
        let report = config.validate();
        assert!(!report.valid);
        assert!(report.errors[0].contains("not supported"));
    }

    #[test]
    fn test_ledger_requires_secret() {
        assert!(!LedgerConfig::new("").validate().valid);
        assert!(LedgerConfig::new("s3cr3t").validate().valid);
    }

    #[test]
    fn test_ledger_debug_redacts_secret() {
        let debug = format!("{:?}", LedgerConfig::new("hunter2"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_pipeline_backoff_doubles() {
        let config = PipelineConfig {
            retry_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.retry_backoff(0), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(1), Duration::from_millis(200));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_pipeline_overflow_threshold() {
        let config = PipelineConfig {
            buffer_capacity: 10,
            ..Default::default()
        };
        assert_eq!(config.overflow_threshold(), 11);
    }

    #[test]
    fn test_pipeline_validation() {
        let config = PipelineConfig {
            buffer_capacity: 0,
            batch_size: 0,
            ..Default::default()
        };
        let report = config.validate();
        assert_eq!(report.errors.len(), 2);
        assert!(report.into_result("pipeline").is_err());
    }

    #[test]
    fn test_audit_config_from_json() {
        let json = r#"{
            "ledger": {"secret": "abc"},
            "pipeline": {"bufferCapacity": 50, "writeTimeoutMs": 250}
        }"#;
        let config = AuditConfig::from_json_str(json).unwrap();
        assert_eq!(config.pipeline.buffer_capacity, 50);
        assert_eq!(config.pipeline.batch_size, 100);
        assert_eq!(config.pipeline.write_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.encryption.key_size_bits, 256);
        assert_eq!(config.ledger.salt_bytes, 16);
    }

    #[test]
    fn test_audit_config_rejects_invalid_section() {
        let json = r#"{"ledger": {"secret": "abc"}, "encryption": {"rotationPeriodDays": 365}}"#;
        let err = AuditConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("encryption"));
    }

    #[test]
    fn test_audit_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(&path, r#"{"ledger": {"secret": "file-secret"}}"#).unwrap();

        let config = AuditConfig::from_file(&path).unwrap();
        assert_eq!(config.ledger.secret, "file-secret");

        assert!(AuditConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
