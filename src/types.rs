//! Core audit record types
//!
//! All types use camelCase JSON serialization so persisted records stay
//! readable by the surrounding services.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A single audit record
///
/// `category` and `severity` are kept as strings because records usually
/// arrive from an untyped boundary (HTTP, queue). [`AuditRecord::validate`]
/// checks them against [`AuditCategory`] and [`Severity`] before the record
/// is buffered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Unique record identifier (aud-<uuid>)
    pub id: String,

    /// Unix timestamp in milliseconds, 0 when absent
    #[serde(default)]
    pub timestamp: u64,

    /// Audit category (e.g., "phi_access", "authentication")
    #[serde(default)]
    pub category: String,

    /// Severity level (e.g., "info", "critical")
    #[serde(default)]
    pub severity: String,

    /// Who performed the action
    #[serde(default)]
    pub actor: String,

    /// What was done (e.g., "patient.read")
    #[serde(default)]
    pub action: String,

    /// Resource the action was performed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Arbitrary structured details
    #[serde(default)]
    pub details: serde_json::Value,

    /// Optional key-value metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Integrity stamp, attached by the ledger before persistence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityStamp>,
}

impl AuditRecord {
    /// Create a new record with auto-generated id and timestamp
    pub fn new(
        category: AuditCategory,
        severity: Severity,
        actor: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            timestamp: now_millis(),
            category: category.to_string(),
            severity: severity.to_string(),
            actor: actor.into(),
            action: action.into(),
            resource: None,
            details: serde_json::Value::Null,
            metadata: HashMap::new(),
            integrity: None,
        }
    }

    /// Set the resource the action touched
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the fields required before a record may be buffered
    ///
    /// Every problem is reported at once so callers can fix the record in
    /// one pass.
    pub fn validate(&self) -> Result<()> {
        let mut fields = Vec::new();

        if self.timestamp == 0 {
            fields.push("timestamp".to_string());
        }
        if self.category.parse::<AuditCategory>().is_err() {
            fields.push("category".to_string());
        }
        if self.severity.parse::<Severity>().is_err() {
            fields.push("severity".to_string());
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(AuditError::Validation { fields })
        }
    }

    /// Approximate serialized size, used for buffer accounting
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Known audit categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Login, logout, MFA
    Authentication,
    /// Permission grants and denials
    Authorization,
    /// Read access to protected health information
    PhiAccess,
    /// Creation, update or deletion of protected health information
    PhiModification,
    /// Data leaving the system (exports, reports, transfers)
    DataExport,
    /// Administrative configuration changes
    Administration,
    /// Security incidents and alerts
    Security,
    /// Service lifecycle
    System,
}

impl AuditCategory {
    /// All known categories
    pub const ALL: [AuditCategory; 8] = [
        AuditCategory::Authentication,
        AuditCategory::Authorization,
        AuditCategory::PhiAccess,
        AuditCategory::PhiModification,
        AuditCategory::DataExport,
        AuditCategory::Administration,
        AuditCategory::Security,
        AuditCategory::System,
    ];

    /// Wire name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::Authorization => "authorization",
            AuditCategory::PhiAccess => "phi_access",
            AuditCategory::PhiModification => "phi_modification",
            AuditCategory::DataExport => "data_export",
            AuditCategory::Administration => "administration",
            AuditCategory::Security => "security",
            AuditCategory::System => "system",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditCategory {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        AuditCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AuditError::Validation {
                fields: vec!["category".to_string()],
            })
    }
}

/// Severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Wire name of the severity
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(AuditError::Validation {
                fields: vec!["severity".to_string()],
            }),
        }
    }
}

/// Integrity stamp attached to a record by the ledger
///
/// `hash = SHA-256(canonical(record without stamp) || salt || secret)`.
/// `previous_hash` links the record to its predecessor in ingestion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityStamp {
    /// Hex-encoded digest
    pub hash: String,

    /// Hash of the preceding record, absent for the first record of a chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,

    /// Hex-encoded random salt
    pub salt: String,

    /// Digest algorithm identifier
    pub algorithm: String,

    /// Unix timestamp in milliseconds when the stamp was produced
    pub timestamp: u64,
}

/// A record that can carry an [`IntegrityStamp`]
pub trait Stamped: Serialize + Clone {
    /// The attached stamp, if any
    fn integrity(&self) -> Option<&IntegrityStamp>;

    /// Attach or remove the stamp
    fn set_integrity(&mut self, stamp: Option<IntegrityStamp>);
}

impl Stamped for AuditRecord {
    fn integrity(&self) -> Option<&IntegrityStamp> {
        self.integrity.as_ref()
    }

    fn set_integrity(&mut self, stamp: Option<IntegrityStamp>) {
        self.integrity = stamp;
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
