//! Integrity ledger: salted hashes and hash chaining for audit records
//!
//! Each record is fingerprinted as
//! `SHA-256(canonical(record without stamp) || salt || secret)` and carries
//! the hash of its predecessor. Editing a record breaks its own hash;
//! deleting, inserting or reordering records breaks the chain.

use crate::canonical::{sha256_hex, to_canonical_string};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::Result;
use crate::types::{IntegrityStamp, Stamped};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Digest identifier stored in every stamp
pub const HASH_ALGORITHM: &str = "sha256";

/// Result of auditing an ordered sequence of stamped records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAudit {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub invalid_entries: usize,
    pub chain_breaks: usize,
    pub details: Vec<AuditDetail>,
}

impl ChainAudit {
    /// No tampered record and no broken link
    pub fn is_intact(&self) -> bool {
        self.invalid_entries == 0 && self.chain_breaks == 0
    }

    /// Indexes whose link to the preceding record is broken
    pub fn break_indexes(&self) -> Vec<usize> {
        self.details
            .iter()
            .filter(|d| !d.chain_valid)
            .map(|d| d.index)
            .collect()
    }
}

/// Per-record audit outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDetail {
    pub index: usize,
    /// The record's own hash verifies
    pub hash_valid: bool,
    /// The record links to the record before it (always true at index 0)
    pub chain_valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

/// Computes and checks integrity stamps
pub struct IntegrityLedger {
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
}

impl IntegrityLedger {
    /// Create a ledger using the system clock
    pub fn new(config: LedgerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a ledger with an explicit clock
    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().into_result("ledger")?;
        Ok(Self { config, clock })
    }

    /// Produce a stamp for `record`, linking it to `previous_hash`
    ///
    /// Any stamp already attached to the record is ignored for hashing.
    /// Threading `previous_hash` through a sequence is the caller's job.
    pub fn stamp<T: Stamped>(&self, record: &T, previous_hash: Option<&str>) -> Result<IntegrityStamp> {
        let canonical = canonical_without_stamp(record)?;
        let salt = self.generate_salt();
        let hash = self.compute_hash(&canonical, &salt);

        Ok(IntegrityStamp {
            hash,
            previous_hash: previous_hash.map(str::to_string),
            salt,
            algorithm: HASH_ALGORITHM.to_string(),
            timestamp: self.clock.now_millis(),
        })
    }

    /// Stamp `record` in place and return its new hash
    pub fn seal<T: Stamped>(&self, record: &mut T, previous_hash: Option<&str>) -> Result<String> {
        let stamp = self.stamp(record, previous_hash)?;
        let hash = stamp.hash.clone();
        record.set_integrity(Some(stamp));
        Ok(hash)
    }

    /// Recompute the record's hash with its stored salt
    ///
    /// Returns false when the record carries no stamp.
    pub fn verify<T: Stamped>(&self, record: &T) -> bool {
        let Some(stamp) = record.integrity() else {
            return false;
        };
        if stamp.algorithm != HASH_ALGORITHM {
            return false;
        }
        match canonical_without_stamp(record) {
            Ok(canonical) => self.compute_hash(&canonical, &stamp.salt) == stamp.hash,
            Err(e) => {
                tracing::warn!(error = %e, "Record could not be canonicalized for verification");
                false
            }
        }
    }

    /// True iff `current` links to `previous`
    pub fn verify_chain<T: Stamped>(current: &T, previous: &T) -> bool {
        match (current.integrity(), previous.integrity()) {
            (Some(cur), Some(prev)) => cur.previous_hash.as_deref() == Some(prev.hash.as_str()),
            _ => false,
        }
    }

    /// Verify every record and every adjacent link of an ordered sequence
    pub fn audit_sequence<T: Stamped>(&self, records: &[T]) -> ChainAudit {
        let mut audit = ChainAudit {
            total_entries: records.len(),
            ..Default::default()
        };

        for (index, record) in records.iter().enumerate() {
            let mut issues = Vec::new();

            let hash_valid = self.verify(record);
            if hash_valid {
                audit.valid_entries += 1;
            } else {
                audit.invalid_entries += 1;
                issues.push(if record.integrity().is_none() {
                    "missing integrity stamp".to_string()
                } else {
                    "hash mismatch".to_string()
                });
            }

            let chain_valid = index == 0 || Self::verify_chain(record, &records[index - 1]);
            if !chain_valid {
                audit.chain_breaks += 1;
                issues.push(format!("chain break with record {}", index - 1));
            }

            audit.details.push(AuditDetail {
                index,
                hash_valid,
                chain_valid,
                issues,
            });
        }

        if !audit.is_intact() {
            tracing::error!(
                total = audit.total_entries,
                invalid = audit.invalid_entries,
                chain_breaks = audit.chain_breaks,
                "Audit sequence integrity violation"
            );
        }

        audit
    }

    fn generate_salt(&self) -> String {
        let mut salt = vec![0u8; self.config.salt_bytes];
        OsRng.fill_bytes(&mut salt);
        hex::encode(salt)
    }

    fn compute_hash(&self, canonical: &str, salt: &str) -> String {
        sha256_hex(&[
            canonical.as_bytes(),
            salt.as_bytes(),
            self.config.secret.as_bytes(),
        ])
    }
}

fn canonical_without_stamp<T: Stamped>(record: &T) -> Result<String> {
    if record.integrity().is_none() {
        return to_canonical_string(record);
    }
    let mut bare = record.clone();
    bare.set_integrity(None);
    to_canonical_string(&bare)
}
