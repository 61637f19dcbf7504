//! Record and field encryption
//!
//! Records are serialized to sorted-key JSON (nulls kept) and sealed with AES-256-GCM
//! under the active key of a [`KeyRing`]. The key version is bound into
//! the authentication tag as associated data, and a SHA-256 checksum of
//! the plaintext travels with the payload and is re-checked after
//! decryption.
//!
//! Single attributes can be protected in place with
//! [`EncryptionEngine::encrypt_field`], which produces an
//! `enc:<ciphertext>:<keyVersion>` tag that fits in any string column.

pub mod keyring;

use crate::canonical::{sha256_hex, to_sorted_string};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigReport, EncryptionConfig};
use crate::error::{AuditError, Result};
use crate::metrics::{EncryptionMetrics, EncryptionMetricsSnapshot};
use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keyring::{EncryptionKey, KeyInfo, KeyRing};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Cipher identifier stored in every payload
pub const ALGORITHM: &str = "aes-256-gcm";

/// Prefix of encrypted field tags
pub const FIELD_PREFIX: &str = "enc";

const NONCE_LEN: usize = 12;

/// Encrypted record envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    /// Base64-encoded ciphertext including the GCM tag
    pub ciphertext: String,

    /// Base64-encoded 96-bit nonce
    pub iv: String,

    /// Version of the key that sealed this payload
    pub key_version: u32,

    /// Cipher identifier
    pub algorithm: String,

    /// Unix timestamp in milliseconds when the payload was produced
    pub timestamp: u64,

    /// Hex SHA-256 of the plaintext
    pub checksum: String,
}

/// An encrypted scalar, rendered as `enc:<ciphertext>:<keyVersion>`
///
/// `ciphertext` is the base64 encoding of `nonce || ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub ciphertext: String,
    pub key_version: u32,
}

impl EncryptedField {
    /// Check whether a string looks like an encrypted field tag
    pub fn is_encrypted(value: &str) -> bool {
        value.parse::<EncryptedField>().is_ok()
    }
}

impl fmt::Display for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", FIELD_PREFIX, self.ciphertext, self.key_version)
    }
}

impl FromStr for EncryptedField {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || AuditError::Decryption("Malformed encrypted field".to_string());

        let body = s
            .strip_prefix(FIELD_PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(malformed)?;
        let (ciphertext, version) = body.rsplit_once(':').ok_or_else(malformed)?;
        if ciphertext.is_empty() {
            return Err(malformed());
        }
        let key_version = version.parse::<u32>().map_err(|_| malformed())?;

        Ok(Self {
            ciphertext: ciphertext.to_string(),
            key_version,
        })
    }
}

/// Versioned-key encryption for audit records and individual fields
pub struct EncryptionEngine {
    config: EncryptionConfig,
    keyring: KeyRing,
    metrics: EncryptionMetrics,
    clock: Arc<dyn Clock>,
}

impl EncryptionEngine {
    /// Create an engine using the system clock
    pub fn new(config: EncryptionConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock
    pub fn with_clock(config: EncryptionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let keyring = KeyRing::new(&config, clock.clone())?;
        Ok(Self {
            config,
            keyring,
            metrics: EncryptionMetrics::default(),
            clock,
        })
    }

    /// Check the configured policy
    pub fn validate_configuration(&self) -> ConfigReport {
        self.config.validate()
    }

    /// Encrypt a whole record with the active key
    pub fn encrypt_record<T: Serialize + ?Sized>(&self, record: &T) -> Result<EncryptedPayload> {
        let started = Instant::now();
        let result = self.seal_record(record);
        match &result {
            Ok(payload) => {
                self.metrics.record_encrypt(started.elapsed());
                tracing::debug!(key_version = payload.key_version, "Record encrypted");
            }
            Err(e) => {
                self.metrics.record_encrypt_error();
                tracing::warn!(error = %e, "Record encryption failed");
            }
        }
        result
    }

    fn seal_record<T: Serialize + ?Sized>(&self, record: &T) -> Result<EncryptedPayload> {
        let plaintext = to_sorted_string(record)
            .map_err(|e| AuditError::Encryption(format!("Failed to serialize record: {}", e)))?;
        let checksum = sha256_hex(&[plaintext.as_bytes()]);

        let (nonce, ciphertext, key_version) = self
            .keyring
            .with_active(|key| {
                let (nonce, ciphertext) = seal(key, plaintext.as_bytes())?;
                Ok((nonce, ciphertext, key.version))
            })?;

        Ok(EncryptedPayload {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(nonce),
            key_version,
            algorithm: ALGORITHM.to_string(),
            timestamp: self.clock.now_millis(),
            checksum,
        })
    }

    /// Decrypt a payload with the key version it names
    pub fn decrypt_record<T: DeserializeOwned>(&self, payload: &EncryptedPayload) -> Result<T> {
        let started = Instant::now();
        let result = self.open_record(payload);
        match &result {
            Ok(_) => self.metrics.record_decrypt(started.elapsed()),
            Err(e) => {
                self.metrics.record_decrypt_error();
                if e.is_security_relevant() {
                    if matches!(e, AuditError::IntegrityViolation(_)) {
                        self.metrics.record_integrity_violation();
                    }
                    tracing::error!(
                        key_version = payload.key_version,
                        error = %e,
                        "Security-relevant decryption failure"
                    );
                } else {
                    tracing::warn!(key_version = payload.key_version, error = %e, "Decryption failed");
                }
            }
        }
        result
    }

    fn open_record<T: DeserializeOwned>(&self, payload: &EncryptedPayload) -> Result<T> {
        if payload.algorithm != ALGORITHM {
            return Err(AuditError::Decryption(format!(
                "Unsupported algorithm '{}'",
                payload.algorithm
            )));
        }

        let nonce = BASE64
            .decode(&payload.iv)
            .map_err(|e| AuditError::Decryption(format!("Invalid iv encoding: {}", e)))?;
        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .map_err(|e| AuditError::Decryption(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = self
            .keyring
            .with_version(payload.key_version, |key| open(key, &nonce, &ciphertext))?;

        let checksum = sha256_hex(&[&plaintext]);
        if checksum != payload.checksum {
            return Err(AuditError::IntegrityViolation(format!(
                "checksum mismatch for payload sealed with key version {}",
                payload.key_version
            )));
        }

        serde_json::from_slice(&plaintext)
            .map_err(|e| AuditError::Decryption(format!("Failed to deserialize record: {}", e)))
    }

    /// Encrypt a single scalar value
    pub fn encrypt_field(&self, value: &str) -> Result<EncryptedField> {
        let started = Instant::now();
        let result = self.keyring.with_active(|key| {
            let (nonce, ciphertext) = seal(key, value.as_bytes())?;
            let mut sealed = nonce;
            sealed.extend_from_slice(&ciphertext);
            Ok(EncryptedField {
                ciphertext: BASE64.encode(sealed),
                key_version: key.version,
            })
        });
        match &result {
            Ok(_) => self.metrics.record_encrypt(started.elapsed()),
            Err(_) => self.metrics.record_encrypt_error(),
        }
        result
    }

    /// Decrypt an `enc:<ciphertext>:<keyVersion>` tag
    pub fn decrypt_field(&self, encoded: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.open_field(encoded);
        match &result {
            Ok(_) => self.metrics.record_decrypt(started.elapsed()),
            Err(e) => {
                self.metrics.record_decrypt_error();
                tracing::warn!(error = %e, "Field decryption failed");
            }
        }
        result
    }

    fn open_field(&self, encoded: &str) -> Result<String> {
        let field: EncryptedField = encoded.parse()?;
        let sealed = BASE64
            .decode(&field.ciphertext)
            .map_err(|e| AuditError::Decryption(format!("Invalid field encoding: {}", e)))?;
        if sealed.len() < NONCE_LEN {
            return Err(AuditError::Decryption("Encrypted field too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let plaintext = self
            .keyring
            .with_version(field.key_version, |key| open(key, nonce, ciphertext))?;

        String::from_utf8(plaintext)
            .map_err(|e| AuditError::Decryption(format!("Field is not valid UTF-8: {}", e)))
    }

    /// Encrypt the named top-level string members of a JSON object in place
    ///
    /// Missing and non-string members are left untouched. Returns the
    /// number of members encrypted.
    pub fn encrypt_fields(&self, object: &mut serde_json::Value, fields: &[&str]) -> Result<usize> {
        let Some(map) = object.as_object_mut() else {
            return Err(AuditError::Encryption(
                "Field encryption requires a JSON object".to_string(),
            ));
        };

        let mut count = 0;
        for name in fields {
            if let Some(serde_json::Value::String(value)) = map.get_mut(*name) {
                if EncryptedField::is_encrypted(value) {
                    continue;
                }
                *value = self.encrypt_field(value)?.to_string();
                count += 1;
            }
        }
        Ok(count)
    }

    /// Decrypt every top-level member holding an encrypted field tag
    pub fn decrypt_fields(&self, object: &mut serde_json::Value) -> Result<usize> {
        let Some(map) = object.as_object_mut() else {
            return Err(AuditError::Decryption(
                "Field decryption requires a JSON object".to_string(),
            ));
        };

        let mut count = 0;
        for value in map.values_mut() {
            if let serde_json::Value::String(s) = value {
                if EncryptedField::is_encrypted(s) {
                    *s = self.decrypt_field(s)?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Generate a new active key, retaining the previous one for decryption
    pub fn rotate_key(&self) -> Result<u32> {
        let version = self.keyring.rotate()?;
        self.metrics.record_rotation();
        Ok(version)
    }

    /// Rotate only when the active key has reached the rotation period
    pub fn rotate_if_due(&self) -> Result<Option<u32>> {
        let rotated = self.keyring.rotate_if_due()?;
        if rotated.is_some() {
            self.metrics.record_rotation();
        }
        Ok(rotated)
    }

    /// Whether the active key has reached the rotation period
    pub fn is_rotation_due(&self) -> bool {
        self.keyring.is_rotation_due()
    }

    /// Version used for new encryptions
    pub fn active_version(&self) -> u32 {
        self.keyring.active_version()
    }

    /// Number of retained keys
    pub fn key_count(&self) -> usize {
        self.keyring.len()
    }

    /// All retained key versions, ascending
    pub fn key_versions(&self) -> Vec<u32> {
        self.keyring.versions()
    }

    /// Metadata for all retained keys
    pub fn keys(&self) -> Vec<KeyInfo> {
        self.keyring.keys()
    }

    pub fn metrics(&self) -> EncryptionMetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn associated_data(version: u32) -> Vec<u8> {
    format!("a3s-audit:key:{}", version).into_bytes()
}

fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let aad = associated_data(key.version);
    let ciphertext = key
        .cipher()
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| AuditError::Encryption(format!("Encryption failed: {}", e)))?;
    Ok((nonce.to_vec(), ciphertext))
}

fn open(key: &EncryptionKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(AuditError::Decryption(format!(
            "Invalid iv length {}, expected {}",
            nonce.len(),
            NONCE_LEN
        )));
    }
    let aad = associated_data(key.version);
    key.cipher()
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|e| AuditError::Decryption(format!("Decryption failed: {}", e)))
}
