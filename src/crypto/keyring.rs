//! Versioned symmetric key ring
//!
//! Holds every key generation ever issued. Exactly one key is active for
//! new encryptions; retired keys stay available for decryption. The key
//! map and the active version live behind one lock, so a rotation is
//! observed all at once or not at all.

use crate::clock::Clock;
use crate::config::EncryptionConfig;
use crate::error::{AuditError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

/// One generation of key material
pub struct EncryptionKey {
    /// Unique key identifier (key-<uuid>)
    pub id: String,

    /// Monotonic version number, starting at 1
    pub version: u32,

    /// When the key was generated
    pub created_at: DateTime<Utc>,

    /// When the key is due for rotation
    pub expires_at: DateTime<Utc>,

    /// Whether new encryptions use this key
    pub active: bool,

    material: [u8; 32],
    cipher: Aes256Gcm,
}

impl EncryptionKey {
    fn generate(version: u32, now: DateTime<Utc>, lifetime: chrono::Duration) -> Result<Self> {
        let mut material = [0u8; 32];
        OsRng.fill_bytes(&mut material);
        let cipher = Aes256Gcm::new_from_slice(&material).map_err(|e| {
            AuditError::Encryption(format!("Failed to initialize cipher: {}", e))
        })?;

        Ok(Self {
            id: format!("key-{}", uuid::Uuid::new_v4()),
            version,
            created_at: now,
            expires_at: now + lifetime,
            active: true,
            material,
            cipher,
        })
    }

    /// Raw key bytes
    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }

    /// Metadata view without key material
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            version: self.version,
            created_at: self.created_at,
            expires_at: self.expires_at,
            active: self.active,
        }
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("active", &self.active)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Key metadata safe to log or export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

struct KeyRingState {
    keys: BTreeMap<u32, EncryptionKey>,
    active_version: u32,
}

/// Owner of all key generations
pub struct KeyRing {
    state: RwLock<KeyRingState>,
    master_key_id: String,
    rotation_period: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl KeyRing {
    /// Create a key ring holding a freshly generated version 1 key
    pub fn new(config: &EncryptionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().into_result("encryption")?;

        let rotation_period = config.rotation_period();
        let first = EncryptionKey::generate(1, clock.now(), rotation_period)?;
        let mut keys = BTreeMap::new();
        keys.insert(1, first);

        tracing::info!(
            master_key_id = %config.master_key_id,
            version = 1,
            "Key ring initialized"
        );

        Ok(Self {
            state: RwLock::new(KeyRingState {
                keys,
                active_version: 1,
            }),
            master_key_id: config.master_key_id.clone(),
            rotation_period,
            clock,
        })
    }

    /// Generate the next key version and make it active
    ///
    /// The previous key is deactivated but retained for decryption.
    pub fn rotate(&self) -> Result<u32> {
        let mut state = self.write_state()?;
        self.rotate_locked(&mut state)
    }

    /// Rotate only when the active key has reached the rotation period
    ///
    /// The check and the rotation happen under one write lock, so
    /// concurrent callers rotate at most once per period.
    pub fn rotate_if_due(&self) -> Result<Option<u32>> {
        let mut state = self.write_state()?;
        if !self.due(&state) {
            return Ok(None);
        }
        self.rotate_locked(&mut state).map(Some)
    }

    /// Whether the active key has reached the rotation period
    pub fn is_rotation_due(&self) -> bool {
        let Ok(state) = self.state.read() else {
            tracing::error!("Key ring lock poisoned, reporting rotation as due");
            return true;
        };
        self.due(&state)
    }

    fn due(&self, state: &KeyRingState) -> bool {
        match state.keys.get(&state.active_version) {
            Some(key) => self.clock.now() - key.created_at >= self.rotation_period,
            None => true,
        }
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, KeyRingState>> {
        self.state
            .write()
            .map_err(|e| AuditError::Encryption(format!("Failed to acquire key lock: {}", e)))
    }

    fn rotate_locked(&self, state: &mut KeyRingState) -> Result<u32> {
        let next_version = state.active_version + 1;
        let key = EncryptionKey::generate(next_version, self.clock.now(), self.rotation_period)?;

        let previous = state.active_version;
        if let Some(old) = state.keys.get_mut(&previous) {
            old.active = false;
        }
        state.keys.insert(next_version, key);
        state.active_version = next_version;

        tracing::info!(
            master_key_id = %self.master_key_id,
            previous_version = previous,
            version = next_version,
            "Encryption key rotated"
        );

        Ok(next_version)
    }

    /// Run `f` against the active key under a consistent view of the ring
    pub(crate) fn with_active<R>(
        &self,
        f: impl FnOnce(&EncryptionKey) -> Result<R>,
    ) -> Result<R> {
        let state = self.state.read().map_err(|e| {
            AuditError::Encryption(format!("Failed to acquire key lock: {}", e))
        })?;
        let key = state
            .keys
            .get(&state.active_version)
            .filter(|k| k.active)
            .ok_or_else(|| AuditError::Encryption("No active encryption key".to_string()))?;
        f(key)
    }

    /// Run `f` against a specific key version
    pub(crate) fn with_version<R>(
        &self,
        version: u32,
        f: impl FnOnce(&EncryptionKey) -> Result<R>,
    ) -> Result<R> {
        let state = self.state.read().map_err(|e| {
            AuditError::Decryption(format!("Failed to acquire key lock: {}", e))
        })?;
        let key = state
            .keys
            .get(&version)
            .ok_or(AuditError::KeyNotFound { version })?;
        f(key)
    }

    /// Version used for new encryptions
    pub fn active_version(&self) -> u32 {
        self.state.read().map(|s| s.active_version).unwrap_or(0)
    }

    /// All retained key versions, ascending
    pub fn versions(&self) -> Vec<u32> {
        self.state
            .read()
            .map(|s| s.keys.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Metadata for all retained keys, ascending by version
    pub fn keys(&self) -> Vec<KeyInfo> {
        self.state
            .read()
            .map(|s| s.keys.values().map(EncryptionKey::info).collect())
            .unwrap_or_default()
    }

    /// Number of retained keys
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn master_key_id(&self) -> &str {
        &self.master_key_id
    }
}
