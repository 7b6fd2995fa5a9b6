//! Secret custody — AES-256-GCM encryption of secret values at rest, plus
//! a bounded ring of access events.
//!
//! The store keeps only ciphertext; this module owns the cipher. The wire
//! layout is `nonce (12 bytes) || ciphertext`, base64-encoded for storage.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::SecretError;

/// Encrypts and decrypts secret values with AES-256-GCM.
pub struct SecretCipher {
    cipher: Aes256Gcm,
    /// Identifier of the key material in use, recorded on each secret row
    /// so rotation can tell old ciphertext from new.
    key_id: String,
}

impl SecretCipher {
    /// Create a cipher from a raw 32-byte key.
    pub fn from_key(key: &[u8], key_id: impl Into<String>) -> Result<Self, SecretError> {
        if key.len() != 32 {
            return Err(SecretError::InvalidKeyLength { got: key.len() });
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| SecretError::EncryptFailed { message: e.to_string() })?;
        Ok(Self {
            cipher,
            key_id: key_id.into(),
        })
    }

    /// Create a cipher from a base64-encoded 32-byte key, as carried in the
    /// `SHIPMATE_SECRET_KEY` environment variable.
    pub fn from_base64(encoded: &str, key_id: impl Into<String>) -> Result<Self, SecretError> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| SecretError::DecryptFailed { message: e.to_string() })?;
        Self::from_key(&key, key_id)
    }

    /// The key id recorded on rows encrypted by this cipher.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt a plaintext value. Returns base64 of `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::EncryptFailed { message: e.to_string() })?;
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretError> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| SecretError::DecryptFailed { message: e.to_string() })?;
        if combined.len() < 12 {
            return Err(SecretError::DecryptFailed {
                message: "data too short to contain nonce".into(),
            });
        }
        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SecretError::DecryptFailed { message: e.to_string() })?;
        String::from_utf8(plaintext)
            .map_err(|e| SecretError::DecryptFailed { message: e.to_string() })
    }
}

/// What happened to a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretAccess {
    Stored,
    Retrieved,
    Deleted,
    DecryptFailed,
}

/// One secret access event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub access: SecretAccess,
    pub actor: String,
}

/// Bounded ring of secret access events.
#[derive(Debug)]
pub struct SecretAuditRing {
    entries: Mutex<VecDeque<SecretAuditEntry>>,
    capacity: usize,
}

impl SecretAuditRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(50),
        }
    }

    pub fn record(&self, name: impl Into<String>, access: SecretAccess, actor: impl Into<String>) {
        let mut entries = self.entries.lock().expect("secret audit lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(SecretAuditEntry {
            timestamp: Utc::now(),
            name: name.into(),
            access,
            actor: actor.into(),
        });
    }

    pub fn recent(&self, n: usize) -> Vec<SecretAuditEntry> {
        let entries = self.entries.lock().expect("secret audit lock poisoned");
        entries.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("secret audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SecretAuditRing {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Store/retrieve secrets by name, with every access audited.
///
/// The narrow façade skills use: plaintext goes in, plaintext comes out,
/// and only ciphertext ever touches the store.
pub struct SecretVault {
    store: std::sync::Arc<crate::store::Store>,
    cipher: SecretCipher,
    audit: SecretAuditRing,
}

impl SecretVault {
    pub fn new(store: std::sync::Arc<crate::store::Store>, cipher: SecretCipher) -> Self {
        Self {
            store,
            cipher,
            audit: SecretAuditRing::default(),
        }
    }

    /// Encrypt and store a secret under `name`.
    pub fn store_secret(
        &self,
        name: &str,
        plaintext: &str,
        owner: &str,
    ) -> Result<(), crate::error::ShipmateError> {
        let encrypted = self.cipher.encrypt(plaintext)?;
        self.store
            .put_secret(name, &encrypted, self.cipher.key_id(), owner)?;
        self.audit.record(name, SecretAccess::Stored, owner);
        Ok(())
    }

    /// Retrieve and decrypt a secret.
    pub fn retrieve_secret(
        &self,
        name: &str,
        actor: &str,
    ) -> Result<String, crate::error::ShipmateError> {
        let Some(row) = self.store.get_secret(name)? else {
            return Err(SecretError::NotFound {
                name: name.to_string(),
            }
            .into());
        };
        match self.cipher.decrypt(&row.encrypted_value) {
            Ok(plaintext) => {
                self.audit.record(name, SecretAccess::Retrieved, actor);
                Ok(plaintext)
            }
            Err(e) => {
                self.audit.record(name, SecretAccess::DecryptFailed, actor);
                Err(e.into())
            }
        }
    }

    /// Delete a secret. Returns whether it existed.
    pub fn delete_secret(
        &self,
        name: &str,
        actor: &str,
    ) -> Result<bool, crate::error::ShipmateError> {
        let existed = self.store.delete_secret(name)?;
        if existed {
            self.audit.record(name, SecretAccess::Deleted, actor);
        }
        Ok(existed)
    }

    /// Names of stored secrets.
    pub fn list_names(&self) -> Result<Vec<String>, crate::error::ShipmateError> {
        Ok(self.store.list_secret_names()?)
    }

    /// The access audit ring.
    pub fn audit(&self) -> &SecretAuditRing {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_key(&[7u8; 32], "k1").unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let c = cipher();
        let encrypted = c.encrypt("ghp_supersecret").unwrap();
        assert_ne!(encrypted, "ghp_supersecret");
        assert_eq!(c.decrypt(&encrypted).unwrap(), "ghp_supersecret");
    }

    #[test]
    fn test_nonce_makes_ciphertext_unique() {
        let c = cipher();
        let a = c.encrypt("same value").unwrap();
        let b = c.encrypt("same value").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_decrypt() {
        let a = cipher();
        let b = SecretCipher::from_key(&[9u8; 32], "k2").unwrap();
        let encrypted = a.encrypt("value").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            SecretCipher::from_key(&[0u8; 16], "short"),
            Err(SecretError::InvalidKeyLength { got: 16 })
        ));
    }

    #[test]
    fn test_tampered_data_rejected() {
        let c = cipher();
        let mut encrypted = c.encrypt("value").unwrap();
        encrypted.replace_range(..4, "AAAA");
        assert!(c.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_vault_roundtrip_with_audit() {
        let store = std::sync::Arc::new(crate::store::Store::open_in_memory().unwrap());
        let vault = SecretVault::new(store, cipher());

        vault.store_secret("gh-token", "ghp_abc123", "u1").unwrap();
        assert_eq!(vault.retrieve_secret("gh-token", "u1").unwrap(), "ghp_abc123");
        assert_eq!(vault.list_names().unwrap(), vec!["gh-token"]);
        assert!(vault.delete_secret("gh-token", "u1").unwrap());

        let accesses: Vec<SecretAccess> =
            vault.audit().recent(10).iter().map(|e| e.access).collect();
        assert_eq!(
            accesses,
            vec![SecretAccess::Stored, SecretAccess::Retrieved, SecretAccess::Deleted]
        );
    }

    #[test]
    fn test_vault_missing_secret() {
        let store = std::sync::Arc::new(crate::store::Store::open_in_memory().unwrap());
        let vault = SecretVault::new(store, cipher());
        assert!(vault.retrieve_secret("ghost", "u1").is_err());
        assert!(!vault.delete_secret("ghost", "u1").unwrap());
    }

    #[test]
    fn test_audit_ring_bounds() {
        let ring = SecretAuditRing::new(50);
        for i in 0..60 {
            ring.record(format!("s{i}"), SecretAccess::Retrieved, "u1");
        }
        assert_eq!(ring.len(), 50);
        let recent = ring.recent(5);
        assert_eq!(recent.last().unwrap().name, "s59");
    }
}
