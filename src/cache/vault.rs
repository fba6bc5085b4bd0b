//! In-memory vault for raw key bytes.
//!
//! Cached DEKs never sit in memory as plaintext: each entry is encrypted
//! under its own random AES-256 key and 96-bit IV, keyed by a random
//! identity. Removing an entry discards the wrap key, so the plaintext is
//! unrecoverable afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use tracing::error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::errors::{FieldVaultError, Result};

/// AES-256 wrap key size in bytes.
const WRAP_KEY_LEN: usize = 32;

/// GCM nonce size in bytes.
const NONCE_LEN: usize = 12;

struct VaultEntry {
    wrap_key: Zeroizing<Vec<u8>>,
    iv: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

/// Per-entry-encrypted store for secret bytes.
///
/// Safe for uncoordinated concurrent access; every entry is independent.
#[derive(Default)]
pub struct KeyVault {
    entries: RwLock<HashMap<Uuid, VaultEntry>>,
}

impl KeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt `bytes` under a fresh random key and store the result under a
    /// fresh random identity.
    pub fn put(&self, bytes: &[u8]) -> Result<Uuid> {
        let mut wrap_key = Zeroizing::new(vec![0u8; WRAP_KEY_LEN]);
        rand::rng().fill_bytes(&mut wrap_key);

        let mut iv = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new_from_slice(&wrap_key)
            .map_err(|e| FieldVaultError::EncryptionFailed(format!("invalid key length: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), bytes)
            .map_err(|e| FieldVaultError::EncryptionFailed(format!("vault encryption: {e}")))?;

        let id = Uuid::new_v4();
        self.entries.write().insert(
            id,
            VaultEntry {
                wrap_key,
                iv,
                ciphertext,
            },
        );
        Ok(id)
    }

    /// Decrypt the entry behind `id`, or `None` for an unknown identity.
    pub fn get(&self, id: &Uuid) -> Option<Zeroizing<Vec<u8>>> {
        let entries = self.entries.read();
        let entry = entries.get(id)?;

        let cipher = match Aes256Gcm::new_from_slice(&entry.wrap_key) {
            Ok(c) => c,
            Err(e) => {
                error!(%id, "vault entry has an invalid wrap key: {e}");
                return None;
            }
        };
        match cipher.decrypt(Nonce::from_slice(&entry.iv), entry.ciphertext.as_slice()) {
            Ok(plaintext) => Some(Zeroizing::new(plaintext)),
            Err(_) => {
                // Entries are written once and never mutated, so this means
                // memory corruption rather than a caller mistake.
                error!(%id, "vault entry failed authentication");
                None
            }
        }
    }

    /// Discard the entry behind `id`. Returns whether it existed.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Scoped handle pairing a cached DEK with its vault entry.
///
/// Acquiring inserts the raw DEK into the vault; dropping the last clone of
/// the holder removes it. That one-to-one pairing is what keeps vault
/// entries from leaking or being freed twice.
pub struct CachedWrappedKeyHolder {
    key_id: String,
    wrapped: String,
    vault: Arc<KeyVault>,
    vault_ref: Uuid,
}

impl CachedWrappedKeyHolder {
    /// Store `dek` in the vault and bind this holder to the entry.
    pub fn acquire(
        vault: Arc<KeyVault>,
        key_id: impl Into<String>,
        wrapped: impl Into<String>,
        dek: &[u8],
    ) -> Result<Self> {
        let vault_ref = vault.put(dek)?;
        Ok(Self {
            key_id: key_id.into(),
            wrapped: wrapped.into(),
            vault,
            vault_ref,
        })
    }

    /// Identity the DEK travels under inside ciphertext containers.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The DEK's persistable wrapped form.
    pub fn wrapped(&self) -> &str {
        &self.wrapped
    }

    /// Raw DEK bytes, decrypted out of the vault.
    pub fn dek(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.vault.get(&self.vault_ref)
    }
}

impl Drop for CachedWrappedKeyHolder {
    fn drop(&mut self) {
        self.vault.remove(&self.vault_ref);
    }
}

impl std::fmt::Debug for CachedWrappedKeyHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedWrappedKeyHolder")
            .field("key_id", &self.key_id)
            .field("vault_ref", &self.vault_ref)
            .finish_non_exhaustive()
    }
}
