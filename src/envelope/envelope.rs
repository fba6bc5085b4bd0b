//! Envelope encryption: payloads under a DEK, the DEK wrapped by the
//! tenant's key-encryption key.
//!
//! Two variants share one shape. `EnvelopeEncryptionService` mints a fresh
//! DEK per call, paying one wrap per encryption. The cached variant reuses a
//! "current" DEK until its freshness window elapses, amortizing the wrap
//! cost across many writes; the raw DEK bytes only ever sit in the
//! `KeyVault`, and every call still mints a fresh IV because DEK+IV reuse
//! breaks GCM confidentiality.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cache::{CachedWrappedKeyHolder, EphemeralKeyCache, KeyVault};
use crate::config::CacheSettings;
use crate::envelope::cipher::CipherSpec;
use crate::envelope::container::CiphertextContainer;
use crate::envelope::service::EncryptionService;
use crate::errors::{FieldVaultError, Result};
use crate::keys::CryptoKey;
use crate::search::holder::HmacHolder;

/// DEK size in bytes (AES-256).
const DEK_LEN: usize = 32;

fn mint_dek() -> Zeroizing<Vec<u8>> {
    let mut dek = Zeroizing::new(vec![0u8; DEK_LEN]);
    rand::rng().fill_bytes(&mut dek);
    dek
}

fn build_container(
    spec: &CipherSpec,
    key: &CryptoKey,
    iv: &[u8],
    ciphertext: &[u8],
    dek_id: &str,
    wrapped_dek: &str,
) -> CiphertextContainer {
    let mut container = CiphertextContainer {
        key_id: Some(key.id.clone()),
        algorithm: String::new(),
        mode: String::new(),
        padding: String::new(),
        key_size: None,
        gcm_tag_length: None,
        iv: BASE64.encode(iv),
        cipher_text: BASE64.encode(ciphertext),
        data_encryption_key_id: Some(dek_id.to_string()),
        data_encryption_key: Some(wrapped_dek.to_string()),
        extra: serde_json::Map::new(),
    };
    spec.apply_to(&mut container);
    container
}

fn decode_payload(container: &CiphertextContainer) -> Result<(Vec<u8>, Vec<u8>)> {
    let iv = BASE64
        .decode(&container.iv)
        .map_err(|e| FieldVaultError::InvalidContainer(format!("bad IV: {e}")))?;
    let ciphertext = BASE64
        .decode(&container.cipher_text)
        .map_err(|e| FieldVaultError::InvalidContainer(format!("bad ciphertext: {e}")))?;
    Ok((iv, ciphertext))
}

fn wrapped_dek(container: &CiphertextContainer) -> Result<&str> {
    container.data_encryption_key.as_deref().ok_or_else(|| {
        FieldVaultError::InvalidContainer("container carries no wrapped DEK".to_string())
    })
}

/// Envelope service that mints a fresh random DEK per encrypt call.
pub struct EnvelopeEncryptionService {
    base: Arc<dyn EncryptionService>,
}

impl EnvelopeEncryptionService {
    pub fn new(base: Arc<dyn EncryptionService>) -> Self {
        Self { base }
    }
}

impl EncryptionService for EnvelopeEncryptionService {
    fn encrypt(&self, key: &CryptoKey, plaintext: &[u8]) -> Result<CiphertextContainer> {
        let spec = CipherSpec::from_configuration(&key.configuration)?;

        let dek = mint_dek();
        let wrapped = self.base.encrypt(key, &dek)?.to_json()?;
        let dek_id = Uuid::new_v4().to_string();

        let iv = spec.mint_iv();
        let ciphertext = spec.encrypt(&dek, &iv, plaintext)?;
        Ok(build_container(&spec, key, &iv, &ciphertext, &dek_id, &wrapped))
    }

    fn decrypt(&self, container: &CiphertextContainer) -> Result<Vec<u8>> {
        let spec = CipherSpec::from_container(container)?;
        let wrapped = CiphertextContainer::from_json(wrapped_dek(container)?)?;
        let dek = Zeroizing::new(self.base.decrypt(&wrapped)?);

        let (iv, ciphertext) = decode_payload(container)?;
        spec.decrypt(&dek, &iv, &ciphertext)
    }

    fn hmac(&self, holders: &mut [HmacHolder]) -> Result<()> {
        self.base.hmac(holders)
    }
}

/// Envelope service with a short-lived DEK cache.
///
/// Encrypt reuses the "current" DEK until its absolute TTL elapses; at most
/// one DEK is minted per freshness window across all threads because the
/// get-or-mint sequence runs under one mutex. Decrypt caches unwrapped DEKs
/// by identity under the longer sliding TTL, since many historical records
/// share one DEK.
pub struct CachedEnvelopeEncryptionService {
    base: Arc<dyn EncryptionService>,
    vault: Arc<KeyVault>,
    cache: EphemeralKeyCache<String, Arc<CachedWrappedKeyHolder>>,
    mint_lock: Mutex<()>,
}

impl CachedEnvelopeEncryptionService {
    pub fn new(base: Arc<dyn EncryptionService>, settings: &CacheSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            base,
            vault: Arc::new(KeyVault::new()),
            cache: EphemeralKeyCache::new(
                settings.entry_ttl(),
                settings.current_ttl(),
                settings.sweep_interval(),
            ),
            mint_lock: Mutex::new(()),
        })
    }

    /// The current DEK, minting and wrapping a new one if the slot is empty
    /// or stale.
    fn current_dek(
        &self,
        key: &CryptoKey,
    ) -> Result<(Arc<CachedWrappedKeyHolder>, Zeroizing<Vec<u8>>)> {
        let _guard = self.mint_lock.lock();

        if let Some(holder) = self.cache.get_current() {
            // The vault entry can be gone if clear() raced this call.
            if let Some(dek) = holder.dek() {
                return Ok((holder, dek));
            }
        }

        let dek = mint_dek();
        let wrapped = self.base.encrypt(key, &dek)?.to_json()?;
        let dek_id = Uuid::new_v4().to_string();
        let holder = Arc::new(CachedWrappedKeyHolder::acquire(
            Arc::clone(&self.vault),
            dek_id.clone(),
            wrapped,
            &dek,
        )?);
        debug!(dek_id, key_id = %key.id, "minted new current DEK");

        self.cache.put_current(Arc::clone(&holder));
        // Fresh records decrypt through the keyed side without an unwrap.
        self.cache.put(dek_id, Arc::clone(&holder));
        Ok((holder, dek))
    }

    /// Drop every cached DEK and stop the sweep. Idempotent.
    pub fn shutdown(&self) {
        self.cache.clear();
        self.cache.shutdown();
    }
}

impl EncryptionService for CachedEnvelopeEncryptionService {
    fn encrypt(&self, key: &CryptoKey, plaintext: &[u8]) -> Result<CiphertextContainer> {
        let spec = CipherSpec::from_configuration(&key.configuration)?;
        let (holder, dek) = self.current_dek(key)?;

        let iv = spec.mint_iv();
        let ciphertext = spec.encrypt(&dek, &iv, plaintext)?;
        Ok(build_container(
            &spec,
            key,
            &iv,
            &ciphertext,
            holder.key_id(),
            holder.wrapped(),
        ))
    }

    fn decrypt(&self, container: &CiphertextContainer) -> Result<Vec<u8>> {
        let spec = CipherSpec::from_container(container)?;
        let dek_id = container.data_encryption_key_id.as_deref().ok_or_else(|| {
            FieldVaultError::InvalidContainer("container names no DEK identity".to_string())
        })?;

        let dek = match self.cache.get(&dek_id.to_string()).and_then(|h| h.dek()) {
            Some(dek) => dek,
            None => {
                let wrapped = CiphertextContainer::from_json(wrapped_dek(container)?)?;
                let dek = Zeroizing::new(self.base.decrypt(&wrapped)?);
                let holder = Arc::new(CachedWrappedKeyHolder::acquire(
                    Arc::clone(&self.vault),
                    dek_id,
                    wrapped_dek(container)?,
                    &dek,
                )?);
                self.cache.put(dek_id.to_string(), holder);
                dek
            }
        };

        let (iv, ciphertext) = decode_payload(container)?;
        spec.decrypt(&dek, &iv, &ciphertext)
    }

    fn hmac(&self, holders: &mut [HmacHolder]) -> Result<()> {
        self.base.hmac(holders)
    }
}
