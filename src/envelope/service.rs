//! The encryption-service seam and the software-keystore implementation.
//!
//! Everything that touches key material goes through `EncryptionService`.
//! `LocalEncryptionService` resolves base64 material straight from the key's
//! configuration document, which is the software-keystore form; HSM/KMS
//! deployments replace the whole implementation behind the same trait and
//! the envelope layer never notices.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::envelope::cipher::CipherSpec;
use crate::envelope::container::CiphertextContainer;
use crate::errors::{FieldVaultError, Result};
use crate::keys::{CryptoKey, CryptoKeyProvider};
use crate::search::holder::HmacHolder;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric encryption and keyed hashing against tenant keys.
///
/// `hmac` is a bulk operation that mutates holders in place: each holder
/// with a non-null hash input gets its hash slot filled; holders without
/// input are left untouched, because the HMAC of null is null.
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, key: &CryptoKey, plaintext: &[u8]) -> Result<CiphertextContainer>;

    fn decrypt(&self, container: &CiphertextContainer) -> Result<Vec<u8>>;

    fn hmac(&self, holders: &mut [HmacHolder]) -> Result<()>;
}

/// Base implementation over key material stored in the key configuration.
pub struct LocalEncryptionService {
    provider: Arc<dyn CryptoKeyProvider>,
}

impl LocalEncryptionService {
    pub fn new(provider: Arc<dyn CryptoKeyProvider>) -> Self {
        Self { provider }
    }

    fn key_material(key: &CryptoKey) -> Result<Zeroizing<Vec<u8>>> {
        let encoded = key.configuration.key_material.as_deref().ok_or_else(|| {
            FieldVaultError::Configuration(format!(
                "key '{}' carries no key material; use an external EncryptionService",
                key.id
            ))
        })?;
        let material = BASE64.decode(encoded).map_err(|e| {
            FieldVaultError::Configuration(format!("key '{}' material is not base64: {e}", key.id))
        })?;
        Ok(Zeroizing::new(material))
    }
}

impl EncryptionService for LocalEncryptionService {
    fn encrypt(&self, key: &CryptoKey, plaintext: &[u8]) -> Result<CiphertextContainer> {
        let spec = CipherSpec::from_configuration(&key.configuration)?;
        let material = Self::key_material(key)?;

        let iv = spec.mint_iv();
        let ciphertext = spec.encrypt(&material, &iv, plaintext)?;

        let mut container = CiphertextContainer {
            key_id: Some(key.id.clone()),
            algorithm: String::new(),
            mode: String::new(),
            padding: String::new(),
            key_size: None,
            gcm_tag_length: None,
            iv: BASE64.encode(&iv),
            cipher_text: BASE64.encode(&ciphertext),
            data_encryption_key_id: None,
            data_encryption_key: None,
            extra: serde_json::Map::new(),
        };
        spec.apply_to(&mut container);
        Ok(container)
    }

    fn decrypt(&self, container: &CiphertextContainer) -> Result<Vec<u8>> {
        let key_id = container.key_id.as_deref().ok_or_else(|| {
            FieldVaultError::InvalidContainer("container names no key".to_string())
        })?;
        let key = self
            .provider
            .get_by_id(key_id)?
            .ok_or_else(|| FieldVaultError::KeyNotFound(key_id.to_string()))?;

        let spec = CipherSpec::from_container(container)?;
        let material = Self::key_material(&key)?;

        let iv = BASE64
            .decode(&container.iv)
            .map_err(|e| FieldVaultError::InvalidContainer(format!("bad IV: {e}")))?;
        let ciphertext = BASE64
            .decode(&container.cipher_text)
            .map_err(|e| FieldVaultError::InvalidContainer(format!("bad ciphertext: {e}")))?;

        spec.decrypt(&material, &iv, &ciphertext)
    }

    fn hmac(&self, holders: &mut [HmacHolder]) -> Result<()> {
        for holder in holders.iter_mut() {
            let Some(input) = holder.hash_input() else {
                continue;
            };
            let material = Self::key_material(&holder.key)?;
            let mut mac = HmacSha256::new_from_slice(&material)
                .map_err(|e| FieldVaultError::HmacError(format!("invalid HMAC key: {e}")))?;
            mac.update(input.as_bytes());
            holder.hash = Some(BASE64.encode(mac.finalize().into_bytes()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{InMemoryCryptoKeyProvider, KeyConfiguration, KeyUsage};

    fn test_key(id: &str, usage: KeyUsage) -> CryptoKey {
        CryptoKey {
            id: id.to_string(),
            key_type: "AES".to_string(),
            usage,
            configuration: KeyConfiguration {
                key_material: Some(BASE64.encode([0x42u8; 32])),
                ..KeyConfiguration::default()
            },
            key_start_time: None,
            tenant_id: "t1".to_string(),
            rekey_mode: None,
            created_date: Some(chrono::Utc::now()),
        }
    }

    fn service_with(keys: &[CryptoKey]) -> LocalEncryptionService {
        let provider = InMemoryCryptoKeyProvider::new();
        for key in keys {
            provider.upsert(key.clone());
        }
        LocalEncryptionService::new(Arc::new(provider))
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = test_key("k1", KeyUsage::Encryption);
        let service = service_with(std::slice::from_ref(&key));

        let container = service.encrypt(&key, b"plaintext").expect("encrypt failed");
        assert_eq!(container.key_id.as_deref(), Some("k1"));
        assert_eq!(container.mode, "GCM");
        assert_eq!(service.decrypt(&container).expect("decrypt failed"), b"plaintext");
    }

    #[test]
    fn decrypt_with_unknown_key_fails() {
        let key = test_key("k1", KeyUsage::Encryption);
        let service = service_with(&[]);
        let signing = service_with(std::slice::from_ref(&key));

        let container = signing.encrypt(&key, b"plaintext").unwrap();
        assert!(matches!(
            service.decrypt(&container),
            Err(FieldVaultError::KeyNotFound(_))
        ));
    }

    #[test]
    fn hmac_fills_only_holders_with_input() {
        let key = Arc::new(test_key("h1", KeyUsage::Hmac));
        let service = service_with(&[]);

        let mut holders = vec![
            HmacHolder::new(Arc::clone(&key), "email", Some("a@example.com".to_string())),
            HmacHolder::new(Arc::clone(&key), "phone", None),
        ];
        service.hmac(&mut holders).expect("hmac failed");
        assert!(holders[0].hash.is_some());
        assert!(holders[1].hash.is_none());
    }

    #[test]
    fn hmac_is_deterministic_per_key() {
        let key_a = Arc::new(test_key("a", KeyUsage::Hmac));
        let mut other_config = test_key("b", KeyUsage::Hmac);
        other_config.configuration.key_material = Some(BASE64.encode([0x24u8; 32]));
        let key_b = Arc::new(other_config);
        let service = service_with(&[]);

        let mut holders = vec![
            HmacHolder::new(Arc::clone(&key_a), "f", Some("value".to_string())),
            HmacHolder::new(Arc::clone(&key_a), "f", Some("value".to_string())),
            HmacHolder::new(key_b, "f", Some("value".to_string())),
        ];
        service.hmac(&mut holders).expect("hmac failed");
        assert_eq!(holders[0].hash, holders[1].hash);
        assert_ne!(holders[0].hash, holders[2].hash);
    }
}
