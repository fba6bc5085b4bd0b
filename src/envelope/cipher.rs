//! Transform parsing and the payload cipher delegates.
//!
//! A `CipherSpec` is resolved either from a key's configuration document (on
//! encrypt) or from a persisted container (on decrypt). Three transforms are
//! supported: AES-256-GCM, AES-256-CBC with PKCS5/7 padding, and a no-op mode
//! that exists solely for failure-path testing. Everything else is a
//! configuration error.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::envelope::container::CiphertextContainer;
use crate::errors::{FieldVaultError, Result};
use crate::keys::KeyConfiguration;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// GCM nonce size in bytes.
const GCM_IV_LEN: usize = 12;

/// CBC initialization vector size in bytes (one AES block).
const CBC_IV_LEN: usize = 16;

/// The only tag size the GCM primitive produces.
const GCM_TAG_BITS: u32 = 128;

/// The only key size this crate encrypts under.
const KEY_SIZE_BITS: u32 = 256;

/// How the payload bytes are transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Authenticated encryption; requires a tag length.
    Gcm { tag_bits: u32 },
    /// Unauthenticated block mode, kept for stores written before GCM.
    Cbc,
    /// Pass-through. Never use outside failure-path tests.
    Noop,
}

/// Fully resolved transform: algorithm, mode, padding, and key size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    pub mode: CipherMode,
}

impl CipherSpec {
    /// Resolve the transform a key's configuration asks for. Missing fields
    /// fall back to AES-256-GCM with a 128-bit tag; present-but-unsupported
    /// values are configuration errors.
    pub fn from_configuration(config: &KeyConfiguration) -> Result<Self> {
        Self::resolve(
            config.algorithm.as_deref(),
            config.mode.as_deref(),
            config.padding.as_deref(),
            config.key_size,
            config.gcm_tag_length,
        )
    }

    /// Resolve the transform a persisted container was written under.
    pub fn from_container(container: &CiphertextContainer) -> Result<Self> {
        Self::resolve(
            Some(&container.algorithm),
            Some(&container.mode),
            Some(&container.padding),
            container.key_size,
            container.gcm_tag_length,
        )
    }

    fn resolve(
        algorithm: Option<&str>,
        mode: Option<&str>,
        padding: Option<&str>,
        key_size: Option<u32>,
        gcm_tag_length: Option<u32>,
    ) -> Result<Self> {
        match algorithm {
            None => {}
            Some(a) if a.eq_ignore_ascii_case("AES") => {}
            Some(a) => {
                return Err(FieldVaultError::Configuration(format!(
                    "unsupported algorithm '{a}'"
                )))
            }
        }

        if let Some(bits) = key_size {
            if bits != KEY_SIZE_BITS {
                return Err(FieldVaultError::Configuration(format!(
                    "unsupported key size {bits}; only {KEY_SIZE_BITS}-bit keys are supported"
                )));
            }
        }

        let mode = match mode.map(str::to_ascii_uppercase).as_deref() {
            None | Some("GCM") => {
                let tag_bits = gcm_tag_length.unwrap_or(GCM_TAG_BITS);
                if tag_bits != GCM_TAG_BITS {
                    return Err(FieldVaultError::Configuration(format!(
                        "unsupported GCM tag length {tag_bits}; only {GCM_TAG_BITS} is supported"
                    )));
                }
                CipherMode::Gcm { tag_bits }
            }
            Some("CBC") => CipherMode::Cbc,
            Some("NONE") => CipherMode::Noop,
            Some(m) => {
                return Err(FieldVaultError::Configuration(format!(
                    "unsupported cipher mode '{m}'"
                )))
            }
        };

        if let Some(p) = padding {
            let ok = match mode {
                CipherMode::Gcm { .. } | CipherMode::Noop => {
                    p.eq_ignore_ascii_case("NoPadding") || p.is_empty()
                }
                CipherMode::Cbc => {
                    p.eq_ignore_ascii_case("PKCS5Padding")
                        || p.eq_ignore_ascii_case("PKCS5")
                        || p.eq_ignore_ascii_case("PKCS7Padding")
                        || p.eq_ignore_ascii_case("PKCS7")
                }
            };
            if !ok {
                return Err(FieldVaultError::Configuration(format!(
                    "unsupported padding '{p}' for mode {mode:?}"
                )));
            }
        }

        Ok(Self { mode })
    }

    /// Wire name of the mode.
    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            CipherMode::Gcm { .. } => "GCM",
            CipherMode::Cbc => "CBC",
            CipherMode::Noop => "NONE",
        }
    }

    /// Wire name of the padding implied by the mode.
    pub fn padding_name(&self) -> &'static str {
        match self.mode {
            CipherMode::Gcm { .. } | CipherMode::Noop => "NoPadding",
            CipherMode::Cbc => "PKCS5Padding",
        }
    }

    /// A fresh random IV of the mode's size. Minted once per encrypt call,
    /// never reused, even when the DEK is.
    pub fn mint_iv(&self) -> Vec<u8> {
        let len = match self.mode {
            CipherMode::Gcm { .. } => GCM_IV_LEN,
            CipherMode::Cbc => CBC_IV_LEN,
            CipherMode::Noop => 0,
        };
        let mut iv = vec![0u8; len];
        rand::rng().fill_bytes(&mut iv);
        iv
    }

    /// Write the transform parameters onto a container.
    pub fn apply_to(&self, container: &mut CiphertextContainer) {
        container.algorithm = "AES".to_string();
        container.mode = self.mode_name().to_string();
        container.padding = self.padding_name().to_string();
        container.key_size = Some(KEY_SIZE_BITS);
        container.gcm_tag_length = match self.mode {
            CipherMode::Gcm { tag_bits } => Some(tag_bits),
            _ => None,
        };
    }

    /// Encrypt `plaintext` under `key` with `iv` per this transform.
    pub fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            CipherMode::Gcm { .. } => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| {
                    FieldVaultError::Configuration(format!("invalid key length: {e}"))
                })?;
                cipher
                    .encrypt(Nonce::from_slice(iv), plaintext)
                    .map_err(|e| FieldVaultError::Configuration(format!("GCM encryption: {e}")))
            }
            CipherMode::Cbc => {
                let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|e| {
                    FieldVaultError::Configuration(format!("invalid key or IV length: {e}"))
                })?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            CipherMode::Noop => Ok(plaintext.to_vec()),
        }
    }

    /// Decrypt bytes produced by `encrypt` with the same key and IV. All
    /// cipher failures (bad tag, bad padding) surface as configuration
    /// errors; none of them are retryable without operator action.
    pub fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            CipherMode::Gcm { .. } => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| {
                    FieldVaultError::Configuration(format!("invalid key length: {e}"))
                })?;
                cipher
                    .decrypt(Nonce::from_slice(iv), ciphertext)
                    .map_err(|_| {
                        FieldVaultError::Configuration(
                            "GCM decryption failed: wrong key or corrupted data".to_string(),
                        )
                    })
            }
            CipherMode::Cbc => {
                let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|e| {
                    FieldVaultError::Configuration(format!("invalid key or IV length: {e}"))
                })?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).map_err(|_| {
                    FieldVaultError::Configuration(
                        "CBC decryption failed: bad padding".to_string(),
                    )
                })
            }
            CipherMode::Noop => Ok(ciphertext.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: &str) -> KeyConfiguration {
        KeyConfiguration {
            algorithm: Some("AES".to_string()),
            mode: Some(mode.to_string()),
            ..KeyConfiguration::default()
        }
    }

    #[test]
    fn empty_configuration_defaults_to_gcm() {
        let spec = CipherSpec::from_configuration(&KeyConfiguration::default()).unwrap();
        assert_eq!(spec.mode, CipherMode::Gcm { tag_bits: 128 });
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut cfg = config("GCM");
        cfg.algorithm = Some("DES".to_string());
        assert!(CipherSpec::from_configuration(&cfg).is_err());
    }

    #[test]
    fn wrong_tag_length_is_rejected() {
        let mut cfg = config("GCM");
        cfg.gcm_tag_length = Some(96);
        assert!(CipherSpec::from_configuration(&cfg).is_err());
    }

    #[test]
    fn cbc_rejects_no_padding() {
        let mut cfg = config("CBC");
        cfg.padding = Some("NoPadding".to_string());
        assert!(CipherSpec::from_configuration(&cfg).is_err());
    }

    #[test]
    fn gcm_round_trip() {
        let spec = CipherSpec::from_configuration(&config("GCM")).unwrap();
        let key = [7u8; 32];
        let iv = spec.mint_iv();
        let ct = spec.encrypt(&key, &iv, b"payload").unwrap();
        assert_eq!(spec.decrypt(&key, &iv, &ct).unwrap(), b"payload");
    }

    #[test]
    fn cbc_round_trip() {
        let spec = CipherSpec::from_configuration(&config("CBC")).unwrap();
        let key = [9u8; 32];
        let iv = spec.mint_iv();
        assert_eq!(iv.len(), 16);
        let ct = spec.encrypt(&key, &iv, b"block mode payload").unwrap();
        assert_eq!(spec.decrypt(&key, &iv, &ct).unwrap(), b"block mode payload");
    }

    #[test]
    fn noop_passes_bytes_through() {
        let spec = CipherSpec::from_configuration(&config("NONE")).unwrap();
        assert!(spec.mint_iv().is_empty());
        assert_eq!(spec.encrypt(&[], &[], b"x").unwrap(), b"x");
    }

    #[test]
    fn gcm_tampered_ciphertext_fails() {
        let spec = CipherSpec::from_configuration(&config("GCM")).unwrap();
        let key = [7u8; 32];
        let iv = spec.mint_iv();
        let mut ct = spec.encrypt(&key, &iv, b"payload").unwrap();
        ct[0] ^= 0xFF;
        assert!(spec.decrypt(&key, &iv, &ct).is_err());
    }
}
