use std::sync::Arc;

use crate::keys::CryptoKey;

/// Forces the protection machinery onto specific keys for one rekey pass.
///
/// An unset half leaves that half of the pipeline on the provider's current
/// keys, so an encryption pass does not disturb HMAC computation and vice
/// versa.
#[derive(Clone, Default)]
pub struct KeyOverlay {
    /// Encrypt under exactly this key instead of the tenant's current one.
    pub encryption_key: Option<Arc<CryptoKey>>,
    /// Hash under exactly this set instead of every active HMAC key.
    pub hmac_keys: Option<Vec<Arc<CryptoKey>>>,
}

impl KeyOverlay {
    pub fn for_encryption(key: Arc<CryptoKey>) -> Self {
        Self {
            encryption_key: Some(key),
            hmac_keys: None,
        }
    }

    pub fn for_hmac(keys: Vec<Arc<CryptoKey>>) -> Self {
        Self {
            encryption_key: None,
            hmac_keys: Some(keys),
        }
    }
}

impl std::fmt::Debug for KeyOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyOverlay")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|k| k.id.as_str()),
            )
            .field(
                "hmac_keys",
                &self
                    .hmac_keys
                    .as_ref()
                    .map(|ks| ks.iter().map(|k| k.id.as_str()).collect::<Vec<_>>()),
            )
            .finish()
    }
}
