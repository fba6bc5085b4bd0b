use std::collections::HashMap;

use parking_lot::RwLock;

use crate::errors::{FieldVaultError, Result};
use crate::keys::key::{current_encryption_key, CryptoKey, KeyUsage};

/// Source of truth for tenant keys.
///
/// Implementations are expected to be backed by the deployment's key store;
/// this crate only reads. `get_current_hmac_keys` returns every key that new
/// HMACs should be computed under, which during rotation is more than one.
pub trait CryptoKeyProvider: Send + Sync {
    /// Look up a single key by identity.
    fn get_by_id(&self, key_id: &str) -> Result<Option<CryptoKey>>;

    /// Active HMAC keys for a tenant, in no particular order.
    fn get_current_hmac_keys(&self, tenant_id: &str) -> Result<Vec<CryptoKey>>;

    /// Every key across all tenants. The rekey scheduler groups these itself.
    fn get_all_crypto_keys(&self) -> Result<Vec<CryptoKey>>;

    /// The tenant's current ENCRYPTION key: the most recently created one.
    fn get_current_encryption_key(&self, tenant_id: &str) -> Result<CryptoKey> {
        let keys = self.get_all_crypto_keys()?;
        current_encryption_key(&keys, tenant_id)
            .cloned()
            .ok_or_else(|| FieldVaultError::NoEncryptionKey(tenant_id.to_string()))
    }
}

/// Map-backed provider for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryCryptoKeyProvider {
    keys: RwLock<HashMap<String, CryptoKey>>,
}

impl InMemoryCryptoKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key.
    pub fn upsert(&self, key: CryptoKey) {
        self.keys.write().insert(key.id.clone(), key);
    }

    pub fn remove(&self, key_id: &str) -> Option<CryptoKey> {
        self.keys.write().remove(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl CryptoKeyProvider for InMemoryCryptoKeyProvider {
    fn get_by_id(&self, key_id: &str) -> Result<Option<CryptoKey>> {
        Ok(self.keys.read().get(key_id).cloned())
    }

    fn get_current_hmac_keys(&self, tenant_id: &str) -> Result<Vec<CryptoKey>> {
        // A retiring key stops signing new records immediately; existing
        // hashes under it survive until the rekey pass purges them.
        Ok(self
            .keys
            .read()
            .values()
            .filter(|k| {
                k.tenant_id == tenant_id && k.usage == KeyUsage::Hmac && !k.is_key_off()
            })
            .cloned()
            .collect())
    }

    fn get_all_crypto_keys(&self) -> Result<Vec<CryptoKey>> {
        Ok(self.keys.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key::{KeyConfiguration, RekeyMode};
    use chrono::{Duration, Utc};

    fn key(id: &str, tenant: &str, usage: KeyUsage, age_secs: i64) -> CryptoKey {
        CryptoKey {
            id: id.to_string(),
            key_type: "AES".to_string(),
            usage,
            configuration: KeyConfiguration::default(),
            key_start_time: None,
            tenant_id: tenant.to_string(),
            rekey_mode: None,
            created_date: Some(Utc::now() - Duration::seconds(age_secs)),
        }
    }

    #[test]
    fn current_encryption_key_is_most_recent() {
        let provider = InMemoryCryptoKeyProvider::new();
        provider.upsert(key("old", "t1", KeyUsage::Encryption, 3_600));
        provider.upsert(key("new", "t1", KeyUsage::Encryption, 60));
        provider.upsert(key("other-tenant", "t2", KeyUsage::Encryption, 1));

        let current = provider.get_current_encryption_key("t1").unwrap();
        assert_eq!(current.id, "new");
    }

    #[test]
    fn missing_encryption_key_is_an_error() {
        let provider = InMemoryCryptoKeyProvider::new();
        assert!(provider.get_current_encryption_key("t1").is_err());
    }

    #[test]
    fn key_off_hmac_keys_are_not_current() {
        let provider = InMemoryCryptoKeyProvider::new();
        let mut retiring = key("h1", "t1", KeyUsage::Hmac, 3_600);
        retiring.rekey_mode = Some(RekeyMode::KeyOff);
        provider.upsert(retiring);
        provider.upsert(key("h2", "t1", KeyUsage::Hmac, 60));

        let current = provider.get_current_hmac_keys("t1").unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, "h2");
    }
}
