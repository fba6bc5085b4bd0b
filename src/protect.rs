//! The write-path conductor.
//!
//! `protect` runs the full pipeline for one entity: HMAC computation under
//! every active key, confidential fields folded into one JSON document and
//! envelope-encrypted into the blob field, the key id recorded, and cascade
//! fields recursed into. `restore` reverses the encryption half; hashes are
//! one-way and stay as they are.
//!
//! Rotation drives exactly the same pair through `protect_with`, handing in
//! an overlay that forces the target key(s) instead of the provider's
//! current ones.

use std::sync::Arc;

use serde_json::Value;
use zeroize::Zeroizing;

use crate::envelope::{CiphertextContainer, EncryptionService};
use crate::errors::{FieldVaultError, Result};
use crate::keys::{CryptoKey, CryptoKeyProvider, KeyUsage};
use crate::registry::EntityFieldRegistry;
use crate::rekey::KeyOverlay;
use crate::search::HashMergeMode;

/// Protects and restores registered entities.
pub struct EntityProtector {
    registry: Arc<EntityFieldRegistry>,
    provider: Arc<dyn CryptoKeyProvider>,
    service: Arc<dyn EncryptionService>,
}

impl EntityProtector {
    /// `service` is the envelope service (plain or cached); its bulk-HMAC
    /// operation is what the strategy hashes through.
    pub fn new(
        registry: Arc<EntityFieldRegistry>,
        provider: Arc<dyn CryptoKeyProvider>,
        service: Arc<dyn EncryptionService>,
    ) -> Self {
        Self {
            registry,
            provider,
            service,
        }
    }

    pub fn registry(&self) -> &Arc<EntityFieldRegistry> {
        &self.registry
    }

    /// Protect `entity` under the tenant's current keys.
    pub fn protect<T: 'static>(&self, tenant_id: &str, entity: &mut T) -> Result<()> {
        self.protect_with(tenant_id, entity, None)
    }

    /// Protect `entity`, with an optional overlay forcing specific keys.
    /// The overlay is how a rekey pass re-protects records onto its target.
    pub fn protect_with<T: 'static>(
        &self,
        tenant_id: &str,
        entity: &mut T,
        overlay: Option<&KeyOverlay>,
    ) -> Result<()> {
        let entry = self.registry.entry::<T>()?;

        // 1. Hashes first, while the plaintext accessors still read values.
        if let Some(strategy) = &entry.strategy {
            let keys = self.hmac_keys(tenant_id, overlay)?;
            if keys.is_empty() {
                return Err(FieldVaultError::NoActiveHmacKeys(tenant_id.to_string()));
            }
            // A forced key set is authoritative: rekey passes must strip
            // entries under keys being retired, or records would keep
            // qualifying for the same pass.
            let mode = match overlay.and_then(|o| o.hmac_keys.as_ref()) {
                Some(_) => HashMergeMode::Replace,
                None => HashMergeMode::Retain,
            };
            strategy.apply_with(entity, &keys, self.service.as_ref(), mode)?;
        }

        // 2. Fold the confidential fields into one document and encrypt it.
        if !entry.encrypt_fields.is_empty() {
            let key = self.encryption_key(tenant_id, overlay)?;

            let mut document = serde_json::Map::new();
            for field in &entry.encrypt_fields {
                if let Some(value) = (field.get)(entity) {
                    document.insert(field.name.clone(), Value::String(value));
                }
            }
            let plaintext = Zeroizing::new(serde_json::to_vec(&Value::Object(document))?);

            let container = self.service.encrypt(&key, &plaintext)?;
            let blob = entry.blob.as_ref().ok_or_else(|| {
                FieldVaultError::classification(&entry.name, "no blob field registered")
            })?;
            (blob.set)(entity, Some(container.to_json()?));
            if let Some(key_id) = &entry.key_id {
                (key_id.set)(entity, Some(key.id.clone()));
            }
        }

        // 3. Recurse into cascade fields through the erased entry points.
        for cascade in &entry.cascade_fields {
            let hook = self
                .registry
                .erased(cascade.target)
                .ok_or_else(|| FieldVaultError::NotRegistered(cascade.target_name.clone()))?;
            (cascade.walk)(entity, &mut |child| {
                (hook.protect)(child, self, tenant_id, overlay)
            })?;
        }

        Ok(())
    }

    /// Decrypt the blob back into the entity's plaintext fields, recursing
    /// into cascades. A missing or empty blob leaves the fields untouched.
    pub fn restore<T: 'static>(&self, entity: &mut T) -> Result<()> {
        let entry = self.registry.entry::<T>()?;

        if let Some(blob) = &entry.blob {
            if let Some(json) = (blob.get)(entity) {
                let container = CiphertextContainer::from_json(&json)?;
                let plaintext = Zeroizing::new(self.service.decrypt(&container)?);
                let document: serde_json::Map<String, Value> =
                    serde_json::from_slice(&plaintext)?;

                for field in &entry.encrypt_fields {
                    let value = document
                        .get(&field.name)
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    (field.set)(entity, value);
                }
            }
        }

        for cascade in &entry.cascade_fields {
            let hook = self
                .registry
                .erased(cascade.target)
                .ok_or_else(|| FieldVaultError::NotRegistered(cascade.target_name.clone()))?;
            (cascade.walk)(entity, &mut |child| (hook.restore)(child, self))?;
        }

        Ok(())
    }

    /// Whether `entity`'s persisted protection state references `key`: the
    /// recorded key id for encryption keys, any hash entry for HMAC keys.
    pub(crate) fn uses_key<T: 'static>(&self, entity: &T, key: &CryptoKey) -> Result<bool> {
        let entry = self.registry.entry::<T>()?;
        Ok(match key.usage {
            KeyUsage::Encryption => {
                entry
                    .key_id
                    .as_ref()
                    .and_then(|binding| (binding.get)(entity))
                    .as_deref()
                    == Some(key.id.as_str())
            }
            KeyUsage::Hmac => entry
                .strategy
                .as_ref()
                .is_some_and(|strategy| strategy.references_key(entity, &key.id)),
        })
    }

    fn hmac_keys(
        &self,
        tenant_id: &str,
        overlay: Option<&KeyOverlay>,
    ) -> Result<Vec<Arc<CryptoKey>>> {
        if let Some(forced) = overlay.and_then(|o| o.hmac_keys.clone()) {
            return Ok(forced);
        }
        Ok(self
            .provider
            .get_current_hmac_keys(tenant_id)?
            .into_iter()
            .map(Arc::new)
            .collect())
    }

    fn encryption_key(
        &self,
        tenant_id: &str,
        overlay: Option<&KeyOverlay>,
    ) -> Result<Arc<CryptoKey>> {
        if let Some(forced) = overlay.and_then(|o| o.encryption_key.clone()) {
            return Ok(forced);
        }
        Ok(Arc::new(self.provider.get_current_encryption_key(tenant_id)?))
    }
}
