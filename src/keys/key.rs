use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a crypto key protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsage {
    Encryption,
    Hmac,
}

/// Operator-issued rotation directive. A key carries at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RekeyMode {
    /// Promote this key to standard use; move every record onto it.
    KeyOn,
    /// Retire this key; move every record off it.
    KeyOff,
}

/// Opaque versioned cipher document attached to a key.
///
/// Only the fields this crate understands are typed; everything else is
/// preserved in `extra` so older and newer writers can share a key store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<String>,

    /// Key size in bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,

    /// GCM authentication tag length in bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcm_tag_length: Option<u32>,

    /// Base64 key material, present only in the software-keystore form.
    /// HSM-backed deployments leave this empty and resolve material behind
    /// their own `EncryptionService`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_material: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A tenant's encryption or HMAC key as the key store describes it.
///
/// Identity is `id`; the configuration document says how to use the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoKey {
    pub id: String,

    #[serde(rename = "type")]
    pub key_type: String,

    pub usage: KeyUsage,

    pub configuration: KeyConfiguration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_start_time: Option<DateTime<Utc>>,

    pub tenant_id: String,

    /// `None` means the key is in steady state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rekey_mode: Option<RekeyMode>,

    /// Mandatory in a healthy key store; the scheduler treats `None` as a
    /// hard misconfiguration and skips the tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
}

impl CryptoKey {
    pub fn is_key_on(&self) -> bool {
        self.rekey_mode == Some(RekeyMode::KeyOn)
    }

    pub fn is_key_off(&self) -> bool {
        self.rekey_mode == Some(RekeyMode::KeyOff)
    }

    /// True when the key was created at or before `cutoff`. Keys without a
    /// creation date never pass.
    pub fn created_at_or_before(&self, cutoff: DateTime<Utc>) -> bool {
        matches!(self.created_date, Some(d) if d <= cutoff)
    }
}

/// Most recently created ENCRYPTION key for a tenant, ignoring keys without
/// a creation date.
pub fn current_encryption_key<'a>(keys: &'a [CryptoKey], tenant_id: &str) -> Option<&'a CryptoKey> {
    keys.iter()
        .filter(|k| k.tenant_id == tenant_id && k.usage == KeyUsage::Encryption)
        .filter(|k| k.created_date.is_some())
        .max_by_key(|k| k.created_date)
}
