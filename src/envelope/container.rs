use serde::{Deserialize, Serialize};

use crate::errors::{FieldVaultError, Result};

/// Durable record of one encryption: cipher parameters, IV, ciphertext, and
/// for envelope encryption the wrapped DEK that unlocks it.
///
/// Containers are persisted by the caller (usually inside the entity's blob
/// field) and must round-trip exactly through decrypt. Fields this version
/// does not understand survive in `extra` so an older reader never strips
/// what a newer writer stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextContainer {
    /// Id of the CryptoKey this container was produced under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    pub algorithm: String,

    pub mode: String,

    pub padding: String,

    /// Key size in bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,

    /// GCM authentication tag length in bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcm_tag_length: Option<u32>,

    /// Base64 IV. Empty for the no-op mode.
    pub iv: String,

    /// Base64 ciphertext.
    pub cipher_text: String,

    /// Identity the wrapped DEK is cached and looked up under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_encryption_key_id: Option<String>,

    /// The wrapped DEK itself: a serialized container produced by the base
    /// encryption service against the tenant's key-encryption key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_encryption_key: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CiphertextContainer {
    /// Serialize to the flat JSON form callers persist.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a persisted container back.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FieldVaultError::InvalidContainer(format!("malformed container: {e}")))
    }
}
