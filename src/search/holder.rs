use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::keys::CryptoKey;

/// Persistable projection of one computed hash, stored on the entity's
/// lookup or unique list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmacEntry {
    pub key_id: String,
    pub alias: String,
    pub hash: String,
}

/// Working item for one (key, alias, value) hash computation.
///
/// A holder with no value stands for the HMAC of null, which is defined as
/// null: the hashing routine never sees it and no entry is produced.
#[derive(Clone)]
pub struct HmacHolder {
    pub key: Arc<CryptoKey>,
    pub alias: String,
    pub value: Option<String>,
    /// Tokenizer-derived form; when present it replaces `value` as the hash
    /// input.
    pub tokenized: Option<String>,
    pub hash: Option<String>,
}

impl HmacHolder {
    pub fn new(key: Arc<CryptoKey>, alias: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key,
            alias: alias.into(),
            value,
            tokenized: None,
            hash: None,
        }
    }

    pub fn with_tokenized(
        key: Arc<CryptoKey>,
        alias: impl Into<String>,
        value: String,
        tokenized: String,
    ) -> Self {
        Self {
            key,
            alias: alias.into(),
            value: Some(value),
            tokenized: Some(tokenized),
            hash: None,
        }
    }

    /// The bytes-to-hash for this holder, if any.
    pub fn hash_input(&self) -> Option<&str> {
        self.tokenized.as_deref().or(self.value.as_deref())
    }

    /// Convert a hashed holder into its persistable entry.
    pub fn into_entry(self) -> Option<HmacEntry> {
        let hash = self.hash?;
        Some(HmacEntry {
            key_id: self.key.id.clone(),
            alias: self.alias,
            hash,
        })
    }
}

impl fmt::Debug for HmacHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Plaintext values stay out of logs.
        f.debug_struct("HmacHolder")
            .field("key_id", &self.key.id)
            .field("alias", &self.alias)
            .field("value", &self.value.as_ref().map(|_| "[redacted]"))
            .field("hashed", &self.hash.is_some())
            .finish()
    }
}
