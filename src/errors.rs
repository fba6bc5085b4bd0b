use thiserror::Error;

/// All errors that can occur in FieldVault.
#[derive(Debug, Error)]
pub enum FieldVaultError {
    // --- Registration errors ---
    #[error("Field classification error for '{entity}': {reason}")]
    Classification { entity: String, reason: String },

    #[error("Cascade cycle detected: {0}")]
    CascadeCycle(String),

    #[error("Entity type '{0}' is not registered")]
    NotRegistered(String),

    #[error("Entity type '{0}' is already registered")]
    AlreadyRegistered(String),

    // --- Key and cipher configuration errors ---
    #[error("Key configuration error: {0}")]
    Configuration(String),

    #[error("Crypto key '{0}' not found")]
    KeyNotFound(String),

    #[error("No active HMAC keys for '{0}'")]
    NoActiveHmacKeys(String),

    #[error("No encryption key available for tenant '{0}'")]
    NoEncryptionKey(String),

    // --- Crypto errors ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("HMAC error: {0}")]
    HmacError(String),

    // --- Container errors ---
    #[error("Invalid ciphertext container: {0}")]
    InvalidContainer(String),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    // --- Rekey errors ---
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Rekey run for tenant '{tenant}' aborted: {failures} failures exceeded threshold {threshold}")]
    RekeyAborted {
        tenant: String,
        failures: u64,
        threshold: i64,
    },
}

impl FieldVaultError {
    /// Shorthand for registration-time violations.
    pub(crate) fn classification(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        FieldVaultError::Classification {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for FieldVault results.
pub type Result<T> = std::result::Result<T, FieldVaultError>;
