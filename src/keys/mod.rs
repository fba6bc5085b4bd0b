//! Key model and the key-store boundary.
//!
//! This module provides:
//! - `CryptoKey`, `KeyUsage`, `RekeyMode`, `KeyConfiguration` (`key`)
//! - The `CryptoKeyProvider` trait plus a map-backed implementation
//!   (`provider`)

pub mod key;
pub mod provider;

// Re-export the most commonly used items.
pub use key::{current_encryption_key, CryptoKey, KeyConfiguration, KeyUsage, RekeyMode};
pub use provider::{CryptoKeyProvider, InMemoryCryptoKeyProvider};
