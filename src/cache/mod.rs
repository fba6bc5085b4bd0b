//! Ephemeral key caching.
//!
//! This module provides:
//! - `EphemeralKeyCache`: TTL store with sliding keyed entries and an
//!   absolute-expiry "current" slot (`ephemeral`)
//! - `KeyVault` and `CachedWrappedKeyHolder`: per-entry-encrypted storage for
//!   raw key bytes with scoped acquire/release (`vault`)

pub mod ephemeral;
pub mod vault;

// Re-export the most commonly used items.
pub use ephemeral::EphemeralKeyCache;
pub use vault::{CachedWrappedKeyHolder, KeyVault};
