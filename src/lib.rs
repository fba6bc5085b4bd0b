//! Field-level protection for entities: envelope encryption, searchable
//! HMACs, and tenant-aware key rotation.
//!
//! The write path classifies an entity's fields through the
//! [`registry::EntityFieldRegistry`], hashes searchable fields with
//! [`search::SearchableHmacStrategy`] under every active HMAC key, and
//! envelope-encrypts the confidential fields through an
//! [`envelope::EncryptionService`] — all conducted by
//! [`protect::EntityProtector`]. The [`rekey::RekeyScheduler`] keeps that
//! protection consistent as keys rotate across tenants.

pub mod cache;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod keys;
pub mod protect;
pub mod registry;
pub mod rekey;
pub mod search;
pub(crate) mod sync;
