//! Envelope encryption over tenant keys.
//!
//! This module provides:
//! - `CiphertextContainer`: the durable wire shape of one encryption
//!   (`container`)
//! - `CipherSpec`: transform parsing and the payload cipher delegates
//!   (`cipher`)
//! - The `EncryptionService` trait plus the software-keystore base
//!   implementation (`service`)
//! - `EnvelopeEncryptionService` and `CachedEnvelopeEncryptionService`
//!   (`envelope`)

pub mod cipher;
pub mod container;
#[allow(clippy::module_inception)]
pub mod envelope;
pub mod service;

// Re-export the most commonly used items.
pub use cipher::{CipherMode, CipherSpec};
pub use container::CiphertextContainer;
pub use envelope::{CachedEnvelopeEncryptionService, EnvelopeEncryptionService};
pub use service::{EncryptionService, LocalEncryptionService};
