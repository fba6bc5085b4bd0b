//! Key rotation.
//!
//! This module provides:
//! - The `RekeyService` / `RekeyCryptoKeyManager` collaborator traits
//!   (`service`)
//! - `KeyOverlay`: forced-key overlays for rekey passes (`overlay`)
//! - `ProgressTracker` and `RekeyOutcome` (`tracker`)
//! - `RekeyScheduler`: the per-tenant rotation state machine and its
//!   background loop (`scheduler`)

pub mod overlay;
pub mod scheduler;
pub mod service;
pub mod tracker;

// Re-export the most commonly used items.
pub use overlay::KeyOverlay;
pub use scheduler::{RekeyScheduler, RekeySchedulerHandle};
pub use service::{RekeyCryptoKeyManager, RekeyService};
pub use tracker::{ProgressTracker, RekeyOutcome};
