//! Runtime tuning for caches and the rekey scheduler.
//!
//! Settings are plain serde structs supplied programmatically; every field
//! has a default so partial documents deserialize cleanly.

pub mod settings;

pub use settings::{CacheSettings, RekeySettings};
