//! Searchable keyed hashing.
//!
//! This module provides:
//! - `HmacHolder` and `HmacEntry`: the working and persisted forms of one
//!   hash (`holder`)
//! - The tokenizer trait and built-in digits-only/last-4 variants
//!   (`tokenizer`)
//! - `SearchableHmacStrategy`: per-key, per-field hashing with tokenizer
//!   fan-out and compound unique groups (`strategy`)

pub mod holder;
pub mod strategy;
pub mod tokenizer;

// Re-export the most commonly used items.
pub use holder::{HmacEntry, HmacHolder};
pub use strategy::{HashMergeMode, HmacStrategyKind, SearchableHmacStrategy};
pub use tokenizer::{DigitsOnlyTokenizer, HmacTokenizer, LastFourTokenizer, TokenizerKind};
