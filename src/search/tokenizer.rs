use std::fmt;
use std::sync::Arc;

/// Derives additional searchable forms of a plaintext value.
///
/// Each tokenizer turns one holder into one extra holder whose alias gains
/// the tokenizer's suffix, so a phone number registered for lookup can also
/// be found by its digits or its last four.
pub trait HmacTokenizer: Send + Sync {
    /// Suffix appended to the field alias for the derived holder.
    fn alias_suffix(&self) -> &str;

    /// Tokenized form of `value`; `None` skips the derived holder.
    fn tokenize(&self, value: &str) -> Option<String>;
}

/// Keeps only ASCII digits: "+1 (555) 010-3456" tokenizes to "15550103456".
pub struct DigitsOnlyTokenizer;

impl HmacTokenizer for DigitsOnlyTokenizer {
    fn alias_suffix(&self) -> &str {
        "digits"
    }

    fn tokenize(&self, value: &str) -> Option<String> {
        let digits: String = value.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            None
        } else {
            Some(digits)
        }
    }
}

/// Last four digits, for partial-identifier search. Values with fewer than
/// four digits produce nothing.
pub struct LastFourTokenizer;

impl HmacTokenizer for LastFourTokenizer {
    fn alias_suffix(&self) -> &str {
        "last4"
    }

    fn tokenize(&self, value: &str) -> Option<String> {
        let digits: Vec<char> = value.chars().filter(char::is_ascii_digit).collect();
        if digits.len() < 4 {
            return None;
        }
        Some(digits[digits.len() - 4..].iter().collect())
    }
}

/// Tokenizer selection carried by a field descriptor.
#[derive(Clone)]
pub enum TokenizerKind {
    DigitsOnly,
    LastFour,
    Custom(Arc<dyn HmacTokenizer>),
}

impl TokenizerKind {
    pub(crate) fn build(&self) -> Arc<dyn HmacTokenizer> {
        match self {
            TokenizerKind::DigitsOnly => Arc::new(DigitsOnlyTokenizer),
            TokenizerKind::LastFour => Arc::new(LastFourTokenizer),
            TokenizerKind::Custom(tokenizer) => Arc::clone(tokenizer),
        }
    }
}

impl fmt::Debug for TokenizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizerKind::DigitsOnly => f.write_str("DigitsOnly"),
            TokenizerKind::LastFour => f.write_str("LastFour"),
            TokenizerKind::Custom(t) => write!(f, "Custom({})", t.alias_suffix()),
        }
    }
}
