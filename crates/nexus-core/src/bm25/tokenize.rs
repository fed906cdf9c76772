//! BM25 tokenization.
//!
//! Unicode-aware lowercase word splitting with a configurable stop-word
//! list. The same tokenizer instance MUST be used at index time and query
//! time; scoring is meaningless otherwise.

use std::collections::HashSet;

/// Default English stop words. Deliberately small: aggressive lists hurt
/// rare-term queries, and single-character terms like "8" must survive.
pub const DEFAULT_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if",
    "in", "into", "is", "it", "its", "of", "on", "or", "that", "the", "their", "there", "these",
    "they", "this", "to", "was", "were", "what", "which", "will", "with",
];

/// Word tokenizer shared by index and query paths.
#[derive(Debug, Clone)]
pub struct Bm25Tokenizer {
    stop_words: HashSet<String>,
}

impl Default for Bm25Tokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_WORDS.iter().map(|s| s.to_string()))
    }
}

impl Bm25Tokenizer {
    pub fn new(stop_words: impl IntoIterator<Item = String>) -> Self {
        Self {
            stop_words: stop_words.into_iter().collect(),
        }
    }

    /// Splits text into lowercase alphanumeric terms, dropping stop words.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut terms = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                for lower in ch.to_lowercase() {
                    current.push(lower);
                }
            } else if !current.is_empty() {
                self.flush(&mut current, &mut terms);
            }
        }
        if !current.is_empty() {
            self.flush(&mut current, &mut terms);
        }
        terms
    }

    fn flush(&self, current: &mut String, terms: &mut Vec<String>) {
        if !self.stop_words.contains(current.as_str()) {
            terms.push(std::mem::take(current));
        } else {
            current.clear();
        }
    }
}
