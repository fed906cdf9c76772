//! Token counting for chunk sizing.
//!
//! The sizer used for chunking should be the same tokenizer used for
//! embedding, so chunk sizes predict model token counts and nothing gets
//! truncated. A heuristic word counter is provided for configurations
//! without a tokenizer file (and for tests); it is deterministic, which is
//! all the chunker's byte-stability guarantee requires.

use std::sync::Arc;
use tokenizers::Tokenizer;

/// Counts tokens in a piece of text.
pub trait TokenSizer: Send + Sync {
    fn size(&self, text: &str) -> usize;
}

/// Whitespace word counter. Deterministic and tokenizer-free.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSizer;

impl TokenSizer for HeuristicSizer {
    fn size(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// HuggingFace tokenizer-backed sizer.
pub struct HfTokenizerSizer {
    tokenizer: Arc<Tokenizer>,
}

impl HfTokenizerSizer {
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self { tokenizer }
    }
}

impl TokenSizer for HfTokenizerSizer {
    /// Token count without special tokens; falls back to 0 on encode failure
    /// (the chunker treats 0-sized text as packable).
    fn size(&self, text: &str) -> usize {
        self.tokenizer
            .encode(text, false)
            .map(|encoding| encoding.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_counts_words() {
        let sizer = HeuristicSizer;
        assert_eq!(sizer.size("one two  three\nfour"), 4);
        assert_eq!(sizer.size(""), 0);
        assert_eq!(sizer.size("   "), 0);
    }
}
