//! HuggingFace tokenizer handle with truncation configured.

use crate::error::EmbeddingError;
use std::path::Path;
use tokenizers::tokenizer::{Tokenizer, TruncationDirection, TruncationParams, TruncationStrategy};

/// An owned, truncation-configured tokenizer.
#[derive(Debug)]
pub struct TokenizerHandle {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl TokenizerHandle {
    /// Creates a tokenizer from serialized JSON bytes.
    pub fn from_bytes(bytes: Vec<u8>, max_length: usize) -> Result<Self, EmbeddingError> {
        let mut tokenizer = Tokenizer::from_bytes(bytes).map_err(|e| {
            EmbeddingError::ModelLoad(format!("failed to deserialize tokenizer: {}", e))
        })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                stride: 0,
                strategy: TruncationStrategy::OnlyFirst,
                direction: TruncationDirection::Right,
            }))
            .map_err(|e| {
                EmbeddingError::InvalidConfig(format!(
                    "failed to configure truncation: {}",
                    e
                ))
            })?;
        Ok(Self {
            tokenizer,
            max_length,
        })
    }

    /// Reads and parses a `tokenizer.json` file.
    pub fn from_file(path: &Path, max_length: usize) -> Result<Self, EmbeddingError> {
        let bytes = std::fs::read(path).map_err(|e| {
            EmbeddingError::ModelLoad(format!("failed to read tokenizer {:?}: {}", path, e))
        })?;
        Self::from_bytes(bytes, max_length)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Underlying tokenizer, for chunk sizing.
    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Encodes text into token ids, including special tokens.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, EmbeddingError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError::Tokenization(format!("encoding failed: {}", e)))?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            return Err(EmbeddingError::Tokenization(
                "tokenizer returned no tokens".to_string(),
            ));
        }
        Ok(ids.to_vec())
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl Clone for TokenizerHandle {
    fn clone(&self) -> Self {
        Self {
            tokenizer: self.tokenizer.clone(),
            max_length: self.max_length,
        }
    }
}
