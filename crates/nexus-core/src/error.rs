//! Error types for nexus-core.
//!
//! Each subsystem has a focused error enum; everything converges on
//! [`NexusError`] at the public API boundary.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NexusError>;

/// Top-level error surfaced by the public API.
#[derive(Debug, Error)]
pub enum NexusError {
    /// Invalid or missing core configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse or chunker failure on a single document. Never fatal to the
    /// pipeline; the document is skipped and the batch continues.
    #[error("Corpus error for '{uri}': {reason}")]
    Corpus { uri: String, reason: String },

    /// Vector or BM25 index operation failed. Triggers per-document rollback.
    #[error("Index error: {0}")]
    Index(String),

    /// Invariant violation between the three data stores. Surfaces as a
    /// repair action, not a crash.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Invalid query input: empty, overlong, or a malformed filter.
    #[error("Query error: {0}")]
    Query(String),

    /// Per-query deadline exceeded at a stage boundary.
    #[error("Deadline exceeded during {stage}")]
    Deadline { stage: &'static str },

    /// Embedding or rerank model failed to load or run. Embedding failure is
    /// fatal; rerank failure is handled by falling back to RRF order.
    #[error("Model error: {0}")]
    Model(String),

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Errors from the redb-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database operation failed
    #[error("Database error: {0}")]
    Database(String),
    /// Record failed to (de)serialize
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors from embedding and reranking models.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    /// Failed to load model weights or tokenizer
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    /// Failed to tokenize text
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    /// Forward pass through the model failed
    #[error("Inference failed: {0}")]
    Inference(String),
    /// Invalid model configuration
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from document loading and chunking.
#[derive(Debug, Clone, Error)]
pub enum ChunkError {
    /// Document bytes could not be decoded or parsed
    #[error("Failed to parse document: {0}")]
    Parse(String),
    /// Invalid chunker configuration
    #[error("Invalid chunking config: {0}")]
    InvalidConfig(String),
}

impl From<EmbeddingError> for NexusError {
    fn from(err: EmbeddingError) -> Self {
        NexusError::Model(err.to_string())
    }
}

impl NexusError {
    /// Wraps a chunk/parse failure as a per-document corpus error.
    pub fn corpus(uri: impl Into<String>, err: impl std::fmt::Display) -> Self {
        NexusError::Corpus {
            uri: uri.into(),
            reason: err.to_string(),
        }
    }
}
