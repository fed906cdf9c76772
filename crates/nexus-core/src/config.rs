//! Core configuration.
//!
//! The config struct is immutable once constructed; loading it from
//! `config.yaml` (and translating environment variables) is the job of the
//! external CLI. Every field has a serde default so partial configs
//! deserialize cleanly.

use crate::error::NexusError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration for the retrieval core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    /// Root directory for all persistent state
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Identifier of the embedding model; must match the id recorded by the
    /// vector store. A mismatch is a fatal configuration error.
    pub model_id: String,
    /// Maximum texts per embedding batch
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens
    pub target_tokens: usize,
    /// Overlap between adjacent chunks, in tokens
    pub overlap_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Dense candidates fetched per query
    pub dense_k: usize,
    /// Sparse candidates fetched per query
    pub sparse_k: usize,
    /// Candidates passed to the cross-encoder; 0 disables reranking
    pub rerank_k: usize,
    /// RRF weight on the dense list (1.0 = all dense, 0.0 = all sparse)
    pub alpha: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    /// Whole-query deadline in milliseconds
    pub query_deadline_ms: u64,
    /// Stage budget for query embedding
    pub embed_budget_ms: u64,
    /// Stage budget for the parallel dense + sparse retrieval
    pub search_budget_ms: u64,
    /// Stage budget for cross-encoder reranking; a breach falls back to RRF
    pub rerank_budget_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Watcher coalescing window in milliseconds. Consumed by the external
    /// watcher; carried here so the whole ingest posture lives in one place.
    pub debounce_ms: u64,
    /// Bounded ingest queue capacity; submitters block when full
    pub queue_capacity: usize,
    /// Worker tasks draining the queue
    pub workers: usize,
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nexus")
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: "jinaai/jina-embeddings-v2-small-en".to_string(),
            batch_size: 32,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 512,
            overlap_tokens: 50,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_k: 50,
            sparse_k: 50,
            rerank_k: 20,
            alpha: 0.5,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            query_deadline_ms: 2000,
            embed_budget_ms: 100,
            search_budget_ms: 200,
            rerank_budget_ms: 1500,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            queue_capacity: 1024,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl NexusConfig {
    /// Validates the configuration. Called once at startup; failures are
    /// fatal.
    pub fn validate(&self) -> Result<(), NexusError> {
        if self.embedding.model_id.is_empty() {
            return Err(NexusError::Config("embedding.model_id is empty".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(NexusError::Config("embedding.batch_size must be > 0".into()));
        }
        if self.chunking.target_tokens == 0 {
            return Err(NexusError::Config("chunking.target_tokens must be > 0".into()));
        }
        if self.chunking.overlap_tokens >= self.chunking.target_tokens {
            return Err(NexusError::Config(format!(
                "chunking.overlap_tokens ({}) must be smaller than target_tokens ({})",
                self.chunking.overlap_tokens, self.chunking.target_tokens
            )));
        }
        if self.retrieval.dense_k == 0 || self.retrieval.sparse_k == 0 {
            return Err(NexusError::Config(
                "retrieval.dense_k and sparse_k must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            return Err(NexusError::Config(format!(
                "retrieval.alpha ({}) must be in [0, 1]",
                self.retrieval.alpha
            )));
        }
        if self.retrieval.bm25_k1 < 0.0 {
            return Err(NexusError::Config("retrieval.bm25_k1 must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.bm25_b) {
            return Err(NexusError::Config("retrieval.bm25_b must be in [0, 1]".into()));
        }
        if self.ingest.queue_capacity == 0 {
            return Err(NexusError::Config("ingest.queue_capacity must be > 0".into()));
        }
        if self.ingest.workers == 0 {
            return Err(NexusError::Config("ingest.workers must be > 0".into()));
        }
        Ok(())
    }

    /// Persistent state layout under `data_dir`.
    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn bm25_dir(&self) -> PathBuf {
        self.data_dir.join("bm25")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Reserved for the out-of-scope key-value memory layer.
    pub fn memories_dir(&self) -> PathBuf {
        self.data_dir.join("memories")
    }

    /// Returns a config rooted at the given data directory, defaults
    /// elsewhere. Convenient for tests and embedding callers.
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NexusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.target_tokens, 512);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.retrieval.dense_k, 50);
        assert_eq!(config.retrieval.rerank_k, 20);
        assert!((config.retrieval.alpha - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.ingest.queue_capacity, 1024);
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let mut config = NexusConfig::default();
        config.retrieval.alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_target() {
        let mut config = NexusConfig::default();
        config.chunking.overlap_tokens = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: NexusConfig =
            serde_json::from_str(r#"{"chunking": {"target_tokens": 256}}"#).unwrap();
        assert_eq!(config.chunking.target_tokens, 256);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.retrieval.sparse_k, 50);
    }

    #[test]
    fn test_state_layout() {
        let config = NexusConfig::with_data_dir("/tmp/nexus-test");
        assert!(config.metadata_db_path().ends_with("metadata.db"));
        assert!(config.bm25_dir().ends_with("bm25"));
        assert!(config.vectors_dir().ends_with("vectors"));
    }
}
