//! Cross-encoder reranking.
//!
//! A cross-encoder jointly scores `(query, passage)` pairs: slower than
//! embedding similarity but considerably more accurate, which is why it only
//! sees the top fusion candidates. The retriever treats reranking as
//! best-effort: any failure or budget breach falls back to RRF order.

pub mod model;

pub use model::BertCrossEncoder;

use crate::error::EmbeddingError;
use std::sync::Arc;

/// A model scoring query/passage pairs with calibrated relevance in [0, 1].
pub trait CrossEncoder: Send + Sync {
    fn model_id(&self) -> &str;

    /// Scores each passage against the query. Output is parallel to
    /// `passages`; higher is more relevant.
    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, EmbeddingError>;
}

/// Shared reranker handle.
pub type SharedCrossEncoder = Arc<dyn CrossEncoder>;
