//! Dense text encoding.
//!
//! The [`Embedder`] trait is the seam between the retrieval core and model
//! inference. Implementations are loaded once during the explicit startup
//! phase and shared read-only across threads; inference must be reentrant.
//! Query and chunk embeddings MUST come from the same model; the service
//! checks `model_id()` against the vector store's recorded id at startup.

pub mod model;
pub mod tokenizer;

pub use model::{JinaBertConfig, JinaBertEmbedder};
pub use tokenizer::TokenizerHandle;

use crate::error::EmbeddingError;
use std::sync::Arc;

/// An embedding model producing unit-norm vectors of fixed dimension.
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model.
    fn model_id(&self) -> &str;

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Embeds a batch of chunk texts. Inputs are grouped into model batches
    /// internally; outputs are parallel to inputs.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embeds a single query string.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string()))?;
        vectors.pop().ok_or_else(|| {
            EmbeddingError::Inference("embed_batch returned no vector for query".to_string())
        })
    }
}

/// Shared embedder handle.
pub type SharedEmbedder = Arc<dyn Embedder>;
