//! Query-side orchestration: fusion and the hybrid retriever.

pub mod fusion;
pub mod retriever;

pub use fusion::{weighted_rrf, FusedHit, RRF_K};
pub use retriever::{HybridRetriever, SearchOptions};
