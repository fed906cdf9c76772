//! Persistent storage for sources, documents, and chunks.

mod metadata;

pub use metadata::{ChunkDiff, MetadataStore, StoreStats};
