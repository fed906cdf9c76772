//! # Nexus Core
//!
//! Hybrid retrieval & indexing core for the Nexus local personal-knowledge
//! service. Turns a corpus of markdown/PDF documents into a searchable
//! knowledge base and serves low-latency ranked retrieval against it,
//! combining approximate nearest-neighbor search over dense embeddings,
//! incremental BM25 keyword scoring, Reciprocal Rank Fusion, and
//! cross-encoder reranking.
//!
//! ## Modules
//!
//! - [`service`] - the `Nexus` facade wiring everything together
//! - [`storage`] - metadata store: sources, documents, chunks (redb)
//! - [`vector`] - HNSW dense index with filterable payloads
//! - [`bm25`] - incremental posting-list index with on-disk persistence
//! - [`search`] - RRF fusion and the hybrid retriever
//! - [`ingest`] - loaders and the diff-based ingestion pipeline
//! - [`chunking`] - structure-aware windowing chunker
//! - [`embedding`] - embedder trait and candle JinaBERT implementation
//! - [`rerank`] - cross-encoder trait and candle implementation
//! - [`audit`] - startup consistency repair
//! - [`filter`] - metadata filter grammar
//! - [`config`] / [`error`] / [`types`] - configuration, errors, data model
//!
//! The MCP JSON-RPC surface, CLI, filesystem watcher, config loading, and
//! the memory layer are external collaborators built on top of this crate.

pub mod audit;
pub mod bm25;
pub mod chunking;
pub mod config;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod rerank;
pub mod search;
pub mod service;
pub mod storage;
pub mod types;
pub mod vector;

pub use config::NexusConfig;
pub use error::{NexusError, Result};
pub use filter::Filter;
pub use ingest::IngestRequest;
pub use search::SearchOptions;
pub use service::{ConsistencyReport, Nexus};
pub use types::{
    ChunkId, DeleteOutcome, DocumentId, IndexStats, IngestOutcome, SearchResult, Source,
    SourceId, SourceKind,
};
