//! The `Nexus` facade.
//!
//! Wires the seven components together behind the public API that the MCP
//! adapter, CLI, and watcher call. Construction is an explicit startup
//! phase: models are loaded, stores opened, the consistency audit run, no
//! lazy initialization anywhere. `Nexus` is cheap to clone-by-`Arc` fields
//! and safe to share across tasks.

use crate::audit::{rebuild_bm25, startup_audit};
use crate::bm25::{Bm25Index, Bm25LoadError, Bm25Params, Bm25Tokenizer};
use crate::chunking::{Chunker, HfTokenizerSizer, TokenSizer};
use crate::config::NexusConfig;
use crate::embedding::{JinaBertConfig, JinaBertEmbedder, SharedEmbedder};
use crate::error::{NexusError, Result};
use crate::filter::Filter;
use crate::ingest::{IngestQueue, IngestRequest, IngestionPipeline};
use crate::rerank::{BertCrossEncoder, SharedCrossEncoder};
use crate::search::{HybridRetriever, SearchOptions};
use crate::storage::MetadataStore;
use crate::types::{
    now_epoch, ChunkId, DeleteOutcome, DocumentId, IndexStats, IngestOutcome, SearchResult,
    Source, SourceId, SourceKind,
};
use crate::vector::VectorStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Default number of results returned by `search`.
const DEFAULT_LIMIT: usize = 10;

/// Per-store chunk accounting from [`Nexus::verify_consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub metadata_chunks: usize,
    pub vector_chunks: usize,
    pub bm25_chunks: usize,
    /// Ids not present in all three stores
    pub divergent: usize,
}

impl ConsistencyReport {
    pub fn consistent(&self) -> bool {
        self.divergent == 0
    }
}

/// The hybrid retrieval & indexing core.
pub struct Nexus {
    config: NexusConfig,
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorStore>,
    bm25: Arc<Bm25Index>,
    pipeline: Arc<IngestionPipeline>,
    retriever: HybridRetriever,
    queue: IngestQueue,
}

impl Nexus {
    /// Opens the service with models loaded from `<data_dir>/models/`.
    ///
    /// Expects `model.safetensors` and `tokenizer.json` for the embedder; a
    /// reranker checkpoint under `models/reranker/` is optional; embedding
    /// failure is fatal, a missing or broken reranker only disables
    /// reranking.
    pub async fn open(config: NexusConfig) -> Result<Self> {
        config.validate()?;
        let models = config.models_dir();

        let embedder_config = JinaBertConfig {
            model_id: config.embedding.model_id.clone(),
            batch_size: config.embedding.batch_size,
            ..JinaBertConfig::default()
        };
        let embedder = JinaBertEmbedder::from_files(
            &models.join("model.safetensors"),
            &models.join("tokenizer.json"),
            embedder_config,
        )?;
        let sizer: Arc<dyn TokenSizer> =
            Arc::new(HfTokenizerSizer::new(Arc::new(embedder.tokenizer().inner().clone())));
        let embedder: SharedEmbedder = Arc::new(embedder);

        let reranker_dir = models.join("reranker");
        let reranker: Option<SharedCrossEncoder> = if reranker_dir.join("model.safetensors").exists()
        {
            match BertCrossEncoder::from_files(
                &reranker_dir.join("model.safetensors"),
                &reranker_dir.join("config.json"),
                &reranker_dir.join("tokenizer.json"),
                "bge-reranker-base",
            ) {
                Ok(model) => Some(Arc::new(model)),
                Err(e) => {
                    warn!("Reranker failed to load, falling back to RRF-only: {}", e);
                    None
                }
            }
        } else {
            info!("No reranker checkpoint found; reranking disabled");
            None
        };

        Self::with_components(config, embedder, reranker, sizer).await
    }

    /// Opens the service with injected model implementations.
    ///
    /// This is the seam used by tests and alternative inference backends;
    /// everything else (stores, audit, pipeline, retriever) is identical
    /// to [`Nexus::open`].
    pub async fn with_components(
        config: NexusConfig,
        embedder: SharedEmbedder,
        reranker: Option<SharedCrossEncoder>,
        sizer: Arc<dyn TokenSizer>,
    ) -> Result<Self> {
        config.validate()?;
        if embedder.model_id() != config.embedding.model_id {
            return Err(NexusError::Config(format!(
                "configured embedding model '{}' does not match loaded model '{}'",
                config.embedding.model_id,
                embedder.model_id()
            )));
        }
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            NexusError::Config(format!("cannot create data dir {:?}: {}", config.data_dir, e))
        })?;

        let metadata = Arc::new(MetadataStore::open(&config.metadata_db_path())?);
        let vectors = Arc::new(VectorStore::open(
            &config.vectors_dir(),
            embedder.dimension(),
            embedder.model_id(),
        )?);

        let bm25_params = Bm25Params {
            k1: config.retrieval.bm25_k1,
            b: config.retrieval.bm25_b,
        };
        let bm25_tokenizer = Arc::new(Bm25Tokenizer::default());
        let bm25 = match Bm25Index::load(&config.bm25_dir(), bm25_params) {
            Ok(index) => {
                // A count disagreement means the image is stale relative to
                // the metadata store; rebuild rather than trust it.
                let meta_chunks = metadata.stats()?.chunks;
                if index.doc_count() != meta_chunks {
                    warn!(
                        persisted = index.doc_count(),
                        metadata = meta_chunks,
                        "BM25 chunk count disagrees with metadata store, rebuilding"
                    );
                    rebuild_bm25(&metadata, &index, &bm25_tokenizer)?;
                }
                Arc::new(index)
            }
            Err(Bm25LoadError::Missing) => {
                let index = Bm25Index::new(bm25_params);
                rebuild_bm25(&metadata, &index, &bm25_tokenizer)?;
                Arc::new(index)
            }
            Err(e) => {
                warn!("BM25 index unusable ({}), rebuilding from metadata store", e);
                let index = Bm25Index::new(bm25_params);
                rebuild_bm25(&metadata, &index, &bm25_tokenizer)?;
                Arc::new(index)
            }
        };

        startup_audit(&metadata, &vectors, &bm25, &bm25_tokenizer, &embedder).await?;
        bm25.persist(&config.bm25_dir())?;

        let chunker = Arc::new(Chunker::new(&config.chunking, sizer));
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&metadata),
            Arc::clone(&vectors),
            Arc::clone(&bm25),
            Arc::clone(&bm25_tokenizer),
            chunker,
            embedder.clone(),
            config.ingest.workers,
        ));
        let queue = pipeline.spawn_queue(config.ingest.queue_capacity);

        let retriever = HybridRetriever::new(
            Arc::clone(&metadata),
            Arc::clone(&vectors),
            Arc::clone(&bm25),
            Arc::clone(&bm25_tokenizer),
            embedder,
            reranker,
            config.retrieval.clone(),
        );

        info!("Nexus core ready at {:?}", config.data_dir);
        Ok(Self {
            config,
            metadata,
            vectors,
            bm25,
            pipeline,
            retriever,
            queue,
        })
    }

    pub fn config(&self) -> &NexusConfig {
        &self.config
    }

    // =========================================================================
    // Ingestion API
    // =========================================================================

    /// Registers a content origin (idempotent) and returns its id.
    pub async fn add_source(&self, kind: SourceKind, root: &str) -> Result<SourceId> {
        let id = SourceId::derive(kind, root);
        let source = match self.metadata.get_source(&id)? {
            Some(existing) => Source {
                last_scan_at: Some(now_epoch()),
                ..existing
            },
            None => Source {
                id: id.clone(),
                kind,
                root: root.to_string(),
                created_at: now_epoch(),
                last_scan_at: None,
            },
        };
        self.metadata.upsert_source(&source)?;
        Ok(id)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        Ok(self.metadata.list_sources()?)
    }

    /// Ingests one document synchronously.
    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let outcome = self.pipeline.ingest_document(request).await?;
        self.flush()?;
        Ok(outcome)
    }

    /// Ingests many documents with bounded concurrency; per-document errors
    /// are collected, never aborting the batch.
    pub async fn ingest_batch(
        &self,
        requests: Vec<IngestRequest>,
    ) -> Vec<Result<IngestOutcome>> {
        let results = self.pipeline.ingest_batch(requests).await;
        if let Err(e) = self.flush() {
            warn!("Failed to persist BM25 index after batch: {}", e);
        }
        results
    }

    /// Handle to the bounded ingest queue (for the watcher). Submitters
    /// block while the queue is at capacity. Call [`Nexus::flush`] after a
    /// burst to persist the sparse index.
    pub fn ingest_queue(&self) -> IngestQueue {
        self.queue.clone()
    }

    /// Deletes a document and its chunks from all three stores.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<DeleteOutcome> {
        let outcome = self.pipeline.delete_document(document_id).await?;
        self.flush()?;
        Ok(outcome)
    }

    /// Deletes a source, cascading to every owned document and chunk.
    pub async fn delete_source(&self, source_id: &SourceId) -> Result<DeleteOutcome> {
        let removed = self.metadata.delete_source(source_id)?;
        self.vectors.delete(&removed)?;
        for id in &removed {
            self.bm25.remove(id);
        }
        self.flush()?;
        Ok(DeleteOutcome {
            removed: removed.len(),
        })
    }

    /// Persists the BM25 image (write-to-temp, atomic rename).
    pub fn flush(&self) -> Result<()> {
        Ok(self.bm25.persist(&self.config.bm25_dir())?)
    }

    // =========================================================================
    // Query API
    // =========================================================================

    /// Hybrid search. `limit` defaults to 10; options default from the
    /// retrieval config.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        filter: Option<Filter>,
        options: Option<SearchOptions>,
    ) -> Result<Vec<SearchResult>> {
        self.retriever
            .search(
                query,
                limit.unwrap_or(DEFAULT_LIMIT),
                filter.unwrap_or_default(),
                options.unwrap_or_else(|| self.retriever.default_options()),
            )
            .await
    }

    /// Dense-only near neighbors of an indexed chunk.
    pub async fn find_related(
        &self,
        chunk_id: ChunkId,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        self.retriever
            .find_related(chunk_id, limit.unwrap_or(DEFAULT_LIMIT))
            .await
    }

    /// Audits the three-way chunk id invariant on demand. Divergence is a
    /// consistency error to be repaired by the startup orphan scan, not a
    /// crash; this reports it.
    pub fn verify_consistency(&self) -> Result<ConsistencyReport> {
        use std::collections::HashSet;
        let metadata: HashSet<ChunkId> = self.metadata.all_chunk_ids()?.into_iter().collect();
        let vectors: HashSet<ChunkId> = self.vectors.chunk_ids().into_iter().collect();
        let bm25: HashSet<ChunkId> = self.bm25.chunk_ids().into_iter().collect();

        let divergent = metadata
            .iter()
            .chain(vectors.iter())
            .chain(bm25.iter())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|id| {
                !(metadata.contains(*id) && vectors.contains(*id) && bm25.contains(*id))
            })
            .count();

        Ok(ConsistencyReport {
            metadata_chunks: metadata.len(),
            vector_chunks: vectors.len(),
            bm25_chunks: bm25.len(),
            divergent,
        })
    }

    /// Aggregate statistics over the three stores.
    pub fn stats(&self) -> Result<IndexStats> {
        let store = self.metadata.stats()?;
        let bm25_dir = self.config.bm25_dir();
        let bm25_bytes: u64 = [
            bm25_dir.join(crate::bm25::INDEX_FILE),
            bm25_dir.join(crate::bm25::LENGTHS_FILE),
        ]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

        Ok(IndexStats {
            sources: store.sources,
            documents: store.documents,
            chunks: store.chunks,
            vectors: self.vectors.count(),
            bm25_terms: self.bm25.term_count(),
            index_size_bytes: self.metadata.file_size() + self.vectors.file_size() + bm25_bytes,
        })
    }
}
