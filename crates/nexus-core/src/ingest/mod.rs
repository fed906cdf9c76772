//! Ingestion pipeline.
//!
//! The only writer to the vector store and the BM25 index. Updates are
//! expressed as a transition from the old chunk set to the new one: the
//! deterministic chunk ids make the diff a set operation, unchanged chunks
//! are never re-embedded, and re-ingesting identical bytes returns without
//! touching either index.
//!
//! Per-document critical sections serialize writes for one document without
//! serializing distinct documents. Index mutations commit the metadata store
//! last; if an index step fails, completed steps are inverted in reverse
//! order before the error surfaces.

pub mod loader;

pub use loader::{loader_for, DocumentLoader, LoadedDocument};

use crate::bm25::{Bm25Index, Bm25Tokenizer};
use crate::chunking::Chunker;
use crate::embedding::SharedEmbedder;
use crate::error::{NexusError, Result};
use crate::storage::MetadataStore;
use crate::types::{
    now_epoch, ChunkId, ChunkPayload, ChunkRecord, DeleteOutcome, Document, DocumentId,
    IngestOutcome, Source, SourceId,
};
use crate::vector::VectorStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, instrument, warn};

/// One document to ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source_id: SourceId,
    pub uri: String,
    pub bytes: Vec<u8>,
    /// Caller tags, merged with tags declared in the document
    pub tags: Vec<String>,
    /// Caller frontmatter overrides
    pub frontmatter: serde_json::Map<String, serde_json::Value>,
    pub mtime: Option<i64>,
}

impl IngestRequest {
    pub fn new(source_id: SourceId, uri: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source_id,
            uri: uri.into(),
            bytes,
            tags: Vec::new(),
            frontmatter: serde_json::Map::new(),
            mtime: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

pub struct IngestionPipeline {
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorStore>,
    bm25: Arc<Bm25Index>,
    bm25_tokenizer: Arc<Bm25Tokenizer>,
    chunker: Arc<Chunker>,
    embedder: SharedEmbedder,
    workers: usize,
    /// Per-document write locks; entries are created on demand
    doc_locks: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<MetadataStore>,
        vectors: Arc<VectorStore>,
        bm25: Arc<Bm25Index>,
        bm25_tokenizer: Arc<Bm25Tokenizer>,
        chunker: Arc<Chunker>,
        embedder: SharedEmbedder,
        workers: usize,
    ) -> Self {
        Self {
            metadata,
            vectors,
            bm25,
            bm25_tokenizer,
            chunker,
            embedder,
            workers: workers.max(1),
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    fn doc_lock(&self, id: DocumentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.doc_locks.lock().expect("doc lock table poisoned");
        locks.entry(id).or_default().clone()
    }

    /// Ingests one document end to end.
    #[instrument(skip_all, fields(uri = %request.uri))]
    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let source = self
            .metadata
            .get_source(&request.source_id)?
            .ok_or_else(|| {
                NexusError::corpus(
                    &request.uri,
                    format!("unknown source {}", request.source_id),
                )
            })?;
        let document_id = DocumentId::derive(&request.source_id, &request.uri);
        let lock = self.doc_lock(document_id);
        let _guard = lock.lock().await;

        // Change detection before any parsing: identical bytes are a no-op.
        let content_hash = blake3::hash(&request.bytes).to_hex().to_string();
        if let Some(existing) = self.metadata.get_document(&document_id)? {
            if existing.content_hash == content_hash {
                let kept = self.metadata.chunk_ids_of(&document_id)?.len();
                debug!(document = %document_id, kept, "Content unchanged, skipping");
                return Ok(IngestOutcome {
                    document_id,
                    added: 0,
                    removed: 0,
                    kept,
                });
            }
        }

        // Parse and chunk. Failures here are corpus errors: this document
        // is skipped, the batch continues.
        let loaded = loader_for(source.kind, &request.uri).load(&request.bytes, &request.uri)?;

        let mut tags = request.tags.clone();
        for tag in &loaded.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let mut frontmatter = loaded.frontmatter.clone();
        for (key, value) in &request.frontmatter {
            frontmatter.insert(key.clone(), value.clone());
        }

        let now = now_epoch();
        let document = Document {
            id: document_id,
            source_id: request.source_id.clone(),
            uri: request.uri.clone(),
            title: loaded.title.clone(),
            content_hash,
            byte_size: request.bytes.len() as u64,
            mtime: request.mtime,
            tags: tags.clone(),
            frontmatter,
            indexed_at: now,
        };
        let status = self.metadata.upsert_document(&document)?;

        let new_records: Vec<ChunkRecord> = self
            .chunker
            .chunk(&loaded.body, &loaded.structure)
            .into_iter()
            .enumerate()
            .map(|(ordinal, raw)| {
                let ordinal = ordinal as u32;
                ChunkRecord {
                    id: ChunkId::derive(&document_id, ordinal, &raw.text),
                    document_id,
                    ordinal,
                    text: raw.text,
                    char_start: raw.char_start,
                    char_end: raw.char_end,
                    section_path: raw.section_path,
                    token_count: raw.token_count as u32,
                    embedding_version: 1,
                    indexed_at: now,
                }
            })
            .collect();

        // Chunk-set transition via deterministic ids.
        let old_ids = self.metadata.chunk_ids_of(&document_id)?;
        let old_set: HashSet<ChunkId> = old_ids.iter().copied().collect();
        let new_set: HashSet<ChunkId> = new_records.iter().map(|c| c.id).collect();
        let added: Vec<&ChunkRecord> = new_records
            .iter()
            .filter(|c| !old_set.contains(&c.id))
            .collect();
        let removed: Vec<ChunkId> = old_ids
            .iter()
            .filter(|id| !new_set.contains(id))
            .copied()
            .collect();
        let kept = new_records.len() - added.len();

        // Embed only the added chunks, in batches.
        let embeddings = {
            let embedder = self.embedder.clone();
            let texts: Vec<String> = added.iter().map(|c| c.text.clone()).collect();
            tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
                .await
                .map_err(|join| NexusError::Model(format!("embedding task failed: {}", join)))??
        };
        if embeddings.len() != added.len() {
            return Err(NexusError::Model(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                added.len()
            )));
        }

        let upserts: Vec<(ChunkId, Vec<f32>, ChunkPayload)> = added
            .iter()
            .zip(embeddings)
            .map(|(record, embedding)| {
                (
                    record.id,
                    embedding,
                    chunk_payload(&source, &document, record),
                )
            })
            .collect();

        // Snapshot removed-chunk state so index steps can be inverted.
        let removed_records = self.metadata.get_chunks_by_ids(&removed)?;
        let mut removed_state: Vec<(ChunkId, Vec<f32>, ChunkPayload)> = Vec::new();
        for id in &removed {
            if let (Some(embedding), Some(payload)) =
                (self.vectors.embedding_of(id)?, self.vectors.payload(id))
            {
                removed_state.push((*id, embedding, payload));
            }
        }

        self.apply_index_transition(&document_id, &upserts, &removed, &removed_records, removed_state, &new_records)?;

        info!(
            document = %document_id,
            ?status,
            added = added.len(),
            removed = removed.len(),
            kept,
            "Ingested document"
        );
        Ok(IngestOutcome {
            document_id,
            added: added.len(),
            removed: removed.len(),
            kept,
        })
    }

    /// Applies the dual-index swap with rollback, committing metadata last.
    fn apply_index_transition(
        &self,
        document_id: &DocumentId,
        upserts: &[(ChunkId, Vec<f32>, ChunkPayload)],
        removed: &[ChunkId],
        removed_records: &[ChunkRecord],
        removed_state: Vec<(ChunkId, Vec<f32>, ChunkPayload)>,
        new_records: &[ChunkRecord],
    ) -> Result<()> {
        let added_ids: Vec<ChunkId> = upserts.iter().map(|(id, _, _)| *id).collect();

        let restore_removed = |this: &Self| {
            for record in removed_records {
                this.bm25
                    .add(record.id, &this.bm25_tokenizer.tokenize(&record.text));
            }
            if let Err(e) = this.vectors.upsert_batch(removed_state.clone()) {
                warn!("Rollback failed to restore removed vectors: {}", e);
            }
        };

        // 1. Remove outgoing chunks from both indexes.
        self.vectors
            .delete(removed)
            .map_err(|e| NexusError::Index(e.to_string()))?;
        for id in removed {
            self.bm25.remove(id);
        }

        // 2. Insert incoming chunks.
        if let Err(e) = self.vectors.upsert_batch(upserts.to_vec()) {
            restore_removed(self);
            return Err(NexusError::Index(e.to_string()));
        }
        for record in new_records {
            if added_ids.contains(&record.id) {
                self.bm25
                    .add(record.id, &self.bm25_tokenizer.tokenize(&record.text));
            }
        }

        // 3. Metadata commit last: it is the source of truth for repair.
        if let Err(e) = self.metadata.replace_chunks(document_id, new_records) {
            for id in &added_ids {
                self.bm25.remove(id);
            }
            if let Err(rollback) = self.vectors.delete(&added_ids) {
                warn!("Rollback failed to delete added vectors: {}", rollback);
            }
            restore_removed(self);
            return Err(NexusError::Index(format!(
                "metadata commit failed after index writes: {}",
                e
            )));
        }
        Ok(())
    }

    /// Deletes a document and all its chunks from the three stores.
    #[instrument(skip_all, fields(document = %document_id))]
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<DeleteOutcome> {
        let lock = self.doc_lock(document_id);
        let _guard = lock.lock().await;

        let chunk_ids = self.metadata.chunk_ids_of(&document_id)?;
        self.vectors.delete(&chunk_ids)?;
        for id in &chunk_ids {
            self.bm25.remove(id);
        }
        self.metadata.delete_document(&document_id)?;

        info!(removed = chunk_ids.len(), "Deleted document");
        Ok(DeleteOutcome {
            removed: chunk_ids.len(),
        })
    }

    /// Ingests many documents with bounded concurrency. Per-document
    /// failures are collected, never aborting the batch.
    pub async fn ingest_batch(
        self: &Arc<Self>,
        requests: Vec<IngestRequest>,
    ) -> Vec<Result<IngestOutcome>> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let futures = requests.into_iter().map(|request| {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                this.ingest_document(request).await
            }
        });
        futures::future::join_all(futures).await
    }

    /// Spawns the bounded work queue with a fixed worker pool. Submitters
    /// block when the queue is full (back-pressure toward the watcher).
    pub fn spawn_queue(self: &Arc<Self>, capacity: usize) -> IngestQueue {
        let (tx, rx) = mpsc::channel::<IngestJob>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..self.workers {
            let rx = Arc::clone(&rx);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    let result = this.ingest_document(job.request).await;
                    let _ = job.reply.send(result);
                }
            });
        }
        IngestQueue { tx }
    }
}

/// Builds the vector-store payload for a chunk.
pub(crate) fn chunk_payload(
    source: &Source,
    document: &Document,
    record: &ChunkRecord,
) -> ChunkPayload {
    ChunkPayload {
        source_id: document.source_id.clone(),
        document_id: document.id,
        uri: document.uri.clone(),
        kind: source.kind,
        tags: document.tags.clone(),
        indexed_at: record.indexed_at,
        section_path: record.section_path.clone(),
    }
}

struct IngestJob {
    request: IngestRequest,
    reply: oneshot::Sender<Result<IngestOutcome>>,
}

/// Handle to the bounded ingest queue.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestJob>,
}

impl IngestQueue {
    /// Enqueues a request, awaiting if the queue is full. The returned
    /// receiver resolves with the outcome once a worker finishes.
    pub async fn submit(
        &self,
        request: IngestRequest,
    ) -> Result<oneshot::Receiver<Result<IngestOutcome>>> {
        let (reply, receiver) = oneshot::channel();
        self.tx
            .send(IngestJob { request, reply })
            .await
            .map_err(|_| NexusError::Index("ingest queue is shut down".to_string()))?;
        Ok(receiver)
    }

    /// Enqueues a request and awaits its outcome.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let receiver = self.submit(request).await?;
        receiver
            .await
            .map_err(|_| NexusError::Index("ingest worker dropped the job".to_string()))?
    }
}
