//! Startup consistency audit.
//!
//! The core invariant is three-way: every live chunk id is present in the
//! metadata store, the vector store, and the BM25 index, or in none of
//! them. A torn write (crash mid-ingest) can break this; the audit repairs
//! it at startup with the metadata store as the source of truth:
//!
//! - ids present in an index but not in metadata are purged from the index
//! - ids present in metadata but missing a vector are re-embedded
//! - ids present in metadata but missing from BM25 are re-tokenized
//! - a persisted BM25 image that cannot be trusted is rebuilt wholesale
//!
//! Repairs are logged, never fatal.

use crate::bm25::{Bm25Index, Bm25Tokenizer};
use crate::embedding::SharedEmbedder;
use crate::error::{NexusError, Result};
use crate::ingest::chunk_payload;
use crate::storage::MetadataStore;
use crate::types::{ChunkId, ChunkPayload, ChunkRecord};
use crate::vector::VectorStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the audit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Index-only ids purged from the vector store
    pub purged_from_vectors: usize,
    /// Index-only ids purged from BM25
    pub purged_from_bm25: usize,
    /// Metadata chunks re-embedded into the vector store
    pub reembedded: usize,
    /// Metadata chunks re-added to BM25
    pub readded_to_bm25: usize,
}

impl AuditReport {
    pub fn clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs the orphan scan and repairs. Called once during startup, before the
/// service accepts queries.
pub async fn startup_audit(
    metadata: &Arc<MetadataStore>,
    vectors: &Arc<VectorStore>,
    bm25: &Arc<Bm25Index>,
    bm25_tokenizer: &Bm25Tokenizer,
    embedder: &SharedEmbedder,
) -> Result<AuditReport> {
    let mut report = AuditReport::default();
    let meta_ids: HashSet<ChunkId> = metadata.all_chunk_ids()?.into_iter().collect();

    // Index-only orphans: remove, metadata is the source of truth.
    let vector_orphans: Vec<ChunkId> = vectors
        .chunk_ids()
        .into_iter()
        .filter(|id| !meta_ids.contains(id))
        .collect();
    if !vector_orphans.is_empty() {
        warn!(
            count = vector_orphans.len(),
            "Purging vector-store chunks unknown to the metadata store"
        );
        report.purged_from_vectors = vectors.delete(&vector_orphans)?;
    }

    let bm25_orphans: Vec<ChunkId> = bm25
        .chunk_ids()
        .into_iter()
        .filter(|id| !meta_ids.contains(id))
        .collect();
    for id in &bm25_orphans {
        bm25.remove(id);
    }
    if !bm25_orphans.is_empty() {
        warn!(
            count = bm25_orphans.len(),
            "Purged BM25 chunks unknown to the metadata store"
        );
        report.purged_from_bm25 = bm25_orphans.len();
    }

    // Metadata chunks missing from an index: restore them.
    let missing_vectors: Vec<ChunkId> = meta_ids
        .iter()
        .filter(|id| !vectors.contains(id))
        .copied()
        .collect();
    if !missing_vectors.is_empty() {
        warn!(
            count = missing_vectors.len(),
            "Re-embedding chunks missing from the vector store"
        );
        report.reembedded = reembed(metadata, vectors, embedder, &missing_vectors).await?;
    }

    let missing_bm25: Vec<ChunkId> = meta_ids
        .iter()
        .filter(|id| !bm25.contains(id))
        .copied()
        .collect();
    if !missing_bm25.is_empty() {
        warn!(
            count = missing_bm25.len(),
            "Re-adding chunks missing from the BM25 index"
        );
        for record in metadata.get_chunks_by_ids(&missing_bm25)? {
            bm25.add(record.id, &bm25_tokenizer.tokenize(&record.text));
        }
        report.readded_to_bm25 = missing_bm25.len();
    }

    if report.clean() {
        debug!("Consistency audit clean: {} chunks", meta_ids.len());
    } else {
        info!(?report, "Consistency audit repaired index state");
    }
    Ok(report)
}

/// Rebuilds the BM25 index in full from the metadata store. Used when the
/// persisted image is missing, corrupt, or from another format version.
pub fn rebuild_bm25(
    metadata: &MetadataStore,
    bm25: &Bm25Index,
    bm25_tokenizer: &Bm25Tokenizer,
) -> Result<usize> {
    bm25.clear();
    let ids = metadata.all_chunk_ids()?;
    let records = metadata.get_chunks_by_ids(&ids)?;
    let count = records.len();
    for record in records {
        bm25.add(record.id, &bm25_tokenizer.tokenize(&record.text));
    }
    info!(chunks = count, "Rebuilt BM25 index from metadata store");
    Ok(count)
}

/// Re-embeds metadata chunks and upserts them into the vector store.
async fn reembed(
    metadata: &Arc<MetadataStore>,
    vectors: &Arc<VectorStore>,
    embedder: &SharedEmbedder,
    ids: &[ChunkId],
) -> Result<usize> {
    let records = metadata.get_chunks_by_ids(ids)?;
    if records.is_empty() {
        return Ok(0);
    }

    // Resolve documents and sources once per document.
    let mut payload_ctx = HashMap::new();
    for record in &records {
        if payload_ctx.contains_key(&record.document_id) {
            continue;
        }
        let Some(document) = metadata.get_document(&record.document_id)? else {
            warn!(
                chunk = %record.id,
                document = %record.document_id,
                "Chunk references a missing document; leaving for the next audit"
            );
            continue;
        };
        let Some(source) = metadata.get_source(&document.source_id)? else {
            warn!(document = %document.id, "Document references a missing source");
            continue;
        };
        payload_ctx.insert(record.document_id, (source, document));
    }

    let repairable: Vec<&ChunkRecord> = records
        .iter()
        .filter(|r| payload_ctx.contains_key(&r.document_id))
        .collect();
    let texts: Vec<String> = repairable.iter().map(|r| r.text.clone()).collect();
    let embedder = embedder.clone();
    let embeddings = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
        .await
        .map_err(|join| NexusError::Model(format!("embedding task failed: {}", join)))??;

    let upserts: Vec<(ChunkId, Vec<f32>, ChunkPayload)> = repairable
        .iter()
        .zip(embeddings)
        .map(|(record, embedding)| {
            let (source, document) = &payload_ctx[&record.document_id];
            (record.id, embedding, chunk_payload(source, document, record))
        })
        .collect();
    let count = upserts.len();
    vectors.upsert_batch(upserts)?;
    Ok(count)
}
