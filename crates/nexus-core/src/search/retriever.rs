//! Hybrid retriever: the query orchestrator.
//!
//! Pipeline stages: validate -> extract filter hints -> embed query ->
//! parallel dense + sparse retrieval -> RRF fusion -> hydrate -> optional
//! cross-encoder rerank. Stage transitions are the cancellation
//! checkpoints: every stage boundary is an await point, so dropping the
//! future abandons the query.
//!
//! The per-query deadline is computed once at entry and covers the whole
//! pipeline: each stage runs under `min(stage budget, time remaining)` and
//! the remainder is re-checked at every stage boundary. A breach before a
//! ranked list exists (embedding, dense/sparse) is a `Deadline` error; a
//! breach at or during the rerank stage yields the partial result instead,
//! RRF order with `rerank_used = false`, never an error. Hydration is how
//! that partial result is materialized, so it always runs to completion (a
//! bounded local B-tree read).

use crate::bm25::{Bm25Index, Bm25Tokenizer};
use crate::config::RetrievalConfig;
use crate::error::{NexusError, Result};
use crate::filter::{split_query_hints, Filter};
use crate::rerank::SharedCrossEncoder;
use crate::search::fusion::{weighted_rrf, FusedHit, RRF_K};
use crate::storage::MetadataStore;
use crate::types::{ChunkId, ChunkRecord, SearchResult};
use crate::vector::VectorStore;
use crate::embedding::SharedEmbedder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Maximum query length in characters.
const MAX_QUERY_CHARS: usize = 1000;

/// Time left before the per-query deadline, saturating at zero.
fn time_left(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Per-call knobs, defaulted from [`RetrievalConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub use_rerank: bool,
    pub dense_k: usize,
    pub sparse_k: usize,
    pub rerank_k: usize,
    pub alpha: f32,
}

impl SearchOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            use_rerank: true,
            dense_k: config.dense_k,
            sparse_k: config.sparse_k,
            rerank_k: config.rerank_k,
            alpha: config.alpha,
        }
    }
}

pub struct HybridRetriever {
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorStore>,
    bm25: Arc<Bm25Index>,
    bm25_tokenizer: Arc<Bm25Tokenizer>,
    embedder: SharedEmbedder,
    reranker: Option<SharedCrossEncoder>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        metadata: Arc<MetadataStore>,
        vectors: Arc<VectorStore>,
        bm25: Arc<Bm25Index>,
        bm25_tokenizer: Arc<Bm25Tokenizer>,
        embedder: SharedEmbedder,
        reranker: Option<SharedCrossEncoder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            metadata,
            vectors,
            bm25,
            bm25_tokenizer,
            embedder,
            reranker,
            config,
        }
    }

    pub fn default_options(&self) -> SearchOptions {
        SearchOptions::from_config(&self.config)
    }

    /// Runs the full hybrid pipeline.
    #[instrument(skip_all, fields(limit))]
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Filter,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        // Stage 1: query processing.
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(NexusError::Query("query is empty".to_string()));
        }
        if trimmed.chars().count() > MAX_QUERY_CHARS {
            return Err(NexusError::Query(format!(
                "query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }
        if limit == 0 {
            return Err(NexusError::Query("limit must be > 0".to_string()));
        }
        let (query_text, hints) = split_query_hints(trimmed);
        if query_text.is_empty() {
            return Err(NexusError::Query(
                "query is empty after filter hints".to_string(),
            ));
        }
        let filter = filter.and(hints);
        let query_tokens = self.bm25_tokenizer.tokenize(&query_text);

        // The whole pipeline runs against this one deadline; stage budgets
        // are capped by whatever of it remains.
        let deadline = Instant::now() + Duration::from_millis(self.config.query_deadline_ms);

        // Stage 2: query embedding, under its budget.
        let embed_budget = Duration::from_millis(self.config.embed_budget_ms).min(time_left(deadline));
        if embed_budget.is_zero() {
            return Err(NexusError::Deadline {
                stage: "query embedding",
            });
        }
        let query_vector = {
            let embedder = self.embedder.clone();
            let text = query_text.clone();
            match timeout(
                embed_budget,
                spawn_blocking(move || embedder.embed_query(&text)),
            )
            .await
            {
                Err(_) => {
                    return Err(NexusError::Deadline {
                        stage: "query embedding",
                    })
                }
                Ok(Err(join)) => {
                    return Err(NexusError::Model(format!("embedding task failed: {}", join)))
                }
                Ok(Ok(Err(e))) => return Err(e.into()),
                Ok(Ok(Ok(vector))) => vector,
            }
        };

        // Stage 3: dense and sparse retrieval in parallel.
        let search_budget =
            Duration::from_millis(self.config.search_budget_ms).min(time_left(deadline));
        if search_budget.is_zero() {
            return Err(NexusError::Deadline {
                stage: "dense/sparse retrieval",
            });
        }
        let (dense, sparse) = {
            let vectors = self.vectors.clone();
            let dense_filter = filter.clone();
            let dense_k = options.dense_k;
            let dense_vector = query_vector.clone();
            let dense_task = spawn_blocking(move || {
                vectors.search(&dense_vector, dense_k, Some(&dense_filter))
            });

            let bm25 = self.bm25.clone();
            let payload_source = self.vectors.clone();
            let sparse_filter = filter.clone();
            let sparse_k = options.sparse_k;
            let tokens = query_tokens.clone();
            let sparse_task = spawn_blocking(move || {
                if sparse_filter.is_empty() {
                    bm25.search(&tokens, sparse_k, None)
                } else {
                    let predicate = |id: &ChunkId| {
                        payload_source
                            .payload(id)
                            .map(|payload| sparse_filter.matches(&payload))
                            .unwrap_or(false)
                    };
                    bm25.search(&tokens, sparse_k, Some(&predicate))
                }
            });

            match timeout(search_budget, async {
                tokio::join!(dense_task, sparse_task)
            })
            .await
            {
                Err(_) => {
                    return Err(NexusError::Deadline {
                        stage: "dense/sparse retrieval",
                    })
                }
                Ok((Err(join), _)) | Ok((_, Err(join))) => {
                    return Err(NexusError::Index(format!("retrieval task failed: {}", join)))
                }
                Ok((Ok(dense), Ok(sparse))) => (dense?, sparse),
            }
        };
        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            "Retrieved candidates"
        );

        // Both retrievers empty after filtering: return nothing, never
        // relax the filter.
        if dense.is_empty() && sparse.is_empty() {
            return Ok(Vec::new());
        }

        // Stage 4: RRF fusion.
        let mut fused = weighted_rrf(&dense, &sparse, options.alpha, RRF_K);
        let rerank_active =
            options.use_rerank && options.rerank_k > 0 && self.reranker.is_some();
        fused.truncate(if rerank_active {
            options.rerank_k
        } else {
            limit
        });

        // Stage 5: hydrate candidate text (needed by the cross-encoder too).
        let ids: Vec<ChunkId> = fused.iter().map(|h| h.chunk_id).collect();
        let records = self.metadata.get_chunks_by_ids(&ids)?;
        let by_id: HashMap<ChunkId, ChunkRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();
        let mut candidates: Vec<(FusedHit, ChunkRecord)> = Vec::with_capacity(fused.len());
        for hit in fused {
            match by_id.get(&hit.chunk_id) {
                Some(record) => candidates.push((hit, record.clone())),
                // Concurrent delete between retrieval and hydration
                None => warn!(chunk_id = %hit.chunk_id, "Chunk missing during hydration, skipping"),
            }
        }

        // Stage 6: optional cross-encoder rerank, best-effort. A breach of
        // the per-query deadline here yields the partial result (RRF order),
        // never an error.
        let mut rerank_used = false;
        let mut rerank_scores: Vec<Option<f32>> = vec![None; candidates.len()];
        let rerank_budget =
            Duration::from_millis(self.config.rerank_budget_ms).min(time_left(deadline));
        if let Some(reranker) = self
            .reranker
            .clone()
            .filter(|_| rerank_active && !candidates.is_empty())
        {
            if rerank_budget.is_zero() {
                warn!("Per-query deadline exhausted before rerank, returning RRF order");
            } else {
                let text = query_text.clone();
                let passages: Vec<String> =
                    candidates.iter().map(|(_, r)| r.text.clone()).collect();
                match timeout(
                    rerank_budget,
                    spawn_blocking(move || reranker.score(&text, &passages)),
                )
                .await
                {
                    Ok(Ok(Ok(scores))) if scores.len() == candidates.len() => {
                        rerank_scores = scores.into_iter().map(Some).collect();
                        rerank_used = true;
                    }
                    Ok(Ok(Ok(scores))) => {
                        warn!(
                            expected = candidates.len(),
                            actual = scores.len(),
                            "Reranker returned wrong score count, falling back to RRF order"
                        );
                    }
                    Ok(Ok(Err(e))) => {
                        warn!("Rerank failed, falling back to RRF order: {}", e);
                    }
                    Ok(Err(join)) => {
                        warn!("Rerank task failed, falling back to RRF order: {}", join);
                    }
                    Err(_) => {
                        warn!(
                            budget_ms = rerank_budget.as_millis() as u64,
                            "Rerank exceeded its budget, falling back to RRF order"
                        );
                    }
                }
            }
        }

        let mut ranked: Vec<(FusedHit, ChunkRecord, Option<f32>)> = candidates
            .into_iter()
            .zip(rerank_scores)
            .map(|((hit, record), score)| (hit, record, score))
            .collect();
        if rerank_used {
            // Stable sort: equal rerank scores preserve incoming RRF order.
            ranked.sort_by(|a, b| {
                b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        ranked.truncate(limit);

        Ok(ranked
            .into_iter()
            .map(|(hit, record, rerank_score)| {
                let payload = self.vectors.payload(&hit.chunk_id);
                SearchResult {
                    chunk_id: hit.chunk_id,
                    score: rerank_score.unwrap_or(hit.score),
                    text: record.text,
                    document_id: record.document_id,
                    uri: payload.map(|p| p.uri).unwrap_or_default(),
                    section_path: record.section_path,
                    char_start: record.char_start,
                    char_end: record.char_end,
                    dense_rank: hit.dense_rank,
                    sparse_rank: hit.sparse_rank,
                    dense_score: hit.dense_score,
                    sparse_score: hit.sparse_score,
                    rerank_score,
                    rerank_used,
                }
            })
            .collect())
    }

    /// Dense-only nearest neighbors of an already-indexed chunk.
    pub async fn find_related(&self, chunk_id: ChunkId, limit: usize) -> Result<Vec<SearchResult>> {
        if limit == 0 {
            return Err(NexusError::Query("limit must be > 0".to_string()));
        }
        let Some(embedding) = self.vectors.embedding_of(&chunk_id)? else {
            return Err(NexusError::Query(format!("unknown chunk id {}", chunk_id)));
        };

        let vectors = self.vectors.clone();
        let hits = spawn_blocking(move || vectors.search(&embedding, limit + 1, None))
            .await
            .map_err(|join| NexusError::Index(format!("retrieval task failed: {}", join)))??;

        let neighbor_ids: Vec<ChunkId> = hits
            .iter()
            .filter(|(id, _)| *id != chunk_id)
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        let scores: HashMap<ChunkId, f32> = hits.into_iter().collect();
        let records = self.metadata.get_chunks_by_ids(&neighbor_ids)?;

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                let score = scores.get(&record.id).copied().unwrap_or(0.0);
                let payload = self.vectors.payload(&record.id);
                SearchResult {
                    chunk_id: record.id,
                    score,
                    text: record.text,
                    document_id: record.document_id,
                    uri: payload.map(|p| p.uri).unwrap_or_default(),
                    section_path: record.section_path,
                    char_start: record.char_start,
                    char_end: record.char_end,
                    dense_rank: Some(i as u32 + 1),
                    sparse_rank: None,
                    dense_score: Some(score),
                    sparse_score: None,
                    rerank_score: None,
                    rerank_used: false,
                }
            })
            .collect())
    }
}
