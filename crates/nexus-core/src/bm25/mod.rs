//! Incremental BM25 posting-list index.
//!
//! Classic BM25 over the set of live chunks. Inserts update document
//! frequencies, posting lists, and the average document length
//! incrementally; removal decrements `df` and drops a term from the
//! dictionary when it reaches zero. The index is the sparse half of hybrid
//! retrieval and must always agree with the vector store and the metadata
//! store on which chunk ids exist.
//!
//! Interior locking is reader-writer: the ingestion pipeline is the only
//! writer, queries read concurrently.

mod persist;
pub mod tokenize;

pub use persist::{Bm25LoadError, INDEX_FILE, LENGTHS_FILE};
pub use tokenize::{Bm25Tokenizer, DEFAULT_STOP_WORDS};

use crate::types::ChunkId;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// BM25 scoring parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Bm25State {
    /// term -> (chunk_id -> term frequency). BTreeMap keeps the dictionary
    /// sorted by term, which is also the on-disk order.
    pub(crate) postings: BTreeMap<String, HashMap<ChunkId, u32>>,
    /// Inverse map used for O(|terms in chunk|) removal. Never persisted;
    /// rebuilt from postings on load.
    pub(crate) chunk_terms: HashMap<ChunkId, Vec<(String, u32)>>,
    /// Per-chunk token counts
    pub(crate) lengths: HashMap<ChunkId, u32>,
    pub(crate) total_len: u64,
}

impl Bm25State {
    fn avg_doc_len(&self) -> f32 {
        if self.lengths.is_empty() {
            0.0
        } else {
            self.total_len as f32 / self.lengths.len() as f32
        }
    }
}

/// The sparse index. Cheap to share behind an `Arc`.
pub struct Bm25Index {
    params: Bm25Params,
    state: RwLock<Bm25State>,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            state: RwLock::new(Bm25State::default()),
        }
    }

    pub(crate) fn from_state(params: Bm25Params, state: Bm25State) -> Self {
        Self {
            params,
            state: RwLock::new(state),
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Adds (or replaces) a chunk's tokens.
    pub fn add(&self, chunk_id: ChunkId, tokens: &[String]) {
        let mut state = self.state.write().expect("bm25 lock poisoned");
        remove_inner(&mut state, &chunk_id);

        let mut freqs: HashMap<&String, u32> = HashMap::new();
        for token in tokens {
            *freqs.entry(token).or_insert(0) += 1;
        }

        let mut terms = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            state
                .postings
                .entry(term.clone())
                .or_default()
                .insert(chunk_id, tf);
            terms.push((term.clone(), tf));
        }
        terms.sort_by(|a, b| a.0.cmp(&b.0));
        state.chunk_terms.insert(chunk_id, terms);
        state.lengths.insert(chunk_id, tokens.len() as u32);
        state.total_len += tokens.len() as u64;
    }

    /// Removes a chunk. Returns false when the id was not indexed.
    pub fn remove(&self, chunk_id: &ChunkId) -> bool {
        let mut state = self.state.write().expect("bm25 lock poisoned");
        remove_inner(&mut state, chunk_id)
    }

    /// Scores the query terms against the corpus.
    ///
    /// The filter predicate is applied to candidates *before* truncation to
    /// `k`, so filtered searches are not starved by high-scoring excluded
    /// chunks. Ties order by descending score, then ascending chunk id.
    pub fn search(
        &self,
        query_tokens: &[String],
        k: usize,
        filter: Option<&dyn Fn(&ChunkId) -> bool>,
    ) -> Vec<(ChunkId, f32)> {
        if k == 0 || query_tokens.is_empty() {
            return Vec::new();
        }
        let state = self.state.read().expect("bm25 lock poisoned");
        let n = state.lengths.len();
        if n == 0 {
            return Vec::new();
        }
        let avgdl = state.avg_doc_len();
        let Bm25Params { k1, b } = self.params;

        let mut scores: HashMap<ChunkId, f32> = HashMap::new();
        for term in query_tokens {
            let Some(postings) = state.postings.get(term) else {
                continue;
            };
            let df = postings.len() as f32;
            let idf = ((n as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (chunk_id, &tf) in postings {
                let len = *state.lengths.get(chunk_id).unwrap_or(&0) as f32;
                let tf = tf as f32;
                let denom = tf + k1 * (1.0 - b + b * len / avgdl.max(f32::EPSILON));
                *scores.entry(*chunk_id).or_insert(0.0) += idf * (tf * (k1 + 1.0)) / denom;
            }
        }
        drop(state);

        let mut hits: Vec<(ChunkId, f32)> = match filter {
            Some(pred) => scores.into_iter().filter(|(id, _)| pred(id)).collect(),
            None => scores.into_iter().collect(),
        };
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }

    /// Number of indexed chunks.
    pub fn doc_count(&self) -> usize {
        self.state.read().expect("bm25 lock poisoned").lengths.len()
    }

    /// Number of distinct terms in the dictionary.
    pub fn term_count(&self) -> usize {
        self.state.read().expect("bm25 lock poisoned").postings.len()
    }

    pub fn avg_doc_len(&self) -> f32 {
        self.state.read().expect("bm25 lock poisoned").avg_doc_len()
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.state
            .read()
            .expect("bm25 lock poisoned")
            .lengths
            .contains_key(chunk_id)
    }

    /// All indexed chunk ids, for consistency audits.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.state
            .read()
            .expect("bm25 lock poisoned")
            .lengths
            .keys()
            .copied()
            .collect()
    }

    /// Drops every posting. Used by the rebuild path.
    pub fn clear(&self) {
        let mut state = self.state.write().expect("bm25 lock poisoned");
        *state = Bm25State::default();
        debug!("Cleared BM25 index");
    }
}

fn remove_inner(state: &mut Bm25State, chunk_id: &ChunkId) -> bool {
    let Some(terms) = state.chunk_terms.remove(chunk_id) else {
        return false;
    };
    for (term, _) in &terms {
        if let Some(postings) = state.postings.get_mut(term) {
            postings.remove(chunk_id);
            if postings.is_empty() {
                state.postings.remove(term);
            }
        }
    }
    if let Some(len) = state.lengths.remove(chunk_id) {
        state.total_len -= len as u64;
    }
    true
}
