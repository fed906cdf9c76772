//! Dense vector store: HNSW graph with filterable payloads.
//!
//! Vectors are L2-normalized on insert so cosine similarity reduces to dot
//! product. The HNSW graph supports online insert; deletion is a tombstone
//! (the graph slot is excluded from results and reclaimed by the rebuild on
//! next open). Payloads carry enough metadata for conjunctive filtering
//! without a metadata-store lookup.
//!
//! Readers run concurrently; the ingestion pipeline is the only writer.

mod persist;

use crate::error::NexusError;
use crate::filter::Filter;
use crate::types::{ChunkId, ChunkPayload};
use hnsw::{Hnsw, Searcher};
use persist::VectorDb;
use space::{Metric, Neighbor};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Floor for HNSW ef_search; scales up with the candidate count.
const MIN_EF_SEARCH: usize = 50;

/// Cosine distance scaled to u32 for the HNSW graph. Inputs are unit
/// vectors, so the dot product is the cosine similarity.
struct CosineDistance;

impl Metric<Box<[f32]>> for CosineDistance {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum();
        let distance = (1.0 - dot).clamp(0.0, 2.0);
        (distance * (u32::MAX as f32 / 2.0)) as u32
    }
}

fn similarity_from_distance(distance: u32) -> f32 {
    let d = distance as f32 / (u32::MAX as f32 / 2.0);
    (1.0 - d).clamp(0.0, 1.0)
}

/// Normalizes to unit length in place. Zero vectors are left untouched.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

struct GraphState {
    index: Hnsw<CosineDistance, Box<[f32]>, rand::rngs::StdRng, 16, 32>,
    insert_searcher: Searcher<u32>,
    /// Graph slot -> chunk id
    slots: Vec<ChunkId>,
    /// Live chunk id -> graph slot
    by_id: HashMap<ChunkId, usize>,
    /// Soft-deleted slots, excluded from results
    tombstones: HashSet<usize>,
    payloads: HashMap<ChunkId, ChunkPayload>,
}

impl std::fmt::Debug for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphState")
            .field("slots", &self.slots.len())
            .field("by_id", &self.by_id.len())
            .field("tombstones", &self.tombstones.len())
            .field("payloads", &self.payloads.len())
            .finish_non_exhaustive()
    }
}

impl GraphState {
    fn new() -> Self {
        Self {
            index: Hnsw::new(CosineDistance),
            insert_searcher: Searcher::default(),
            slots: Vec::new(),
            by_id: HashMap::new(),
            tombstones: HashSet::new(),
            payloads: HashMap::new(),
        }
    }

    fn insert(&mut self, chunk_id: ChunkId, vector: Box<[f32]>, payload: ChunkPayload) {
        if let Some(old_slot) = self.by_id.get(&chunk_id) {
            self.tombstones.insert(*old_slot);
        }
        let slot = self.slots.len();
        self.slots.push(chunk_id);
        self.index.insert(vector, &mut self.insert_searcher);
        self.by_id.insert(chunk_id, slot);
        self.payloads.insert(chunk_id, payload);
    }

    fn remove(&mut self, chunk_id: &ChunkId) -> bool {
        match self.by_id.remove(chunk_id) {
            Some(slot) => {
                self.tombstones.insert(slot);
                self.payloads.remove(chunk_id);
                true
            }
            None => false,
        }
    }

    fn live_count(&self) -> usize {
        self.by_id.len()
    }
}

/// The dense index with its backing storage.
#[derive(Debug)]
pub struct VectorStore {
    db: VectorDb,
    dimension: usize,
    model_id: String,
    state: RwLock<GraphState>,
}

impl VectorStore {
    /// Opens (or creates) the store under `dir` and rebuilds the graph from
    /// persisted rows.
    ///
    /// The recorded embedding model id must match `model_id`; a mismatch
    /// means query and chunk embeddings would come from different models,
    /// which is a fatal configuration error.
    pub fn open(dir: &Path, dimension: usize, model_id: &str) -> Result<Self, NexusError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            NexusError::Config(format!("cannot create vector dir {:?}: {}", dir, e))
        })?;
        let db = VectorDb::open(&dir.join("store.redb"))?;

        match db.read_meta()? {
            Some((recorded_model, recorded_dim)) => {
                if recorded_model != model_id {
                    return Err(NexusError::Config(format!(
                        "vector store was built with embedding model '{}' but '{}' is configured; \
                         reindex or restore the original model",
                        recorded_model, model_id
                    )));
                }
                if recorded_dim != dimension {
                    return Err(NexusError::Config(format!(
                        "vector store dimension {} does not match embedder dimension {}",
                        recorded_dim, dimension
                    )));
                }
            }
            None => db.write_meta(model_id, dimension)?,
        }

        let mut state = GraphState::new();
        let rows = db.load_all()?;
        let total = rows.len();
        for (chunk_id, embedding, payload) in rows {
            if embedding.len() != dimension {
                warn!(
                    chunk_id = %chunk_id,
                    expected = dimension,
                    actual = embedding.len(),
                    "Skipping persisted vector with wrong dimension"
                );
                continue;
            }
            state.insert(chunk_id, embedding.into_boxed_slice(), payload);
        }
        info!("Vector store ready: {} vectors ({} rows loaded)", state.live_count(), total);

        Ok(Self {
            db,
            dimension,
            model_id: model_id.to_string(),
            state: RwLock::new(state),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Upserts one vector with its payload.
    pub fn upsert(
        &self,
        chunk_id: ChunkId,
        vector: Vec<f32>,
        payload: ChunkPayload,
    ) -> Result<(), NexusError> {
        self.upsert_batch(vec![(chunk_id, vector, payload)])
    }

    /// Upserts a batch in one storage transaction, then updates the graph.
    pub fn upsert_batch(
        &self,
        mut items: Vec<(ChunkId, Vec<f32>, ChunkPayload)>,
    ) -> Result<(), NexusError> {
        if items.is_empty() {
            return Ok(());
        }
        for (chunk_id, vector, _) in &mut items {
            if vector.len() != self.dimension {
                return Err(NexusError::Index(format!(
                    "vector for chunk {} has dimension {}, expected {}",
                    chunk_id,
                    vector.len(),
                    self.dimension
                )));
            }
            l2_normalize(vector);
        }
        // Persist first so a crash leaves rows the startup rebuild can use.
        self.db.put_many(&items)?;

        let mut state = self.state.write().expect("vector lock poisoned");
        for (chunk_id, vector, payload) in items {
            state.insert(chunk_id, vector.into_boxed_slice(), payload);
        }
        Ok(())
    }

    /// Deletes chunks, returning how many were present.
    pub fn delete(&self, ids: &[ChunkId]) -> Result<usize, NexusError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.delete_many(ids)?;
        let mut state = self.state.write().expect("vector lock poisoned");
        let mut removed = 0;
        for id in ids {
            if state.remove(id) {
                removed += 1;
            }
        }
        debug!("Deleted {} of {} vectors", removed, ids.len());
        Ok(removed)
    }

    /// ANN search with optional conjunctive payload filter.
    ///
    /// Oversamples the graph when a filter or tombstones are present, then
    /// applies the filter before truncating to `k`. Results are
    /// (chunk id, cosine similarity) in descending similarity order, ties
    /// broken by ascending chunk id.
    pub fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<(ChunkId, f32)>, NexusError> {
        if vector.len() != self.dimension {
            return Err(NexusError::Index(format!(
                "query vector has dimension {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        let state = self.state.read().expect("vector lock poisoned");
        if k == 0 || state.live_count() == 0 {
            return Ok(Vec::new());
        }

        let mut query = vector.to_vec();
        l2_normalize(&mut query);
        let query: Box<[f32]> = query.into_boxed_slice();

        let oversample = if filter.is_some() { 4 } else { 2 };
        let fetch = (k * oversample + state.tombstones.len()).min(state.slots.len());
        let ef = (fetch * 2).max(MIN_EF_SEARCH);

        let mut searcher: Searcher<u32> = Searcher::default();
        let mut neighbors = vec![
            Neighbor {
                index: !0,
                distance: !0,
            };
            fetch
        ];
        state
            .index
            .nearest(&query, ef, &mut searcher, &mut neighbors);

        let filter_matches = |id: &ChunkId| match filter {
            Some(f) if !f.is_empty() => state
                .payloads
                .get(id)
                .map(|payload| f.matches(payload))
                .unwrap_or(false),
            _ => true,
        };

        let mut hits: Vec<(ChunkId, f32)> = neighbors
            .into_iter()
            .filter(|n| n.index != !0)
            .filter(|n| !state.tombstones.contains(&n.index))
            .filter_map(|n| {
                let chunk_id = state.slots[n.index];
                // A tombstoned id may have been re-inserted at a newer slot;
                // only the live slot counts.
                if state.by_id.get(&chunk_id) != Some(&n.index) {
                    return None;
                }
                if !filter_matches(&chunk_id) {
                    return None;
                }
                Some((chunk_id, similarity_from_distance(n.distance)))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn count(&self) -> usize {
        self.state.read().expect("vector lock poisoned").live_count()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.state
            .read()
            .expect("vector lock poisoned")
            .by_id
            .contains_key(id)
    }

    /// All live chunk ids, for consistency audits.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.state
            .read()
            .expect("vector lock poisoned")
            .by_id
            .keys()
            .copied()
            .collect()
    }

    pub fn payload(&self, id: &ChunkId) -> Option<ChunkPayload> {
        self.state
            .read()
            .expect("vector lock poisoned")
            .payloads
            .get(id)
            .cloned()
    }

    /// Stored (normalized) embedding for a chunk.
    pub fn embedding_of(&self, id: &ChunkId) -> Result<Option<Vec<f32>>, NexusError> {
        Ok(self.db.get_embedding(id)?)
    }

    pub fn file_size(&self) -> u64 {
        self.db.file_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentId, SourceId, SourceKind};
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn payload(tags: &[&str]) -> ChunkPayload {
        let source_id = SourceId::new("src");
        ChunkPayload {
            document_id: DocumentId::derive(&source_id, "/d.md"),
            source_id,
            uri: "/d.md".to_string(),
            kind: SourceKind::File,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            indexed_at: 1_700_000_000,
            section_path: vec![],
        }
    }

    fn id(n: u32) -> ChunkId {
        let source = SourceId::new("src");
        let doc = DocumentId::derive(&source, "/d.md");
        ChunkId::derive(&doc, n, "vec")
    }

    fn open_store(dir: &TempDir) -> VectorStore {
        VectorStore::open(dir.path(), DIM, "test-model").unwrap()
    }

    #[test]
    fn test_upsert_search_exact_match() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(id(1), vec![1.0, 0.0, 0.0, 0.0], payload(&[])).unwrap();
        store.upsert(id(2), vec![0.0, 1.0, 0.0, 0.0], payload(&[])).unwrap();
        store.upsert(id(3), vec![0.9, 0.1, 0.0, 0.0], payload(&[])).unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, id(1));
        assert!(hits[0].1 > 0.99, "exact match similarity was {}", hits[0].1);
        assert_eq!(hits[1].0, id(3));
    }

    #[test]
    fn test_vectors_normalized_on_insert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        // Same direction, different magnitudes: both should be unit vectors
        store.upsert(id(1), vec![10.0, 0.0, 0.0, 0.0], payload(&[])).unwrap();
        let stored = store.embedding_of(&id(1)).unwrap().unwrap();
        let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_delete_excludes_from_search() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(id(1), vec![1.0, 0.0, 0.0, 0.0], payload(&[])).unwrap();
        store.upsert(id(2), vec![0.9, 0.1, 0.0, 0.0], payload(&[])).unwrap();
        assert_eq!(store.count(), 2);

        assert_eq!(store.delete(&[id(1)]).unwrap(), 1);
        assert_eq!(store.count(), 1);
        assert!(!store.contains(&id(1)));
        assert!(store.embedding_of(&id(1)).unwrap().is_none());

        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 10, None).unwrap();
        assert!(hits.iter().all(|(cid, _)| *cid != id(1)));

        // Deleting again is a no-op
        assert_eq!(store.delete(&[id(1)]).unwrap(), 0);
    }

    #[test]
    fn test_filtered_search() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(id(1), vec![1.0, 0.0, 0.0, 0.0], payload(&["tutorial"])).unwrap();
        store.upsert(id(2), vec![0.99, 0.01, 0.0, 0.0], payload(&["ai"])).unwrap();

        let filter = Filter::parse("tag:ai").unwrap();
        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 10, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id(2));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.upsert(id(1), vec![1.0, 0.0], payload(&[])).is_err());
        assert!(store.search(&[1.0, 0.0], 5, None).is_err());
    }

    #[test]
    fn test_rebuild_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.upsert(id(1), vec![1.0, 0.0, 0.0, 0.0], payload(&["keep"])).unwrap();
            store.upsert(id(2), vec![0.0, 1.0, 0.0, 0.0], payload(&[])).unwrap();
            store.delete(&[id(2)]).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.count(), 1);
        assert!(store.contains(&id(1)));
        assert!(!store.contains(&id(2)));
        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 5, None).unwrap();
        assert_eq!(hits[0].0, id(1));
        assert_eq!(store.payload(&id(1)).unwrap().tags, vec!["keep"]);
    }

    #[test]
    fn test_model_id_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let _store = open_store(&dir);
        }
        let err = VectorStore::open(dir.path(), DIM, "other-model").unwrap_err();
        assert!(matches!(err, NexusError::Config(_)));
    }

    #[test]
    fn test_upsert_same_id_replaces() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(id(1), vec![1.0, 0.0, 0.0, 0.0], payload(&["old"])).unwrap();
        store.upsert(id(1), vec![0.0, 1.0, 0.0, 0.0], payload(&["new"])).unwrap();

        assert_eq!(store.count(), 1);
        assert_eq!(store.payload(&id(1)).unwrap().tags, vec!["new"]);
        let hits = store.search(&[0.0, 1.0, 0.0, 0.0], 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn test_search_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.search(&[1.0, 0.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    }
}
