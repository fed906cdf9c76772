//! Weighted Reciprocal Rank Fusion.
//!
//! RRF combines ranked lists using rank positions only, which makes it
//! robust to the incomparable score scales of cosine similarity and BM25.
//! The k constant (60) is the recommendation of Cormack, Clarke & Buettcher
//! (SIGIR 2009); alpha splits the weight between the dense and sparse lists.

use crate::types::ChunkId;
use std::collections::HashMap;

/// Standard RRF rank constant.
pub const RRF_K: f32 = 60.0;

/// One fused candidate with its per-list diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    /// 1-based rank in the dense list, if present
    pub dense_rank: Option<u32>,
    /// 1-based rank in the sparse list, if present
    pub sparse_rank: Option<u32>,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
}

/// Fuses a dense and a sparse candidate list.
///
/// `score(id) = alpha * 1/(k + rank_dense) + (1 - alpha) * 1/(k + rank_sparse)`,
/// with an absent list contributing nothing. Output is sorted by descending
/// fused score; ties order by descending dense score (absent last), then by
/// ascending chunk id, so results are fully deterministic.
pub fn weighted_rrf(
    dense: &[(ChunkId, f32)],
    sparse: &[(ChunkId, f32)],
    alpha: f32,
    k: f32,
) -> Vec<FusedHit> {
    let mut hits: HashMap<ChunkId, FusedHit> = HashMap::with_capacity(dense.len() + sparse.len());

    for (rank, (chunk_id, score)) in dense.iter().enumerate() {
        let rank = rank as u32 + 1;
        let entry = hits.entry(*chunk_id).or_insert_with(|| FusedHit {
            chunk_id: *chunk_id,
            score: 0.0,
            dense_rank: None,
            sparse_rank: None,
            dense_score: None,
            sparse_score: None,
        });
        entry.score += alpha / (k + rank as f32);
        entry.dense_rank = Some(rank);
        entry.dense_score = Some(*score);
    }

    for (rank, (chunk_id, score)) in sparse.iter().enumerate() {
        let rank = rank as u32 + 1;
        let entry = hits.entry(*chunk_id).or_insert_with(|| FusedHit {
            chunk_id: *chunk_id,
            score: 0.0,
            dense_rank: None,
            sparse_rank: None,
            dense_score: None,
            sparse_score: None,
        });
        entry.score += (1.0 - alpha) / (k + rank as f32);
        entry.sparse_rank = Some(rank);
        entry.sparse_score = Some(*score);
    }

    let mut fused: Vec<FusedHit> = hits.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| match (b.dense_score, a.dense_score) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentId, SourceId, SourceKind};

    fn id(n: u32) -> ChunkId {
        let source = SourceId::derive(SourceKind::File, "/fusion.md");
        let doc = DocumentId::derive(&source, "/fusion.md");
        ChunkId::derive(&doc, n, "fixture")
    }

    #[test]
    fn test_items_in_both_lists_rank_first() {
        let dense = vec![(id(1), 0.9), (id(2), 0.8), (id(3), 0.7)];
        let sparse = vec![(id(3), 10.0), (id(1), 8.0), (id(4), 5.0)];

        let fused = weighted_rrf(&dense, &sparse, 0.5, RRF_K);
        assert_eq!(fused.len(), 4);
        let top: Vec<ChunkId> = fused.iter().take(2).map(|h| h.chunk_id).collect();
        assert!(top.contains(&id(1)));
        assert!(top.contains(&id(3)));
    }

    #[test]
    fn test_never_ranks_chunk_absent_from_both() {
        let dense = vec![(id(1), 0.9)];
        let sparse = vec![(id(2), 3.0)];
        let fused = weighted_rrf(&dense, &sparse, 0.5, RRF_K);
        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|h| h.chunk_id == id(1) || h.chunk_id == id(2)));
    }

    #[test]
    fn test_diagnostics_carry_ranks_and_scores() {
        let dense = vec![(id(1), 0.9), (id(2), 0.5)];
        let sparse = vec![(id(2), 7.0)];
        let fused = weighted_rrf(&dense, &sparse, 0.5, RRF_K);

        let h1 = fused.iter().find(|h| h.chunk_id == id(1)).unwrap();
        assert_eq!(h1.dense_rank, Some(1));
        assert_eq!(h1.sparse_rank, None);
        assert_eq!(h1.dense_score, Some(0.9));

        let h2 = fused.iter().find(|h| h.chunk_id == id(2)).unwrap();
        assert_eq!(h2.dense_rank, Some(2));
        assert_eq!(h2.sparse_rank, Some(1));
        assert_eq!(h2.sparse_score, Some(7.0));
    }

    #[test]
    fn test_alpha_extremes() {
        let dense = vec![(id(1), 0.9), (id(2), 0.8)];
        let sparse = vec![(id(2), 9.0), (id(1), 1.0)];

        // All weight on dense: dense order wins
        let fused = weighted_rrf(&dense, &sparse, 1.0, RRF_K);
        assert_eq!(fused[0].chunk_id, id(1));

        // All weight on sparse: sparse order wins
        let fused = weighted_rrf(&dense, &sparse, 0.0, RRF_K);
        assert_eq!(fused[0].chunk_id, id(2));
    }

    #[test]
    fn test_symmetric_ranks_tie_break_deterministically() {
        // id(1): dense rank 1, sparse rank 2; id(2): dense rank 2, sparse rank 1
        let dense = vec![(id(1), 0.9), (id(2), 0.9)];
        let sparse = vec![(id(2), 5.0), (id(1), 5.0)];
        let fused = weighted_rrf(&dense, &sparse, 0.5, RRF_K);
        assert!((fused[0].score - fused[1].score).abs() < 1e-6);
        // Equal RRF and dense scores: ascending chunk id decides
        assert!(fused[0].chunk_id < fused[1].chunk_id);
    }

    #[test]
    fn test_empty_inputs() {
        let empty: Vec<(ChunkId, f32)> = Vec::new();
        assert!(weighted_rrf(&empty, &empty, 0.5, RRF_K).is_empty());

        let sparse = vec![(id(1), 2.0), (id(2), 1.0)];
        let fused = weighted_rrf(&empty, &sparse, 0.5, RRF_K);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].chunk_id, id(1));
    }

    #[test]
    fn test_rank_not_score_drives_fusion() {
        // Wildly different score scales must not matter
        let dense = vec![(id(1), 1000.0), (id(2), 0.0001)];
        let sparse = vec![(id(2), 0.5), (id(1), 0.4)];
        let fused = weighted_rrf(&dense, &sparse, 0.5, RRF_K);
        let s1 = fused.iter().find(|h| h.chunk_id == id(1)).unwrap().score;
        let s2 = fused.iter().find(|h| h.chunk_id == id(2)).unwrap().score;
        assert!((s1 - s2).abs() < 1e-6, "symmetric ranks give equal scores");
    }
}
