//! Approximate-nearest-neighbor acceleration for the vector index.
//!
//! The accelerator is a capability-checked trait with a guaranteed
//! fallback: when no accelerator is available (never built, invalidated
//! by writes, or its descriptor file is missing/corrupt) the index falls
//! back to a brute-force cosine scan over the embedding rows. Candidates
//! from the accelerator are always exact-rescored by the caller, so the
//! accelerator only has to be approximately right.

use std::sync::Mutex;

use hnsw::{Hnsw, Searcher};
use space::{Metric, Neighbor};

/// ef_search floor; scaled as max(k * 2, MIN_EF_SEARCH) per query.
const MIN_EF_SEARCH: usize = 50;

/// Cosine distance over owned embedding rows, scaled to u32 as required
/// by the HNSW unit type.
struct CosineDistance;

impl Metric<Box<[f32]>> for CosineDistance {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let a_slice: &[f32] = a;
        let b_slice: &[f32] = b;

        let dot: f32 = a_slice.iter().zip(b_slice.iter()).map(|(&x, &y)| x * y).sum();
        let mag_a: f32 = a_slice.iter().map(|x| x * x).sum::<f32>().sqrt();
        let mag_b: f32 = b_slice.iter().map(|y| y * y).sum::<f32>().sqrt();

        if mag_a == 0.0 || mag_b == 0.0 {
            return u32::MAX;
        }

        // Distance is in [0, 2]; scale to the u32 range.
        let distance = 1.0 - dot / (mag_a * mag_b);
        (distance * (u32::MAX as f32 / 2.0)) as u32
    }
}

/// Candidate generator over embedding row numbers.
pub trait AnnAccelerator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Row numbers of the approximate nearest neighbors, best first.
    fn shortlist(&self, query: &[f32], k: usize) -> Vec<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// HNSW-backed accelerator (M=16, M0=32, the paper's recommendation for
/// balanced recall/memory).
pub struct HnswAccelerator {
    index: Hnsw<CosineDistance, Box<[f32]>, rand::rngs::StdRng, 16, 32>,
    // The searcher is mutated during queries; keep shortlist(&self) by
    // guarding it.
    searcher: Mutex<Searcher<u32>>,
    count: usize,
}

impl HnswAccelerator {
    /// Build from all embedding rows in row order, so HNSW internal ids
    /// equal row numbers.
    pub fn build(rows: &[Vec<f32>]) -> Self {
        let mut index = Hnsw::new(CosineDistance);
        let mut searcher = Searcher::default();
        for row in rows {
            index.insert(row.clone().into_boxed_slice(), &mut searcher);
        }
        Self {
            index,
            searcher: Mutex::new(searcher),
            count: rows.len(),
        }
    }
}

impl AnnAccelerator for HnswAccelerator {
    fn kind(&self) -> &'static str {
        "hnsw"
    }

    fn shortlist(&self, query: &[f32], k: usize) -> Vec<usize> {
        if self.count == 0 {
            return Vec::new();
        }
        let actual_k = k.min(self.count);
        let mut neighbors = vec![
            Neighbor {
                index: !0,
                distance: !0
            };
            actual_k
        ];
        let ef_search = (k * 2).max(MIN_EF_SEARCH);
        let query_box = query.to_vec().into_boxed_slice();

        let mut searcher = self.searcher.lock().unwrap();
        self.index
            .nearest(&query_box, ef_search, &mut searcher, &mut neighbors);

        neighbors
            .into_iter()
            .filter(|n| n.index != !0)
            .map(|n| n.index)
            .collect()
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn shortlist_finds_exact_match_first() {
        let rows: Vec<Vec<f32>> = (0..8).map(|i| unit(8, i)).collect();
        let accel = HnswAccelerator::build(&rows);
        let hits = accel.shortlist(&unit(8, 3), 3);
        assert_eq!(hits.first().copied(), Some(3));
    }

    #[test]
    fn empty_accelerator_yields_no_candidates() {
        let accel = HnswAccelerator::build(&[]);
        assert!(accel.shortlist(&[1.0, 0.0], 5).is_empty());
        assert!(accel.is_empty());
    }

    #[test]
    fn shortlist_caps_at_row_count() {
        let rows: Vec<Vec<f32>> = (0..3).map(|i| unit(4, i)).collect();
        let accel = HnswAccelerator::build(&rows);
        let hits = accel.shortlist(&unit(4, 0), 10);
        assert!(hits.len() <= 3);
    }
}
