//! Math utility functions

use std::cmp::Ordering;

/// Indices of the `k` highest scores, best first.
///
/// Ties keep the lower index first; NaN compares equal to everything.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    // Stable sort keeps ascending index order among equal scores
    indices.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });
    indices.truncate(k.min(scores.len()));
    indices
}
