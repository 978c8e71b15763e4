//! Similarity and rank scoring shared by the backends and the coordinator.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Cosine similarity, `None` when the vectors cannot be compared.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut mag_a = 0.0f32;
    let mut mag_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    if mag_a == 0.0 || mag_b == 0.0 {
        return None;
    }

    Some(dot / (mag_a.sqrt() * mag_b.sqrt()))
}

/// Knobs for combining similarity and importance into one score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankWeights {
    /// Score given to memories found only by lexical match.
    pub lexical_baseline: f32,
    /// Multiplier applied to importance before it is added to the score.
    pub importance_weight: f32,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            lexical_baseline: 0.0,
            importance_weight: 0.01,
        }
    }
}

impl RankWeights {
    /// Additive importance bonus over either a similarity or the baseline.
    pub fn score(&self, similarity: Option<f32>, importance: f32) -> f32 {
        similarity.unwrap_or(self.lexical_baseline) + importance * self.importance_weight
    }
}

/// Descending score, then newest first, then id for a total order.
pub fn rank_order(
    a: (f32, DateTime<Utc>, &str),
    b: (f32, DateTime<Utc>, &str),
) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| a.2.cmp(b.2))
}
