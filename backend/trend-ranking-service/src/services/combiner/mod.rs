/// Weighted Score Combiner
///
/// `combined = Σ w_r · norm_r` over the four windows. A window the candidate has no
/// activity in contributes 0; it never excludes the candidate.
use crate::models::{RangeLabel, RankedCandidate};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Recency-biased weights: `w_3h >= w_6h >= w_24h >= w_1w > 0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeWeights {
    weights: [f64; 4],
}

impl RangeWeights {
    pub fn new(w_3h: f64, w_6h: f64, w_24h: f64, w_1w: f64) -> Result<Self, String> {
        let weights = [w_3h, w_6h, w_24h, w_1w];

        if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(format!("weights must be positive, got {:?}", weights));
        }
        if weights.windows(2).any(|pair| pair[0] < pair[1]) {
            return Err(format!(
                "weights must not increase from 3h to 1w, got {:?}",
                weights
            ));
        }

        Ok(Self { weights })
    }

    pub fn from_slice(row: &[f64]) -> Result<Self, String> {
        match row {
            [w_3h, w_6h, w_24h, w_1w] => Self::new(*w_3h, *w_6h, *w_24h, *w_1w),
            _ => Err(format!("expected 4 weights, got {}", row.len())),
        }
    }

    pub fn weight(&self, range: RangeLabel) -> f64 {
        self.weights[range.index()]
    }
}

pub struct ScoreCombiner {
    weights: RangeWeights,
}

impl ScoreCombiner {
    pub fn new(weights: RangeWeights) -> Self {
        Self { weights }
    }

    pub fn combine(&self, per_range: &BTreeMap<RangeLabel, f64>) -> f64 {
        per_range
            .iter()
            .map(|(range, norm)| self.weights.weight(*range) * norm)
            .sum()
    }

    /// Fill `combined_score` for every candidate. Before suppression runs the
    /// effective score equals the combined score.
    pub fn combine_all(&self, candidates: &mut [RankedCandidate]) {
        for candidate in candidates.iter_mut() {
            let combined = self.combine(&candidate.per_range_normalized);
            candidate.combined_score = combined;
            candidate.effective_score = combined;
        }
    }
}

/// Descending effective score, then higher raw hot score in the shortest available
/// range, then ascending item id.
pub fn compare_candidates(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.effective_score
        .total_cmp(&a.effective_score)
        .then_with(|| b.tiebreak_hot_score.total_cmp(&a.tiebreak_hot_score))
        .then_with(|| a.item_id.cmp(&b.item_id))
}

/// Sort into final order and assign 1-based ranks.
pub fn order_candidates(candidates: &mut [RankedCandidate]) {
    candidates.sort_by(compare_candidates);
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i + 1;
    }
}
