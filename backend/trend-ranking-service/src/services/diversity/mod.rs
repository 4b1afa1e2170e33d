use crate::models::RankedCandidate;
use crate::services::combiner::compare_candidates;
use std::collections::{HashMap, HashSet};

/// Diversity Layer - per-source cap
///
/// Walks candidates in descending score order and accepts an item unless its source
/// already holds `cap` slots. Rejected items go to an overflow pool that is only
/// consulted when the primary pass cannot fill the page, so a source that dominates
/// supply still yields a full page.
///
/// `cap = max(1, ceil(N / effective_sources))` with
/// `effective_sources = min(distinct_sources_in_pool, cap_target)`.
#[derive(Debug, Clone, Default)]
pub struct DiversityLayer;

#[derive(Debug, Clone, Default)]
pub struct CapOutcome {
    pub selected: Vec<RankedCandidate>,
    pub cap: usize,
    pub distinct_sources: usize,
    /// Slots filled from the overflow pool
    pub overflow_used: usize,
    /// Eligible candidates left out of the page
    pub remaining: usize,
}

/// Effective source count used as the cap denominator.
pub fn effective_source_count(distinct_sources: usize, cap_target: usize) -> usize {
    distinct_sources.min(cap_target).max(1)
}

pub fn per_source_cap(page_size: usize, distinct_sources: usize, cap_target: usize) -> usize {
    let denominator = effective_source_count(distinct_sources, cap_target);
    page_size.div_ceil(denominator).max(1)
}

impl DiversityLayer {
    pub fn new() -> Self {
        Self
    }

    /// `ordered` must already be sorted best-first.
    pub fn enforce(
        &self,
        ordered: Vec<RankedCandidate>,
        page_size: usize,
        cap_target: usize,
    ) -> CapOutcome {
        let total = ordered.len();
        if total == 0 || page_size == 0 {
            return CapOutcome {
                remaining: total,
                ..Default::default()
            };
        }

        let distinct_sources = ordered
            .iter()
            .map(|c| c.source_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let cap = per_source_cap(page_size, distinct_sources, cap_target);

        let mut selected: Vec<RankedCandidate> = Vec::with_capacity(page_size.min(total));
        let mut overflow: Vec<RankedCandidate> = Vec::new();
        let mut per_source: HashMap<String, usize> = HashMap::new();

        for candidate in ordered {
            if selected.len() >= page_size {
                overflow.push(candidate);
                continue;
            }
            let count = per_source.entry(candidate.source_id.clone()).or_insert(0);
            if *count < cap {
                *count += 1;
                selected.push(candidate);
            } else {
                overflow.push(candidate);
            }
        }

        let mut overflow_used = 0;
        if selected.len() < page_size {
            let missing = page_size - selected.len();
            overflow_used = missing.min(overflow.len());
            selected.extend(overflow.drain(..overflow_used));
            selected.sort_by(compare_candidates);
        }

        CapOutcome {
            remaining: total - selected.len(),
            selected,
            cap,
            distinct_sources,
            overflow_used,
        }
    }
}
