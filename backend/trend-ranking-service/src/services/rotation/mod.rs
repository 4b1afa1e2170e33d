/// Rotation / Cooldown Suppressor
///
/// Per (item, range) state machine:
/// - `Fresh`: no state row, or the last exposure is older than the reset gap
/// - `Shown`: selected in recent cycles; every consecutive hit softens the score
///   by `combined / (1 + k * hits)`
/// - `Suppressed`: hits exceeded the threshold, the item is hard-excluded until
///   `suppressed_until`
///
/// Only selected items get their state written back; unselected items age toward
/// `Fresh` on their own.
pub mod store;

pub use store::{InMemoryRotationStore, RedisRotationStore, RotationStore};

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::models::{RangeLabel, RankedCandidate, RotationKey, RotationState};

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Hits above this count trigger a cooldown
    pub hit_threshold: u32,
    pub cooldown: Duration,
    /// Gap since the last exposure after which hits reset to zero
    pub reset_gap: Duration,
    pub penalty_k: f64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            hit_threshold: 3,
            cooldown: Duration::hours(1),
            reset_gap: Duration::minutes(20),
            penalty_k: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Fresh,
    Shown,
    Suppressed,
}

/// Result of one suppression pass
#[derive(Debug, Default)]
pub struct SuppressionOutcome {
    /// Survivors, with `effective_score` penalized
    pub kept: Vec<RankedCandidate>,
    /// Rotation item ids hard-excluded this cycle
    pub suppressed: Vec<String>,
    /// States as loaded, reused when writing back the selection
    pub states: HashMap<RotationKey, RotationState>,
}

pub struct RotationSuppressor {
    store: Arc<dyn RotationStore>,
    policy: RotationPolicy,
}

impl RotationSuppressor {
    pub fn new(store: Arc<dyn RotationStore>, policy: RotationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn phase(&self, state: Option<&RotationState>, now: DateTime<Utc>) -> RotationPhase {
        let Some(state) = state else {
            return RotationPhase::Fresh;
        };
        if state.suppressed_until.is_some_and(|until| until > now) {
            return RotationPhase::Suppressed;
        }
        if self.effective_hits(state, now) == 0 {
            RotationPhase::Fresh
        } else {
            RotationPhase::Shown
        }
    }

    /// Consecutive hits that still count at `now`.
    fn effective_hits(&self, state: &RotationState, now: DateTime<Utc>) -> u32 {
        match state.last_shown_at {
            Some(last) if now - last > self.policy.reset_gap => 0,
            Some(_) => state.consecutive_hits,
            None => 0,
        }
    }

    /// Load rotation state for every candidate. A store failure fails open: all
    /// candidates are treated as fresh.
    pub async fn load_states(
        &self,
        candidates: &[RankedCandidate],
        range: RangeLabel,
    ) -> HashMap<RotationKey, RotationState> {
        let keys: Vec<RotationKey> = candidates
            .iter()
            .map(|c| RotationKey::new(c.rotation_item_id(), range))
            .collect();

        match self.store.load_many(&keys).await {
            Ok(states) => states,
            Err(e) => {
                warn!(
                    range = %range,
                    candidates = keys.len(),
                    error = %e,
                    "Rotation state unavailable, treating candidates as fresh"
                );
                HashMap::new()
            }
        }
    }

    /// Drop suppressed candidates and penalize recently shown ones.
    pub fn apply(
        &self,
        candidates: Vec<RankedCandidate>,
        states: &HashMap<RotationKey, RotationState>,
        range: RangeLabel,
        now: DateTime<Utc>,
    ) -> (Vec<RankedCandidate>, Vec<String>) {
        let mut kept = Vec::with_capacity(candidates.len());
        let mut suppressed = Vec::new();

        for mut candidate in candidates {
            let rotation_id = candidate.rotation_item_id();
            let state = states.get(&RotationKey::new(rotation_id.clone(), range));

            match self.phase(state, now) {
                RotationPhase::Suppressed => {
                    suppressed.push(rotation_id);
                }
                RotationPhase::Fresh => {
                    candidate.effective_score = candidate.combined_score;
                    kept.push(candidate);
                }
                RotationPhase::Shown => {
                    let hits = state.map(|s| self.effective_hits(s, now)).unwrap_or(0);
                    let penalty = 1.0 + self.policy.penalty_k * hits as f64;
                    candidate.effective_score =
                        (candidate.combined_score / penalty).min(candidate.combined_score);
                    kept.push(candidate);
                }
            }
        }

        (kept, suppressed)
    }

    pub async fn suppress(
        &self,
        candidates: Vec<RankedCandidate>,
        range: RangeLabel,
        now: DateTime<Utc>,
    ) -> SuppressionOutcome {
        let states = self.load_states(&candidates, range).await;
        let (kept, suppressed) = self.apply(candidates, &states, range, now);

        if !suppressed.is_empty() {
            debug!(range = %range, suppressed = suppressed.len(), "Cooldown excluded candidates");
        }

        SuppressionOutcome {
            kept,
            suppressed,
            states,
        }
    }

    /// State after one more selection at `now`.
    pub fn next_state(
        &self,
        previous: Option<&RotationState>,
        score: f64,
        now: DateTime<Utc>,
    ) -> RotationState {
        let hits = previous
            .map(|s| self.effective_hits(s, now))
            .unwrap_or(0)
            .saturating_add(1);

        let suppressed_until = if hits > self.policy.hit_threshold {
            Some(
                now.checked_add_signed(self.policy.cooldown)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
        } else {
            None
        };

        RotationState {
            consecutive_hits: hits,
            last_shown_at: Some(now),
            suppressed_until,
            last_score: score,
        }
    }

    /// Write back state for the selected items as one batch.
    ///
    /// The write runs on its own task so it still completes when the caller is
    /// dropped mid-composition. Failures are logged and never surface.
    pub async fn record_selection(
        &self,
        selected: &[RankedCandidate],
        states: &HashMap<RotationKey, RotationState>,
        range: RangeLabel,
        now: DateTime<Utc>,
    ) {
        if selected.is_empty() {
            return;
        }

        let entries: Vec<(RotationKey, RotationState)> = selected
            .iter()
            .map(|candidate| {
                let key = RotationKey::new(candidate.rotation_item_id(), range);
                let next = self.next_state(states.get(&key), candidate.effective_score, now);
                (key, next)
            })
            .collect();

        let written = entries.len();
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move { store.save_batch(entries).await });

        match handle.await {
            Ok(Ok(())) => debug!(range = %range, written, "Rotation state updated"),
            Ok(Err(e)) => warn!(
                range = %range,
                written,
                error = %e,
                "Failed to persist rotation state"
            ),
            Err(e) => error!(range = %range, error = %e, "Rotation write task failed"),
        }
    }
}
