/// Section Composer
///
/// Orchestrates one named section end to end:
/// - `Ranked`: normalize each window → combine → cooldown → diversity cap
/// - `Issues`: same pipeline over cluster aggregates, one representative per cluster
/// - `Fresh`: `log1p(activity) * boost` in a single window, cap only, no cooldown
///
/// Incoming `exclude_ids` are removed before scoring, so an excluded item never
/// takes a cap slot or shifts the normalization statistics. A page is composed by
/// running sections strictly in `SectionKind::PAGE_ORDER`, each consuming the ids
/// emitted by the sections before it.
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RankingPolicy;
use crate::error::Result;
use crate::models::{
    cluster_key, ClusterAggregate, ClusterMembership, PageComposition, PageRequest, RangeLabel,
    RankParams, RankedCandidate, SectionKind, SectionMode, SectionResult, TrendAggregate,
};
use crate::services::clusters::{dedupe_representatives, ClusterSelector};
use crate::services::combiner::{order_candidates, ScoreCombiner};
use crate::services::diversity::{CapOutcome, DiversityLayer};
use crate::services::feed::{FeedFetcher, TrendFeed};
use crate::services::normalizer::RobustNormalizer;
use crate::services::rotation::{RotationStore, RotationSuppressor};

/// One scoreable entry of a section's candidate pool
struct PoolEntry {
    /// Key into the per-window hot scores (post id, or cluster id in issue mode)
    score_key: String,
    item_id: String,
    source_id: String,
    cluster_id: Option<String>,
}

type HotByRange = HashMap<RangeLabel, HashMap<String, f64>>;

pub struct SectionComposer {
    fetcher: FeedFetcher,
    suppressor: RotationSuppressor,
    normalizer: RobustNormalizer,
    diversity: DiversityLayer,
    clusters: ClusterSelector,
    /// Indexed by `RangeLabel::index()` of the requested range
    combiners: [ScoreCombiner; 4],
    policy: RankingPolicy,
}

impl SectionComposer {
    /// Validates the policy; an invalid policy is a startup failure.
    pub fn new(
        feed: Arc<dyn TrendFeed>,
        store: Arc<dyn RotationStore>,
        policy: RankingPolicy,
    ) -> Result<Self> {
        policy.validate()?;

        let combiners = [
            ScoreCombiner::new(policy.range_weights(RangeLabel::ThreeHours)?),
            ScoreCombiner::new(policy.range_weights(RangeLabel::SixHours)?),
            ScoreCombiner::new(policy.range_weights(RangeLabel::TwentyFourHours)?),
            ScoreCombiner::new(policy.range_weights(RangeLabel::OneWeek)?),
        ];

        Ok(Self {
            fetcher: FeedFetcher::new(feed, policy.fetch_deadline(), policy.stale_after()),
            suppressor: RotationSuppressor::new(store, policy.rotation_policy()),
            normalizer: RobustNormalizer::new(),
            diversity: DiversityLayer::new(),
            clusters: ClusterSelector::new(),
            combiners,
            policy,
        })
    }

    /// Default request for a page section.
    pub fn section_params(
        &self,
        kind: SectionKind,
        spotlight_range: RangeLabel,
        exclude_ids: HashSet<String>,
    ) -> RankParams {
        let range = match kind {
            SectionKind::Spotlight => spotlight_range,
            other => other.default_range(),
        };

        RankParams {
            section: kind.as_str().to_string(),
            range,
            mode: kind.mode(),
            per_source_cap_target: self.policy.per_source_cap_target,
            page_size: self.policy.page_size(kind),
            exclude_ids,
        }
    }

    pub async fn rank(&self, params: RankParams) -> SectionResult {
        self.rank_at(params, Utc::now()).await
    }

    /// Rank one section as of `now`. Never fails: a section that cannot be served
    /// comes back empty so sibling sections still render.
    pub async fn rank_at(&self, mut params: RankParams, now: DateTime<Utc>) -> SectionResult {
        if params.page_size == 0 {
            warn!(section = %params.section, "Section requested with page size 0");
            return SectionResult::empty(&params);
        }
        if params.per_source_cap_target == 0 {
            warn!(section = %params.section, "Cap target 0 requested, using 1");
            params.per_source_cap_target = 1;
        }

        let span = info_span!(
            "rank_section",
            section = %params.section,
            range = %params.range,
            mode = %params.mode
        );

        async {
            match params.mode {
                SectionMode::Ranked => self.rank_posts(&params, now).await,
                SectionMode::Issues => self.rank_issues(&params, now).await,
                SectionMode::Fresh => self.rank_fresh(&params, now).await,
            }
        }
        .instrument(span)
        .await
    }

    pub async fn compose_page(&self, request: PageRequest) -> PageComposition {
        self.compose_page_at(request, Utc::now()).await
    }

    /// Sections run strictly in page order; each one's output is excluded from all
    /// later sections.
    pub async fn compose_page_at(
        &self,
        request: PageRequest,
        now: DateTime<Utc>,
    ) -> PageComposition {
        let cycle_id = Uuid::new_v4().to_string();
        let spotlight = request
            .spotlight_range
            .unwrap_or(self.policy.spotlight_range);
        let span = info_span!("compose_page", cycle_id = %cycle_id, spotlight = %spotlight);

        async move {
            let mut exclude = request.exclude_ids;
            let mut sections = Vec::with_capacity(SectionKind::PAGE_ORDER.len());

            for kind in SectionKind::PAGE_ORDER {
                let params = self.section_params(kind, spotlight, std::mem::take(&mut exclude));
                let result = self.rank_at(params, now).await;
                exclude = result.next_exclude_ids.clone();
                sections.push(result);
            }

            let items: usize = sections.iter().map(|s| s.items.len()).sum();
            info!(sections = sections.len(), items, "Page composed");

            PageComposition {
                cycle_id,
                sections,
                exclude_ids: exclude,
                composed_at: now,
            }
        }
        .instrument(span)
        .await
    }

    async fn rank_posts(&self, params: &RankParams, now: DateTime<Utc>) -> SectionResult {
        let snapshot = self.fetcher.post_ranges(now).await;

        let mut hot_by_range: HotByRange = HashMap::new();
        let mut sources: HashMap<String, String> = HashMap::new();
        for range in RangeLabel::ALL {
            let Some(rows) = snapshot.get(range) else {
                continue;
            };
            let hot = hot_by_range.entry(range).or_default();
            for row in rows {
                if params.exclude_ids.contains(&row.item_id) {
                    continue;
                }
                sources
                    .entry(row.item_id.clone())
                    .or_insert_with(|| row.source_id.clone());
                hot.insert(row.item_id.clone(), row.hot_score);
            }
        }

        let pool: Vec<PoolEntry> = pool_keys(params.range, &hot_by_range)
            .into_iter()
            .map(|id| PoolEntry {
                source_id: sources.get(&id).cloned().unwrap_or_default(),
                score_key: id.clone(),
                item_id: id,
                cluster_id: None,
            })
            .collect();

        let candidates = self.score_pool(&pool, &hot_by_range, params.range);
        self.select_with_rotation(params, candidates, snapshot.unavailable, now)
            .await
    }

    async fn rank_issues(&self, params: &RankParams, now: DateTime<Utc>) -> SectionResult {
        let (cluster_snapshot, post_snapshot) = tokio::join!(
            self.fetcher.cluster_ranges(now),
            self.fetcher.post_range(params.range, now)
        );
        let mut degraded = cluster_snapshot.unavailable.clone();
        degraded.extend(post_snapshot.unavailable.iter().copied());

        let mut hot_by_range: HotByRange = HashMap::new();
        let mut aggregates: HashMap<String, &ClusterAggregate> = HashMap::new();
        // The requested window describes the cluster best, so it is read first
        let read_order = std::iter::once(params.range)
            .chain(RangeLabel::ALL.into_iter().filter(|r| *r != params.range));
        for range in read_order {
            let Some(rows) = cluster_snapshot.get(range) else {
                continue;
            };
            let hot = hot_by_range.entry(range).or_default();
            for row in rows {
                aggregates.entry(row.cluster_id.clone()).or_insert(row);
                hot.insert(row.cluster_id.clone(), row.hot_score);
            }
        }

        let cluster_ids: Vec<String> = pool_keys(params.range, &hot_by_range).into_iter().collect();
        if cluster_ids.is_empty() {
            return self.build_result(params, CapOutcome::default(), degraded, 0, 0);
        }

        let mut memberships = self.fetcher.memberships(&cluster_ids).await;
        for cluster_id in &cluster_ids {
            let Some(aggregate) = aggregates.get(cluster_id) else {
                continue;
            };
            match memberships.get_mut(cluster_id) {
                Some(membership) => {
                    if membership.representative_post_id.is_none() {
                        membership.representative_post_id =
                            aggregate.representative_post_id.clone();
                    }
                }
                None => {
                    // Without membership the recorded representative is the only member we know
                    if let Some(representative) = &aggregate.representative_post_id {
                        memberships.insert(
                            cluster_id.clone(),
                            ClusterMembership {
                                cluster_id: cluster_id.clone(),
                                member_post_ids: vec![representative.clone()],
                                representative_post_id: Some(representative.clone()),
                                size: aggregate.size,
                            },
                        );
                    }
                }
            }
        }

        let post_aggregates: HashMap<String, TrendAggregate> = post_snapshot
            .get(params.range)
            .unwrap_or(&[])
            .iter()
            .map(|row| (row.item_id.clone(), row.clone()))
            .collect();
        let fallback_sources: HashMap<String, String> = aggregates
            .iter()
            .map(|(id, aggregate)| (id.clone(), aggregate.source_id.clone()))
            .collect();

        let picks = self.clusters.pick(
            &cluster_ids,
            &memberships,
            &post_aggregates,
            &fallback_sources,
            &params.exclude_ids,
        );

        let pool: Vec<PoolEntry> = picks
            .into_iter()
            .map(|pick| PoolEntry {
                score_key: pick.cluster_id.clone(),
                item_id: pick.representative_post_id,
                source_id: pick.source_id,
                cluster_id: Some(pick.cluster_id),
            })
            .collect();

        let candidates = self.score_pool(&pool, &hot_by_range, params.range);
        self.select_with_rotation(params, candidates, degraded, now)
            .await
    }

    async fn rank_fresh(&self, params: &RankParams, now: DateTime<Utc>) -> SectionResult {
        let snapshot = self.fetcher.post_range(params.range, now).await;
        let boost = self.policy.fresh_boost_factor;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut candidates: Vec<RankedCandidate> = snapshot
            .get(params.range)
            .unwrap_or(&[])
            .iter()
            .filter(|row| !params.exclude_ids.contains(&row.item_id))
            .filter(|row| seen.insert(row.item_id.as_str()))
            .map(|row| {
                let score = row.hot_score.max(0.0).ln_1p() * boost;
                let mut candidate =
                    RankedCandidate::new(row.item_id.clone(), row.source_id.clone());
                candidate.combined_score = score;
                candidate.effective_score = score;
                candidate.tiebreak_hot_score = row.hot_score;
                candidate
            })
            .collect();

        let pool_size = candidates.len();
        order_candidates(&mut candidates);
        let capped = self
            .diversity
            .enforce(candidates, params.page_size, params.per_source_cap_target);

        self.build_result(params, capped, snapshot.unavailable.clone(), pool_size, 0)
    }

    /// Normalize every window over the pool, then combine with the weight row of
    /// the requested range.
    fn score_pool(
        &self,
        pool: &[PoolEntry],
        hot_by_range: &HotByRange,
        range: RangeLabel,
    ) -> Vec<RankedCandidate> {
        let normalized: HotByRange = hot_by_range
            .iter()
            .map(|(window, hot)| {
                let raw: HashMap<String, f64> = pool
                    .iter()
                    .filter_map(|entry| {
                        hot.get(&entry.score_key)
                            .map(|h| (entry.score_key.clone(), *h))
                    })
                    .collect();
                (*window, self.normalizer.normalize(&raw))
            })
            .collect();

        let mut candidates: Vec<RankedCandidate> = pool
            .iter()
            .map(|entry| {
                let mut candidate =
                    RankedCandidate::new(entry.item_id.clone(), entry.source_id.clone());
                candidate.cluster_id = entry.cluster_id.clone();
                for window in RangeLabel::ALL {
                    let norm = normalized
                        .get(&window)
                        .and_then(|m| m.get(&entry.score_key));
                    if let Some(norm) = norm {
                        candidate.per_range_normalized.insert(window, *norm);
                    }
                }
                candidate.tiebreak_hot_score = RangeLabel::ALL
                    .iter()
                    .find_map(|window| {
                        hot_by_range
                            .get(window)
                            .and_then(|m| m.get(&entry.score_key))
                    })
                    .copied()
                    .unwrap_or(0.0);
                candidate
            })
            .collect();

        self.combiners[range.index()].combine_all(&mut candidates);
        candidates
    }

    async fn select_with_rotation(
        &self,
        params: &RankParams,
        mut candidates: Vec<RankedCandidate>,
        degraded: Vec<RangeLabel>,
        now: DateTime<Utc>,
    ) -> SectionResult {
        let pool_size = candidates.len();
        if candidates.is_empty() {
            return self.build_result(params, CapOutcome::default(), degraded, 0, 0);
        }

        order_candidates(&mut candidates);

        // Cooldown runs per cluster first, so a cooling cluster never shadows
        // another cluster that shares its representative
        let outcome = self.suppressor.suppress(candidates, params.range, now).await;
        let mut kept = outcome.kept;
        order_candidates(&mut kept);
        if params.mode == SectionMode::Issues {
            kept = dedupe_representatives(kept);
            order_candidates(&mut kept);
        }

        let capped = self
            .diversity
            .enforce(kept, params.page_size, params.per_source_cap_target);

        self.suppressor
            .record_selection(&capped.selected, &outcome.states, params.range, now)
            .await;

        self.build_result(params, capped, degraded, pool_size, outcome.suppressed.len())
    }

    fn build_result(
        &self,
        params: &RankParams,
        capped: CapOutcome,
        degraded: Vec<RangeLabel>,
        pool_size: usize,
        suppressed: usize,
    ) -> SectionResult {
        let mut degraded_ranges = degraded;
        degraded_ranges.sort();
        degraded_ranges.dedup();

        let mut items = capped.selected;
        let mut next_exclude_ids = params.exclude_ids.clone();
        for (i, item) in items.iter_mut().enumerate() {
            item.rank = i + 1;
            next_exclude_ids.insert(item.item_id.clone());
            if let Some(cluster_id) = &item.cluster_id {
                next_exclude_ids.insert(cluster_key(cluster_id));
            }
        }

        if items.is_empty() {
            info!(candidates = pool_size, suppressed, "Section has no content for now");
        } else {
            info!(
                candidates = pool_size,
                suppressed,
                selected = items.len(),
                cap = capped.cap,
                overflow = capped.overflow_used,
                degraded = degraded_ranges.len(),
                "Section ranked"
            );
        }

        SectionResult {
            section: params.section.clone(),
            range: params.range,
            mode: params.mode,
            items,
            next_exclude_ids,
            has_more: capped.remaining > 0,
            degraded_ranges,
        }
    }
}

/// Items active in the requested window; when that window is unavailable, anything
/// active in a window that is.
fn pool_keys(primary: RangeLabel, hot_by_range: &HotByRange) -> BTreeSet<String> {
    match hot_by_range.get(&primary) {
        Some(hot) => hot.keys().cloned().collect(),
        None => hot_by_range
            .values()
            .flat_map(|hot| hot.keys().cloned())
            .collect(),
    }
}
