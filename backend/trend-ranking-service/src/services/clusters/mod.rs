/// Cluster Representative Selector
///
/// Issue sections rank clusters, not posts. Each cluster is collapsed to one member:
/// the upstream-flagged representative while it is still a member, otherwise the
/// member with the highest hot score in the section's range.
use std::collections::{HashMap, HashSet};

use crate::models::{cluster_key, ClusterMembership, RankedCandidate, TrendAggregate};

/// A cluster that survived exclusion, with its chosen representative
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPick {
    pub cluster_id: String,
    pub representative_post_id: String,
    pub source_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSelector;

impl ClusterSelector {
    pub fn new() -> Self {
        Self
    }

    /// A cluster is out when the page already shows the cluster or any of its posts.
    pub fn is_excluded(&self, membership: &ClusterMembership, exclude: &HashSet<String>) -> bool {
        exclude.contains(&cluster_key(&membership.cluster_id))
            || membership
                .member_post_ids
                .iter()
                .any(|post_id| exclude.contains(post_id))
    }

    pub fn choose_representative(
        &self,
        membership: &ClusterMembership,
        post_aggregates: &HashMap<String, TrendAggregate>,
    ) -> Option<String> {
        if let Some(flagged) = &membership.representative_post_id {
            if membership.member_post_ids.contains(flagged) {
                return Some(flagged.clone());
            }
        }

        membership
            .member_post_ids
            .iter()
            .max_by(|a, b| {
                let hot_a = post_aggregates.get(*a).map(|p| p.hot_score).unwrap_or(f64::MIN);
                let hot_b = post_aggregates.get(*b).map(|p| p.hot_score).unwrap_or(f64::MIN);
                // Lower id wins a tie, so it must compare as "greater" here
                hot_a.total_cmp(&hot_b).then_with(|| b.cmp(a))
            })
            .cloned()
    }

    /// Collapse every non-excluded cluster to a representative.
    ///
    /// `fallback_sources` maps cluster ids to the source recorded on the cluster
    /// aggregate, used when the representative has no post aggregate of its own.
    pub fn pick(
        &self,
        cluster_ids: &[String],
        memberships: &HashMap<String, ClusterMembership>,
        post_aggregates: &HashMap<String, TrendAggregate>,
        fallback_sources: &HashMap<String, String>,
        exclude: &HashSet<String>,
    ) -> Vec<ClusterPick> {
        let mut picks = Vec::with_capacity(cluster_ids.len());

        for cluster_id in cluster_ids {
            let Some(membership) = memberships.get(cluster_id) else {
                continue;
            };
            if membership.member_post_ids.is_empty() || self.is_excluded(membership, exclude) {
                continue;
            }
            let Some(representative) = self.choose_representative(membership, post_aggregates)
            else {
                continue;
            };

            let source_id = post_aggregates
                .get(&representative)
                .map(|p| p.source_id.clone())
                .or_else(|| fallback_sources.get(cluster_id).cloned())
                .unwrap_or_default();

            picks.push(ClusterPick {
                cluster_id: cluster_id.clone(),
                representative_post_id: representative,
                source_id,
            });
        }

        picks
    }
}

/// Keep the best-ranked row per cluster and per representative post.
/// `ordered` must be sorted best-first.
pub fn dedupe_representatives(ordered: Vec<RankedCandidate>) -> Vec<RankedCandidate> {
    let mut seen_posts: HashSet<String> = HashSet::new();
    let mut seen_clusters: HashSet<String> = HashSet::new();

    ordered
        .into_iter()
        .filter(|candidate| {
            let cluster_fresh = match &candidate.cluster_id {
                Some(cluster_id) => !seen_clusters.contains(cluster_id),
                None => true,
            };
            if !cluster_fresh || seen_posts.contains(&candidate.item_id) {
                return false;
            }
            seen_posts.insert(candidate.item_id.clone());
            if let Some(cluster_id) = &candidate.cluster_id {
                seen_clusters.insert(cluster_id.clone());
            }
            true
        })
        .collect()
}
