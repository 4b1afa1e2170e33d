use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::TrendFeed;
use crate::error::{RankingError, Result};
use crate::models::{ClusterAggregate, ClusterMembership, RangeLabel, TrendAggregate};

#[derive(Default)]
struct FeedSnapshot {
    posts: HashMap<RangeLabel, Vec<TrendAggregate>>,
    clusters: HashMap<RangeLabel, Vec<ClusterAggregate>>,
    memberships: HashMap<String, ClusterMembership>,
    unavailable: HashSet<RangeLabel>,
    delays: HashMap<RangeLabel, Duration>,
}

/// Snapshot-backed feed for tests and local runs.
///
/// Each `replace_*` call supersedes the previous snapshot of that window, the same
/// way an upstream refresh does. Windows can be made unavailable or slow to exercise
/// degradation paths.
#[derive(Clone, Default)]
pub struct InMemoryTrendFeed {
    inner: Arc<RwLock<FeedSnapshot>>,
}

impl InMemoryTrendFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace_posts(&self, range: RangeLabel, rows: Vec<TrendAggregate>) {
        self.inner.write().await.posts.insert(range, rows);
    }

    pub async fn replace_clusters(&self, range: RangeLabel, rows: Vec<ClusterAggregate>) {
        self.inner.write().await.clusters.insert(range, rows);
    }

    pub async fn upsert_membership(&self, membership: ClusterMembership) {
        self.inner
            .write()
            .await
            .memberships
            .insert(membership.cluster_id.clone(), membership);
    }

    pub async fn set_unavailable(&self, range: RangeLabel, unavailable: bool) {
        let mut inner = self.inner.write().await;
        if unavailable {
            inner.unavailable.insert(range);
        } else {
            inner.unavailable.remove(&range);
        }
    }

    pub async fn set_delay(&self, range: RangeLabel, delay: Duration) {
        self.inner.write().await.delays.insert(range, delay);
    }

    /// Returns the configured delay, or an error when the window is down.
    async fn gate(&self, range: RangeLabel) -> Result<Option<Duration>> {
        let inner = self.inner.read().await;
        if inner.unavailable.contains(&range) {
            return Err(RankingError::DataUnavailable {
                range,
                reason: "feed marked unavailable".to_string(),
            });
        }
        Ok(inner.delays.get(&range).copied())
    }
}

#[async_trait]
impl TrendFeed for InMemoryTrendFeed {
    async fn post_aggregates(&self, range: RangeLabel) -> Result<Vec<TrendAggregate>> {
        if let Some(delay) = self.gate(range).await? {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .inner
            .read()
            .await
            .posts
            .get(&range)
            .cloned()
            .unwrap_or_default())
    }

    async fn cluster_aggregates(&self, range: RangeLabel) -> Result<Vec<ClusterAggregate>> {
        if let Some(delay) = self.gate(range).await? {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .inner
            .read()
            .await
            .clusters
            .get(&range)
            .cloned()
            .unwrap_or_default())
    }

    async fn cluster_memberships(&self, cluster_ids: &[String]) -> Result<Vec<ClusterMembership>> {
        let inner = self.inner.read().await;
        Ok(cluster_ids
            .iter()
            .filter_map(|id| inner.memberships.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn post(id: &str, range: RangeLabel) -> TrendAggregate {
        TrendAggregate {
            item_id: id.to_string(),
            source_id: "site".to_string(),
            range,
            view_delta: 1,
            comment_delta: 0,
            like_delta: 0,
            dislike_delta: 0,
            hot_score: 1.0,
            window_end: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_replace_supersedes_previous_snapshot() {
        let feed = InMemoryTrendFeed::new();
        let range = RangeLabel::ThreeHours;
        feed.replace_posts(range, vec![post("a", range), post("b", range)])
            .await;
        feed.replace_posts(range, vec![post("c", range)]).await;

        let rows = feed.post_aggregates(range).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id, "c");
    }

    #[tokio::test]
    async fn test_unavailable_range_errors() {
        let feed = InMemoryTrendFeed::new();
        feed.set_unavailable(RangeLabel::OneWeek, true).await;

        let err = feed.post_aggregates(RangeLabel::OneWeek).await.unwrap_err();
        assert!(matches!(err, RankingError::DataUnavailable { .. }));
        assert!(feed.post_aggregates(RangeLabel::SixHours).await.unwrap().is_empty());
    }
}
