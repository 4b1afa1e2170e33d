// ============================================
// Trend Aggregate Feed
// ============================================
//
// Read side of the periodically refreshed per-window aggregates.
//
// All four windows are fetched concurrently, each under its own deadline. A window
// that errors, times out, comes back empty or is older than the stale threshold is
// reported as unavailable and contributes nothing to the combination. The fetch
// joins on all windows before any scoring starts.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTrendFeed;
pub use postgres::PgTrendFeed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RankingError, Result};
use crate::models::{ClusterAggregate, ClusterMembership, RangeLabel, TrendAggregate};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrendFeed: Send + Sync {
    async fn post_aggregates(&self, range: RangeLabel) -> Result<Vec<TrendAggregate>>;

    async fn cluster_aggregates(&self, range: RangeLabel) -> Result<Vec<ClusterAggregate>>;

    async fn cluster_memberships(&self, cluster_ids: &[String]) -> Result<Vec<ClusterMembership>>;
}

/// Aggregate rows that carry a freshness marker
pub trait Windowed {
    fn window_end(&self) -> DateTime<Utc>;
}

impl Windowed for TrendAggregate {
    fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }
}

impl Windowed for ClusterAggregate {
    fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }
}

/// Rows per available window plus the windows that degraded
#[derive(Debug, Clone)]
pub struct RangeSnapshot<T> {
    pub by_range: HashMap<RangeLabel, Vec<T>>,
    pub unavailable: Vec<RangeLabel>,
}

impl<T> Default for RangeSnapshot<T> {
    fn default() -> Self {
        Self {
            by_range: HashMap::new(),
            unavailable: Vec::new(),
        }
    }
}

impl<T> RangeSnapshot<T> {
    pub fn get(&self, range: RangeLabel) -> Option<&[T]> {
        self.by_range.get(&range).map(|rows| rows.as_slice())
    }
}

pub struct FeedFetcher {
    feed: Arc<dyn TrendFeed>,
    deadline: Duration,
    stale_after: chrono::Duration,
}

impl FeedFetcher {
    pub fn new(
        feed: Arc<dyn TrendFeed>,
        deadline: Duration,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            feed,
            deadline,
            stale_after,
        }
    }

    pub async fn post_ranges(&self, now: DateTime<Utc>) -> RangeSnapshot<TrendAggregate> {
        let feed = &self.feed;
        self.fetch_ranges(&RangeLabel::ALL, now, |range| feed.post_aggregates(range))
            .await
    }

    pub async fn post_range(
        &self,
        range: RangeLabel,
        now: DateTime<Utc>,
    ) -> RangeSnapshot<TrendAggregate> {
        let feed = &self.feed;
        self.fetch_ranges(&[range], now, |range| feed.post_aggregates(range))
            .await
    }

    pub async fn cluster_ranges(&self, now: DateTime<Utc>) -> RangeSnapshot<ClusterAggregate> {
        let feed = &self.feed;
        self.fetch_ranges(&RangeLabel::ALL, now, |range| feed.cluster_aggregates(range))
            .await
    }

    /// Membership lookup under the same deadline. Failure yields an empty map; the
    /// caller falls back to the representatives recorded on the aggregates.
    pub async fn memberships(&self, cluster_ids: &[String]) -> HashMap<String, ClusterMembership> {
        if cluster_ids.is_empty() {
            return HashMap::new();
        }

        match tokio::time::timeout(self.deadline, self.feed.cluster_memberships(cluster_ids)).await
        {
            Ok(Ok(rows)) => rows
                .into_iter()
                .map(|m| (m.cluster_id.clone(), m))
                .collect(),
            Ok(Err(e)) => {
                warn!(clusters = cluster_ids.len(), error = %e, "Cluster membership unavailable");
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    clusters = cluster_ids.len(),
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Cluster membership fetch timed out"
                );
                HashMap::new()
            }
        }
    }

    async fn fetch_ranges<T, F, Fut>(
        &self,
        ranges: &[RangeLabel],
        now: DateTime<Utc>,
        fetch: F,
    ) -> RangeSnapshot<T>
    where
        T: Windowed,
        F: Fn(RangeLabel) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let deadline = self.deadline;
        let pending = ranges.iter().map(|range| {
            let range = *range;
            let fut = fetch(range);
            async move { (range, tokio::time::timeout(deadline, fut).await) }
        });

        let mut snapshot = RangeSnapshot::default();
        for (range, outcome) in join_all(pending).await {
            let rows = match outcome {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    self.degrade(&mut snapshot, range, e.to_string());
                    continue;
                }
                Err(_) => {
                    self.degrade(
                        &mut snapshot,
                        range,
                        format!("fetch exceeded {}ms deadline", deadline.as_millis()),
                    );
                    continue;
                }
            };

            let Some(newest) = rows.iter().map(|r| r.window_end()).max() else {
                self.degrade(&mut snapshot, range, "no aggregates in window".to_string());
                continue;
            };
            if now - newest > self.stale_after {
                self.degrade(
                    &mut snapshot,
                    range,
                    format!("snapshot is stale, newest window_end {}", newest),
                );
                continue;
            }

            debug!(range = %range, rows = rows.len(), "Fetched trend aggregates");
            snapshot.by_range.insert(range, rows);
        }

        snapshot
    }

    fn degrade<T>(&self, snapshot: &mut RangeSnapshot<T>, range: RangeLabel, reason: String) {
        let err = RankingError::DataUnavailable { range, reason };
        warn!(range = %range, error = %err, "Zero-weighting unavailable range");
        snapshot.unavailable.push(range);
    }
}
