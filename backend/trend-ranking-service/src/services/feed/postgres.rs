/// PostgreSQL trend feed
///
/// Reads the materialized views refreshed by the upstream aggregation jobs:
/// - `trend_post_aggregates`: one row per (range_label, post_id)
/// - `trend_cluster_aggregates`: one row per (range_label, cluster_id)
/// - `trend_cluster_members`: (cluster_id, post_id, is_representative)
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::error;

use super::TrendFeed;
use crate::error::{RankingError, Result};
use crate::models::{ClusterAggregate, ClusterMembership, RangeLabel, TrendAggregate};

pub struct PgTrendFeed {
    pool: PgPool,
}

impl PgTrendFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrendFeed for PgTrendFeed {
    async fn post_aggregates(&self, range: RangeLabel) -> Result<Vec<TrendAggregate>> {
        let rows = sqlx::query_as::<
            _,
            (
                String,        // post_id
                String,        // source_id
                i64,           // view_delta
                i64,           // comment_delta
                i64,           // like_delta
                i64,           // dislike_delta
                f64,           // hot_score
                DateTime<Utc>, // window_end
            ),
        >(
            r#"
            SELECT post_id, source_id, view_delta, comment_delta, like_delta,
                   dislike_delta, hot_score::float8, window_end
            FROM trend_post_aggregates
            WHERE range_label = $1
            "#,
        )
        .bind(range.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(range = %range, "Failed to fetch post aggregates: {}", e);
            RankingError::DataUnavailable {
                range,
                reason: e.to_string(),
            }
        })?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let (
                    item_id,
                    source_id,
                    view_delta,
                    comment_delta,
                    like_delta,
                    dislike_delta,
                    hot_score,
                    window_end,
                ) = row;
                TrendAggregate {
                    item_id,
                    source_id,
                    range,
                    view_delta,
                    comment_delta,
                    like_delta,
                    dislike_delta,
                    hot_score,
                    window_end,
                }
            })
            .collect())
    }

    async fn cluster_aggregates(&self, range: RangeLabel) -> Result<Vec<ClusterAggregate>> {
        let rows = sqlx::query_as::<
            _,
            (
                String,         // cluster_id
                String,         // source_id of the representative
                i64,            // view_delta
                i64,            // comment_delta
                i64,            // like_delta
                i64,            // dislike_delta
                f64,            // hot_score
                DateTime<Utc>,  // window_end
                Option<String>, // representative_post_id
                i32,            // size
            ),
        >(
            r#"
            SELECT cluster_id, source_id, view_delta, comment_delta, like_delta,
                   dislike_delta, hot_score::float8, window_end,
                   representative_post_id, size
            FROM trend_cluster_aggregates
            WHERE range_label = $1
            "#,
        )
        .bind(range.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(range = %range, "Failed to fetch cluster aggregates: {}", e);
            RankingError::DataUnavailable {
                range,
                reason: e.to_string(),
            }
        })?;

        Ok(rows
            .into_iter()
            .map(|row| ClusterAggregate {
                cluster_id: row.0,
                source_id: row.1,
                range,
                view_delta: row.2,
                comment_delta: row.3,
                like_delta: row.4,
                dislike_delta: row.5,
                hot_score: row.6,
                window_end: row.7,
                representative_post_id: row.8,
                size: row.9,
            })
            .collect())
    }

    async fn cluster_memberships(&self, cluster_ids: &[String]) -> Result<Vec<ClusterMembership>> {
        if cluster_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, (String, String, bool)>(
            r#"
            SELECT cluster_id, post_id, is_representative
            FROM trend_cluster_members
            WHERE cluster_id = ANY($1)
            ORDER BY cluster_id, post_id
            "#,
        )
        .bind(cluster_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<String, ClusterMembership> = BTreeMap::new();
        for (cluster_id, post_id, is_representative) in rows {
            let membership = grouped
                .entry(cluster_id.clone())
                .or_insert_with(|| ClusterMembership {
                    cluster_id,
                    member_post_ids: Vec::new(),
                    representative_post_id: None,
                    size: 0,
                });
            if is_representative {
                membership.representative_post_id = Some(post_id.clone());
            }
            membership.member_post_ids.push(post_id);
            membership.size += 1;
        }

        Ok(grouped.into_values().collect())
    }
}
