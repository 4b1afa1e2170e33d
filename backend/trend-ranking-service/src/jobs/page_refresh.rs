//! Page Refresh Background Job
//!
//! Recomposes the full landing page once per interval so cooldown state advances
//! on a steady cadence and readers can serve the latest snapshot straight from
//! Redis.
//!
//! Each cycle:
//! 1. Composes all sections in page order with an empty exclude set
//! 2. Serializes the composition to JSON
//! 3. Stores it under `{prefix}:page:latest` with a TTL of two intervals, so a
//!    single missed cycle never leaves readers without a page

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error};

use crate::config::RankingPolicy;
use crate::error::{RankingError, Result};
use crate::models::{PageComposition, PageRequest};
use crate::services::SectionComposer;

/// Default interval between compositions (every 5 minutes)
const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Initial delay so the feed views are reachable before the first cycle
const INITIAL_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PageRefreshConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub initial_delay: Duration,
}

impl Default for PageRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: REFRESH_INTERVAL,
            initial_delay: INITIAL_DELAY,
        }
    }
}

impl From<&RankingPolicy> for PageRefreshConfig {
    fn from(policy: &RankingPolicy) -> Self {
        Self {
            enabled: policy.refresh_enabled,
            interval: policy.refresh_interval(),
            initial_delay: Duration::from_secs(policy.refresh_initial_delay_secs),
        }
    }
}

impl PageRefreshConfig {
    /// Cached pages outlive one missed cycle.
    pub fn cache_ttl(&self) -> Duration {
        self.interval * 2
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageCache: Send + Sync {
    async fn store_latest(&self, page: &PageComposition, ttl: Duration) -> Result<()>;
}

pub struct RedisPageCache {
    redis: redis::Client,
    key: String,
}

impl RedisPageCache {
    pub fn new(redis: redis::Client, key_prefix: &str) -> Self {
        Self {
            redis,
            key: format!("{}:page:latest", key_prefix),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl PageCache for RedisPageCache {
    async fn store_latest(&self, page: &PageComposition, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(page)?;
        let mut conn = self.redis.get_multiplexed_async_connection().await?;

        conn.set_ex::<_, _, ()>(&self.key, json, ttl.as_secs().max(1))
            .await
            .map_err(|e| {
                error!("Redis SET failed for {}: {}", self.key, e);
                RankingError::Redis(e.to_string())
            })?;

        Ok(())
    }
}

/// Start the page refresh loop. Returns immediately when disabled.
pub async fn start_page_refresh(
    composer: Arc<SectionComposer>,
    cache: Arc<dyn PageCache>,
    config: PageRefreshConfig,
) {
    if !config.enabled {
        tracing::info!("Page refresh disabled by configuration");
        return;
    }

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        ttl_secs = config.cache_ttl().as_secs(),
        "Starting page refresh background job"
    );

    sleep(config.initial_delay).await;

    loop {
        let cycle_start = Instant::now();

        match run_refresh_cycle(&composer, cache.as_ref(), &config).await {
            Ok(page) => {
                tracing::info!(
                    cycle_id = %page.cycle_id,
                    items = page.sections.iter().map(|s| s.items.len()).sum::<usize>(),
                    duration_ms = cycle_start.elapsed().as_millis(),
                    "Page refresh cycle completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    duration_ms = cycle_start.elapsed().as_millis(),
                    "Page refresh cycle failed"
                );
            }
        }

        sleep(config.interval).await;
    }
}

/// Compose once and cache the result.
///
/// Composition itself never fails; only the cache write can. The composed page is
/// handed back on success.
pub async fn run_refresh_cycle(
    composer: &SectionComposer,
    cache: &dyn PageCache,
    config: &PageRefreshConfig,
) -> Result<PageComposition> {
    let page = composer.compose_page(PageRequest::default()).await;

    cache.store_latest(&page, config.cache_ttl()).await?;
    debug!(cycle_id = %page.cycle_id, "Cached latest page");

    Ok(page)
}
