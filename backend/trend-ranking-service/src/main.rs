use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trend_ranking_service::{
    config::LogFormat,
    jobs::{start_page_refresh, PageCache, PageRefreshConfig, RedisPageCache},
    Config, PgTrendFeed, RedisRotationStore, RotationStore, SectionComposer, TrendFeed,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first so LOG_FORMAT can shape the subscriber
    let config = Config::from_env().context("Failed to load config")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.service.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }

    info!(
        service = %config.service.service_name,
        spotlight_range = %config.policy.spotlight_range,
        cap_target = config.policy.per_source_cap_target,
        "Starting trend ranking service"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let redis_client =
        redis::Client::open(config.redis.url.clone()).context("Failed to create Redis client")?;

    let feed: Arc<dyn TrendFeed> = Arc::new(PgTrendFeed::new(pool));
    let store: Arc<dyn RotationStore> = Arc::new(
        RedisRotationStore::new(redis_client.clone()).with_key_prefix(&config.redis.key_prefix),
    );
    let cache: Arc<dyn PageCache> =
        Arc::new(RedisPageCache::new(redis_client, &config.redis.key_prefix));

    let composer = Arc::new(
        SectionComposer::new(feed, store, config.policy.clone())
            .context("Invalid ranking policy")?,
    );

    tokio::spawn(start_page_refresh(
        composer,
        cache,
        PageRefreshConfig::from(&config.policy),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Trend ranking service stopped");
    Ok(())
}
