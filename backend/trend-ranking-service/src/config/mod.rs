use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::{RankingError, Result};
use crate::models::{RangeLabel, SectionKind};
use crate::services::combiner::RangeWeights;
use crate::services::rotation::RotationPolicy;

/// Upper bound for every duration knob (30 days)
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub policy: RankingPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

/// Ranking policy knobs, read from `RANKING_*` environment variables.
///
/// Weight rows list the contribution of the 3h, 6h, 24h and 1w windows (in that
/// order) when ranking a section over the row's range.
#[derive(Debug, Clone, Deserialize)]
pub struct RankingPolicy {
    #[serde(default = "default_weights_3h")]
    pub weights_3h: Vec<f64>,
    #[serde(default = "default_weights_6h")]
    pub weights_6h: Vec<f64>,
    #[serde(default = "default_weights_24h")]
    pub weights_24h: Vec<f64>,
    #[serde(default = "default_weights_1w")]
    pub weights_1w: Vec<f64>,

    #[serde(default = "default_hit_threshold")]
    pub hit_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_reset_gap_secs")]
    pub reset_gap_secs: u64,
    #[serde(default = "default_penalty_k")]
    pub penalty_k: f64,

    #[serde(default = "default_per_source_cap_target")]
    pub per_source_cap_target: usize,

    #[serde(default = "default_rising_page_size")]
    pub rising_page_size: usize,
    #[serde(default = "default_spotlight_page_size")]
    pub spotlight_page_size: usize,
    #[serde(default = "default_issues_page_size")]
    pub issues_page_size: usize,
    #[serde(default = "default_fresh_page_size")]
    pub fresh_page_size: usize,
    #[serde(default = "default_spotlight_range")]
    pub spotlight_range: RangeLabel,

    #[serde(default = "default_fresh_boost_factor")]
    pub fresh_boost_factor: f64,

    #[serde(default = "default_fetch_deadline_ms")]
    pub fetch_deadline_ms: u64,
    #[serde(default = "default_feed_refresh_interval_secs")]
    pub feed_refresh_interval_secs: u64,

    #[serde(default = "default_refresh_enabled")]
    pub refresh_enabled: bool,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_initial_delay_secs")]
    pub refresh_initial_delay_secs: u64,
}

fn default_weights_3h() -> Vec<f64> {
    vec![0.50, 0.30, 0.15, 0.05]
}
fn default_weights_6h() -> Vec<f64> {
    vec![0.40, 0.30, 0.20, 0.10]
}
fn default_weights_24h() -> Vec<f64> {
    vec![0.30, 0.30, 0.25, 0.15]
}
fn default_weights_1w() -> Vec<f64> {
    vec![0.25, 0.25, 0.25, 0.25]
}
fn default_hit_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    3600
}
fn default_reset_gap_secs() -> u64 {
    20 * 60
}
fn default_penalty_k() -> f64 {
    0.25
}
fn default_per_source_cap_target() -> usize {
    8
}
fn default_rising_page_size() -> usize {
    10
}
fn default_spotlight_page_size() -> usize {
    10
}
fn default_issues_page_size() -> usize {
    8
}
fn default_fresh_page_size() -> usize {
    12
}
fn default_spotlight_range() -> RangeLabel {
    RangeLabel::TwentyFourHours
}
fn default_fresh_boost_factor() -> f64 {
    1.0
}
fn default_fetch_deadline_ms() -> u64 {
    2000
}
fn default_feed_refresh_interval_secs() -> u64 {
    600
}
fn default_refresh_enabled() -> bool {
    true
}
fn default_refresh_interval_secs() -> u64 {
    300
}
fn default_refresh_initial_delay_secs() -> u64 {
    5
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            weights_3h: default_weights_3h(),
            weights_6h: default_weights_6h(),
            weights_24h: default_weights_24h(),
            weights_1w: default_weights_1w(),
            hit_threshold: default_hit_threshold(),
            cooldown_secs: default_cooldown_secs(),
            reset_gap_secs: default_reset_gap_secs(),
            penalty_k: default_penalty_k(),
            per_source_cap_target: default_per_source_cap_target(),
            rising_page_size: default_rising_page_size(),
            spotlight_page_size: default_spotlight_page_size(),
            issues_page_size: default_issues_page_size(),
            fresh_page_size: default_fresh_page_size(),
            spotlight_range: default_spotlight_range(),
            fresh_boost_factor: default_fresh_boost_factor(),
            fetch_deadline_ms: default_fetch_deadline_ms(),
            feed_refresh_interval_secs: default_feed_refresh_interval_secs(),
            refresh_enabled: default_refresh_enabled(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_initial_delay_secs: default_refresh_initial_delay_secs(),
        }
    }
}

impl RankingPolicy {
    pub fn from_env() -> Result<Self> {
        envy::prefixed("RANKING_")
            .from_env::<RankingPolicy>()
            .map_err(|e| RankingError::InvalidConfiguration(e.to_string()))
    }

    fn weight_row(&self, range: RangeLabel) -> &[f64] {
        match range {
            RangeLabel::ThreeHours => &self.weights_3h,
            RangeLabel::SixHours => &self.weights_6h,
            RangeLabel::TwentyFourHours => &self.weights_24h,
            RangeLabel::OneWeek => &self.weights_1w,
        }
    }

    /// Weight table keyed by the requested section range.
    pub fn range_weights(&self, range: RangeLabel) -> Result<RangeWeights> {
        RangeWeights::from_slice(self.weight_row(range)).map_err(|e| {
            RankingError::InvalidConfiguration(format!("weights for {}: {}", range, e))
        })
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            hit_threshold: self.hit_threshold,
            cooldown: bounded_seconds(self.cooldown_secs),
            reset_gap: bounded_seconds(self.reset_gap_secs),
            penalty_k: self.penalty_k,
        }
    }

    pub fn page_size(&self, section: SectionKind) -> usize {
        match section {
            SectionKind::Rising => self.rising_page_size,
            SectionKind::Spotlight => self.spotlight_page_size,
            SectionKind::Issues24h | SectionKind::Issues1w => self.issues_page_size,
            SectionKind::Fresh => self.fresh_page_size,
        }
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.fetch_deadline_ms)
    }

    /// A snapshot older than this has missed more than one upstream refresh.
    pub fn stale_after(&self) -> chrono::Duration {
        bounded_seconds(self.feed_refresh_interval_secs) * 2
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Fail-fast checks run once at startup.
    pub fn validate(&self) -> Result<()> {
        for range in RangeLabel::ALL {
            self.range_weights(range)?;
        }
        if self.hit_threshold == 0 {
            return Err(RankingError::InvalidConfiguration(
                "hit_threshold must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("cooldown_secs", self.cooldown_secs),
            ("reset_gap_secs", self.reset_gap_secs),
            ("feed_refresh_interval_secs", self.feed_refresh_interval_secs),
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("refresh_initial_delay_secs", self.refresh_initial_delay_secs),
        ] {
            let representable = i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .is_some();
            if !representable || secs > MAX_DURATION_SECS {
                return Err(RankingError::InvalidConfiguration(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_DURATION_SECS, secs
                )));
            }
        }
        if self.cooldown_secs == 0 {
            return Err(RankingError::InvalidConfiguration(
                "cooldown_secs must be positive".to_string(),
            ));
        }
        if self.reset_gap_secs == 0 {
            return Err(RankingError::InvalidConfiguration(
                "reset_gap_secs must be positive".to_string(),
            ));
        }
        if !self.penalty_k.is_finite() || self.penalty_k < 0.0 {
            return Err(RankingError::InvalidConfiguration(format!(
                "penalty_k must be a non-negative number, got {}",
                self.penalty_k
            )));
        }
        if self.per_source_cap_target == 0 {
            return Err(RankingError::InvalidConfiguration(
                "per_source_cap_target must be at least 1".to_string(),
            ));
        }
        for section in SectionKind::PAGE_ORDER {
            if self.page_size(section) == 0 {
                return Err(RankingError::InvalidConfiguration(format!(
                    "page size for section {} must be at least 1",
                    section
                )));
            }
        }
        if !self.fresh_boost_factor.is_finite() || self.fresh_boost_factor <= 0.0 {
            return Err(RankingError::InvalidConfiguration(format!(
                "fresh_boost_factor must be positive, got {}",
                self.fresh_boost_factor
            )));
        }
        if self.fetch_deadline_ms == 0 {
            return Err(RankingError::InvalidConfiguration(
                "fetch_deadline_ms must be positive".to_string(),
            ));
        }
        if self.feed_refresh_interval_secs == 0 || self.refresh_interval_secs == 0 {
            return Err(RankingError::InvalidConfiguration(
                "refresh intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "text".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let config = Config {
            service: ServiceConfig {
                service_name: env::var("SERVICE_NAME")
                    .unwrap_or_else(|_| "trend-ranking-service".to_string()),
                log_format,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost:5432/trends".to_string()),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5)?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "trend_ranking".to_string()),
            },
            policy: RankingPolicy::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(RankingError::InvalidConfiguration(
                "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        self.policy.validate()
    }
}

/// Out-of-range values are rejected by `validate`; this only keeps the
/// conversion itself from panicking.
fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs.min(MAX_DURATION_SECS) as i64)
        .unwrap_or_else(chrono::Duration::zero)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            RankingError::InvalidConfiguration(format!("{} has an invalid value: {}", key, raw))
        }),
        Err(_) => Ok(default),
    }
}
