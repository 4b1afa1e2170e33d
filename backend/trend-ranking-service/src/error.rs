use thiserror::Error;

use crate::models::RangeLabel;

/// Error taxonomy for the ranking engine.
///
/// Only `InvalidConfiguration` is fatal, and only at startup. Everything else is
/// absorbed inside a section: unavailable ranges are zero-weighted and an unavailable
/// rotation store fails open. An empty candidate pool is not an error at all.
#[derive(Debug, Error)]
pub enum RankingError {
    #[error("Trend aggregates for {range} unavailable: {reason}")]
    DataUnavailable { range: RangeLabel, reason: String },

    #[error("Rotation store unavailable: {0}")]
    RotationStoreUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RankingError {
    fn from(err: sqlx::Error) -> Self {
        RankingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for RankingError {
    fn from(err: redis::RedisError) -> Self {
        RankingError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for RankingError {
    fn from(err: serde_json::Error) -> Self {
        RankingError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RankingError>;
