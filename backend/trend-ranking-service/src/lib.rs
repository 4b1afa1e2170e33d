pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;

pub use config::{Config, RankingPolicy};
pub use error::{RankingError, Result};
pub use services::{
    InMemoryRotationStore, InMemoryTrendFeed, PgTrendFeed, RedisRotationStore, RotationStore,
    SectionComposer, TrendFeed,
};
