pub mod clusters;
pub mod combiner;
pub mod composer;
pub mod diversity;
pub mod feed;
pub mod normalizer;
pub mod rotation;

pub use clusters::ClusterSelector;
pub use combiner::{RangeWeights, ScoreCombiner};
pub use composer::SectionComposer;
pub use diversity::DiversityLayer;
pub use feed::{FeedFetcher, InMemoryTrendFeed, PgTrendFeed, TrendFeed};
pub use normalizer::RobustNormalizer;
pub use rotation::{
    InMemoryRotationStore, RedisRotationStore, RotationPolicy, RotationStore, RotationSuppressor,
};
