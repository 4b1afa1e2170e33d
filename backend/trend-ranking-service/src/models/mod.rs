use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

/// Fixed look-back window of a trend aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RangeLabel {
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    TwentyFourHours,
    #[serde(rename = "1w")]
    OneWeek,
}

impl RangeLabel {
    /// Shortest window first. Tie-breaking and weight rows rely on this order.
    pub const ALL: [RangeLabel; 4] = [
        RangeLabel::ThreeHours,
        RangeLabel::SixHours,
        RangeLabel::TwentyFourHours,
        RangeLabel::OneWeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreeHours => "3h",
            Self::SixHours => "6h",
            Self::TwentyFourHours => "24h",
            Self::OneWeek => "1w",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::ThreeHours => 0,
            Self::SixHours => 1,
            Self::TwentyFourHours => 2,
            Self::OneWeek => 3,
        }
    }
}

impl std::fmt::Display for RangeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RangeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "3h" => Ok(Self::ThreeHours),
            "6h" => Ok(Self::SixHours),
            "24h" | "1d" => Ok(Self::TwentyFourHours),
            "1w" | "7d" => Ok(Self::OneWeek),
            other => Err(format!("unknown range label: {}", other)),
        }
    }
}

/// Per-post engagement deltas for one window, as refreshed upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAggregate {
    pub item_id: String,
    pub source_id: String,
    pub range: RangeLabel,
    pub view_delta: i64,
    pub comment_delta: i64,
    pub like_delta: i64,
    pub dislike_delta: i64,
    /// views + 3*comments + 2*likes over the window
    pub hot_score: f64,
    pub window_end: DateTime<Utc>,
}

impl TrendAggregate {
    /// Hot score formula used by the upstream refresh job.
    pub fn compute_hot_score(view_delta: i64, comment_delta: i64, like_delta: i64) -> f64 {
        view_delta as f64 + 3.0 * comment_delta as f64 + 2.0 * like_delta as f64
    }
}

/// Cluster-level deltas summed across member posts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAggregate {
    pub cluster_id: String,
    /// Site of the current representative, used for cap accounting
    pub source_id: String,
    pub range: RangeLabel,
    pub view_delta: i64,
    pub comment_delta: i64,
    pub like_delta: i64,
    pub dislike_delta: i64,
    pub hot_score: f64,
    pub window_end: DateTime<Utc>,
    pub representative_post_id: Option<String>,
    pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub cluster_id: String,
    pub member_post_ids: Vec<String>,
    pub representative_post_id: Option<String>,
    pub size: i32,
}

/// Rotation state is tracked per (item, window label)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RotationKey {
    pub item_id: String,
    pub range: RangeLabel,
}

impl RotationKey {
    pub fn new(item_id: impl Into<String>, range: RangeLabel) -> Self {
        Self {
            item_id: item_id.into(),
            range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RotationState {
    pub consecutive_hits: u32,
    pub last_shown_at: Option<DateTime<Utc>>,
    pub suppressed_until: Option<DateTime<Utc>>,
    pub last_score: f64,
}

/// Prefix that keeps cluster rotation keys and exclusions apart from post ids.
pub const CLUSTER_KEY_PREFIX: &str = "cluster:";

pub fn cluster_key(cluster_id: &str) -> String {
    format!("{}{}", CLUSTER_KEY_PREFIX, cluster_id)
}

/// Transient per-invocation ranking row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub item_id: String,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub per_range_normalized: BTreeMap<RangeLabel, f64>,
    pub combined_score: f64,
    pub effective_score: f64,
    /// Raw hot score in the shortest range this candidate has data for
    pub tiebreak_hot_score: f64,
    pub rank: usize,
}

impl RankedCandidate {
    pub fn new(item_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            source_id: source_id.into(),
            cluster_id: None,
            per_range_normalized: BTreeMap::new(),
            combined_score: 0.0,
            effective_score: 0.0,
            tiebreak_hot_score: 0.0,
            rank: 0,
        }
    }

    /// Key used for rotation state: the cluster for issue rows, the post otherwise.
    pub fn rotation_item_id(&self) -> String {
        match &self.cluster_id {
            Some(cluster_id) => cluster_key(cluster_id),
            None => self.item_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionMode {
    /// Multi-window combination with cooldown and diversity cap
    Ranked,
    /// Cluster representatives instead of raw posts
    Issues,
    /// Recency-boosted activity, no cooldown
    Fresh,
}

impl SectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ranked => "ranked",
            Self::Issues => "issues",
            Self::Fresh => "fresh",
        }
    }
}

impl std::fmt::Display for SectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named sections of the home page, in composition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Rising,
    Spotlight,
    Issues24h,
    Issues1w,
    Fresh,
}

impl SectionKind {
    /// Page composition order. Earlier sections win contested items.
    pub const PAGE_ORDER: [SectionKind; 5] = [
        SectionKind::Rising,
        SectionKind::Spotlight,
        SectionKind::Issues24h,
        SectionKind::Issues1w,
        SectionKind::Fresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Spotlight => "spotlight",
            Self::Issues24h => "issues_24h",
            Self::Issues1w => "issues_1w",
            Self::Fresh => "fresh",
        }
    }

    pub fn mode(&self) -> SectionMode {
        match self {
            Self::Rising | Self::Spotlight => SectionMode::Ranked,
            Self::Issues24h | Self::Issues1w => SectionMode::Issues,
            Self::Fresh => SectionMode::Fresh,
        }
    }

    /// Default range; the spotlight range is chosen per page request.
    pub fn default_range(&self) -> RangeLabel {
        match self {
            Self::Rising | Self::Fresh => RangeLabel::ThreeHours,
            Self::Spotlight | Self::Issues24h => RangeLabel::TwentyFourHours,
            Self::Issues1w => RangeLabel::OneWeek,
        }
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of one section request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankParams {
    pub section: String,
    pub range: RangeLabel,
    pub mode: SectionMode,
    pub per_source_cap_target: usize,
    pub page_size: usize,
    #[serde(default)]
    pub exclude_ids: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionResult {
    pub section: String,
    pub range: RangeLabel,
    pub mode: SectionMode,
    pub items: Vec<RankedCandidate>,
    pub next_exclude_ids: HashSet<String>,
    pub has_more: bool,
    /// Ranges whose aggregates were unavailable and contributed nothing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_ranges: Vec<RangeLabel>,
}

impl SectionResult {
    /// "No content for now": empty items, exclusions passed through unchanged.
    pub fn empty(params: &RankParams) -> Self {
        Self {
            section: params.section.clone(),
            range: params.range,
            mode: params.mode,
            items: Vec::new(),
            next_exclude_ids: params.exclude_ids.clone(),
            has_more: false,
            degraded_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRequest {
    /// Spotlight range; falls back to the configured default
    pub spotlight_range: Option<RangeLabel>,
    #[serde(default)]
    pub exclude_ids: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageComposition {
    pub cycle_id: String,
    pub sections: Vec<SectionResult>,
    pub exclude_ids: HashSet<String>,
    pub composed_at: DateTime<Utc>,
}
