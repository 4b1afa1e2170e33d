use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{RankingError, Result};
use crate::models::{RotationKey, RotationState};

/// Keyed read / batched upsert of rotation state.
///
/// Rows are created lazily on first exposure and only ever superseded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RotationStore: Send + Sync {
    /// Missing keys are simply absent from the returned map.
    async fn load_many(&self, keys: &[RotationKey]) -> Result<HashMap<RotationKey, RotationState>>;

    /// All entries are written together or not at all.
    async fn save_batch(&self, entries: Vec<(RotationKey, RotationState)>) -> Result<()>;
}

/// Redis-backed rotation store
///
/// Key: `{prefix}:rotation:{range}:{item_id}`, value: JSON-encoded `RotationState`.
pub struct RedisRotationStore {
    redis: redis::Client,
    key_prefix: String,
}

impl RedisRotationStore {
    pub fn new(redis: redis::Client) -> Self {
        Self {
            redis,
            key_prefix: "trend_ranking".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    fn state_key(&self, key: &RotationKey) -> String {
        format!(
            "{}:rotation:{}:{}",
            self.key_prefix,
            key.range.as_str(),
            key.item_id
        )
    }
}

#[async_trait]
impl RotationStore for RedisRotationStore {
    async fn load_many(&self, keys: &[RotationKey]) -> Result<HashMap<RotationKey, RotationState>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RankingError::RotationStoreUnavailable(e.to_string()))?;

        let redis_keys: Vec<String> = keys.iter().map(|k| self.state_key(k)).collect();
        let values: Vec<Option<String>> = conn
            .mget(&redis_keys)
            .await
            .map_err(|e| RankingError::RotationStoreUnavailable(e.to_string()))?;

        let mut states = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(json) = value else { continue };
            match serde_json::from_str::<RotationState>(&json) {
                Ok(state) => {
                    states.insert(key.clone(), state);
                }
                Err(e) => {
                    // Unreadable row behaves like a fresh item
                    warn!(
                        item_id = %key.item_id,
                        range = %key.range,
                        error = %e,
                        "Discarding unreadable rotation state"
                    );
                }
            }
        }

        debug!(requested = keys.len(), found = states.len(), "Loaded rotation states");
        Ok(states)
    }

    async fn save_batch(&self, entries: Vec<(RotationKey, RotationState)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RankingError::RotationStoreUnavailable(e.to_string()))?;

        // MULTI/EXEC so a cycle never leaves half of its cooldown accounting behind
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, state) in &entries {
            let json = serde_json::to_string(state)?;
            pipe.set(self.state_key(key), json).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| RankingError::RotationStoreUnavailable(e.to_string()))?;

        debug!(written = entries.len(), "Saved rotation states");
        Ok(())
    }
}

/// Process-local rotation store for tests and single-node runs.
#[derive(Clone, Default)]
pub struct InMemoryRotationStore {
    states: Arc<RwLock<HashMap<RotationKey, RotationState>>>,
}

impl InMemoryRotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &RotationKey) -> Option<RotationState> {
        self.states.read().await.get(key).cloned()
    }

    pub async fn insert(&self, key: RotationKey, state: RotationState) {
        self.states.write().await.insert(key, state);
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl RotationStore for InMemoryRotationStore {
    async fn load_many(&self, keys: &[RotationKey]) -> Result<HashMap<RotationKey, RotationState>> {
        let states = self.states.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| states.get(k).map(|s| (k.clone(), s.clone())))
            .collect())
    }

    async fn save_batch(&self, entries: Vec<(RotationKey, RotationState)>) -> Result<()> {
        let mut states = self.states.write().await;
        states.extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RangeLabel;

    #[tokio::test]
    async fn test_in_memory_round_trip_and_missing_keys() {
        let store = InMemoryRotationStore::new();
        let key = RotationKey::new("post-1", RangeLabel::ThreeHours);
        let state = RotationState {
            consecutive_hits: 2,
            ..Default::default()
        };

        store
            .save_batch(vec![(key.clone(), state.clone())])
            .await
            .unwrap();

        let missing = RotationKey::new("post-2", RangeLabel::ThreeHours);
        let loaded = store.load_many(&[key.clone(), missing]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&key], state);
    }

    #[tokio::test]
    async fn test_same_item_different_range_is_separate_state() {
        let store = InMemoryRotationStore::new();
        let short = RotationKey::new("post-1", RangeLabel::ThreeHours);
        let long = RotationKey::new("post-1", RangeLabel::OneWeek);
        store.insert(short.clone(), RotationState::default()).await;

        assert!(store.get(&short).await.is_some());
        assert!(store.get(&long).await.is_none());
    }

    #[test]
    fn test_redis_key_layout() {
        let client = redis::Client::open("redis://localhost:6379").expect("valid url");
        let store = RedisRotationStore::new(client).with_key_prefix("feeds");
        let key = RotationKey::new("cluster:42", RangeLabel::TwentyFourHours);
        assert_eq!(store.state_key(&key), "feeds:rotation:24h:cluster:42");
    }
}
