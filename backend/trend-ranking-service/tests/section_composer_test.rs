use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use trend_ranking_service::{
    models::{
        ClusterAggregate, ClusterMembership, PageRequest, RangeLabel, RotationKey, RotationState,
        SectionKind, TrendAggregate,
    },
    InMemoryRotationStore, InMemoryTrendFeed, RankingError, RankingPolicy, RotationStore,
    SectionComposer,
};

fn post(
    id: &str,
    source: &str,
    range: RangeLabel,
    hot: f64,
    window_end: DateTime<Utc>,
) -> TrendAggregate {
    TrendAggregate {
        item_id: id.to_string(),
        source_id: source.to_string(),
        range,
        view_delta: hot as i64,
        comment_delta: 0,
        like_delta: 0,
        dislike_delta: 0,
        hot_score: hot,
        window_end,
    }
}

fn cluster(
    id: &str,
    source: &str,
    range: RangeLabel,
    hot: f64,
    representative: Option<&str>,
    window_end: DateTime<Utc>,
) -> ClusterAggregate {
    ClusterAggregate {
        cluster_id: id.to_string(),
        source_id: source.to_string(),
        range,
        view_delta: hot as i64,
        comment_delta: 0,
        like_delta: 0,
        dislike_delta: 0,
        hot_score: hot,
        window_end,
        representative_post_id: representative.map(String::from),
        size: 2,
    }
}

fn membership(id: &str, members: &[&str], flagged: Option<&str>) -> ClusterMembership {
    ClusterMembership {
        cluster_id: id.to_string(),
        member_post_ids: members.iter().map(|m| m.to_string()).collect(),
        representative_post_id: flagged.map(String::from),
        size: members.len() as i32,
    }
}

fn composer(feed: &InMemoryTrendFeed, store: &InMemoryRotationStore) -> SectionComposer {
    SectionComposer::new(
        Arc::new(feed.clone()),
        Arc::new(store.clone()),
        RankingPolicy::default(),
    )
    .expect("default policy is valid")
}

/// 40 posts over 5 sources in every window, plus 10 clusters in 24h and 1w.
/// Cluster c0 contains p0, the hottest post on the page.
async fn seed_page(feed: &InMemoryTrendFeed, now: DateTime<Utc>) {
    for range in RangeLabel::ALL {
        let posts = (0..40)
            .map(|i| {
                let hot = 1000.0 / (i as f64 + 1.0) * (1.0 + range.index() as f64 * 0.1);
                post(&format!("p{}", i), &format!("s{}", i % 5), range, hot, now)
            })
            .collect();
        feed.replace_posts(range, posts).await;
    }

    for range in [RangeLabel::TwentyFourHours, RangeLabel::OneWeek] {
        let clusters = (0..10)
            .map(|i| {
                let rep = format!("q{}a", i);
                cluster(
                    &format!("c{}", i),
                    &format!("s{}", i % 5),
                    range,
                    500.0 - i as f64 * 20.0,
                    Some(rep.as_str()),
                    now,
                )
            })
            .collect();
        feed.replace_clusters(range, clusters).await;
    }

    for i in 0..10 {
        let a = format!("q{}a", i);
        let b = if i == 0 { "p0".to_string() } else { format!("q{}b", i) };
        feed.upsert_membership(membership(
            &format!("c{}", i),
            &[a.as_str(), b.as_str()],
            Some(a.as_str()),
        ))
        .await;
    }
}

#[tokio::test]
async fn test_page_sections_never_repeat_an_item() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    seed_page(&feed, now).await;

    let page = composer(&feed, &store)
        .compose_page_at(PageRequest::default(), now)
        .await;

    let order: Vec<&str> = page.sections.iter().map(|s| s.section.as_str()).collect();
    assert_eq!(order, vec!["rising", "spotlight", "issues_24h", "issues_1w", "fresh"]);

    let mut seen = HashSet::new();
    for section in &page.sections {
        assert!(!section.items.is_empty(), "{} came back empty", section.section);
        for item in &section.items {
            assert!(
                seen.insert(item.item_id.clone()),
                "{} repeated in {}",
                item.item_id,
                section.section
            );
            assert!(page.exclude_ids.contains(&item.item_id));
        }
    }

    // p0 leads rising, so its cluster is off the table for both issue sections
    assert_eq!(page.sections[0].items[0].item_id, "p0");
    for section in &page.sections[2..4] {
        assert!(section
            .items
            .iter()
            .all(|item| item.cluster_id.as_deref() != Some("c0")));
    }

    // A cluster shown in issues_24h is not shown again in issues_1w
    let daily: HashSet<_> = page.sections[2]
        .items
        .iter()
        .filter_map(|i| i.cluster_id.clone())
        .collect();
    assert!(page.sections[3]
        .items
        .iter()
        .filter_map(|i| i.cluster_id.as_ref())
        .all(|id| !daily.contains(id)));
}

#[tokio::test]
async fn test_next_exclude_ids_chain_without_overlap() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    seed_page(&feed, now).await;
    let composer = composer(&feed, &store);

    let first = composer
        .rank_at(
            composer.section_params(
                SectionKind::Rising,
                RangeLabel::TwentyFourHours,
                HashSet::new(),
            ),
            now,
        )
        .await;
    let second = composer
        .rank_at(
            composer.section_params(
                SectionKind::Rising,
                RangeLabel::TwentyFourHours,
                first.next_exclude_ids.clone(),
            ),
            now,
        )
        .await;

    let first_ids: HashSet<_> = first.items.iter().map(|i| i.item_id.clone()).collect();
    assert_eq!(first_ids.len(), 10);
    assert!(second.items.iter().all(|i| !first_ids.contains(&i.item_id)));
    assert!(first.next_exclude_ids.is_subset(&second.next_exclude_ids));
    assert!(first.has_more);
}

#[tokio::test]
async fn test_ranks_are_dense_and_ordered() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    seed_page(&feed, now).await;
    let composer = composer(&feed, &store);

    let result = composer
        .rank_at(
            composer.section_params(SectionKind::Spotlight, RangeLabel::OneWeek, HashSet::new()),
            now,
        )
        .await;

    assert_eq!(result.range, RangeLabel::OneWeek);
    for (i, item) in result.items.iter().enumerate() {
        assert_eq!(item.rank, i + 1);
    }

    // 5 sources, page of 10: no source may take more than ceil(10 / 5) slots
    let mut per_source: HashMap<&str, usize> = HashMap::new();
    for item in &result.items {
        *per_source.entry(item.source_id.as_str()).or_default() += 1;
    }
    assert!(per_source.values().all(|count| *count <= 2));
}

/// Three items over one window, republished every cycle so the snapshot stays fresh.
async fn publish_rising(feed: &InMemoryTrendFeed, now: DateTime<Utc>) {
    let range = RangeLabel::ThreeHours;
    feed.replace_posts(
        range,
        vec![
            post("x", "s1", range, 1000.0, now),
            post("y", "s2", range, 100.0, now),
            post("z", "s3", range, 10.0, now),
        ],
    )
    .await;
}

#[tokio::test]
async fn test_repeated_winner_enters_cooldown_then_returns() {
    let start = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    // One slot, so only the leader accumulates exposure
    let policy = RankingPolicy {
        rising_page_size: 1,
        ..Default::default()
    };
    let composer = SectionComposer::new(Arc::new(feed.clone()), Arc::new(store.clone()), policy)
        .expect("valid policy");
    let key = RotationKey::new("x", RangeLabel::ThreeHours);

    let params = || {
        composer.section_params(SectionKind::Rising, RangeLabel::TwentyFourHours, HashSet::new())
    };

    // Four consecutive cycles five minutes apart: shown every time
    for cycle in 0..4 {
        let now = start + Duration::minutes(5 * cycle);
        publish_rising(&feed, now).await;
        let result = composer.rank_at(params(), now).await;
        assert_eq!(result.items[0].item_id, "x", "cycle {}", cycle);
    }

    let state = store.get(&key).await.expect("state written for x");
    assert_eq!(state.consecutive_hits, 4);
    assert_eq!(
        state.suppressed_until,
        Some(start + Duration::minutes(15) + Duration::hours(1))
    );

    // Fifth cycle: x is in cooldown despite the best score
    let now = start + Duration::minutes(20);
    publish_rising(&feed, now).await;
    let result = composer.rank_at(params(), now).await;
    let ids: Vec<&str> = result.items.iter().map(|i| i.item_id.as_str()).collect();
    assert_eq!(ids, vec!["y"]);

    // Cooldown over and the last exposure is long past the reset gap
    let now = start + Duration::minutes(80);
    publish_rising(&feed, now).await;
    let result = composer.rank_at(params(), now).await;
    assert_eq!(result.items[0].item_id, "x");
    assert_eq!(store.get(&key).await.map(|s| s.consecutive_hits), Some(1));
}

#[tokio::test]
async fn test_shown_items_are_softened() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    let composer = composer(&feed, &store);
    publish_rising(&feed, now).await;

    store
        .insert(
            RotationKey::new("x", RangeLabel::ThreeHours),
            RotationState {
                consecutive_hits: 2,
                last_shown_at: Some(now - Duration::minutes(5)),
                suppressed_until: None,
                last_score: 1.0,
            },
        )
        .await;

    let result = composer
        .rank_at(
            composer.section_params(
                SectionKind::Rising,
                RangeLabel::TwentyFourHours,
                HashSet::new(),
            ),
            now,
        )
        .await;
    let x = result
        .items
        .iter()
        .find(|i| i.item_id == "x")
        .expect("x still eligible");
    assert!((x.effective_score - x.combined_score / 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_active_cooldown_hides_top_item() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    let composer = composer(&feed, &store);
    publish_rising(&feed, now).await;

    store
        .insert(
            RotationKey::new("x", RangeLabel::ThreeHours),
            RotationState {
                consecutive_hits: 4,
                last_shown_at: Some(now),
                suppressed_until: Some(now + Duration::hours(1)),
                last_score: 1.0,
            },
        )
        .await;

    let result = composer
        .rank_at(
            composer.section_params(
                SectionKind::Rising,
                RangeLabel::TwentyFourHours,
                HashSet::new(),
            ),
            now,
        )
        .await;
    assert!(result.items.iter().all(|i| i.item_id != "x"));
    assert_eq!(result.items.len(), 2);
}

#[tokio::test]
async fn test_issue_section_collapses_clusters_to_representatives() {
    let now = Utc::now();
    let range = RangeLabel::TwentyFourHours;
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();

    feed.replace_posts(
        range,
        vec![
            post("p1", "s1", range, 5.0, now),
            post("p2", "s2", range, 50.0, now),
            post("p4", "s4", range, 20.0, now),
        ],
    )
    .await;
    feed.replace_clusters(
        range,
        vec![
            cluster("c1", "s1", range, 300.0, Some("gone"), now),
            cluster("c2", "s9", range, 200.0, Some("p9"), now),
            cluster("c3", "s4", range, 100.0, Some("p4"), now),
        ],
    )
    .await;
    // Flagged representative left the cluster
    feed.upsert_membership(membership("c1", &["p1", "p2"], Some("gone")))
        .await;
    feed.upsert_membership(membership("c3", &["p4"], Some("p4")))
        .await;
    // c2 has no membership rows at all

    let composer = composer(&feed, &store);
    let exclude: HashSet<String> = ["p4".to_string()].into();
    let result = composer
        .rank_at(
            composer.section_params(SectionKind::Issues24h, RangeLabel::TwentyFourHours, exclude),
            now,
        )
        .await;

    let picked: Vec<(&str, Option<&str>)> = result
        .items
        .iter()
        .map(|i| (i.item_id.as_str(), i.cluster_id.as_deref()))
        .collect();
    assert_eq!(picked, vec![("p2", Some("c1")), ("p9", Some("c2"))]);
    assert_eq!(result.items[1].source_id, "s9");
    assert!(result.next_exclude_ids.contains("cluster:c1"));
    assert!(result.next_exclude_ids.contains("cluster:c2"));
    assert!(!result.next_exclude_ids.contains("cluster:c3"));

    // Rotation is tracked per cluster
    assert!(store
        .get(&RotationKey::new("cluster:c1", range))
        .await
        .is_some());
}

#[tokio::test]
async fn test_cooling_cluster_does_not_shadow_cluster_with_same_representative() {
    let now = Utc::now();
    let range = RangeLabel::TwentyFourHours;
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();

    feed.replace_posts(range, vec![post("p1", "s1", range, 40.0, now)])
        .await;
    feed.replace_clusters(
        range,
        vec![
            cluster("c1", "s1", range, 300.0, Some("p1"), now),
            cluster("c2", "s1", range, 200.0, Some("p1"), now),
        ],
    )
    .await;
    feed.upsert_membership(membership("c1", &["p1"], Some("p1")))
        .await;
    feed.upsert_membership(membership("c2", &["p1"], Some("p1")))
        .await;

    store
        .insert(
            RotationKey::new("cluster:c1", range),
            RotationState {
                consecutive_hits: 4,
                last_shown_at: Some(now),
                suppressed_until: Some(now + Duration::hours(1)),
                last_score: 1.0,
            },
        )
        .await;

    let composer = composer(&feed, &store);
    let result = composer
        .rank_at(
            composer.section_params(SectionKind::Issues24h, range, HashSet::new()),
            now,
        )
        .await;

    let picked: Vec<(&str, Option<&str>)> = result
        .items
        .iter()
        .map(|i| (i.item_id.as_str(), i.cluster_id.as_deref()))
        .collect();
    assert_eq!(picked, vec![("p1", Some("c2"))]);
    assert!(result.next_exclude_ids.contains("cluster:c2"));
    assert!(!result.next_exclude_ids.contains("cluster:c1"));
}

#[tokio::test]
async fn test_unavailable_and_slow_ranges_degrade() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    seed_page(&feed, now).await;
    feed.set_unavailable(RangeLabel::SixHours, true).await;
    feed.set_delay(RangeLabel::OneWeek, std::time::Duration::from_secs(2))
        .await;

    let policy = RankingPolicy {
        fetch_deadline_ms: 50,
        ..Default::default()
    };
    let composer = SectionComposer::new(Arc::new(feed.clone()), Arc::new(store.clone()), policy)
        .expect("valid policy");

    let result = composer
        .rank_at(
            composer.section_params(
                SectionKind::Rising,
                RangeLabel::TwentyFourHours,
                HashSet::new(),
            ),
            now,
        )
        .await;

    assert_eq!(
        result.degraded_ranges,
        vec![RangeLabel::SixHours, RangeLabel::OneWeek]
    );
    assert_eq!(result.items.len(), 10);
    let first = &result.items[0];
    assert!(first.per_range_normalized.contains_key(&RangeLabel::ThreeHours));
    assert!(!first.per_range_normalized.contains_key(&RangeLabel::SixHours));
}

#[tokio::test]
async fn test_stale_snapshot_empties_the_section() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    let store = InMemoryRotationStore::new();
    seed_page(&feed, now - Duration::hours(1)).await;

    let composer = composer(&feed, &store);
    let result = composer
        .rank_at(
            composer.section_params(
                SectionKind::Fresh,
                RangeLabel::TwentyFourHours,
                HashSet::new(),
            ),
            now,
        )
        .await;

    assert!(result.items.is_empty());
    assert!(!result.has_more);
    assert_eq!(result.degraded_ranges, vec![RangeLabel::ThreeHours]);
}

struct FailingStore;

#[async_trait]
impl RotationStore for FailingStore {
    async fn load_many(
        &self,
        _keys: &[RotationKey],
    ) -> trend_ranking_service::Result<HashMap<RotationKey, RotationState>> {
        Err(RankingError::RotationStoreUnavailable("connection refused".to_string()))
    }

    async fn save_batch(
        &self,
        _entries: Vec<(RotationKey, RotationState)>,
    ) -> trend_ranking_service::Result<()> {
        Err(RankingError::RotationStoreUnavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_rotation_store_outage_fails_open() {
    let now = Utc::now();
    let feed = InMemoryTrendFeed::new();
    publish_rising(&feed, now).await;

    let composer = SectionComposer::new(
        Arc::new(feed.clone()),
        Arc::new(FailingStore),
        RankingPolicy::default(),
    )
    .expect("valid policy");

    let result = composer
        .rank_at(
            composer.section_params(
                SectionKind::Rising,
                RangeLabel::TwentyFourHours,
                HashSet::new(),
            ),
            now,
        )
        .await;

    let ids: Vec<&str> = result.items.iter().map(|i| i.item_id.as_str()).collect();
    assert_eq!(ids, vec!["x", "y", "z"]);
    assert!(result
        .items
        .iter()
        .all(|i| i.effective_score == i.combined_score));
}
