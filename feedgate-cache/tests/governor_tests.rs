//! Integration tests for the content governor
//!
//! These tests drive complete content requests through cache, quota ledger
//! and freshness policy:
//! - Hit, miss, stale and empty outcomes
//! - Quota exhaustion and window rollover
//! - Fetch failures and stale-serve fallback
//! - Single-flight request coalescing
//! - Degraded persistence

use feedgate_cache::quota::HOUR_MS;
use feedgate_cache::{
    ContentGovernor, FetchStatus, GovernorConfig, ManualClock, MemorySessionStore, Priority, ProviderLimits,
    QuotaTables,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const START_MS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    title: String,
}

fn article(title: &str) -> Article {
    Article {
        title: title.to_string(),
    }
}

struct Harness {
    governor: ContentGovernor,
    clock: Arc<ManualClock>,
    session: Arc<MemorySessionStore>,
}

fn harness(quota: QuotaTables) -> Harness {
    harness_with(GovernorConfig::builder().ttl_jitter(0.0).quota(quota).build())
}

fn harness_with(config: GovernorConfig) -> Harness {
    let clock = Arc::new(ManualClock::at_millis(START_MS));
    let session = Arc::new(MemorySessionStore::new());
    let governor = ContentGovernor::new(config, session.clone(), clock.clone()).unwrap();
    Harness {
        governor,
        clock,
        session,
    }
}

fn gnews(daily: u32, hourly: u32) -> QuotaTables {
    QuotaTables::empty().with_provider("gnews", ProviderLimits::new(daily, hourly, 0))
}

#[tokio::test]
async fn test_quota_count_matches_records_and_blocks_at_limit() {
    let h = harness(gnews(100, 3));
    let ledger = h.governor.ledger();

    for _ in 0..3 {
        assert!(ledger.can_call("gnews").await);
        ledger.record_call("gnews", None, None).await;
    }

    assert_eq!(ledger.counter("gnews").await.hourly.count, 3);
    assert!(!ledger.can_call("gnews").await);
    assert!(!h.governor.can_make_api_call("gnews").await);
}

#[tokio::test]
async fn test_window_rollover_restores_headroom() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let config = GovernorConfig::builder().quota(gnews(100, 2)).build();
    let governor = ContentGovernor::new(config, Arc::new(MemorySessionStore::new()), clock.clone()).unwrap();
    let ledger = governor.ledger();

    ledger.record_call("gnews", None, None).await;
    ledger.record_call("gnews", None, None).await;
    assert!(!ledger.can_call("gnews").await);

    clock.set_millis(HOUR_MS + 1);
    assert!(ledger.can_call("gnews").await);
    assert_eq!(ledger.counter("gnews").await.hourly.count, 0);
}

#[tokio::test]
async fn test_expired_entry_with_exhausted_quota_is_served_stale() {
    let h = harness(gnews(100, 2));
    assert_ok!(
        h.governor
            .set("news_y", &vec![article("old")], Duration::from_millis(5_000))
            .await
    );

    h.clock.advance(Duration::from_secs(3 * 3600));
    h.governor.ledger().record_call("gnews", None, None).await;
    h.governor.ledger().record_call("gnews", None, None).await;
    assert!(!h.governor.can_make_api_call("gnews").await);

    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let response = h
        .governor
        .fetch_content("news_y", Priority::High, "gnews", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec![article("new")])
        })
        .await;

    assert_eq!(response.status, FetchStatus::Stale);
    assert_eq!(response.data, Some(vec![article("old")]));
    assert_eq!(response.written_at, Some(feedgate_cache::clock::millis_to_datetime(START_MS)));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "fetcher must not run without quota");
    assert_eq!(h.governor.get_stats().await.quota_rejections, 1);
}

#[tokio::test]
async fn test_entry_past_its_own_ttl_is_stale_under_lenient_priority() {
    let h = harness(gnews(100, 2));
    assert_ok!(
        h.governor
            .set("news_y", &vec![article("old")], Duration::from_millis(1_000))
            .await
    );

    h.clock.advance(Duration::from_millis(2_000));
    h.governor.ledger().record_call("gnews", None, None).await;
    h.governor.ledger().record_call("gnews", None, None).await;

    // Medium tolerates six hours, but the entry was written to live one second
    let response = h
        .governor
        .fetch_content("news_y", Priority::Medium, "gnews", || async {
            Ok::<_, String>(vec![article("new")])
        })
        .await;

    assert_eq!(response.status, FetchStatus::Stale);
    assert_eq!(response.data, Some(vec![article("old")]));
    assert!(response.next_check_at.is_none());
    assert!(h.governor.get::<Vec<Article>>("news_y").await.is_none());
}

#[tokio::test]
async fn test_hit_reports_earliest_deadline() {
    let h = harness(gnews(100, 10));
    assert_ok!(h.governor.set("short", &1u8, Duration::from_secs(60)).await);

    let response = h
        .governor
        .fetch_content("short", Priority::Low, "gnews", || async { Ok::<_, String>(2u8) })
        .await;

    assert_eq!(response.status, FetchStatus::Hit);
    assert_eq!(
        response.next_check_at,
        Some(feedgate_cache::clock::millis_to_datetime(START_MS + 60_000))
    );
}

#[tokio::test]
async fn test_no_entry_and_no_quota_is_empty() {
    let h = harness(QuotaTables::empty().with_provider("crunchbase", ProviderLimits::new(0, 0, 0)));

    let response = h
        .governor
        .fetch_content("funding_z", Priority::Medium, "crunchbase", || async {
            Ok::<_, String>(vec![article("never")])
        })
        .await;

    assert_eq!(response.status, FetchStatus::Empty);
    assert!(response.data.is_none());
    assert!(response.next_check_at.is_none());
    assert_eq!(h.governor.get_stats().await.empty_results, 1);
}

#[tokio::test]
async fn test_fetch_failure_falls_back_and_consumes_quota() {
    let h = harness(gnews(100, 10));
    assert_ok!(h.governor.set("events", &vec![article("cached")], Duration::from_secs(60)).await);
    h.clock.advance(Duration::from_secs(13 * 3600));

    let response = h
        .governor
        .fetch_content("events", Priority::Low, "gnews", || async {
            Err::<Vec<Article>, _>("provider returned 503")
        })
        .await;

    assert_eq!(response.status, FetchStatus::Stale);
    assert_eq!(response.data, Some(vec![article("cached")]));

    let usage = h.governor.quota_usage("gnews").await;
    assert_eq!(usage.hourly_count, 1, "failed attempts are recorded");
    assert_eq!(h.governor.get_stats().await.fetch_failures, 1);

    let empty = h
        .governor
        .fetch_content("unknown", Priority::Low, "gnews", || async { Err::<Vec<Article>, _>("timeout") })
        .await;
    assert_eq!(empty.status, FetchStatus::Empty);
}

#[tokio::test]
async fn test_priority_decides_freshness_at_read_time() {
    let h = harness(gnews(100, 10));
    let first = h
        .governor
        .fetch_content("feed", Priority::Low, "gnews", || async { Ok::<_, String>(1u32) })
        .await;
    assert_eq!(first.status, FetchStatus::Miss);

    h.clock.advance(Duration::from_secs(3 * 3600));

    // Three hours old: fine for medium, too old for high
    let medium = h
        .governor
        .fetch_content("feed", Priority::Medium, "gnews", || async { Ok::<_, String>(2u32) })
        .await;
    assert_eq!(medium.status, FetchStatus::Hit);
    assert_eq!(medium.data, Some(1));

    let high = h
        .governor
        .fetch_content("feed", Priority::High, "gnews", || async { Ok::<_, String>(3u32) })
        .await;
    assert_eq!(high.status, FetchStatus::Miss);
    assert_eq!(high.data, Some(3));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let h = harness(gnews(100, 10));
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let fetch = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, String>(vec![article("shared")])
    };

    let (a, b, c) = futures::join!(
        h.governor.fetch_content("news_x", Priority::High, "gnews", fetch),
        h.governor.fetch_content("news_x", Priority::High, "gnews", fetch),
        h.governor.fetch_content("news_x", Priority::High, "gnews", fetch),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let mut statuses = vec![a.status, b.status, c.status];
    statuses.sort_by_key(|s| s.to_string());
    assert_eq!(statuses, vec![FetchStatus::Hit, FetchStatus::Hit, FetchStatus::Miss]);
    assert_eq!(h.governor.quota_usage("gnews").await.hourly_count, 1);
}

#[tokio::test]
async fn test_single_flight_can_be_disabled() {
    let config = GovernorConfig::builder()
        .ttl_jitter(0.0)
        .single_flight(false)
        .quota(gnews(100, 10))
        .build();
    let h = harness_with(config);
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let fetch = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, String>(1u8)
    };

    futures::join!(
        h.governor.fetch_content("k", Priority::High, "gnews", fetch),
        h.governor.fetch_content("k", Priority::High, "gnews", fetch),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unavailable_persistence_degrades_to_memory() {
    let h = harness(gnews(100, 10));
    h.session.set_available(false);

    let miss = h
        .governor
        .fetch_content("news_x", Priority::High, "gnews", || async { Ok::<_, String>(vec![article("A")]) })
        .await;
    assert_eq!(miss.status, FetchStatus::Miss);

    let hit = h
        .governor
        .fetch_content("news_x", Priority::High, "gnews", || async { Err::<Vec<Article>, _>("unused") })
        .await;
    assert_eq!(hit.status, FetchStatus::Hit);

    let stats = h.governor.get_stats().await;
    assert!(stats.persist_failures >= 1);
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.persisted_entries, 0);
}

#[tokio::test]
async fn test_clear_keeps_quota_counters() {
    let h = harness(gnews(100, 10));
    h.governor
        .fetch_content("news_1", Priority::High, "gnews", || async { Ok::<_, String>(1) })
        .await;
    assert_ok!(h.governor.set("news_2", &2, Duration::from_secs(60)).await);

    assert_eq!(h.governor.clear().await, 2);
    assert!(h.governor.keys().await.is_empty());
    assert_eq!(h.governor.quota_usage("gnews").await.hourly_count, 1);
}

#[tokio::test]
async fn test_invalidate_and_prefix_invalidation() {
    let h = harness(QuotaTables::empty());
    for key in ["news_1", "news_2", "events_1"] {
        assert_ok!(h.governor.set(key, &key, Duration::from_secs(60)).await);
    }

    assert!(h.governor.invalidate("events_1").await);
    assert!(!h.governor.invalidate("events_1").await, "second invalidation is a no-op");

    assert_eq!(h.governor.invalidate_prefix("news_").await, 2);
    assert!(h.governor.keys().await.is_empty());
    assert_eq!(h.governor.get_stats().await.invalidations, 3);
}

#[tokio::test]
async fn test_governors_share_persistent_tier() {
    let session = Arc::new(MemorySessionStore::new());
    let clock = Arc::new(ManualClock::at_millis(START_MS));

    let writer = ContentGovernor::new(GovernorConfig::default(), session.clone(), clock.clone()).unwrap();
    assert_ok!(writer.set("shared", &vec![article("A")], Duration::from_secs(60)).await);

    let reader = ContentGovernor::new(GovernorConfig::default(), session, clock).unwrap();
    let value: Option<Vec<Article>> = reader.get("shared").await;
    assert_eq!(value, Some(vec![article("A")]));
    assert_eq!(reader.get_stats().await.memory_entries, 1, "read-through fills the fast tier");
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = GovernorConfig::builder().target_load_factor(1.5).build();
    assert!(ContentGovernor::in_memory(config).is_err());
}
