//! Scenario tests for the tiered cache against the in-process remote store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forecache_core::{
    CacheConfig, CacheError, CacheKey, CacheResult, KeyParams, ManualClock, ReconnectPolicy,
};
use forecache_storage::{ArtifactSource, ConnectionState, KeyListing, MockRemote, Tier, TieredCache};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Barrier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Forecast {
    subject: String,
    values: Vec<f64>,
}

fn forecast(subject: &str) -> Forecast {
    Forecast {
        subject: subject.to_string(),
        values: vec![10.0, 12.5, 11.0],
    }
}

struct Harness {
    remote: MockRemote,
    clock: Arc<ManualClock>,
    cache: TieredCache<MockRemote>,
}

fn harness(config: CacheConfig) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let remote = MockRemote::with_clock(clock.clone());
    let cache = TieredCache::with_clock(remote.clone(), &config, clock.clone())
        .expect("test config is valid");
    Harness {
        remote,
        clock,
        cache,
    }
}

fn days(n: i64) -> KeyParams {
    KeyParams::new()
        .with("days", n)
        .with("confidence_interval", 0.95)
}

/// Computes a forecast, optionally waiting for a partner computation first.
struct CountingSource {
    calls: AtomicUsize,
    rendezvous: Option<Barrier>,
    fail: bool,
}

impl CountingSource {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            rendezvous: None,
            fail: false,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource<Forecast> for CountingSource {
    async fn compute(&self, key: &CacheKey) -> CacheResult<Forecast> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.rendezvous {
            barrier.wait().await;
        }
        if self.fail {
            return Err(CacheError::source("model fit diverged"));
        }
        Ok(forecast(key.as_str()))
    }
}

// ============================================================================
// ROUND TRIP AND EXPIRY
// ============================================================================

#[tokio::test]
async fn test_round_trip_remote_tier() {
    let h = harness(CacheConfig::default());
    let key = h.cache.derive_key("42", &days(30)).expect("valid subject");

    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(10))
        .await
        .expect("set");

    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(forecast("42")));
    assert!(h.remote.contains(key.as_str()));
}

#[tokio::test]
async fn test_expiry_scenario_remote_tier() {
    let h = harness(CacheConfig::default());
    let key = h.cache.derive_key("42", &days(30)).expect("valid subject");
    assert!(key.as_str().starts_with("forecast:42:"));

    h.cache
        .set(&key, &json!({"a": 1}), Duration::from_secs(1))
        .await
        .expect("set");
    let read: Option<serde_json::Value> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(json!({"a": 1})));

    h.clock.advance(Duration::from_secs(2));
    let read: Option<serde_json::Value> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, None);
}

#[tokio::test]
async fn test_expiry_scenario_fallback_tier() {
    let h = harness(CacheConfig::default());
    h.remote.set_reachable(false);
    let key = h.cache.derive_key("42", &days(30)).expect("valid subject");

    h.cache
        .set(&key, &json!({"a": 1}), Duration::from_secs(1))
        .await
        .expect("set");
    let read: Option<serde_json::Value> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(json!({"a": 1})));

    h.clock.advance(Duration::from_secs(2));
    let read: Option<serde_json::Value> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, None);
    assert_eq!(h.cache.stats().await.fallback_size, 0);
}

#[tokio::test]
async fn test_remote_write_replaces_older_fallback_copy() {
    let h = harness(CacheConfig::default());
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    assert!(h.cache.stats().await.remote_connected);

    h.remote.set_failing(true);
    h.cache
        .set(&key, &json!(1), Duration::from_secs(3_600))
        .await
        .expect("set");
    assert_eq!(h.cache.stats().await.fallback_size, 1);

    h.remote.set_failing(false);
    h.cache
        .set(&key, &json!(2), Duration::from_secs(10))
        .await
        .expect("set");
    assert_eq!(h.cache.stats().await.fallback_size, 0);

    let read: Option<u32> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(2));

    h.clock.advance(Duration::from_secs(11));
    let read: Option<u32> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, None);
}

#[tokio::test]
async fn test_permuted_params_hit_same_entry() {
    let h = harness(CacheConfig::default());
    let written = h
        .cache
        .derive_key(
            "42",
            &KeyParams::new()
                .with("days", 30)
                .with("confidence_interval", 0.95),
        )
        .expect("valid subject");
    let looked_up = h
        .cache
        .derive_key(
            "42",
            &KeyParams::new()
                .with("confidence_interval", 0.95)
                .with("days", 30),
        )
        .expect("valid subject");

    h.cache
        .set(&written, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    let read: Option<Forecast> = h.cache.get(&looked_up).await.expect("get");
    assert_eq!(read, Some(forecast("42")));
}

// ============================================================================
// DEGRADATION
// ============================================================================

#[tokio::test]
async fn test_degradation_stops_connection_attempts() {
    let h = harness(CacheConfig::default());
    h.remote.set_reachable(false);
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    for _ in 0..5 {
        let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
        assert_eq!(read, None);
    }
    assert_eq!(h.remote.connect_calls(), 3);

    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    h.remote.set_reachable(true);
    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(forecast("42")));

    let stats = h.cache.stats().await;
    assert_eq!(h.remote.connect_calls(), 3);
    assert_eq!(stats.connection_attempts, 3);
    assert_eq!(stats.connection_state, ConnectionState::PermanentlyDegraded);
    assert!(!stats.remote_connected);
    assert_eq!(stats.fallback_hits, 1);
    assert!(!h.remote.contains(key.as_str()));
}

#[tokio::test]
async fn test_backoff_policy_recovers_remote_tier() {
    let config = CacheConfig {
        reconnect: ReconnectPolicy::Backoff {
            initial_ms: 1_000,
            max_ms: 60_000,
        },
        ..CacheConfig::default()
    };
    let h = harness(config);
    h.remote.set_reachable(false);
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    for _ in 0..4 {
        let _: Option<Forecast> = h.cache.get(&key).await.expect("get");
    }
    assert_eq!(h.remote.connect_calls(), 3);
    assert!(matches!(
        h.cache.connection_state(),
        ConnectionState::CoolingDown { .. }
    ));

    h.remote.set_reachable(true);
    h.clock.advance(Duration::from_secs(1));
    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");

    assert_eq!(h.remote.connect_calls(), 4);
    assert_eq!(h.cache.connection_state(), ConnectionState::Connected);
    assert!(h.remote.contains(key.as_str()));
}

#[tokio::test]
async fn test_operation_failure_falls_through_without_state_change() {
    let h = harness(CacheConfig::default());
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    assert!(h.cache.stats().await.remote_connected);

    h.remote.set_failing(true);
    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(forecast("42")));

    h.remote.set_failing(false);
    let stats = h.cache.stats().await;
    assert_eq!(stats.connection_state, ConnectionState::Connected);
    assert_eq!(stats.remote_errors, 2);
    assert_eq!(stats.fallback_hits, 1);
    assert_eq!(stats.fallback_size, 1);
    assert_eq!(h.remote.connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_operations_time_out_to_fallback() {
    let config = CacheConfig {
        operation_timeout_ms: 100,
        ..CacheConfig::default()
    };
    let h = harness(config);
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    assert!(h.cache.stats().await.remote_connected);

    h.remote.set_stalled(true);
    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(forecast("42")));

    let stats = h.cache.stats().await;
    assert_eq!(stats.remote_errors, 3);
    assert!(!stats.remote_connected);
    assert_eq!(stats.connection_state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connect_times_out() {
    let h = harness(CacheConfig::default());
    h.remote.set_stalled(true);
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, None);
    assert_eq!(h.cache.stats().await.connection_attempts, 2);
    assert_eq!(h.cache.connection_state(), ConnectionState::Disconnected);
}

async fn timed_get(
    cache: &TieredCache<MockRemote>,
    key: &CacheKey,
) -> (Option<Forecast>, Duration) {
    let start = tokio::time::Instant::now();
    let read = cache.get(key).await.expect("get");
    (read, start.elapsed())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_do_not_queue_behind_connect() {
    let config = CacheConfig::default();
    let connect_timeout = config.connect_timeout();
    let h = harness(config);
    h.remote.set_stalled(true);
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    let stats = async {
        let start = tokio::time::Instant::now();
        let stats = h.cache.stats().await;
        (stats, start.elapsed())
    };
    let (first, second, third, (stats, stats_wait)) = tokio::join!(
        timed_get(&h.cache, &key),
        timed_get(&h.cache, &key),
        timed_get(&h.cache, &key),
        stats,
    );

    for (read, waited) in [&first, &second, &third] {
        assert_eq!(*read, None);
        assert!(*waited <= connect_timeout, "waited {:?}", waited);
    }
    assert_eq!(second.1, Duration::ZERO);
    assert_eq!(third.1, Duration::ZERO);
    assert_eq!(stats_wait, Duration::ZERO);
    assert_eq!(stats.connection_state, ConnectionState::Connecting);
    assert_eq!(h.remote.connect_calls(), 1);
    assert_eq!(h.cache.stats().await.misses, 3);
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_invalidation_is_scoped_across_tiers() {
    let h = harness(CacheConfig::default());
    let ttl = Duration::from_secs(300);
    let bare_42 = h.cache.derive_key("42", &KeyParams::new()).expect("valid subject");
    let remote_42 = h.cache.derive_key("42", &days(30)).expect("valid subject");
    let fallback_42 = h.cache.derive_key("42", &days(7)).expect("valid subject");
    let remote_420 = h.cache.derive_key("420", &days(30)).expect("valid subject");
    let fallback_420 = h.cache.derive_key("420", &days(7)).expect("valid subject");

    h.cache.set(&bare_42, &forecast("42"), ttl).await.expect("set");
    h.cache.set(&remote_42, &forecast("42"), ttl).await.expect("set");
    h.cache.set(&remote_420, &forecast("420"), ttl).await.expect("set");

    h.remote.set_failing(true);
    h.cache.set(&fallback_42, &forecast("42"), ttl).await.expect("set");
    h.cache.set(&fallback_420, &forecast("420"), ttl).await.expect("set");
    h.remote.set_failing(false);

    let removed = h.cache.invalidate("42").await.expect("invalidate");
    assert_eq!(removed, 3);

    for key in [&bare_42, &remote_42, &fallback_42] {
        let read: Option<Forecast> = h.cache.get(key).await.expect("get");
        assert_eq!(read, None, "{} should be gone", key);
    }
    for key in [&remote_420, &fallback_420] {
        let read: Option<Forecast> = h.cache.get(key).await.expect("get");
        assert_eq!(read, Some(forecast("420")), "{} should survive", key);
    }
}

#[tokio::test]
async fn test_invalidation_treats_glob_characters_literally() {
    let h = harness(CacheConfig::default());
    let ttl = Duration::from_secs(300);
    let starred = h.cache.derive_key("a*", &days(7)).expect("valid subject");
    let plain = h.cache.derive_key("ab", &days(7)).expect("valid subject");

    h.cache.set(&starred, &forecast("a*"), ttl).await.expect("set");
    h.cache.set(&plain, &forecast("ab"), ttl).await.expect("set");

    assert_eq!(h.cache.invalidate("a*").await.expect("invalidate"), 1);
    assert!(h.remote.contains(plain.as_str()));
    assert!(!h.remote.contains(starred.as_str()));
}

#[tokio::test]
async fn test_invalidation_with_remote_down_clears_fallback() {
    let h = harness(CacheConfig::default());
    h.remote.set_reachable(false);
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    assert_eq!(h.cache.invalidate("42").await.expect("invalidate"), 1);
    assert_eq!(h.cache.invalidate("42").await.expect("invalidate"), 0);
}

// ============================================================================
// STATS
// ============================================================================

#[tokio::test]
async fn test_stats_report_remote_figures_and_counters() {
    let h = harness(CacheConfig::default());
    let hit = h.cache.derive_key("1", &days(7)).expect("valid subject");
    let miss = h.cache.derive_key("2", &days(7)).expect("valid subject");

    h.cache
        .set(&hit, &forecast("1"), Duration::from_secs(60))
        .await
        .expect("set");
    let _: Option<Forecast> = h.cache.get(&hit).await.expect("get");
    let _: Option<Forecast> = h.cache.get(&miss).await.expect("get");

    let stats = h.cache.stats().await;
    assert!(stats.remote_connected);
    assert_eq!(stats.connection_attempts, 0);
    assert_eq!(stats.remote_key_count, Some(1));
    assert!(stats.remote_memory_used.is_some());
    assert_eq!(stats.remote_hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.fallback_capacity, 100);
    assert!((stats.hit_rate() - 0.5).abs() < 0.001);
}

#[tokio::test]
async fn test_stats_without_remote() {
    let h = harness(CacheConfig::default());
    h.remote.set_reachable(false);

    let stats = h.cache.stats().await;
    assert!(!stats.remote_connected);
    assert_eq!(stats.remote_key_count, None);
    assert_eq!(stats.remote_memory_used, None);
    assert_eq!(stats.connection_attempts, 1);

    let json = serde_json::to_value(&stats).expect("stats serialize");
    assert_eq!(json["remote_connected"], false);
}

// ============================================================================
// SERIALIZATION
// ============================================================================

#[tokio::test]
async fn test_corrupt_remote_value_is_surfaced() {
    let h = harness(CacheConfig::default());
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    h.remote
        .insert_raw(key.as_str(), "{not json", Duration::from_secs(60));

    let result = h.cache.get::<Forecast>(&key).await;
    assert!(matches!(result, Err(CacheError::Serialization { .. })));
}

// ============================================================================
// READ-THROUGH
// ============================================================================

#[tokio::test]
async fn test_get_or_compute_computes_once_when_sequential() {
    let h = harness(CacheConfig::default());
    let source = CountingSource::new();
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    let ttl = h.cache.ttl_for(7);

    let first = h.cache.get_or_compute(&key, ttl, &source).await.expect("compute");
    let second = h.cache.get_or_compute(&key, ttl, &source).await.expect("cached");

    assert_eq!(first, second);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_get_or_compute_source_error_not_cached() {
    let h = harness(CacheConfig::default());
    let source = CountingSource {
        fail: true,
        ..CountingSource::new()
    };
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    let result = h
        .cache
        .get_or_compute(&key, Duration::from_secs(60), &source)
        .await;
    assert!(matches!(result, Err(CacheError::Source { .. })));
    assert!(h.remote.is_empty());
}

#[tokio::test]
async fn test_concurrent_misses_each_compute() {
    let h = harness(CacheConfig::default());
    let source = CountingSource {
        rendezvous: Some(Barrier::new(2)),
        ..CountingSource::new()
    };
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    let ttl = Duration::from_secs(60);

    let (a, b) = tokio::join!(
        h.cache.get_or_compute(&key, ttl, &source),
        h.cache.get_or_compute(&key, ttl, &source),
    );

    assert_eq!(a.expect("first"), b.expect("second"));
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_refresh_recomputes_over_cached_value() {
    let h = harness(CacheConfig::default());
    let source = CountingSource::new();
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    let ttl = Duration::from_secs(60);

    h.cache.set(&key, &forecast("stale"), ttl).await.expect("set");
    let fresh = h.cache.refresh(&key, ttl, &source).await.expect("refresh");

    assert_eq!(fresh, forecast(key.as_str()));
    assert_eq!(source.calls(), 1);
    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(fresh));
}

#[tokio::test]
async fn test_refresh_error_keeps_cached_value() {
    let h = harness(CacheConfig::default());
    let source = CountingSource {
        fail: true,
        ..CountingSource::new()
    };
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    let ttl = Duration::from_secs(60);

    h.cache.set(&key, &forecast("42"), ttl).await.expect("set");
    let result = h.cache.refresh(&key, ttl, &source).await;

    assert!(matches!(result, Err(CacheError::Source { .. })));
    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(forecast("42")));
}

// ============================================================================
// ADMINISTRATION
// ============================================================================

/// One key in the remote tier, one in the fallback tier, one outside the namespace.
async fn split_across_tiers(h: &Harness) -> (CacheKey, CacheKey) {
    let remote_key = h.cache.derive_key("42", &days(7)).expect("valid subject");
    let fallback_key = h.cache.derive_key("43", &days(7)).expect("valid subject");

    h.cache
        .set(&remote_key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    h.remote.set_failing(true);
    h.cache
        .set(&fallback_key, &forecast("43"), Duration::from_secs(30))
        .await
        .expect("set");
    h.remote.set_failing(false);
    h.remote.insert_raw("sessions:1", "{}", Duration::from_secs(60));

    (remote_key, fallback_key)
}

#[tokio::test]
async fn test_keys_lists_both_tiers_with_lifetimes() {
    let h = harness(CacheConfig::default());
    let (remote_key, fallback_key) = split_across_tiers(&h).await;
    h.clock.advance(Duration::from_secs(10));

    let mut expected = vec![
        KeyListing {
            key: remote_key.to_string(),
            tier: Tier::Remote,
            ttl_secs: Some(50),
        },
        KeyListing {
            key: fallback_key.to_string(),
            tier: Tier::Fallback,
            ttl_secs: Some(20),
        },
    ];
    expected.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(h.cache.keys().await, expected);
}

#[tokio::test]
async fn test_keys_with_remote_down_lists_fallback_only() {
    let h = harness(CacheConfig::default());
    let (_remote_key, fallback_key) = split_across_tiers(&h).await;
    h.remote.set_failing(true);

    let listing = h.cache.keys().await;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].key, fallback_key.as_str());
    assert_eq!(listing[0].tier, Tier::Fallback);
}

#[tokio::test]
async fn test_delete_removes_key_from_both_tiers() {
    let h = harness(CacheConfig::default());
    let (remote_key, fallback_key) = split_across_tiers(&h).await;

    assert_eq!(h.cache.delete(&remote_key).await, 1);
    assert_eq!(h.cache.delete(&fallback_key).await, 1);
    assert_eq!(h.cache.delete(&fallback_key).await, 0);

    let read: Option<Forecast> = h.cache.get(&remote_key).await.expect("get");
    assert_eq!(read, None);
    let read: Option<Forecast> = h.cache.get(&fallback_key).await.expect("get");
    assert_eq!(read, None);
}

#[tokio::test]
async fn test_clear_empties_namespace_only() {
    let h = harness(CacheConfig::default());
    let (remote_key, fallback_key) = split_across_tiers(&h).await;

    assert_eq!(h.cache.clear().await, 2);
    assert!(h.cache.keys().await.is_empty());
    assert!(!h.remote.contains(remote_key.as_str()));
    assert!(h.remote.contains("sessions:1"));

    let read: Option<Forecast> = h.cache.get(&fallback_key).await.expect("get");
    assert_eq!(read, None);
}

// ============================================================================
// FALLBACK-ONLY MODE
// ============================================================================

#[tokio::test]
async fn test_fallback_only_mode_never_contacts_remote() {
    let h = harness(CacheConfig::fallback_only());
    let key = h.cache.derive_key("42", &days(7)).expect("valid subject");

    h.cache
        .set(&key, &forecast("42"), Duration::from_secs(60))
        .await
        .expect("set");
    let read: Option<Forecast> = h.cache.get(&key).await.expect("get");
    assert_eq!(read, Some(forecast("42")));
    assert_eq!(h.cache.invalidate("42").await.expect("invalidate"), 1);

    let stats = h.cache.stats().await;
    assert_eq!(stats.connection_state, ConnectionState::Disabled);
    assert_eq!(h.remote.connect_calls(), 0);
    assert_eq!(h.remote.operation_calls(), 0);
}
