//! End-to-end cache scenarios across the memory and remote tiers.
//!
//! The remote tier is an in-process fake so these run without a Redis server.

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use strata::prelude::*;
use strata_cache::testing::{FlakyConnector, InMemoryRemote, ManualClock};
use strata_cache::{LayerKind, RemoteConfig, StoredEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    id: u32,
    name: String,
    price_cents: u64,
}

#[derive(Debug, thiserror::Error)]
enum RepoError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("database unavailable")]
    Unavailable,
}

impl NotFound for RepoError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn not_found(key: &str) -> Self {
        Self::NotFound(key.to_string())
    }
}

struct Harness {
    cache: CacheManager,
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemote>,
    connector: Arc<FlakyConnector>,
}

async fn layered(max_entries: usize, connector_failures: u32) -> Harness {
    let clock = ManualClock::shared(1_700_000_000_000);
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let connector = Arc::new(if connector_failures == 0 {
        FlakyConnector::healthy(remote.clone())
    } else {
        FlakyConnector::failing(remote.clone(), connector_failures)
    });

    let config = CacheConfig::default()
        .with_max_entries(max_entries)
        .with_layers(vec![LayerKind::Memory, LayerKind::Remote])
        .with_remote(RemoteConfig::default().with_breaker(5, Duration::from_secs(60)));
    let cache = CacheManager::builder(config)
        .clock(clock.clone())
        .remote_connector(connector.clone())
        .build()
        .expect("valid config");
    cache.open().await;

    Harness {
        cache,
        clock,
        remote,
        connector,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn widget() -> Product {
    Product {
        id: 42,
        name: "Widget".to_string(),
        price_cents: 1999,
    }
}

#[tokio::test]
async fn product_is_computed_once_and_invalidated_on_update() {
    let h = layered(100, 0).await;
    let loads = AtomicU32::new(0);
    let load = || async {
        loads.fetch_add(1, Ordering::SeqCst);
        Ok::<_, RepoError>(widget())
    };
    let opts = || {
        RememberOptions::default()
            .with_tag(EntityTag::record("product", 42))
            .with_tag(EntityTag::collection("product"))
    };

    let first = h
        .cache
        .remember("product:42", Duration::from_secs(300), load, opts())
        .await
        .unwrap();
    assert_eq!(first, widget());
    assert!(h.remote.contains("product:42"));

    let second = h
        .cache
        .remember("product:42", Duration::from_secs(300), load, opts())
        .await
        .unwrap();
    assert_eq!(second, widget());
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    let event = InvalidationEvent::update("product").with_record(42);
    assert_eq!(h.cache.invalidate_event(&event).await, 1);
    assert!(!h.remote.contains("product:42"));

    h.cache
        .remember("product:42", Duration::from_secs(300), load, opts())
        .await
        .unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    h.cache.close().await;
}

#[tokio::test]
async fn missing_category_is_negatively_cached() {
    let h = layered(100, 0).await;
    let lookups = AtomicU32::new(0);
    let load = || async {
        lookups.fetch_add(1, Ordering::SeqCst);
        Err::<Product, _>(RepoError::NotFound("category 7".to_string()))
    };
    let opts = RememberOptions::default()
        .with_tag(EntityTag::record("category", 7))
        .with_negative_ttl(Duration::from_secs(30));

    for _ in 0..3 {
        let err = h
            .cache
            .remember("cat:7", Duration::from_secs(60), load, opts.clone())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
    assert_eq!(lookups.load(Ordering::SeqCst), 1);
    assert_eq!(h.cache.lookup::<Product>("cat:7").await, Lookup::Negative);

    // The category gets created: the insert event clears the marker.
    let event = InvalidationEvent::insert("category").with_record(7);
    assert_eq!(h.cache.invalidate_event(&event).await, 1);
    assert_eq!(h.cache.lookup::<Product>("cat:7").await, Lookup::Miss);
    h.cache.close().await;
}

#[tokio::test]
async fn source_failures_are_not_cached() {
    let h = layered(100, 0).await;
    let calls = AtomicU32::new(0);
    for _ in 0..2 {
        let result = h
            .cache
            .remember(
                "product:1",
                Duration::from_secs(60),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Product, _>(RepoError::Unavailable)
                },
                RememberOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(RepoError::Unavailable)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    h.cache.close().await;
}

#[tokio::test]
async fn least_recently_used_entry_is_evicted() {
    let cache = CacheManager::builder(CacheConfig::memory_only().with_max_entries(2))
        .clock(ManualClock::shared(1_000))
        .build()
        .unwrap();
    let opts = CacheOptions::default();

    cache.set("a", &"A", &opts).await;
    cache.set("b", &"B", &opts).await;
    assert_eq!(cache.get::<String>("a").await.as_deref(), Some("A"));
    cache.set("c", &"C", &opts).await;

    assert_eq!(cache.get::<String>("a").await.as_deref(), Some("A"));
    assert_eq!(cache.get::<String>("b").await, None);
    assert_eq!(cache.get::<String>("c").await.as_deref(), Some("C"));
}

#[tokio::test]
async fn remote_hit_is_backfilled_and_counted_per_layer() {
    let h = layered(100, 0).await;
    let now = 1_700_000_000_000;
    let entry = StoredEntry::encode(&widget(), now, Duration::from_secs(120))
        .unwrap()
        .with_tags(["product:42"]);
    h.remote
        .insert_raw("product:42", entry.to_bytes().unwrap());

    assert_eq!(h.cache.get::<Product>("product:42").await, Some(widget()));
    let memory = h.cache.memory().clone();
    eventually(move || memory.contains("product:42")).await;
    assert_eq!(h.cache.get::<Product>("product:42").await, Some(widget()));

    let stats = h.cache.stats();
    assert_eq!(stats.layer_hits.get("memory"), Some(&1));
    assert_eq!(stats.layer_hits.get("remote"), Some(&1));
    assert_eq!(stats.misses, 0);

    // The backfilled copy keeps the original expiry.
    h.clock.advance(Duration::from_secs(120));
    assert_eq!(h.cache.get::<Product>("product:42").await, None);
    h.cache.close().await;
}

#[tokio::test]
async fn tag_invalidation_leaves_nothing_behind() {
    let h = layered(1_000, 0).await;
    for id in 0..50u32 {
        let opts = CacheOptions::ttl(Duration::from_secs(600))
            .with_tag(EntityTag::collection("order"))
            .with_tag(EntityTag::record("customer", id % 5));
        h.cache.set(&format!("order:{id}"), &id, &opts).await;
    }
    h.cache
        .set("customer:1", &1, &CacheOptions::default().with_tag("customer"))
        .await;

    assert_eq!(h.cache.invalidate_by_tags(&["customer:3"]).await, 10);
    assert_eq!(h.cache.invalidate_entity("order").await, 40);

    for id in 0..50u32 {
        assert!(!h.cache.exists(&format!("order:{id}")).await);
    }
    assert!(h.cache.exists("customer:1").await);
    assert!(h.cache.keys_for_tag("order").is_empty());
    assert!(h.cache.index_is_symmetric());
    assert_eq!(h.remote.len(), 1);
    h.cache.close().await;
}

#[tokio::test]
async fn invalidation_reaches_keys_evicted_from_memory() {
    let h = layered(3, 0).await;
    let opts =
        CacheOptions::ttl(Duration::from_secs(600)).with_tag(EntityTag::collection("product"));
    for id in 0..10u32 {
        h.cache.set(&format!("product:{id}"), &id, &opts).await;
    }
    h.cache
        .set("user:1", &1, &CacheOptions::default().with_tag("user"))
        .await;
    assert_eq!(h.cache.memory().entry_count(), 3);
    assert_eq!(h.remote.len(), 11);

    // Reading evicted keys backfills them and evicts others in turn.
    for id in [0u32, 4, 7] {
        assert_eq!(h.cache.get::<u32>(&format!("product:{id}")).await, Some(id));
    }
    assert_eq!(h.cache.keys_for_tag("product").len(), 10);

    assert_eq!(h.cache.invalidate_entity("product").await, 10);

    for id in 0..10u32 {
        let key = format!("product:{id}");
        assert_eq!(h.cache.get::<u32>(&key).await, None, "{key} survived");
        assert!(!h.remote.contains(&key));
    }
    assert!(h.cache.keys_for_tag("product").is_empty());
    assert!(h.cache.index_is_symmetric());
    assert_eq!(h.cache.memory().detached_count(), 1);
    assert_eq!(h.cache.get::<u32>("user:1").await, Some(1));
    h.cache.close().await;
}

#[tokio::test]
async fn expired_entries_are_absent_everywhere() {
    let h = layered(100, 0).await;
    h.cache
        .set("session:1", &"token", &CacheOptions::ttl(Duration::from_secs(30)))
        .await;

    h.clock.advance(Duration::from_secs(29));
    assert!(h.cache.exists("session:1").await);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.cache.get::<String>("session:1").await, None);
    assert!(!h.remote.contains("session:1"));
    assert_eq!(h.cache.sweep_expired(), 0);
    h.cache.close().await;
}

#[tokio::test]
async fn unreachable_remote_at_startup_recovers_after_breaker_timeout() {
    let h = layered(100, 1).await;
    let remote = h.cache.remote().expect("remote layer").clone();
    assert!(remote.is_open());

    // Degraded: writes land in memory only.
    assert!(h.cache.set("k", &1, &CacheOptions::default()).await);
    assert_eq!(h.cache.get::<i32>("k").await, Some(1));
    assert!(!h.remote.contains("k"));

    h.clock.advance(Duration::from_secs(60));
    h.cache.set("k", &2, &CacheOptions::default()).await;
    eventually(|| remote.is_connected()).await;
    assert_eq!(h.connector.attempts(), 2);

    assert!(h.cache.set("k", &3, &CacheOptions::default()).await);
    assert!(h.remote.contains("k"));
    h.cache.close().await;
}

#[tokio::test]
async fn keys_are_namespaced_and_versioned() {
    let h = layered(100, 0).await;
    let keys = h.cache.keys().clone();
    let key = keys.sub_key("product", 42, "reviews");
    assert_eq!(key.as_str(), "app:v1:product:42:reviews");

    h.cache
        .set(&key.as_str(), &vec!["great"], &CacheOptions::default())
        .await;
    h.cache
        .set(&keys.key("product", 43).as_str(), &1, &CacheOptions::default())
        .await;
    let removed = h
        .cache
        .invalidate_pattern(keys.kind_pattern("product").as_str())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    h.cache.close().await;
}
