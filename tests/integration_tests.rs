//! Hearthcache Integration Tests
//!
//! Exercises the public API end to end:
//! - Freshness, expiry and promotion across tiers
//! - Tag invalidation
//! - Eviction bounds
//! - Statistics
//! - Get-or-compute deduplication
//! - Tier degradation and warm start

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use hearthcache::cache::{BackendStats, MemoryBackend, StorageBackend};
use hearthcache::{CacheConfig, CacheManager, Capacity, Error, Result, TierConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
}

fn two_tiers() -> CacheConfig {
    CacheConfig::default().with_tiers(vec![
        TierConfig::memory("memory", Capacity::Items(100)),
        TierConfig::memory("session", Capacity::Bytes(1024 * 1024)),
    ])
}

// =============================================================================
// Freshness and Expiry
// =============================================================================

mod freshness_tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_entry_is_returned() {
        let cache = CacheManager::open(two_tiers()).await.unwrap();
        let value = json!({"items": [1, 2, 3], "total": 6});

        assert!(cache.set("k", &value, Duration::from_secs(60), &[]).await);
        assert_eq!(cache.get::<serde_json::Value>("k").await, Some(value));
    }

    #[tokio::test]
    async fn test_expired_entry_leaves_every_tier() {
        let cache = CacheManager::open(two_tiers()).await.unwrap();
        cache.set("k", &1u32, Duration::from_millis(40), &["t"]).await;

        let before = cache.stats();
        assert!(before.tier_sizes.iter().all(|t| t.entries == 1));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get::<u32>("k").await, None);

        let after = cache.stats();
        assert!(after.tier_sizes.iter().all(|t| t.entries == 0));
        assert_eq!(after.expirations, 1);
        assert_eq!(cache.invalidate_tag("t").await, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_unread_expired_entries() {
        let cache = CacheManager::open(two_tiers()).await.unwrap();
        for i in 0..5 {
            cache
                .set(&format!("short:{}", i), &i, Duration::from_millis(20), &[])
                .await;
        }
        cache.set("long", &1, Duration::from_secs(60), &[]).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.sweep_expired().await, 5);
        assert!(cache.has("long"));
        assert_eq!(cache.stats().tier_sizes[0].entries, 1);
    }

    #[tokio::test]
    async fn test_scheduled_sweep_removes_unread_entries() {
        let mut config = two_tiers();
        config.eviction.sweep_interval = "50ms".into();
        let cache = CacheManager::open(config).await.unwrap();

        cache.set("k", &1, Duration::from_millis(10), &["t"]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nobody read the key; the schedule removed it
        let stats = cache.stats();
        assert!(stats.tier_sizes.iter().all(|t| t.entries == 0));
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(cache.invalidate_tag("t").await, 0);
    }

    #[tokio::test]
    async fn test_user_profile_scenario() {
        let cache = CacheManager::in_memory().await.unwrap();
        let key = "user:42:profile";
        let profile = Profile { name: "A".into() };

        assert!(cache.set(key, &profile, Duration::from_millis(1000), &["user:42"]).await);
        assert_eq!(cache.get::<Profile>(key).await, Some(profile.clone()));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get::<Profile>(key).await, None);

        assert!(cache.set(key, &profile, Duration::from_millis(1000), &["user:42"]).await);
        assert_eq!(cache.invalidate_tag("user:42").await, 1);
        assert_eq!(cache.get::<Profile>(key).await, None);
    }
}

// =============================================================================
// Invalidation and Eviction
// =============================================================================

mod invalidation_tests {
    use super::*;

    #[tokio::test]
    async fn test_tag_invalidation_removes_only_tagged() {
        let cache = CacheManager::in_memory().await.unwrap();
        let ttl = Duration::from_secs(60);
        cache.set("A", &"a", ttl, &["x"]).await;
        cache.set("B", &"b", ttl, &["x", "y"]).await;
        cache.set("C", &"c", ttl, &["y"]).await;

        assert_eq!(cache.invalidate_tag("x").await, 2);
        assert!(!cache.has("A"));
        assert!(!cache.has("B"));
        assert!(cache.has("C"));
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest_below_soft_limit() {
        let config = CacheConfig::default().with_tiers(vec![TierConfig::memory(
            "memory",
            Capacity::Items(100),
        )
        .with_soft_threshold(0.8)]);
        let cache = CacheManager::open(config).await.unwrap();

        for i in 0..120 {
            cache
                .set(&format!("k{:03}", i), &i, Duration::from_secs(60), &[])
                .await;
        }

        let stats = cache.stats();
        let held = stats.tier_sizes[0].entries;
        assert!(held <= 80, "tier holds {} entries", held);
        assert!(stats.evictions >= 40);

        // Survivors are the most recently inserted keys
        let present: Vec<bool> = (0..120).map(|i| cache.has(&format!("k{:03}", i))).collect();
        let first = present.iter().position(|p| *p).unwrap();
        assert!(present[first..].iter().all(|p| *p));
        assert!(present[119]);
        assert!(!present[0]);
    }

    #[tokio::test]
    async fn test_oversized_entry_skips_small_tier() {
        let mut config = CacheConfig::default().with_tiers(vec![
            TierConfig::memory("small", Capacity::Bytes(256)),
            TierConfig::memory("large", Capacity::Bytes(1024 * 1024)),
        ]);
        config.compression.enabled = false;
        let cache = CacheManager::open(config).await.unwrap();

        let big = "x".repeat(4096);
        assert!(cache.set("big", &big, Duration::from_secs(60), &[]).await);

        let stats = cache.stats();
        assert_eq!(stats.tier_sizes[0].entries, 0);
        assert_eq!(stats.tier_sizes[1].entries, 1);
        assert_eq!(cache.get::<String>("big").await, Some(big));
    }
}

// =============================================================================
// Statistics and Compression
// =============================================================================

mod stats_tests {
    use super::*;

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = CacheManager::in_memory().await.unwrap();
        cache.set("k", &1, Duration::from_secs(60), &[]).await;

        for _ in 0..7 {
            assert!(cache.get::<i32>("k").await.is_some());
        }
        for _ in 0..3 {
            assert!(cache.get::<i32>("missing").await.is_none());
        }

        let stats = cache.stats();
        assert_eq!(stats.hits, 7);
        assert_eq!(stats.misses, 3);
        assert!((stats.hit_rate - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_compressed_value_round_trips() {
        let mut config = two_tiers();
        config.compression.min_size_bytes = 64;
        let cache = CacheManager::open(config).await.unwrap();

        let rows: Vec<Profile> = (0..200)
            .map(|i| Profile {
                name: format!("household member {}", i % 4),
            })
            .collect();
        cache.set("rows", &rows, Duration::from_secs(60), &[]).await;

        assert_eq!(cache.get::<Vec<Profile>>("rows").await, Some(rows));
        assert!(cache.stats().compression_bytes_saved > 0);
    }

    #[tokio::test]
    async fn test_prometheus_exposition() {
        let cache = CacheManager::in_memory().await.unwrap();
        cache.set("k", &1, Duration::from_secs(60), &[]).await;
        cache.get::<i32>("k").await;

        let text = cache.stats().to_prometheus().unwrap();
        assert!(text.contains("hearthcache_hits_total 1"));
        assert!(text.contains("tier=\"memory\""));
    }
}

// =============================================================================
// Get-or-compute
// =============================================================================

mod compute_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = Arc::new(CacheManager::in_memory().await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_compute(
                        "report",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>(Profile { name: "A".into() })
                        },
                        Duration::from_secs(60),
                        &["reports"],
                    )
                    .await
            }
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| r.as_ref().map(|p| p.name.as_str()) == Ok("A")));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 7);
        assert_eq!(stats.coalesced, 7);
    }

    #[tokio::test]
    async fn test_spawned_callers_share_one_computation() {
        let cache = Arc::new(CacheManager::in_memory().await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute(
                            "k",
                            || async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                Ok::<_, String>(42u64)
                            },
                            Duration::from_secs(60),
                            &[],
                        )
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_followers_retry_after_failed_leader() {
        let cache = Arc::new(CacheManager::in_memory().await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..3).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_compute(
                        "flaky",
                        || async move {
                            let n = calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            if n == 0 {
                                Err("first attempt failed".to_string())
                            } else {
                                Ok(n)
                            }
                        },
                        Duration::from_secs(60),
                        &[],
                    )
                    .await
            }
        });
        let results = futures::future::join_all(callers).await;

        // One failure surfaced, the retrying caller's value shared
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.has("flaky"));
    }
}

// =============================================================================
// Degradation and Warm Start
// =============================================================================

mod backend_tests {
    use super::*;

    /// Opens fine, rejects every write
    struct RejectingBackend;

    #[async_trait]
    impl StorageBackend for RejectingBackend {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn read(&self, _key: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }

        async fn write(&self, _key: &str, _record: Bytes) -> Result<()> {
            Err(Error::TierUnavailable {
                tier: "rejecting".into(),
                reason: "read-only".into(),
            })
        }

        async fn remove(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }

        fn stats(&self) -> BackendStats {
            BackendStats::default()
        }
    }

    /// Fails the startup check
    struct OfflineBackend;

    #[async_trait]
    impl StorageBackend for OfflineBackend {
        fn name(&self) -> &str {
            "offline"
        }

        async fn read(&self, _key: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }

        async fn write(&self, _key: &str, _record: Bytes) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }

        async fn probe(&self) -> Result<()> {
            Err(Error::TierUnavailable {
                tier: "offline".into(),
                reason: "storage disabled".into(),
            })
        }

        fn stats(&self) -> BackendStats {
            BackendStats::default()
        }
    }

    #[tokio::test]
    async fn test_failing_tier_is_skipped() {
        let backends: Vec<Arc<dyn StorageBackend>> = vec![
            Arc::new(RejectingBackend),
            Arc::new(MemoryBackend::new("session")),
        ];
        let cache = CacheManager::with_backends(two_tiers(), backends).await.unwrap();

        assert!(cache.set("k", &"v", Duration::from_secs(60), &[]).await);
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

        let stats = cache.stats();
        assert!(stats.write_failures >= 1);
        assert_eq!(stats.tier_sizes[0].entries, 0);
        assert_eq!(stats.tier_sizes[1].entries, 1);
    }

    #[tokio::test]
    async fn test_unavailable_tier_is_dropped_at_startup() {
        let backends: Vec<Arc<dyn StorageBackend>> = vec![
            Arc::new(OfflineBackend),
            Arc::new(MemoryBackend::new("session")),
        ];
        let cache = CacheManager::with_backends(two_tiers(), backends).await.unwrap();

        assert_eq!(cache.tier_names(), vec!["session"]);
        assert!(cache.set("k", &1, Duration::from_secs(60), &[]).await);
        assert_eq!(cache.get::<i32>("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_directory_tier_warm_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_tiers(vec![
            TierConfig::memory("memory", Capacity::Items(100)),
            TierConfig::directory("disk", dir.path().join("tier"), Capacity::Bytes(1024 * 1024)),
        ]);

        {
            let cache = CacheManager::open(config.clone()).await.unwrap();
            let profile = Profile { name: "A".into() };
            cache
                .set("user:42:profile", &profile, Duration::from_secs(60), &["user:42"])
                .await;
            cache.set("gone", &1, Duration::from_millis(10), &[]).await;
            cache.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let cache = CacheManager::open(config).await.unwrap();
        assert_eq!(
            cache.get::<Profile>("user:42:profile").await,
            Some(Profile { name: "A".into() })
        );
        assert!(!cache.has("gone"));
        assert_eq!(cache.invalidate_tag("user:42").await, 1);
    }

    #[tokio::test]
    async fn test_directory_tier_keeps_long_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_tiers(vec![TierConfig::directory(
            "disk",
            dir.path(),
            Capacity::Bytes(1024 * 1024),
        )]);
        let key = format!("household:7:shopping-list:{}", "x".repeat(180));
        assert!(key.len() > 200);

        {
            let cache = CacheManager::open(config.clone()).await.unwrap();
            assert!(cache.set(&key, &1, Duration::from_secs(60), &["household:7"]).await);
            assert_eq!(cache.stats().write_failures, 0);
            cache.shutdown().await;
        }

        let cache = CacheManager::open(config).await.unwrap();
        assert_eq!(cache.get::<i32>(&key).await, Some(1));
        assert_eq!(cache.invalidate_tag("household:7").await, 1);
        assert!(!cache.has(&key));
    }

    #[tokio::test]
    async fn test_snapshot_moves_entries_between_caches() {
        let source = CacheManager::in_memory().await.unwrap();
        source
            .set("a", &json!({"n": 1}), Duration::from_secs(60), &["x"])
            .await;
        source.set("b", &json!([1, 2]), Duration::from_secs(60), &[]).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        source.export().await.write_to_file(&path).await.unwrap();

        let target = CacheManager::in_memory().await.unwrap();
        let snapshot = hearthcache::CacheSnapshot::read_from_file(&path).await.unwrap();
        assert_eq!(target.import(snapshot).await, 2);
        assert_eq!(target.get::<serde_json::Value>("a").await, Some(json!({"n": 1})));
        assert_eq!(target.invalidate_tag("x").await, 1);
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_tests {
    use super::*;

    #[test]
    fn test_yaml_config_drives_tiers() {
        let yaml = r#"
tiers:
  - name: hot
    capacity: { items: 50 }
  - name: warm
    capacity: { bytes: 65536 }
    softThreshold: 0.5
defaultTtl: 90s
"#;
        let config = tokio_test::assert_ok!(CacheConfig::from_yaml_str(yaml));
        assert_eq!(config.default_ttl().unwrap(), Duration::from_secs(90));

        let names: BTreeSet<_> = config.tiers.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains("hot") && names.contains("warm"));

        let cache = tokio_test::block_on(CacheManager::open(config)).unwrap();
        assert_eq!(cache.tier_names(), vec!["hot", "warm"]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let yaml = "tiers:\n  - name: hot\n    capacity: { items: 0 }\n";
        tokio_test::assert_err!(CacheConfig::from_yaml_str(yaml));
    }
}
