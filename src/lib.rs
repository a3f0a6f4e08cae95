//! Hearthcache - Multi-Tier Response Cache
//!
//! Caches the serialized results of expensive operations (remote API calls,
//! model inferences, analytics) across an ordered list of storage tiers,
//! with TTL expiry, tag-based invalidation, LZ4 compression and
//! single-flight deduplication of concurrent computations.
//!
//! # Architecture
//!
//! ```text
//! caller → CacheManager → KeyBuilder → Codec → TierStore → StorageBackend
//!                 │                                ▲
//!                 └── Sweeper → EvictionManager ───┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hearthcache::CacheManager;
//!
//! # async fn run() -> hearthcache::Result<()> {
//! let cache = CacheManager::in_memory().await?;
//! let key = cache.key_for("spending", "analyze", &serde_json::json!({"month": "2026-03"}));
//!
//! let total: std::result::Result<f64, String> = cache
//!     .get_or_compute(&key, || async { Ok(1234.5) }, Duration::from_secs(300), &["household:7"])
//!     .await;
//! assert_eq!(total.unwrap(), 1234.5);
//!
//! cache.invalidate_tag("household:7").await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, eviction, invalidation and the cache manager
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheManager, CacheSnapshot, Capacity, StatsSnapshot, TierConfig};
pub use error::{Error, Result};
