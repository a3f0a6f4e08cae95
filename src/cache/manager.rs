//! Cache Manager
//!
//! The public face of the cache: typed get/set over the tier store, the
//! get-or-compute pattern with single flight, tag invalidation, statistics,
//! snapshots and the sweep schedule.
//!
//! Nothing on the read/write path returns an error. A tier that cannot
//! serve or accept an entry turns into a miss or a skipped write; only
//! construction can fail.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, instrument, warn};

use super::backend::StorageBackend;
use super::compression::{Codec, EncodedPayload};
use super::config::CacheConfig;
use super::entry::{now_millis, CacheEntry, EntryMetadata};
use super::eviction::EvictionManager;
use super::flight::{Flights, Role};
use super::invalidation::TagIndex;
use super::key::KeyBuilder;
use super::locks::{KeyGuard, KeyLocks};
use super::metrics::{StatsCollector, StatsSnapshot};
use super::snapshot::{CacheSnapshot, SnapshotEntry};
use super::sweeper::Sweeper;
use super::tier::{Lookup, TierStore};
use crate::error::{Error, Result};

/// State shared between the manager and its sweep task
struct CacheCore {
    store: Arc<TierStore>,
    tags: Arc<TagIndex>,
    locks: Arc<KeyLocks>,
    stats: Arc<StatsCollector>,
    eviction: EvictionManager,
    codec: Codec,
    flights: Flights,
    keys: KeyBuilder,
    default_ttl: Duration,
    /// Held shared by per-key work and sweeps, exclusively by `clear`
    gate: RwLock<()>,
}

impl CacheCore {
    /// Enter the store for work on `key`. Never nest: a queued `clear`
    /// blocks new shared holders.
    async fn enter(&self, key: &str) -> (RwLockReadGuard<'_, ()>, KeyGuard<'_>) {
        let gate = self.gate.read().await;
        let guard = self.locks.lock(key).await;
        (gate, guard)
    }

    async fn sweep_expired(&self) -> usize {
        let _gate = self.gate.read().await;
        self.eviction.sweep_expired().await
    }

    /// Find a live entry for `key`, optionally promoting it into faster tiers.
    /// Records no hit/miss statistics.
    async fn lookup_entry(&self, key: &str, promote: bool) -> Option<CacheEntry> {
        let _guard = self.enter(key).await;

        match self.store.get(key).await {
            Lookup::Hit { entry, tier } => {
                if promote && tier > 0 {
                    let written = self.eviction.place(&entry, 0..tier).await;
                    if !written.is_empty() {
                        self.stats.record_promotion();
                        debug!("Promoted {} from tier {} into {:?}", key, tier, written);
                    }
                }
                Some(entry)
            }
            Lookup::Expired => {
                self.stats.record_expiration();
                self.tags.unregister(key);
                None
            }
            Lookup::Miss => {
                if !self.store.contains(key) {
                    self.tags.unregister(key);
                }
                None
            }
        }
    }

    /// Typed lookup; a value that does not decode as `T` is a miss
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.lookup_entry(key, true).await?;
        match self.codec.decode(&entry.payload(), entry.is_compressed()) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Cached value for {} did not decode: {}", key, e);
                None
            }
        }
    }

    /// Write an encoded payload to every tier that takes it.
    ///
    /// The caller must have entered the store for `key`.
    async fn store_encoded(
        &self,
        key: &str,
        encoded: EncodedPayload,
        ttl: Duration,
        tags: BTreeSet<String>,
        metadata: EntryMetadata,
    ) -> bool {
        if ttl.is_zero() {
            debug!("Not caching {} with zero TTL", key);
            return false;
        }

        let bytes_saved = encoded.bytes_saved;
        let entry = match CacheEntry::new(
            key,
            encoded.bytes,
            encoded.compressed,
            ttl,
            tags,
            metadata,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot build record for {}: {}", key, e);
                return false;
            }
        };

        let written = self.eviction.place(&entry, 0..self.store.len()).await;
        if written.is_empty() {
            // Every tier dropped its older copy
            if !self.store.contains(key) {
                self.tags.unregister(key);
            }
            debug!("{} not cached: no tier accepted it", key);
            return false;
        }

        self.tags.register(key, entry.tags());
        self.stats.record_write(bytes_saved);
        true
    }
}

/// Multi-tier cache manager
pub struct CacheManager {
    core: Arc<CacheCore>,
    sweeper: Mutex<Option<Sweeper>>,
    shut_down: AtomicBool,
}

impl CacheManager {
    /// Open a cache with the backends named in `config`
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backends = config.tiers.iter().map(|t| t.build_backend()).collect();
        Self::assemble(config, backends).await
    }

    /// Open a cache over caller-supplied backends, one per configured tier
    pub async fn with_backends(
        config: CacheConfig,
        backends: Vec<Arc<dyn StorageBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        if backends.len() != config.tiers.len() {
            return Err(Error::Config(format!(
                "{} tiers configured but {} backends supplied",
                config.tiers.len(),
                backends.len()
            )));
        }
        Self::assemble(config, backends).await
    }

    /// Default configuration: in-memory tiers only
    pub async fn in_memory() -> Result<Self> {
        Self::open(CacheConfig::default()).await
    }

    async fn assemble(config: CacheConfig, backends: Vec<Arc<dyn StorageBackend>>) -> Result<Self> {
        let policy = config.eviction.policy()?;
        let default_ttl = config.default_ttl()?;
        let keys = match &config.key_salt {
            Some(salt) => KeyBuilder::new().with_salt(salt.clone()),
            None => KeyBuilder::new(),
        };

        let stats = Arc::new(StatsCollector::new());
        let tiers = config.tiers.iter().cloned().zip(backends).collect();
        let (store, warm) = TierStore::open(tiers, stats.clone()).await;
        let store = Arc::new(store);

        let tags = Arc::new(TagIndex::new());
        for (key, entry_tags) in &warm {
            tags.register(key, entry_tags);
        }

        let locks = Arc::new(KeyLocks::new());
        let eviction = EvictionManager::new(
            store.clone(),
            locks.clone(),
            tags.clone(),
            stats.clone(),
            policy,
        );

        // Warm data may not fit the current capacities
        for idx in 0..store.len() {
            eviction.enforce(idx).await;
        }

        let core = Arc::new(CacheCore {
            store,
            tags,
            locks,
            stats,
            eviction,
            codec: Codec::new(config.compression.clone()),
            flights: Flights::new(),
            keys,
            default_ttl,
            gate: RwLock::new(()),
        });

        info!(
            "Cache ready with tiers [{}], {} entries recovered",
            core.store
                .tiers()
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", "),
            warm.len()
        );

        let sweeper = start_sweeper(&core);
        Ok(Self {
            core,
            sweeper: Mutex::new(Some(sweeper)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Build a cache key for a logical request
    pub fn key_for<P: Serialize>(&self, service: &str, operation: &str, params: &P) -> String {
        self.core.keys.key_for(service, operation, params)
    }

    /// TTL configured as the default
    pub fn default_ttl(&self) -> Duration {
        self.core.default_ttl
    }

    /// Names of the tiers in service, fastest first
    pub fn tier_names(&self) -> Vec<String> {
        self.core
            .store
            .tiers()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    // =========================================================================
    // Reads and Writes
    // =========================================================================

    /// Cache `value` under `key`. Returns false when no tier accepted it.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: &[&str],
    ) -> bool {
        self.set_with_metadata(key, value, ttl, tags, EntryMetadata::default())
            .await
    }

    /// [`set`](Self::set) with provenance metadata attached to the entry
    #[instrument(skip(self, value, metadata))]
    pub async fn set_with_metadata<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: &[&str],
        metadata: EntryMetadata,
    ) -> bool {
        let encoded = match self.core.codec.encode(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Value for {} is not serializable, not caching: {}", key, e);
                return false;
            }
        };

        let _guard = self.core.enter(key).await;
        self.core
            .store_encoded(key, encoded, ttl, tag_set(tags), metadata)
            .await
    }

    /// Cached value for `key`, if live and decodable as `T`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.core.lookup(key).await;
        if value.is_some() {
            self.core.stats.record_hit();
        } else {
            self.core.stats.record_miss();
        }
        value
    }

    /// Whether a live entry exists. Touches no statistics.
    pub fn has(&self, key: &str) -> bool {
        self.core.store.contains_live(key, now_millis())
    }

    /// Remove `key` from every tier. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.core.enter(key).await;
        let removed = self.core.store.delete(key).await;
        self.core.tags.unregister(key);
        removed
    }

    // =========================================================================
    // Get-or-compute
    // =========================================================================

    /// Return the cached value or compute, cache and return it.
    ///
    /// Concurrent callers for the same key share one computation. A failed
    /// computation is returned verbatim and nothing is cached; callers that
    /// were waiting on it retry.
    #[instrument(skip(self, compute))]
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        tags: &[&str],
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let core = &self.core;
        loop {
            if let Some(value) = core.lookup::<T>(key).await {
                core.stats.record_hit();
                return Ok(value);
            }

            match core.flights.join(key) {
                Role::Leader(leader) => {
                    // The previous flight may have landed since the lookup
                    if let Some(value) = core.lookup::<T>(key).await {
                        core.stats.record_hit();
                        leader.abandon();
                        return Ok(value);
                    }

                    core.stats.record_miss();
                    let value = compute().await?;

                    match serde_json::to_vec(&value) {
                        Ok(serialized) => {
                            let serialized = Bytes::from(serialized);
                            let encoded = core.codec.compress(serialized.to_vec());
                            {
                                let _guard = core.enter(key).await;
                                core.store_encoded(
                                    key,
                                    encoded,
                                    ttl,
                                    tag_set(tags),
                                    EntryMetadata::default(),
                                )
                                .await;
                            }
                            leader.complete(serialized);
                        }
                        Err(e) => {
                            warn!("Computed value for {} is not serializable, not caching: {}", key, e);
                            leader.abandon();
                        }
                    }
                    return Ok(value);
                }
                Role::Follower(follower) => {
                    if let Some(serialized) = follower.wait().await {
                        match serde_json::from_slice::<T>(&serialized) {
                            Ok(value) => {
                                core.stats.record_hit();
                                core.stats.record_coalesced();
                                return Ok(value);
                            }
                            Err(e) => debug!("Shared result for {} did not decode: {}", key, e),
                        }
                    }
                    debug!("Flight for {} abandoned, retrying", key);
                }
            }
        }
    }

    /// Get-or-compute with `primary`; if that fails, return the result of
    /// `fallback` without caching it.
    pub async fn get_with_fallback<T, E, P, PFut, B, BFut>(
        &self,
        key: &str,
        primary: P,
        fallback: B,
        ttl: Duration,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        P: FnOnce() -> PFut,
        PFut: Future<Output = std::result::Result<T, E>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = std::result::Result<T, E>>,
    {
        match self.get_or_compute(key, primary, ttl, &[]).await {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!("Primary computation for {} failed, serving uncached fallback", key);
                fallback().await
            }
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove every entry tagged `tag`. Returns the number removed.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        self.invalidate_tags(&[tag]).await
    }

    /// Remove every entry carrying any of `tags`, each counted once
    #[instrument(skip(self))]
    pub async fn invalidate_tags(&self, tags: &[&str]) -> usize {
        let mut removed = 0;
        for key in self.core.tags.keys_for_any(tags) {
            let _guard = self.core.enter(&key).await;
            // Re-tagged since the index was read
            if !self
                .core
                .tags
                .tags_for(&key)
                .iter()
                .any(|t| tags.contains(&t.as_str()))
            {
                continue;
            }
            if self.core.store.delete(&key).await {
                removed += 1;
            }
            self.core.tags.unregister(&key);
        }

        if removed > 0 {
            info!("Invalidated {} entries for tags {:?}", removed, tags);
        }
        removed
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot(self.core.store.usage())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Export every live entry
    pub async fn export(&self) -> CacheSnapshot {
        let mut snapshot = CacheSnapshot::new();

        for key in self.core.store.keys() {
            let Some(entry) = self.core.lookup_entry(&key, false).await else {
                continue;
            };
            let remaining = entry.remaining_ttl_at(now_millis());
            if remaining.is_zero() {
                continue;
            }
            match self
                .core
                .codec
                .decode::<Value>(&entry.payload(), entry.is_compressed())
            {
                Ok(value) => snapshot.insert(
                    key,
                    SnapshotEntry {
                        value,
                        remaining_ttl_ms: remaining.as_millis() as u64,
                        tags: entry.tags().clone(),
                        metadata: entry.metadata().clone(),
                    },
                ),
                Err(e) => warn!("Skipping {} in export: {}", key, e),
            }
        }

        info!("Exported {} entries", snapshot.len());
        snapshot
    }

    /// Load a snapshot. TTLs keep running from the export time; entries with
    /// nothing left are skipped. Returns the number of entries cached.
    pub async fn import(&self, snapshot: CacheSnapshot) -> usize {
        let age_ms = (Utc::now() - snapshot.exported_at)
            .num_milliseconds()
            .max(0) as u64;

        let mut imported = 0;
        for (key, entry) in snapshot.entries {
            let remaining = entry.remaining_ttl_ms.saturating_sub(age_ms);
            if remaining == 0 {
                debug!("Skipping {} on import: no TTL left", key);
                continue;
            }
            let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
            if self
                .set_with_metadata(
                    &key,
                    &entry.value,
                    Duration::from_millis(remaining),
                    &tags,
                    entry.metadata,
                )
                .await
            {
                imported += 1;
            }
        }

        info!("Imported {} entries", imported);
        imported
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Remove everything from every tier and restart the sweep schedule
    ///
    /// Waits for in-progress key operations and sweeps to finish first.
    pub async fn clear(&self) {
        {
            let _gate = self.core.gate.write().await;
            self.core.store.clear().await;
            self.core.tags.clear();
        }

        let mut sweeper = self.sweeper.lock();
        if let Some(old) = sweeper.take() {
            old.cancel();
        }
        if !self.shut_down.load(Ordering::Acquire) {
            *sweeper = Some(start_sweeper(&self.core));
        }
        drop(sweeper);

        info!("Cache cleared");
    }

    /// Run an expiry sweep now. Returns the number of expired entries removed.
    pub async fn sweep_expired(&self) -> usize {
        self.core.sweep_expired().await
    }

    /// Stop the sweep schedule for good
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        info!("Cache shut down");
    }

    /// Whether the periodic sweep is scheduled
    pub fn is_sweep_scheduled(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.is_cancelled())
    }
}

fn start_sweeper(core: &Arc<CacheCore>) -> Sweeper {
    let weak = Arc::downgrade(core);
    Sweeper::spawn(core.eviction.policy().sweep_interval, move || {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(core) => core.sweep_expired().await,
                None => 0,
            }
        }
    })
}

fn tag_set(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("store", &self.core.store)
            .field("tags", &self.core.tags.tag_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
