//! Tier Store
//!
//! An ordered chain of tiers, fastest first. Each tier pairs a backend with an
//! in-memory index of what that backend holds (insertion time, expiry, size),
//! which drives capacity accounting and FIFO eviction without touching the
//! backend.
//!
//! # Degradation
//!
//! A tier whose backend fails its startup check is dropped. A skipped or
//! failed write only affects that tier. With no tiers left the store is an
//! always-miss store.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{DirectoryBackend, MemoryBackend, StorageBackend};
use super::entry::{now_millis, CacheEntry};
use super::metrics::{StatsCollector, TierUsage};
use super::policy::{Candidate, Capacity};

// =============================================================================
// Tier Configuration
// =============================================================================

/// Storage behind a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackendKind {
    /// In-process map
    Memory {
        /// Backend-level byte quota, independent of tier capacity
        #[serde(
            default,
            rename = "quotaBytes",
            skip_serializing_if = "Option::is_none"
        )]
        quota_bytes: Option<u64>,
    },
    /// One file per entry under `path`
    Directory { path: PathBuf },
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Memory { quota_bytes: None }
    }
}

/// Configuration of a single tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub name: String,
    #[serde(default)]
    pub backend: BackendKind,
    pub capacity: Capacity,
    /// Fraction of capacity above which post-write eviction runs
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,
    /// Larger records skip this tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entry_bytes: Option<u64>,
}

fn default_soft_threshold() -> f64 {
    0.8
}

impl TierConfig {
    /// In-memory tier
    pub fn memory(name: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::default(),
            capacity,
            soft_threshold: default_soft_threshold(),
            max_entry_bytes: None,
        }
    }

    /// Directory-backed tier
    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>, capacity: Capacity) -> Self {
        Self {
            backend: BackendKind::Directory { path: path.into() },
            ..Self::memory(name, capacity)
        }
    }

    pub fn with_soft_threshold(mut self, threshold: f64) -> Self {
        self.soft_threshold = threshold;
        self
    }

    pub fn with_max_entry_bytes(mut self, max: u64) -> Self {
        self.max_entry_bytes = Some(max);
        self
    }

    /// Construct the configured backend
    pub fn build_backend(&self) -> Arc<dyn StorageBackend> {
        match &self.backend {
            BackendKind::Memory { quota_bytes: None } => Arc::new(MemoryBackend::new(&self.name)),
            BackendKind::Memory {
                quota_bytes: Some(quota),
            } => Arc::new(MemoryBackend::with_quota(&self.name, *quota)),
            BackendKind::Directory { path } => {
                Arc::new(DirectoryBackend::new(&self.name, path.clone()))
            }
        }
    }
}

// =============================================================================
// Tier
// =============================================================================

/// What a tier's index knows about one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Insertion time (epoch millis)
    pub inserted_at: u64,
    /// Expiry time (epoch millis)
    pub expires_at: u64,
    /// Record size in bytes
    pub size: u64,
}

impl IndexEntry {
    fn of(entry: &CacheEntry) -> Self {
        Self {
            inserted_at: entry.inserted_at(),
            expires_at: entry.expires_at(),
            size: entry.size_bytes(),
        }
    }

    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct TierIndex {
    entries: HashMap<String, IndexEntry>,
    used_bytes: u64,
}

impl TierIndex {
    fn insert(&mut self, key: &str, entry: IndexEntry) {
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.used_bytes = self.used_bytes.saturating_sub(old.size);
        }
        self.used_bytes += entry.size;
    }

    fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let old = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(old.size);
        Some(old)
    }
}

/// One level of the store
pub struct Tier {
    config: TierConfig,
    backend: Arc<dyn StorageBackend>,
    index: Mutex<TierIndex>,
}

impl Tier {
    pub fn new(config: TierConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            config,
            backend,
            index: Mutex::new(TierIndex::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn capacity(&self) -> Capacity {
        self.config.capacity
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn indexed(&self, key: &str) -> Option<IndexEntry> {
        self.index.lock().entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.index.lock().used_bytes
    }

    /// Current usage in the capacity's unit
    pub fn usage(&self) -> u64 {
        let index = self.index.lock();
        self.config
            .capacity
            .usage(index.entries.len(), index.used_bytes)
    }

    /// Whether a record of `size` bytes may live here at all
    pub fn admits(&self, size: u64) -> bool {
        if self.config.max_entry_bytes.is_some_and(|max| size > max) {
            return false;
        }
        self.config.capacity.cost(size) <= self.config.capacity.limit()
    }

    /// Usage a write of `key` with `size` bytes would add
    pub fn incoming_usage(&self, key: &str, size: u64) -> u64 {
        let existing = self.index.lock().entries.get(key).map(|e| e.size);
        match (self.config.capacity, existing) {
            (Capacity::Items(_), Some(_)) => 0,
            (Capacity::Items(_), None) => 1,
            (Capacity::Bytes(_), Some(old)) => size.saturating_sub(old),
            (Capacity::Bytes(_), None) => size,
        }
    }

    /// Eviction candidates, in no particular order
    pub fn candidates(&self) -> Vec<Candidate> {
        self.index
            .lock()
            .entries
            .iter()
            .map(|(key, e)| Candidate {
                key: key.clone(),
                inserted_at: e.inserted_at,
                size: e.size,
            })
            .collect()
    }

    /// Keys whose TTL has elapsed at `now`
    pub fn expired_keys(&self, now: u64) -> Vec<String> {
        self.index
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.index.lock().entries.keys().cloned().collect()
    }

    pub fn usage_report(&self) -> TierUsage {
        let index = self.index.lock();
        TierUsage {
            name: self.config.name.clone(),
            entries: index.entries.len() as u64,
            bytes: index.used_bytes,
            capacity: self.config.capacity.to_string(),
        }
    }

    async fn write(&self, entry: &CacheEntry) -> crate::Result<()> {
        self.backend.write(entry.key(), entry.record().clone()).await?;
        self.index.lock().insert(entry.key(), IndexEntry::of(entry));
        Ok(())
    }

    /// Remove an indexed entry, returning whether the tier held it
    pub async fn remove(&self, key: &str) -> bool {
        if self.index.lock().remove(key).is_none() {
            return false;
        }
        self.remove_from_backend(key).await;
        true
    }

    /// Remove from the backend whether or not the index knows the key
    async fn purge(&self, key: &str) {
        self.index.lock().remove(key);
        self.remove_from_backend(key).await;
    }

    async fn remove_from_backend(&self, key: &str) {
        if let Err(e) = self.backend.remove(key).await {
            warn!("Failed to remove {} from tier {}: {}", key, self.name(), e);
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            warn!("Failed to clear tier {}: {}", self.name(), e);
        }
        *self.index.lock() = TierIndex::default();
    }

    /// Rebuild the index from what a persistent backend already holds.
    ///
    /// Returns the key and tags of every live record. Corrupt and expired
    /// records are deleted.
    async fn warm_load(&self, stats: &StatsCollector) -> Vec<(String, BTreeSet<String>)> {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cannot list tier {} for warm start: {}", self.name(), e);
                return Vec::new();
            }
        };

        let now = now_millis();
        let mut loaded = Vec::new();
        let mut dropped = 0usize;

        for key in keys {
            let record = match self.backend.read(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cannot read {} from tier {}: {}", key, self.name(), e);
                    continue;
                }
            };

            match CacheEntry::from_record(record) {
                Ok(entry) if entry.key() == key && !entry.is_expired_at(now) => {
                    self.index.lock().insert(&key, IndexEntry::of(&entry));
                    loaded.push((key, entry.tags().clone()));
                }
                Ok(entry) if entry.key() == key => {
                    dropped += 1;
                    stats.record_expiration();
                    self.remove_from_backend(&key).await;
                }
                Ok(entry) => {
                    warn!(
                        "Record for {} on tier {} names key {}, discarding",
                        key,
                        self.name(),
                        entry.key()
                    );
                    dropped += 1;
                    stats.record_corrupt_entry();
                    self.remove_from_backend(&key).await;
                }
                Err(e) => {
                    warn!("Discarding record {} on tier {}: {}", key, self.name(), e);
                    dropped += 1;
                    stats.record_corrupt_entry();
                    self.remove_from_backend(&key).await;
                }
            }
        }

        info!(
            "Tier {} warm start: {} entries loaded, {} discarded",
            self.name(),
            loaded.len(),
            dropped
        );
        loaded
    }
}

impl std::fmt::Debug for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tier")
            .field("name", &self.config.name)
            .field("backend", &self.backend.name())
            .field("capacity", &self.config.capacity)
            .field("entries", &self.len())
            .finish()
    }
}

// =============================================================================
// Tier Store
// =============================================================================

/// Result of probing the store for a key
#[derive(Debug)]
pub enum Lookup {
    /// Live entry found in tier `tier`
    Hit { entry: CacheEntry, tier: usize },
    /// Entry found past its TTL; it has been removed from every tier
    Expired,
    Miss,
}

/// Key and tags of an entry recovered during warm start
pub type WarmEntry = (String, BTreeSet<String>);

/// Ordered set of tiers, fastest first
pub struct TierStore {
    tiers: Vec<Tier>,
    stats: Arc<StatsCollector>,
}

impl TierStore {
    /// Probe every backend, keep the usable ones and warm-load persistent
    /// tiers.
    pub async fn open(
        tiers: Vec<(TierConfig, Arc<dyn StorageBackend>)>,
        stats: Arc<StatsCollector>,
    ) -> (Self, Vec<WarmEntry>) {
        let checks = join_all(tiers.iter().map(|(_, backend)| backend.probe())).await;

        let mut usable = Vec::with_capacity(tiers.len());
        for ((config, backend), check) in tiers.into_iter().zip(checks) {
            match check {
                Ok(()) => usable.push(Tier::new(config, backend)),
                Err(e) => warn!(
                    "Tier {} unavailable, continuing without it: {}",
                    config.name, e
                ),
            }
        }

        if usable.is_empty() {
            warn!("No cache tiers available, every lookup will miss");
        }

        let mut warm = Vec::new();
        for tier in &usable {
            if tier.backend.is_persistent() {
                warm.extend(tier.warm_load(&stats).await);
            }
        }

        (
            Self {
                tiers: usable,
                stats,
            },
            warm,
        )
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn tier(&self, idx: usize) -> Option<&Tier> {
        self.tiers.get(idx)
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Find the first live copy of `key`.
    ///
    /// Only tiers whose index knows the key are read. Corrupt records are
    /// deleted from their tier and the search continues; an expired entry is
    /// removed everywhere.
    pub async fn get(&self, key: &str) -> Lookup {
        let now = now_millis();

        for (idx, tier) in self.tiers.iter().enumerate() {
            let Some(indexed) = tier.indexed(key) else {
                continue;
            };
            if indexed.is_expired_at(now) {
                self.delete(key).await;
                return Lookup::Expired;
            }

            let record = match tier.backend.read(key).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!("Tier {} lost {}, dropping index entry", tier.name(), key);
                    tier.index.lock().remove(key);
                    continue;
                }
                Err(e) => {
                    warn!("Read of {} from tier {} failed: {}", key, tier.name(), e);
                    continue;
                }
            };

            match CacheEntry::from_record(record) {
                Ok(entry) if entry.key() == key => {
                    if entry.is_expired_at(now) {
                        self.delete(key).await;
                        return Lookup::Expired;
                    }
                    return Lookup::Hit { entry, tier: idx };
                }
                Ok(entry) => {
                    warn!(
                        "Tier {} returned record for {} when asked for {}",
                        tier.name(),
                        entry.key(),
                        key
                    );
                    self.stats.record_corrupt_entry();
                    tier.purge(key).await;
                }
                Err(e) => {
                    warn!("Corrupt record in tier {}: {}", tier.name(), e);
                    self.stats.record_corrupt_entry();
                    tier.purge(key).await;
                }
            }
        }

        Lookup::Miss
    }

    /// Write `entry` into one tier. On failure any older copy is dropped
    /// from that tier so it cannot be served stale.
    pub async fn write_tier(&self, idx: usize, entry: &CacheEntry) -> bool {
        let Some(tier) = self.tiers.get(idx) else {
            return false;
        };

        match tier.write(entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Write of {} to tier {} failed, skipping tier: {}",
                    entry.key(),
                    tier.name(),
                    e
                );
                self.stats.record_write_failure();
                tier.purge(entry.key()).await;
                false
            }
        }
    }

    /// Record that tier `idx` will not hold the new version of `key`
    pub async fn skip_tier(&self, idx: usize, key: &str) {
        if let Some(tier) = self.tiers.get(idx) {
            tier.remove(key).await;
        }
    }

    /// Remove `key` from every tier. Returns whether any tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in &self.tiers {
            removed |= tier.remove(key).await;
        }
        removed
    }

    /// Whether any tier holds `key`, live or not
    pub fn contains(&self, key: &str) -> bool {
        self.tiers.iter().any(|t| t.contains(key))
    }

    /// Whether any tier holds a live copy of `key` at `now`
    pub fn contains_live(&self, key: &str, now: u64) -> bool {
        self.tiers
            .iter()
            .any(|t| t.indexed(key).is_some_and(|e| !e.is_expired_at(now)))
    }

    /// Every key held by any tier
    pub fn keys(&self) -> BTreeSet<String> {
        self.tiers.iter().flat_map(|t| t.keys()).collect()
    }

    pub async fn clear(&self) {
        for tier in &self.tiers {
            tier.clear().await;
        }
    }

    pub fn usage(&self) -> Vec<TierUsage> {
        self.tiers.iter().map(|t| t.usage_report()).collect()
    }
}

impl std::fmt::Debug for TierStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierStore").field("tiers", &self.tiers).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
