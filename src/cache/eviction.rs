//! Eviction Manager
//!
//! Keeps tiers within capacity and clears out expired entries:
//!
//! - before a write that would exceed hard capacity, oldest entries make room
//! - after a write above the soft threshold, oldest entries go until usage is
//!   back under it
//! - a sweep removes every expired entry, then runs a soft pass on each tier
//!
//! Victims are taken with `try_lock`: an entry some other operation is
//! working on is skipped for this pass. That includes the key being written,
//! whose lock the writer already holds.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::entry::{now_millis, CacheEntry};
use super::invalidation::TagIndex;
use super::locks::{KeyGuard, KeyLocks};
use super::metrics::StatsCollector;
use super::policy::{EvictionGoal, EvictionPolicy};
use super::tier::TierStore;

/// Eviction and expiry sweeps over a [`TierStore`]
pub struct EvictionManager {
    store: Arc<TierStore>,
    locks: Arc<KeyLocks>,
    tags: Arc<TagIndex>,
    stats: Arc<StatsCollector>,
    policy: EvictionPolicy,
    sweeping: AtomicBool,
}

/// Resets the sweep flag however the sweep ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EvictionManager {
    pub fn new(
        store: Arc<TierStore>,
        locks: Arc<KeyLocks>,
        tags: Arc<TagIndex>,
        stats: Arc<StatsCollector>,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            store,
            locks,
            tags,
            stats,
            policy,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Write `entry` into each tier of `tiers` that can take it, making room
    /// first. Tiers that cannot take it drop any older copy.
    ///
    /// The caller must hold the entry's key lock. Returns the tiers written.
    pub async fn place(&self, entry: &CacheEntry, tiers: Range<usize>) -> Vec<usize> {
        let key = entry.key();
        let size = entry.size_bytes();
        let mut written = Vec::new();

        for idx in tiers {
            let Some(tier) = self.store.tier(idx) else {
                break;
            };

            if !tier.admits(size) {
                debug!("Entry {} ({} bytes) too large for tier {}", key, size, tier.name());
                self.store.skip_tier(idx, key).await;
                continue;
            }

            if !self.make_room(idx, key, size).await {
                debug!("No room for {} in tier {}, skipping", key, tier.name());
                self.store.skip_tier(idx, key).await;
                continue;
            }

            if self.store.write_tier(idx, entry).await {
                written.push(idx);
            }
        }

        for &idx in &written {
            self.enforce(idx).await;
        }
        written
    }

    /// Evict until a write of `key` with `size` bytes fits under hard
    /// capacity. Returns false when too many candidates were locked.
    pub async fn make_room(&self, idx: usize, key: &str, size: u64) -> bool {
        let Some(tier) = self.store.tier(idx) else {
            return false;
        };
        let capacity = tier.capacity();
        let incoming = tier.incoming_usage(key, size);
        let usage = tier.usage();

        let Some(goal) = self.policy.room_goal(capacity, usage, incoming) else {
            return true;
        };
        self.run_pass(idx, usage, goal).await;
        tier.usage().saturating_add(incoming) <= capacity.limit()
    }

    /// Soft pass on one tier. Returns the number of entries evicted.
    pub async fn enforce(&self, idx: usize) -> usize {
        let Some(tier) = self.store.tier(idx) else {
            return 0;
        };
        let usage = tier.usage();
        let Some(goal) = self.policy.soft_goal(
            tier.capacity(),
            tier.config().soft_threshold,
            tier.len(),
            usage,
        ) else {
            return 0;
        };
        self.run_pass(idx, usage, goal).await
    }

    async fn run_pass(&self, idx: usize, usage: u64, goal: EvictionGoal) -> usize {
        let Some(tier) = self.store.tier(idx) else {
            return 0;
        };

        let mut guards: HashMap<String, KeyGuard<'_>> = HashMap::new();
        let victims = self.policy.select_victims(
            tier.candidates(),
            tier.capacity(),
            usage,
            goal,
            |candidate| {
                let Some(guard) = self.locks.try_lock(&candidate.key) else {
                    return false;
                };
                // Replaced since the candidate list was taken
                let current = tier
                    .indexed(&candidate.key)
                    .is_some_and(|e| e.inserted_at == candidate.inserted_at);
                if current {
                    guards.insert(candidate.key.clone(), guard);
                }
                current
            },
        );

        let mut evicted = 0;
        for victim in victims {
            if tier.remove(&victim.key).await {
                evicted += 1;
                self.stats.record_eviction();
                if !self.store.contains(&victim.key) {
                    self.tags.unregister(&victim.key);
                }
            }
            guards.remove(&victim.key);
        }

        if evicted > 0 {
            debug!(
                "Evicted {} entries from tier {} ({} -> {} {})",
                evicted,
                tier.name(),
                usage,
                tier.usage(),
                tier.capacity().unit()
            );
        }
        evicted
    }

    /// Remove every expired entry from every tier, then run a soft pass on
    /// each tier.
    ///
    /// Returns the number of expired keys removed. A sweep already running
    /// elsewhere makes this a no-op returning 0.
    pub async fn sweep_expired(&self) -> usize {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sweep already in progress, skipping");
            return 0;
        }
        let _guard = SweepGuard(&self.sweeping);

        let now = now_millis();
        let mut removed = 0;

        for tier in self.store.tiers() {
            for key in tier.expired_keys(now) {
                let Some(_lock) = self.locks.try_lock(&key) else {
                    continue;
                };
                // Re-set since the scan
                if !tier.indexed(&key).is_some_and(|e| e.is_expired_at(now)) {
                    continue;
                }
                if self.store.delete(&key).await {
                    removed += 1;
                    self.stats.record_expiration();
                }
                self.tags.unregister(&key);
            }
        }

        let mut evicted = 0;
        for idx in 0..self.store.len() {
            evicted += self.enforce(idx).await;
        }

        debug!(
            "Sweep removed {} expired entries, evicted {}",
            removed, evicted
        );
        removed
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================
