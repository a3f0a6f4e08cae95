//! Cache Statistics
//!
//! Lock-free counters plus a serializable snapshot. Observation only: nothing
//! here feeds back into cache behavior.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Statistics collector
#[derive(Debug, Default)]
pub struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    compression_bytes_saved: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
    write_failures: AtomicU64,
    corrupt_entries: AtomicU64,
    coalesced: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes_saved: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if bytes_saved > 0 {
            self.compression_bytes_saved
                .fetch_add(bytes_saved, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_entry(&self) {
        self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller was served by another caller's computation
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits(), self.misses())
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, tier_sizes: Vec<TierUsage>) -> StatsSnapshot {
        let hits = self.hits();
        let misses = self.misses();
        StatsSnapshot {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
            compression_bytes_saved: self.compression_bytes_saved.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            tier_sizes,
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.writes,
            &self.evictions,
            &self.compression_bytes_saved,
            &self.expirations,
            &self.promotions,
            &self.write_failures,
            &self.corrupt_entries,
            &self.coalesced,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Occupancy of one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierUsage {
    pub name: String,
    pub entries: u64,
    pub bytes: u64,
    /// Human-readable hard capacity, e.g. `1000 items`
    pub capacity: String,
}

/// Statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub compression_bytes_saved: u64,
    pub expirations: u64,
    pub promotions: u64,
    pub write_failures: u64,
    pub corrupt_entries: u64,
    pub coalesced: u64,
    pub tier_sizes: Vec<TierUsage>,
}

impl StatsSnapshot {
    /// Render as Prometheus text exposition
    pub fn to_prometheus(&self) -> Result<String> {
        let registry = Registry::new_custom(Some("hearthcache".to_string()), None)
            .map_err(metrics_error)?;

        let counters = [
            ("hits_total", "Lookups served from cache", self.hits),
            ("misses_total", "Lookups not served from cache", self.misses),
            ("writes_total", "Entries written", self.writes),
            ("evictions_total", "Entries evicted for capacity", self.evictions),
            ("expirations_total", "Entries removed after TTL", self.expirations),
            ("promotions_total", "Entries copied into faster tiers", self.promotions),
            ("write_failures_total", "Tier writes that failed", self.write_failures),
            ("corrupt_entries_total", "Stored records that failed validation", self.corrupt_entries),
            ("coalesced_total", "Callers served by a shared computation", self.coalesced),
            (
                "compression_bytes_saved_total",
                "Bytes saved by payload compression",
                self.compression_bytes_saved,
            ),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help).map_err(metrics_error)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(metrics_error)?;
        }

        let entries = IntGaugeVec::new(Opts::new("tier_entries", "Entries held per tier"), &["tier"])
            .map_err(metrics_error)?;
        let bytes = IntGaugeVec::new(Opts::new("tier_bytes", "Record bytes held per tier"), &["tier"])
            .map_err(metrics_error)?;
        for tier in &self.tier_sizes {
            entries
                .with_label_values(&[tier.name.as_str()])
                .set(tier.entries as i64);
            bytes
                .with_label_values(&[tier.name.as_str()])
                .set(tier.bytes as i64);
        }
        registry.register(Box::new(entries)).map_err(metrics_error)?;
        registry.register(Box::new(bytes)).map_err(metrics_error)?;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics encoding failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_with_no_lookups() {
        let stats = StatsCollector::new();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.snapshot(Vec::new()).hit_rate, 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = StatsCollector::new();
        for _ in 0..7 {
            stats.record_hit();
        }
        for _ in 0..3 {
            stats.record_miss();
        }
        assert!((stats.hit_rate() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_write_tracks_compression_savings() {
        let stats = StatsCollector::new();
        stats.record_write(0);
        stats.record_write(512);
        stats.record_write(128);

        let snapshot = stats.snapshot(Vec::new());
        assert_eq!(snapshot.writes, 3);
        assert_eq!(snapshot.compression_bytes_saved, 640);
    }

    #[test]
    fn test_reset() {
        let stats = StatsCollector::new();
        stats.record_hit();
        stats.record_eviction();
        stats.record_coalesced();
        stats.reset();

        let snapshot = stats.snapshot(Vec::new());
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.coalesced, 0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let stats = StatsCollector::new();
        stats.record_hit();
        let snapshot = stats.snapshot(vec![TierUsage {
            name: "memory".into(),
            entries: 1,
            bytes: 64,
            capacity: "1000 items".into(),
        }]);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["hitRate"], 1.0);
        assert_eq!(json["compressionBytesSaved"], 0);
        assert_eq!(json["tierSizes"][0]["name"], "memory");
    }

    #[test]
    fn test_prometheus_exposition() {
        let stats = StatsCollector::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        let snapshot = stats.snapshot(vec![TierUsage {
            name: "session".into(),
            entries: 4,
            bytes: 2048,
            capacity: "5242880 bytes".into(),
        }]);

        let text = snapshot.to_prometheus().unwrap();
        assert!(text.contains("hearthcache_hits_total 2"));
        assert!(text.contains("hearthcache_misses_total 1"));
        assert!(text.contains("hearthcache_tier_bytes{tier=\"session\"} 2048"));
    }
}
