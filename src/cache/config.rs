//! Cache Configuration
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration: a 1000-item memory tier in front of a 5 MiB session
//! tier.
//!
//! ```yaml
//! tiers:
//!   - name: memory
//!     capacity: { items: 1000 }
//!   - name: disk
//!     backend: { kind: directory, path: /var/cache/hearthcache }
//!     capacity: { bytes: 52428800 }
//!     softThreshold: 0.75
//! compression:
//!   minSizeBytes: 2048
//! eviction:
//!   sweepInterval: 30s
//! defaultTtl: 10m
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::compression::CompressionConfig;
use super::policy::{Capacity, EvictionPolicy};
use super::tier::{BackendKind, TierConfig};
use crate::error::{Error, Result};

/// Top-level cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Tiers, fastest first
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub eviction: EvictionConfig,

    /// TTL applied when a caller does not pick one (e.g. "5m")
    #[serde(default = "default_ttl")]
    pub default_ttl: String,

    /// Mixed into every generated key; change it to orphan old entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_salt: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            compression: CompressionConfig::default(),
            eviction: EvictionConfig::default(),
            default_ttl: default_ttl(),
            key_salt: None,
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::memory("memory", Capacity::Items(1000)),
        TierConfig::memory("session", Capacity::Bytes(5 * 1024 * 1024)),
    ]
}

fn default_ttl() -> String {
    "5m".to_string()
}

/// Eviction and sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionConfig {
    /// Fraction of a tier's entries removed at minimum per pass
    #[serde(default = "default_min_evict_fraction")]
    pub min_evict_fraction: f64,

    /// Interval of the expiry sweep (e.g. "60s")
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_evict_fraction: default_min_evict_fraction(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_min_evict_fraction() -> f64 {
    0.2
}

fn default_sweep_interval() -> String {
    "60s".to_string()
}

impl EvictionConfig {
    /// Parse into a runtime policy
    pub fn policy(&self) -> Result<EvictionPolicy> {
        Ok(EvictionPolicy {
            min_evict_fraction: self.min_evict_fraction,
            sweep_interval: parse_duration(&self.sweep_interval)?,
        })
    }
}

impl CacheConfig {
    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: CacheConfig = if raw.trim().is_empty() {
            CacheConfig::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the tier list
    pub fn with_tiers(mut self, tiers: Vec<TierConfig>) -> Self {
        self.tiers = tiers;
        self
    }

    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Result<Duration> {
        parse_duration(&self.default_ttl)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for tier in &self.tiers {
            if tier.name.trim().is_empty() {
                return Err(Error::Config("tier name must not be empty".into()));
            }
            if !names.insert(tier.name.as_str()) {
                return Err(Error::Config(format!("duplicate tier name {}", tier.name)));
            }
            if !(tier.soft_threshold > 0.0 && tier.soft_threshold <= 1.0) {
                return Err(Error::Config(format!(
                    "tier {}: softThreshold must be in (0, 1], got {}",
                    tier.name, tier.soft_threshold
                )));
            }
            if tier.capacity.limit() == 0 {
                return Err(Error::Config(format!(
                    "tier {}: capacity must be greater than zero",
                    tier.name
                )));
            }
            if tier.max_entry_bytes == Some(0) {
                return Err(Error::Config(format!(
                    "tier {}: maxEntryBytes must be greater than zero",
                    tier.name
                )));
            }
            if let BackendKind::Directory { path } = &tier.backend {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config(format!(
                        "tier {}: directory path must not be empty",
                        tier.name
                    )));
                }
            }
        }

        let fraction = self.eviction.min_evict_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::Config(format!(
                "minEvictFraction must be in [0, 1], got {}",
                fraction
            )));
        }
        if self.eviction.policy()?.sweep_interval.is_zero() {
            return Err(Error::Config("sweepInterval must be greater than zero".into()));
        }
        if self.default_ttl()?.is_zero() {
            return Err(Error::Config("defaultTtl must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h", "1d" or "1h30m".
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if chars.peek().is_some_and(|n| *n == 's' || *n == 'S') => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = num
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    // Handle case where string ends with a number (assume seconds)
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    Ok(Duration::from_millis(total_ms))
}

// =============================================================================
// Tests
// =============================================================================
