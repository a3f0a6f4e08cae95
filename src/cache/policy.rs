//! Capacity and Eviction Policy
//!
//! Pure planning: given what a tier holds, decide which entries go. Victims
//! are chosen by insertion time (FIFO), not by access recency.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard capacity of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCapacity", into = "RawCapacity")]
pub enum Capacity {
    /// Maximum number of entries
    Items(u64),
    /// Maximum total record bytes
    Bytes(u64),
}

impl Capacity {
    /// Configured limit in this capacity's unit
    pub fn limit(&self) -> u64 {
        match *self {
            Capacity::Items(n) | Capacity::Bytes(n) => n,
        }
    }

    /// Usage of a tier holding `entries` records totalling `bytes`
    pub fn usage(&self, entries: usize, bytes: u64) -> u64 {
        match self {
            Capacity::Items(_) => entries as u64,
            Capacity::Bytes(_) => bytes,
        }
    }

    /// Cost of one record of `size` bytes
    pub fn cost(&self, size: u64) -> u64 {
        match self {
            Capacity::Items(_) => 1,
            Capacity::Bytes(_) => size,
        }
    }

    /// Usage level at which post-write eviction starts
    pub fn soft_limit(&self, threshold: f64) -> u64 {
        ((self.limit() as f64) * threshold).round() as u64
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Capacity::Items(_) => "items",
            Capacity::Bytes(_) => "bytes",
        }
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.limit(), self.unit())
    }
}

/// Wire form of [`Capacity`]: exactly one of `items` / `bytes`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCapacity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
}

impl TryFrom<RawCapacity> for Capacity {
    type Error = String;

    fn try_from(raw: RawCapacity) -> Result<Self, Self::Error> {
        match (raw.items, raw.bytes) {
            (Some(n), None) => Ok(Capacity::Items(n)),
            (None, Some(n)) => Ok(Capacity::Bytes(n)),
            (Some(_), Some(_)) => Err("capacity takes either items or bytes, not both".into()),
            (None, None) => Err("capacity needs items or bytes".into()),
        }
    }
}

impl From<Capacity> for RawCapacity {
    fn from(capacity: Capacity) -> Self {
        match capacity {
            Capacity::Items(n) => RawCapacity {
                items: Some(n),
                ..Default::default()
            },
            Capacity::Bytes(n) => RawCapacity {
                bytes: Some(n),
                ..Default::default()
            },
        }
    }
}

/// An entry that may be evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: String,
    /// Insertion time (epoch millis)
    pub inserted_at: u64,
    pub size: u64,
}

/// Stop condition for one eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionGoal {
    /// Usage must end at or below this
    pub target_usage: u64,
    /// Evict at least this many entries
    pub min_victims: usize,
}

impl EvictionGoal {
    #[inline]
    pub fn satisfied(&self, usage: u64, evicted: usize) -> bool {
        usage <= self.target_usage && evicted >= self.min_victims
    }
}

/// Eviction policy configuration
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Fraction of a tier's entries removed at minimum per soft pass
    pub min_evict_fraction: f64,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            min_evict_fraction: 0.2,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl EvictionPolicy {
    /// Goal for the post-write pass, `None` while under the soft threshold
    pub fn soft_goal(
        &self,
        capacity: Capacity,
        soft_threshold: f64,
        entries: usize,
        usage: u64,
    ) -> Option<EvictionGoal> {
        let target_usage = capacity.soft_limit(soft_threshold);
        if usage <= target_usage {
            return None;
        }
        let min_victims = ((entries as f64) * self.min_evict_fraction).ceil() as usize;
        Some(EvictionGoal {
            target_usage,
            min_victims: min_victims.min(entries),
        })
    }

    /// Goal for making room before a write that adds `incoming` usage,
    /// `None` when it already fits under hard capacity
    pub fn room_goal(&self, capacity: Capacity, usage: u64, incoming: u64) -> Option<EvictionGoal> {
        let limit = capacity.limit();
        if usage.saturating_add(incoming) <= limit {
            return None;
        }
        Some(EvictionGoal {
            target_usage: limit.saturating_sub(incoming),
            min_victims: 0,
        })
    }

    /// Walk candidates oldest first and pick victims until `goal` holds.
    ///
    /// `claim` is asked about each candidate in order; refused candidates are
    /// skipped for this pass. The goal may stay unmet when too many are
    /// refused.
    pub fn select_victims<F>(
        &self,
        mut candidates: Vec<Candidate>,
        capacity: Capacity,
        usage: u64,
        goal: EvictionGoal,
        mut claim: F,
    ) -> Vec<Candidate>
    where
        F: FnMut(&Candidate) -> bool,
    {
        candidates.sort_by(|a, b| {
            a.inserted_at
                .cmp(&b.inserted_at)
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut usage = usage;
        let mut victims = Vec::new();
        for candidate in candidates {
            if goal.satisfied(usage, victims.len()) {
                break;
            }
            if !claim(&candidate) {
                continue;
            }
            usage = usage.saturating_sub(capacity.cost(candidate.size));
            victims.push(candidate);
        }
        victims
    }
}

// =============================================================================
// Tests
// =============================================================================
