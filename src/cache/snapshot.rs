//! Cache Snapshots
//!
//! Portable JSON dump of live entries, used to carry a warm cache across a
//! restart or between hosts. TTLs are stored as time remaining at export.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entry::EntryMetadata;
use crate::error::Result;

/// One exported entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub value: Value,
    /// Milliseconds of TTL left when exported
    pub remaining_ttl_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: EntryMetadata,
}

/// Exported cache contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: BTreeMap<String, SnapshotEntry>,
}

impl CacheSnapshot {
    pub fn new() -> Self {
        Self {
            exported_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: SnapshotEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, self.to_json_pretty()?).await?;
        Ok(())
    }

    pub async fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
