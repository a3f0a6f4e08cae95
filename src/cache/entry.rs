//! Cache Entry Types
//!
//! An entry is held as a single self-describing record: a JSON header line
//! followed by the raw payload. Every tier stores the same bytes, so
//! promotion between tiers is a refcount bump on [`Bytes`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::key::fx_hash;
use crate::error::{Error, Result};

/// Record format version written into every header
pub const RECORD_VERSION: u8 = 1;

/// Current wall-clock time in epoch milliseconds
#[inline]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Key named in a stored record's header. The payload is not verified.
pub fn record_key(record: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct KeyOnly {
        key: String,
    }

    let newline = record.iter().position(|&b| b == b'\n')?;
    serde_json::from_slice::<KeyOnly>(&record[..newline])
        .ok()
        .map(|header| header.key)
}

/// Provenance attached to an entry. Stored, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Originating service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Originating operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Owning session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Free-form attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl EntryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Header line of a stored record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordHeader {
    version: u8,
    key: String,
    inserted_at: u64,
    ttl_ms: u64,
    compressed: bool,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    metadata: EntryMetadata,
    payload_len: u64,
    content_hash: u64,
}

/// Cache entry: header fields plus the encoded record they came from
#[derive(Clone)]
pub struct CacheEntry {
    header: RecordHeader,
    /// Full record (header line + payload)
    record: Bytes,
    /// Offset of the payload within `record`
    payload_offset: usize,
}

impl CacheEntry {
    /// Create a new entry inserted now
    pub fn new(
        key: impl Into<String>,
        payload: Bytes,
        compressed: bool,
        ttl: Duration,
        tags: BTreeSet<String>,
        metadata: EntryMetadata,
    ) -> Result<Self> {
        Self::new_at(key, payload, compressed, ttl, tags, metadata, now_millis())
    }

    /// Create an entry with an explicit insertion time (epoch millis)
    pub fn new_at(
        key: impl Into<String>,
        payload: Bytes,
        compressed: bool,
        ttl: Duration,
        tags: BTreeSet<String>,
        metadata: EntryMetadata,
        inserted_at: u64,
    ) -> Result<Self> {
        let header = RecordHeader {
            version: RECORD_VERSION,
            key: key.into(),
            inserted_at,
            ttl_ms: ttl_to_millis(ttl),
            compressed,
            tags,
            metadata,
            payload_len: payload.len() as u64,
            content_hash: fx_hash(&payload),
        };

        let mut buf = serde_json::to_vec(&header)?;
        buf.push(b'\n');
        let payload_offset = buf.len();
        buf.extend_from_slice(&payload);

        Ok(Self {
            header,
            record: Bytes::from(buf),
            payload_offset,
        })
    }

    /// Parse and verify a stored record
    pub fn from_record(record: Bytes) -> Result<Self> {
        let newline = record
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::corrupt("<unknown>", "missing header terminator"))?;

        let header: RecordHeader = serde_json::from_slice(&record[..newline])
            .map_err(|e| Error::corrupt("<unknown>", format!("unreadable header: {}", e)))?;

        if header.version != RECORD_VERSION {
            return Err(Error::corrupt(
                header.key,
                format!("unsupported record version {}", header.version),
            ));
        }

        let payload_offset = newline + 1;
        let payload = &record[payload_offset..];
        if payload.len() as u64 != header.payload_len {
            return Err(Error::corrupt(
                header.key,
                format!(
                    "payload length {} does not match header {}",
                    payload.len(),
                    header.payload_len
                ),
            ));
        }
        if fx_hash(payload) != header.content_hash {
            return Err(Error::corrupt(header.key, "content hash mismatch"));
        }

        Ok(Self {
            header,
            record,
            payload_offset,
        })
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.header.key
    }

    /// Payload bytes (zero-copy slice of the record)
    #[inline]
    pub fn payload(&self) -> Bytes {
        self.record.slice(self.payload_offset..)
    }

    /// Encoded record as stored by backends
    #[inline]
    pub fn record(&self) -> &Bytes {
        &self.record
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.header.compressed
    }

    /// Insertion time (epoch millis)
    #[inline]
    pub fn inserted_at(&self) -> u64 {
        self.header.inserted_at
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.header.ttl_ms)
    }

    /// Expiry time (epoch millis)
    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.header.inserted_at.saturating_add(self.header.ttl_ms)
    }

    /// Serialized size used for capacity accounting
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.record.len() as u64
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.header.tags
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.header.metadata
    }

    #[inline]
    pub fn content_hash(&self) -> u64 {
        self.header.content_hash
    }

    /// Live iff `now - inserted_at < ttl`
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now.saturating_sub(self.header.inserted_at) >= self.header.ttl_ms
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Time left before expiry, zero once expired
    pub fn remaining_ttl_at(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at().saturating_sub(now))
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.header.key)
            .field("size", &self.size_bytes())
            .field("compressed", &self.header.compressed)
            .field("tags", &self.header.tags)
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

/// Sub-millisecond TTLs round up so they are not born expired
fn ttl_to_millis(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    if ms == 0 && !ttl.is_zero() {
        1
    } else {
        ms
    }
}

// =============================================================================
// Tests
// =============================================================================
