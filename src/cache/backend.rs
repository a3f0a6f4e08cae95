//! Storage Backends
//!
//! A backend is a dumb key -> record store. Capacity accounting, expiry and
//! ordering live in the tier that owns it; a backend only has to keep bytes.
//!
//! - [`MemoryBackend`]: in-process `DashMap`, optionally byte-quota'd
//! - [`DirectoryBackend`]: one file per key, survives restarts
//!
//! Hosts plug their own key-value storage in by implementing
//! [`StorageBackend`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::entry::record_key;
use super::key::hash64;
use crate::error::{Error, Result};

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Read a record
    async fn read(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write (or replace) a record
    async fn write(&self, key: &str, record: Bytes) -> Result<()>;

    /// Remove a record, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// List stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove every record
    async fn clear(&self) -> Result<()>;

    /// Check that the backend is usable. Called once when a store opens.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Whether records survive a process restart
    fn is_persistent(&self) -> bool {
        false
    }

    /// Operation counters
    fn stats(&self) -> BackendStats;
}

/// Backend operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Records currently stored
    pub object_count: u64,
    /// Bytes currently stored
    pub total_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Counters {
    fn snapshot(&self, object_count: u64, total_bytes: u64) -> BackendStats {
        BackendStats {
            object_count,
            total_bytes,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// In-memory backend
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    storage: DashMap<String, Bytes>,
    /// Byte quota; writes past it fail with `QuotaExceeded`
    quota: Option<u64>,
    total_bytes: AtomicU64,
    counters: Counters,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: DashMap::new(),
            quota: None,
            total_bytes: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Memory backend that refuses writes past `quota` bytes
    pub fn with_quota(name: impl Into<String>, quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::new(name)
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|data| data.clone()))
    }

    async fn write(&self, key: &str, record: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let size = record.len() as u64;

        // The entry guard serializes writers of the same key
        let mut slot = self.storage.entry(key.to_string()).or_default();
        let old_size = slot.len() as u64;

        match self.quota {
            Some(quota) => {
                // Reserve before storing so concurrent writers cannot overshoot
                let reserved = self.total_bytes.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |current| {
                        let projected = current.saturating_sub(old_size) + size;
                        (projected <= quota).then_some(projected)
                    },
                );
                if let Err(current) = reserved {
                    let available = quota.saturating_sub(current.saturating_sub(old_size));
                    let was_empty = slot.is_empty();
                    drop(slot);
                    if was_empty {
                        self.storage.remove_if(key, |_, v| v.is_empty());
                    }
                    return Err(Error::QuotaExceeded {
                        tier: self.name.clone(),
                        needed: size,
                        available,
                    });
                }
            }
            None if size > old_size => {
                self.total_bytes.fetch_add(size - old_size, Ordering::AcqRel);
            }
            None => {
                self.total_bytes.fetch_sub(old_size - size, Ordering::AcqRel);
            }
        }

        *slot = record;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if let Some((_, data)) = self.storage.remove(key) {
            self.total_bytes
                .fetch_sub(data.len() as u64, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.storage.iter().map(|e| e.key().clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot(
            self.storage.len() as u64,
            self.total_bytes.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Directory Backend
// =============================================================================

const RECORD_EXTENSION: &str = "entry";

/// Longest hex-encoded key used verbatim as a file stem
const MAX_HEX_STEM: usize = 200;

/// Stem prefix of files named by key digest
const DIGEST_PREFIX: char = 'h';

/// File-per-key backend rooted at a directory
///
/// File names are the hex encoding of the key. Keys too long for that are
/// stored under a 64-bit digest of the key, and their real key is read back
/// from the record header.
#[derive(Debug)]
pub struct DirectoryBackend {
    name: String,
    root: PathBuf,
    counters: Counters,
}

impl DirectoryBackend {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            counters: Counters::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", file_stem_for(key), RECORD_EXTENSION))
    }
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, record: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);
        // Write-then-rename so readers never observe a torn record
        let tmp = path.with_extension("tmp");
        let written = match tokio::fs::write(&tmp, &record).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                debug!("Cannot remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = match decode_file_name(stem) {
                Some(key) => Some(key),
                None if is_digest_stem(stem) => match tokio::fs::read(&path).await {
                    Ok(record) => record_key(&record),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                },
                None => None,
            };
            match key {
                Some(key) if file_stem_for(&key) == stem => keys.push(key),
                _ => debug!("Ignoring foreign file {}", path.display()),
            }
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let unavailable = |e: std::io::Error| Error::TierUnavailable {
            tier: self.name.clone(),
            reason: format!("{}: {}", self.root.display(), e),
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(unavailable)?;
        let marker = self.root.join(".writable");
        tokio::fs::write(&marker, b"ok").await.map_err(unavailable)?;
        tokio::fs::remove_file(&marker).await.map_err(unavailable)?;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn stats(&self) -> BackendStats {
        // Object counts would need a directory scan; the owning tier has them
        self.counters.snapshot(0, 0)
    }
}

fn file_stem_for(key: &str) -> String {
    if key.len() * 2 <= MAX_HEX_STEM {
        encode_file_name(key)
    } else {
        format!("{}{:016x}", DIGEST_PREFIX, hash64(key.as_bytes()))
    }
}

fn is_digest_stem(stem: &str) -> bool {
    stem.len() == 17
        && stem.starts_with(DIGEST_PREFIX)
        && stem[1..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn encode_file_name(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_file_name(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_memory_backend_read_write() {
        let backend = MemoryBackend::new("memory");

        backend.write("a", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(backend.read("a").await.unwrap().unwrap().as_ref(), b"one");
        assert!(backend.read("missing").await.unwrap().is_none());

        backend.write("a", Bytes::from_static(b"three")).await.unwrap();
        let stats = backend.stats();
        assert_eq!(stats.object_count, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.writes, 2);
    }

    #[tokio::test]
    async fn test_memory_backend_remove_is_idempotent() {
        let backend = MemoryBackend::new("memory");
        backend.write("a", Bytes::from_static(b"x")).await.unwrap();

        assert!(backend.remove("a").await.unwrap());
        assert!(!backend.remove("a").await.unwrap());
        assert_eq!(backend.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_memory_backend_quota() {
        let backend = MemoryBackend::with_quota("session", 10);

        backend.write("a", Bytes::from(vec![0u8; 6])).await.unwrap();
        let err = backend.write("b", Bytes::from(vec![0u8; 6])).await.unwrap_err();
        assert_matches!(err, Error::QuotaExceeded { needed: 6, available: 4, .. });

        // Rejected key leaves no placeholder behind
        assert!(backend.read("b").await.unwrap().is_none());
        assert_eq!(backend.stats().object_count, 1);

        // Replacing within quota is fine
        backend.write("a", Bytes::from(vec![0u8; 10])).await.unwrap();
        assert_eq!(backend.stats().total_bytes, 10);
    }

    #[tokio::test]
    async fn test_memory_backend_clear() {
        let backend = MemoryBackend::new("memory");
        for i in 0..5 {
            backend
                .write(&format!("k{}", i), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }
        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
        assert_eq!(backend.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_directory_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("disk", dir.path().join("cache"));
        backend.probe().await.unwrap();

        let key = "spending:analyze:00ff/../weird key";
        backend.write(key, Bytes::from_static(b"record")).await.unwrap();
        assert_eq!(backend.read(key).await.unwrap().unwrap().as_ref(), b"record");
        assert_eq!(backend.keys().await.unwrap(), vec![key.to_string()]);

        assert!(backend.remove(key).await.unwrap());
        assert!(!backend.remove(key).await.unwrap());
        assert!(backend.read(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = DirectoryBackend::new("disk", dir.path());
            backend.probe().await.unwrap();
            backend.write("k", Bytes::from_static(b"v")).await.unwrap();
        }
        let reopened = DirectoryBackend::new("disk", dir.path());
        assert!(reopened.is_persistent());
        assert_eq!(reopened.read("k").await.unwrap().unwrap().as_ref(), b"v");
    }

    #[tokio::test]
    async fn test_directory_backend_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("zz.entry"), b"bad name").unwrap();

        let backend = DirectoryBackend::new("disk", dir.path());
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_backend_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let backend = DirectoryBackend::new("disk", &file);
        assert_matches!(backend.probe().await, Err(Error::TierUnavailable { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_backend_quota_holds_under_concurrent_writers() {
        let backend = std::sync::Arc::new(MemoryBackend::with_quota("session", 10));

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    backend
                        .write(&format!("k{}", i), Bytes::from(vec![0u8; 6]))
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut accepted = 0;
        for writer in writers {
            if writer.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        let stats = backend.stats();
        assert_eq!(stats.total_bytes, 6);
        assert_eq!(stats.object_count, 1);
    }

    #[tokio::test]
    async fn test_directory_backend_long_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("disk", dir.path());
        backend.probe().await.unwrap();

        let key = format!("household:7:shopping-list:{}", "x".repeat(200));
        let entry = crate::cache::entry::CacheEntry::new(
            key.as_str(),
            Bytes::from_static(b"1"),
            false,
            std::time::Duration::from_secs(60),
            Default::default(),
            Default::default(),
        )
        .unwrap();

        backend.write(&key, entry.record().clone()).await.unwrap();
        assert_eq!(
            backend.read(&key).await.unwrap().as_ref(),
            Some(entry.record())
        );
        assert_eq!(backend.keys().await.unwrap(), vec![key.clone()]);

        let name = backend.path_for(&key);
        assert!(name.file_name().unwrap().len() < 64);

        backend.clear().await.unwrap();
        assert!(backend.read(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_backend_skips_digest_files_for_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("h0123456789abcdef.entry"),
            b"{\"key\":\"short\"}\npayload",
        )
        .unwrap();

        let backend = DirectoryBackend::new("disk", dir.path());
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_backend_failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("disk", dir.path());
        backend.probe().await.unwrap();

        // A non-empty directory where the record should go makes the rename fail
        let path = backend.path_for("k");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), b"x").unwrap();

        assert!(backend.write("k", Bytes::from_static(b"v")).await.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_name_encoding() {
        let key = "user:42/profile";
        assert_eq!(decode_file_name(&encode_file_name(key)).as_deref(), Some(key));
        assert_eq!(decode_file_name("abc"), None);
        assert_eq!(decode_file_name("zz"), None);
    }
}
