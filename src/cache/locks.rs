//! Per-Key Locking
//!
//! Every operation that reads-then-writes a key (set, delete, lookup and
//! promote, lazy expiry, invalidation, eviction) runs under that key's async
//! mutex. Mutexes are created on demand and dropped with their last guard.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-key async mutexes
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self.mutex_for(key);
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Take `key` only if nobody holds it
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let mutex = self.mutex_for(key);
        let guard = match mutex.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        Some(KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        })
    }

    /// Number of live mutexes
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key, released on drop
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left: nobody holds or waits on it
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl std::fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}
