//! Multi-Tier Response Cache
//!
//! Serialized responses are kept in an ordered list of tiers, fastest first.
//! Writes go to every tier that can take the entry; reads are served by the
//! fastest tier holding a live copy and promote it into the faster tiers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Manager                                  │
//! │   get / set / get_or_compute / invalidate_tags / export / import         │
//! ├───────────────┬──────────────────┬──────────────────┬────────────────────┤
//! │  Key Builder  │  Codec (LZ4)     │  Tag Index       │  Single Flight     │
//! ├───────────────┴──────────────────┴──────────────────┴────────────────────┤
//! │                             Tier Store                                   │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐        │
//! │  │ Tier 0 (memory)  │  │ Tier 1 (session) │  │ Tier 2 (disk)    │  ...   │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │        Eviction Manager (FIFO, soft threshold)  +  Expiry Sweeper        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - An expired entry is never returned
//! - Every operation on one key is serialized; distinct keys run concurrently
//! - Concurrent get-or-compute calls for one key run the computation once
//! - A tier that fails degrades to a miss or a skipped write, never an error

pub mod backend;
pub mod compression;
pub mod config;
pub mod entry;
pub mod eviction;
pub mod flight;
pub mod invalidation;
pub mod key;
pub mod locks;
mod manager;
pub mod metrics;
pub mod policy;
pub mod snapshot;
pub mod sweeper;
pub mod tier;

pub use backend::{BackendStats, DirectoryBackend, MemoryBackend, StorageBackend};
pub use compression::{Codec, CompressionConfig};
pub use config::{parse_duration, CacheConfig, EvictionConfig};
pub use entry::{CacheEntry, EntryMetadata};
pub use key::KeyBuilder;
pub use manager::CacheManager;
pub use metrics::{StatsSnapshot, TierUsage};
pub use policy::{Capacity, EvictionPolicy};
pub use snapshot::{CacheSnapshot, SnapshotEntry};
pub use tier::{BackendKind, TierConfig};
