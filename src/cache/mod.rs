//! Caching for tile payloads and open source handles.
//!
//! Two logically distinct caches live here:
//!
//! - [`TileCache`]: tile payloads keyed by `(source fingerprint, tile
//!   address, render parameters)`, stored in a pluggable [`CacheBackend`]
//!   and computed at most once per key by concurrent callers.
//! - [`SourceHandleCache`]: open [`TileSource`](crate::source::TileSource)
//!   handles, bounded by count, never evicting a handle that is in use.
//!
//! # Backends
//!
//! - [`MemoryBackend`]: in-process LRU bounded by aggregate byte cost
//! - [`MemcachedBackend`]: shared memcached servers over the text protocol;
//!   failures degrade to misses

mod handles;
mod key;
mod memcached;
mod memory;
mod tile_cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::source::TilePayload;

pub use handles::{SourceHandle, SourceHandleCache, DEFAULT_HANDLE_CAPACITY};
pub use key::{CacheKey, SourceFingerprint};
pub use memcached::{MemcachedBackend, MemcachedOptions};
pub use memory::{MemoryBackend, DEFAULT_TILE_CACHE_CAPACITY};
pub use tile_cache::TileCache;

/// Point-in-time counters of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of stored entries
    pub entries: usize,
    /// Aggregate byte cost of stored entries
    pub bytes: usize,
    /// Byte capacity (0 if unknown)
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Predicate used for selective invalidation.
pub type KeyPredicate<'a> = &'a (dyn Fn(&CacheKey) -> bool + Send + Sync);

/// Storage behind a [`TileCache`].
///
/// Backends never fail: an unreachable or misbehaving store reports misses
/// and drops writes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Look up a payload, marking it recently used.
    async fn get(&self, key: &CacheKey) -> Option<TilePayload>;

    /// Store a payload with its estimated byte cost.
    async fn set(&self, key: CacheKey, value: TilePayload, cost: usize);

    /// Drop every entry whose key matches; returns how many were removed.
    async fn invalidate(&self, predicate: KeyPredicate<'_>) -> usize;

    /// Drop everything.
    async fn clear(&self);

    async fn stats(&self) -> CacheStats;
}
