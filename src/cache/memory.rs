//! In-process LRU backend bounded by aggregate byte cost.
//!
//! The cache tracks the total cost of cached payloads and evicts
//! least-recently-used entries when the capacity is exceeded. Evicted
//! payloads stay alive for as long as a reader holds a clone.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::trace;

use super::{CacheBackend, CacheKey, CacheStats, KeyPredicate};
use crate::source::TilePayload;

/// Default cache capacity: 256MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 100_000;

struct Entry {
    payload: TilePayload,
    cost: usize,
}

struct State {
    lru: LruCache<CacheKey, Entry>,
    current_size: usize,
}

/// LRU payload store with size-based capacity.
///
/// # Thread Safety
///
/// The backend is thread-safe and can be shared across async tasks via `Arc`.
pub struct MemoryBackend {
    state: RwLock<State>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryBackend {
    /// Backend with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Backend holding at most `max_size` bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Backend bounded by both bytes and entry count.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: RwLock::new(State {
                lru: LruCache::new(entries),
                current_size: 0,
            }),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Check presence without updating LRU order.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state.read().await.lru.contains(key)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.lru.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.lru.is_empty()
    }

    /// Current aggregate cost in bytes.
    pub async fn size(&self) -> usize {
        self.state.read().await.current_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Option<TilePayload> {
        let mut state = self.state.write().await;
        match state.lru.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: CacheKey, value: TilePayload, cost: usize) {
        let mut state = self.state.write().await;

        if let Some(old) = state.lru.peek(&key) {
            state.current_size = state.current_size.saturating_sub(old.cost);
        }

        // Entry-count eviction happens inside `push`.
        if let Some((old_key, old)) = state.lru.push(key.clone(), Entry { payload: value, cost }) {
            if old_key != key {
                state.current_size = state.current_size.saturating_sub(old.cost);
            }
        }
        state.current_size += cost;

        while state.current_size > self.max_size {
            match state.lru.pop_lru() {
                Some((evicted, entry)) => {
                    trace!(source = %evicted.source, level = evicted.address.level, "evicting tile");
                    state.current_size = state.current_size.saturating_sub(entry.cost);
                }
                None => break,
            }
        }
    }

    async fn invalidate(&self, predicate: KeyPredicate<'_>) -> usize {
        let mut state = self.state.write().await;
        let doomed: Vec<CacheKey> = state
            .lru
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            if let Some(entry) = state.lru.pop(key) {
                state.current_size = state.current_size.saturating_sub(entry.cost);
            }
        }
        doomed.len()
    }

    async fn clear(&self) {
        let mut state = self.state.write().await;
        state.lru.clear();
        state.current_size = 0;
    }

    async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            entries: state.lru.len(),
            bytes: state.current_size,
            capacity: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{DType, PixelArray};
    use crate::cache::SourceFingerprint;
    use crate::source::{Encoding, OpenOptions, RenderParams, TileAddress};
    use bytes::Bytes;
    use std::sync::Arc;

    fn make_key(source: &str, level: u32, x: u32, y: u32) -> CacheKey {
        CacheKey::new(
            SourceFingerprint::for_label(source, &OpenOptions::default()),
            TileAddress::new(level, x, y),
            RenderParams::pixels(),
        )
    }

    fn make_tile(size: usize) -> TilePayload {
        TilePayload::Encoded {
            data: Bytes::from(vec![0u8; size]),
            encoding: Encoding::Png,
        }
    }

    async fn put(cache: &MemoryBackend, key: CacheKey, size: usize) {
        cache.set(key, make_tile(size), size).await;
    }

    #[tokio::test]
    async fn test_basic_get_set() {
        let cache = MemoryBackend::new();
        let key = make_key("slide", 0, 1, 2);
        assert!(cache.get(&key).await.is_none());

        let tile = TilePayload::Pixels(Arc::new(PixelArray::new(4, 4, 3, DType::Uint8)));
        cache.set(key.clone(), tile.clone(), tile.byte_cost()).await;
        assert_eq!(cache.get(&key).await, Some(tile));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes, 4 * 4 * 3 * 8);
    }

    #[tokio::test]
    async fn test_render_params_are_part_of_key() {
        let cache = MemoryBackend::new();
        let base = make_key("slide", 0, 0, 0);
        let mut banded = base.clone();
        banded.params = RenderParams::pixels().with_bands(vec![0]);

        put(&cache, base.clone(), 10).await;
        assert!(cache.contains(&base).await);
        assert!(!cache.contains(&banded).await);
    }

    #[tokio::test]
    async fn test_size_based_eviction() {
        let cache = MemoryBackend::with_capacity_and_entries(1000, 100);

        put(&cache, make_key("a", 0, 0, 0), 400).await;
        put(&cache, make_key("b", 0, 0, 0), 400).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.size().await, 800);

        put(&cache, make_key("c", 0, 0, 0), 400).await;

        assert!(cache.size().await <= 1000);
        assert!(!cache.contains(&make_key("a", 0, 0, 0)).await);
        assert!(cache.contains(&make_key("b", 0, 0, 0)).await);
        assert!(cache.contains(&make_key("c", 0, 0, 0)).await);
    }

    #[tokio::test]
    async fn test_entry_count_eviction_tracks_size() {
        let cache = MemoryBackend::with_capacity_and_entries(10_000, 2);
        put(&cache, make_key("a", 0, 0, 0), 100).await;
        put(&cache, make_key("b", 0, 0, 0), 200).await;
        put(&cache, make_key("c", 0, 0, 0), 300).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.size().await, 500);
    }

    #[tokio::test]
    async fn test_update_existing_entry() {
        let cache = MemoryBackend::with_capacity(10_000);
        let key = make_key("slide", 0, 0, 0);

        put(&cache, key.clone(), 1000).await;
        put(&cache, key.clone(), 500).await;
        assert_eq!(cache.size().await, 500);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_source() {
        let cache = MemoryBackend::with_capacity(10_000);
        put(&cache, make_key("a", 0, 0, 0), 100).await;
        put(&cache, make_key("a", 1, 0, 0), 100).await;
        put(&cache, make_key("b", 0, 0, 0), 100).await;

        let target = make_key("a", 0, 0, 0).source;
        let removed = cache.invalidate(&|k: &CacheKey| k.source == target).await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.size().await, 100);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = MemoryBackend::with_capacity(10_000);
        put(&cache, make_key("a", 0, 0, 0), 1000).await;
        put(&cache, make_key("b", 0, 0, 0), 2000).await;

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_evicted_payload_survives_for_holder() {
        let cache = MemoryBackend::with_capacity(150);
        let key = make_key("a", 0, 0, 0);
        put(&cache, key.clone(), 100).await;
        let held = cache.get(&key).await.unwrap();

        put(&cache, make_key("b", 0, 0, 0), 100).await;
        assert!(!cache.contains(&key).await);
        assert_eq!(held.byte_cost(), 100);
    }
}
