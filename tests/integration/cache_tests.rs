//! Cache effectiveness integration tests.
//!
//! Tests verify:
//! - Repeated tile requests are served from the tile cache
//! - Concurrent requests for one tile share a single read
//! - Concurrent opens of one file share a single open
//! - Evicted handles are closed and forgotten sources lose their tiles
//! - An unreachable memcached server degrades to cache misses

use std::time::Duration;

use tokio::task::JoinSet;

use large_image::config::{CacheBackendKind, CacheConfig};
use large_image::{CacheBackend, EngineContext, OpenOptions, RenderParams, TileAddress};

use super::test_utils::{counting_context, write_file};

// =============================================================================
// Tile Cache
// =============================================================================

#[tokio::test]
async fn test_repeated_tile_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.count", b"a");
    let (context, counters) = counting_context(4, Duration::ZERO);
    let source = context.open(&path, &OpenOptions::default()).await.unwrap();

    let address = TileAddress::new(2, 1, 1);
    let first = source.get_tile(address, &RenderParams::pixels()).await.unwrap();
    let second = source.get_tile(address, &RenderParams::pixels()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(counters.reads(), 1);

    let stats = context.tile_cache().stats().await;
    assert_eq!(stats.entries, 1);
    assert!(stats.hits >= 1);
}

#[tokio::test]
async fn test_concurrent_tile_requests_read_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.count", b"a");
    let (context, counters) = counting_context(4, Duration::from_millis(50));
    let source = context.open(&path, &OpenOptions::default()).await.unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let source = source.clone();
        tasks.spawn(async move {
            source
                .get_tile(TileAddress::new(2, 0, 0), &RenderParams::pixels())
                .await
        });
    }
    let mut results = Vec::new();
    while let Some(result) = tasks.join_next().await {
        results.push(result.unwrap().unwrap());
    }

    assert_eq!(counters.reads(), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_render_params_are_cached_separately() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.count", b"a");
    let (context, counters) = counting_context(4, Duration::ZERO);
    let source = context.open(&path, &OpenOptions::default()).await.unwrap();

    let address = TileAddress::new(2, 0, 0);
    source.get_tile(address, &RenderParams::pixels()).await.unwrap();
    let banded = source
        .get_tile(address, &RenderParams::pixels().with_bands(vec![2]))
        .await
        .unwrap();
    assert_eq!(banded.as_pixels().unwrap().bands(), 1);
    assert_eq!(context.tile_cache().stats().await.entries, 2);
    assert!(counters.reads() <= 2);
}

// =============================================================================
// Handle Cache
// =============================================================================

#[tokio::test]
async fn test_concurrent_opens_share_one_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.count", b"a");
    let (context, counters) = counting_context(4, Duration::from_millis(50));
    let context = std::sync::Arc::new(context);

    let mut tasks = JoinSet::new();
    for _ in 0..6 {
        let context = context.clone();
        let path = path.clone();
        tasks.spawn(async move { context.open(&path, &OpenOptions::default()).await.map(|_| ()) });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(counters.opens(), 1);
    assert_eq!(context.handle_cache().len().await, 1);
}

#[tokio::test]
async fn test_evicted_handle_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_file(dir.path(), "a.count", b"a");
    let b = write_file(dir.path(), "b.count", b"b");
    let (context, counters) = counting_context(1, Duration::ZERO);

    let first = context.open(&a, &OpenOptions::default()).await.unwrap();
    drop(first);
    let second = context.open(&b, &OpenOptions::default()).await.unwrap();

    assert_eq!(counters.opens(), 2);
    assert_eq!(counters.closes(), 1);
    assert_eq!(context.handle_cache().len().await, 1);

    // Reopening the evicted file opens it again.
    drop(second);
    context.open(&a, &OpenOptions::default()).await.unwrap();
    assert_eq!(counters.opens(), 3);
}

#[tokio::test]
async fn test_changed_file_is_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.count", b"a");
    let (context, counters) = counting_context(4, Duration::ZERO);

    let before = context.open(&path, &OpenOptions::default()).await.unwrap();
    write_file(dir.path(), "a.count", b"a longer body");
    let after = context.open(&path, &OpenOptions::default()).await.unwrap();

    assert_ne!(before.fingerprint(), after.fingerprint());
    assert_eq!(counters.opens(), 2);
}

#[tokio::test]
async fn test_forget_drops_tiles_and_keeps_pinned_handle() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.count", b"a");
    let (context, counters) = counting_context(4, Duration::ZERO);

    let source = context.open(&path, &OpenOptions::default()).await.unwrap();
    for x in 0..3 {
        source
            .get_tile(TileAddress::new(2, x, 0), &RenderParams::pixels())
            .await
            .unwrap();
    }
    let fingerprint = source.fingerprint().clone();
    let pinned = source.clone();
    assert_eq!(context.forget(pinned).await, 3);
    assert_eq!(counters.closes(), 0);
    assert!(context.handle_cache().contains(&fingerprint).await);

    drop(source);
    assert!(context.handle_cache().remove(&fingerprint).await);
    assert_eq!(counters.closes(), 1);
    assert_eq!(context.tile_cache().stats().await.entries, 0);
}

// =============================================================================
// Memcached Backend
// =============================================================================

#[tokio::test]
async fn test_unreachable_memcached_degrades_to_misses() {
    let context = EngineContext::new(CacheConfig {
        cache_backend: CacheBackendKind::Memcached,
        cache_memcached_url: "127.0.0.1:1".to_string(),
        ..Default::default()
    });
    assert_eq!(context.tile_cache().backend().name(), "memcached");

    let source = context
        .open("synthetic:size=512", &OpenOptions::default())
        .await
        .unwrap();
    let address = TileAddress::new(1, 1, 1);
    let first = source.get_tile(address, &RenderParams::pixels()).await.unwrap();
    let second = source.get_tile(address, &RenderParams::pixels()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.as_pixels().unwrap().width(), 256);
}
