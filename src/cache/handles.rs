//! Bounded cache of open source handles.
//!
//! The cache provides:
//! - LRU retention of opened sources to avoid re-parsing metadata
//! - Singleflight opens, so concurrent requests for one source open it once
//! - Pinning: a handle held by a caller is never evicted or closed
//!
//! Eviction calls [`TileSource::close`] before the handle is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::SourceFingerprint;
use crate::error::FormatError;
use crate::source::TileSource;

/// Default number of open handles.
pub const DEFAULT_HANDLE_CAPACITY: usize = 16;

struct HandleEntry {
    fingerprint: SourceFingerprint,
    source: Arc<dyn TileSource>,
    pins: AtomicUsize,
}

/// A pinned, open source.
///
/// While any clone of a handle is alive the cache will not evict it.
pub struct SourceHandle {
    entry: Arc<HandleEntry>,
}

impl SourceHandle {
    fn pin(entry: Arc<HandleEntry>) -> Self {
        entry.pins.fetch_add(1, Ordering::SeqCst);
        Self { entry }
    }

    pub fn fingerprint(&self) -> &SourceFingerprint {
        &self.entry.fingerprint
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        &self.entry.source
    }
}

impl Clone for SourceHandle {
    fn clone(&self) -> Self {
        Self::pin(self.entry.clone())
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Deref for SourceHandle {
    type Target = dyn TileSource;

    fn deref(&self) -> &Self::Target {
        self.entry.source.as_ref()
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("fingerprint", &self.entry.fingerprint)
            .field("pins", &self.entry.pins.load(Ordering::SeqCst))
            .finish()
    }
}

/// State for an in-flight open.
struct InFlightOpen {
    notify: Notify,
    result: Mutex<Option<Result<Arc<HandleEntry>, FormatError>>>,
}

/// LRU cache of open sources, bounded by count.
pub struct SourceHandleCache {
    capacity: usize,
    entries: Mutex<LruCache<SourceFingerprint, Arc<HandleEntry>>>,
    in_flight: Mutex<HashMap<SourceFingerprint, Arc<InFlightOpen>>>,
}

impl SourceHandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(LruCache::unbounded()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the open handle for `fingerprint`, opening it with `open` if
    /// needed.
    pub async fn get_or_open<F, Fut>(
        &self,
        fingerprint: SourceFingerprint,
        open: F,
    ) -> Result<SourceHandle, FormatError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn TileSource>, FormatError>>,
    {
        // Fast path: check cache
        if let Some(handle) = self.pinned(&fingerprint).await {
            return Ok(handle);
        }

        let mut open = Some(open);
        loop {
            let state = {
                let mut in_flight = self.in_flight.lock().await;

                match in_flight.get(&fingerprint) {
                    Some(state) => state.clone(),
                    None => {
                        // We are the leader for this open.
                        let state = Arc::new(InFlightOpen {
                            notify: Notify::new(),
                            result: Mutex::new(None),
                        });
                        in_flight.insert(fingerprint.clone(), state.clone());
                        drop(in_flight);

                        let result = match open.take() {
                            Some(open) => open().await.map(|source| {
                                Arc::new(HandleEntry {
                                    fingerprint: fingerprint.clone(),
                                    source,
                                    pins: AtomicUsize::new(0),
                                })
                            }),
                            None => Err(FormatError::Store("open already attempted".into())),
                        };

                        // Pin before publishing so the entry cannot be
                        // evicted by our own insert.
                        let handle = result.as_ref().ok().map(|e| SourceHandle::pin(e.clone()));
                        if let Ok(entry) = &result {
                            self.insert(entry.clone()).await;
                        }
                        *state.result.lock().await = Some(result.clone());

                        self.in_flight.lock().await.remove(&fingerprint);
                        state.notify.notify_waiters();

                        return match (handle, result) {
                            (Some(handle), _) => Ok(handle),
                            (None, Err(e)) => Err(e),
                            (None, Ok(entry)) => Ok(SourceHandle::pin(entry)),
                        };
                    }
                }
            };

            // Register for the wakeup before checking the result, so a
            // leader finishing in between is not missed.
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = state.result.lock().await.clone();
            let finished = match finished {
                Some(result) => result,
                None => {
                    notified.await;
                    let woken = state.result.lock().await.clone();
                    match woken {
                        Some(result) => result,
                        None => continue,
                    }
                }
            };
            if let Err(e) = finished {
                return Err(e);
            }

            // The leader's entry may have been evicted and closed before we
            // woke; only a handle still in the cache is usable.
            if let Some(handle) = self.pinned(&fingerprint).await {
                return Ok(handle);
            }
            debug!(source = %fingerprint, "opened handle was evicted before use, reopening");
        }
    }

    /// Pin the cached handle for `fingerprint`, if any.
    ///
    /// Pinning happens under the entries lock so eviction cannot race it.
    async fn pinned(&self, fingerprint: &SourceFingerprint) -> Option<SourceHandle> {
        let mut entries = self.entries.lock().await;
        entries.get(fingerprint).map(|e| SourceHandle::pin(e.clone()))
    }

    async fn insert(&self, entry: Arc<HandleEntry>) {
        let evicted = {
            let mut entries = self.entries.lock().await;
            entries.put(entry.fingerprint.clone(), entry);

            let mut evicted = Vec::new();
            while entries.len() > self.capacity {
                // Oldest unpinned entry goes first.
                let victim = entries
                    .iter()
                    .rev()
                    .find(|(_, e)| e.pins.load(Ordering::SeqCst) == 0)
                    .map(|(k, _)| k.clone());
                match victim.and_then(|k| entries.pop(&k)) {
                    Some(e) => evicted.push(e),
                    None => {
                        debug!(open = entries.len(), "all source handles pinned, exceeding capacity");
                        break;
                    }
                }
            }
            evicted
        };

        for entry in evicted {
            debug!(source = %entry.fingerprint, "closing evicted source");
            entry.source.close().await;
        }
    }

    /// Close and drop one handle unless it is pinned.
    ///
    /// Returns `true` if the handle was removed.
    pub async fn remove(&self, fingerprint: &SourceFingerprint) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            match entries.peek(fingerprint) {
                Some(e) if e.pins.load(Ordering::SeqCst) == 0 => entries.pop(fingerprint),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                entry.source.close().await;
                true
            }
            None => false,
        }
    }

    /// Close and drop every unpinned handle.
    pub async fn clear(&self) {
        let drained: Vec<Arc<HandleEntry>> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<SourceFingerprint> = entries
                .iter()
                .filter(|(_, e)| e.pins.load(Ordering::SeqCst) == 0)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.pop(k)).collect()
        };
        for entry in drained {
            entry.source.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, fingerprint: &SourceFingerprint) -> bool {
        self.entries.lock().await.contains(fingerprint)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{DType, PixelArray};
    use crate::error::TileError;
    use crate::source::{OpenOptions, SourceMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::time::{sleep, Duration};

    struct MockSource {
        metadata: SourceMetadata,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TileSource for MockSource {
        fn metadata(&self) -> &SourceMetadata {
            &self.metadata
        }

        async fn read_tile(
            &self,
            _level: u32,
            _x: u32,
            _y: u32,
            _frame: usize,
        ) -> Result<PixelArray, TileError> {
            Ok(PixelArray::new(1, 1, 1, DType::Uint8))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn fp(name: &str) -> SourceFingerprint {
        SourceFingerprint::for_label(name, &OpenOptions::default())
    }

    fn mock(closed: &Arc<AtomicBool>) -> Arc<dyn TileSource> {
        Arc::new(MockSource {
            metadata: SourceMetadata::new(256, 256, 256, 256, 1, DType::Uint8),
            closed: closed.clone(),
        })
    }

    #[tokio::test]
    async fn test_caches_handles() {
        let cache = SourceHandleCache::new(4);
        let opens = AtomicUsize::new(0);
        let counter = &opens;
        let flag = Arc::new(AtomicBool::new(false));

        for _ in 0..3 {
            let flag = flag.clone();
            cache
                .get_or_open(fp("a"), || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(mock(&flag))
                })
                .await
                .unwrap();
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_closes_lru_handle() {
        let cache = SourceHandleCache::new(2);
        let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();

        for (i, flag) in flags.iter().enumerate() {
            let handle = cache
                .get_or_open(fp(&i.to_string()), || async { Ok(mock(flag)) })
                .await
                .unwrap();
            drop(handle);
        }

        assert_eq!(cache.len().await, 2);
        assert!(flags[0].load(Ordering::SeqCst));
        assert!(!flags[1].load(Ordering::SeqCst));
        assert!(!flags[2].load(Ordering::SeqCst));
        assert!(!cache.contains(&fp("0")).await);
    }

    #[tokio::test]
    async fn test_pinned_handles_are_not_evicted() {
        let cache = SourceHandleCache::new(1);
        let first_flag = Arc::new(AtomicBool::new(false));
        let second_flag = Arc::new(AtomicBool::new(false));

        let pinned = cache
            .get_or_open(fp("pinned"), || async { Ok(mock(&first_flag)) })
            .await
            .unwrap();
        let _other = cache
            .get_or_open(fp("other"), || async { Ok(mock(&second_flag)) })
            .await
            .unwrap();

        // Both pinned: capacity is exceeded rather than closing a live handle.
        assert_eq!(cache.len().await, 2);
        assert!(!first_flag.load(Ordering::SeqCst));

        assert!(!cache.remove(&fp("pinned")).await);
        drop(pinned);
        assert!(cache.remove(&fp("pinned")).await);
        assert!(first_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let cache = SourceHandleCache::new(2);
        let err = cache
            .get_or_open(fp("bad"), || async {
                Err(FormatError::NoReader {
                    path: "bad".into(),
                })
            })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_opens_singleflight() {
        let cache = Arc::new(SourceHandleCache::new(4));
        let opens = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let opens = opens.clone();
            let busy = busy.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_open(fp("slow"), || async move {
                        let was_busy = busy.swap(true, Ordering::SeqCst);
                        assert!(!was_busy, "Concurrent opens detected - singleflight failed!");
                        opens.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        busy.store(false, Ordering::SeqCst);
                        Ok(mock(&Arc::new(AtomicBool::new(false))))
                    })
                    .await
                    .map(|h| h.fingerprint().clone())
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), fp("slow"));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_reopens_handle_evicted_before_it_woke() {
        let cache = Arc::new(SourceHandleCache::new(1));
        let opens = Arc::new(AtomicUsize::new(0));
        let first_closed = Arc::new(AtomicBool::new(false));

        let leader = {
            let cache = cache.clone();
            let opens = opens.clone();
            let first_closed = first_closed.clone();
            tokio::spawn(async move {
                let handle = cache
                    .get_or_open(fp("a"), || async move {
                        opens.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(mock(&first_closed))
                    })
                    .await
                    .unwrap();
                drop(handle);
                // Evicts and closes "a" before the waiter runs again.
                cache
                    .get_or_open(fp("b"), || async { Ok(mock(&Arc::new(AtomicBool::new(false)))) })
                    .await
                    .unwrap();
            })
        };

        sleep(Duration::from_millis(10)).await;
        let reopened_closed = Arc::new(AtomicBool::new(false));
        let counter = opens.clone();
        let handle = cache
            .get_or_open(fp("a"), || async {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(mock(&reopened_closed))
            })
            .await
            .unwrap();
        leader.await.unwrap();

        assert!(first_closed.load(Ordering::SeqCst));
        assert!(!reopened_closed.load(Ordering::SeqCst));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(cache.contains(handle.fingerprint()).await);
    }
}
