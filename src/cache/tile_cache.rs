//! Singleflight tile cache over a [`CacheBackend`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use super::{CacheBackend, CacheKey, CacheStats, MemoryBackend, SourceFingerprint};
use crate::error::TileError;
use crate::source::TilePayload;

/// Tile payload cache with at-most-one computation per key.
///
/// Concurrent callers for the same key share a single in-flight computation;
/// later callers are served from the backend. Failed computations are not
/// cached, so the next caller retries.
pub struct TileCache {
    backend: Arc<dyn CacheBackend>,
    in_flight: Mutex<HashMap<CacheKey, Arc<OnceCell<TilePayload>>>>,
}

impl TileCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory cache bounded to `max_bytes`.
    pub fn memory(max_bytes: usize) -> Self {
        Self::new(Arc::new(MemoryBackend::with_capacity(max_bytes)))
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub async fn get(&self, key: &CacheKey) -> Option<TilePayload> {
        self.backend.get(key).await
    }

    /// Store or overwrite a payload.
    pub async fn set(&self, key: CacheKey, value: TilePayload) {
        let cost = value.byte_cost();
        self.backend.set(key, value, cost).await;
    }

    /// Return the cached payload or compute, store and return it.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<TilePayload, TileError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TilePayload, TileError>>,
    {
        if let Some(hit) = self.backend.get(&key).await {
            return Ok(hit);
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let backend = &self.backend;
        let key_ref = &key;
        let result = cell
            .get_or_try_init(|| async move {
                // A flight that finished between our miss and joining may
                // already have stored the value.
                if let Some(hit) = backend.get(key_ref).await {
                    return Ok(hit);
                }
                debug!(
                    source = %key_ref.source,
                    level = key_ref.address.level,
                    x = key_ref.address.x,
                    y = key_ref.address.y,
                    frame = key_ref.address.frame,
                    "computing tile"
                );
                let value = compute().await?;
                backend
                    .set(key_ref.clone(), value.clone(), value.byte_cost())
                    .await;
                Ok(value)
            })
            .await
            .cloned();

        {
            let mut in_flight = self.in_flight.lock().await;
            let finished = cell.initialized() || result.is_err();
            if finished && in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                in_flight.remove(&key);
            }
        }

        result
    }

    pub async fn invalidate(&self, predicate: impl Fn(&CacheKey) -> bool + Send + Sync) -> usize {
        self.backend.invalidate(&predicate).await
    }

    /// Drop every tile of one source.
    pub async fn invalidate_source(&self, source: &SourceFingerprint) -> usize {
        self.invalidate(|key| &key.source == source).await
    }

    pub async fn clear(&self) {
        self.backend.clear().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.backend.stats().await
    }
}
