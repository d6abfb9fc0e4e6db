//! Engine context.
//!
//! An [`EngineContext`] owns everything shared between open sources: the
//! backend registry, the tile cache and the handle cache. It is built once
//! from a [`CacheConfig`]; there is no process-global state.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{
    CacheBackend, MemcachedBackend, MemoryBackend, SourceFingerprint, SourceHandleCache, TileCache,
};
use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::{SinkError, TileError};
use crate::format::SourceRegistry;
use crate::resample::ResampleMethod;
use crate::sink::{CropRect, PyramidSink, TileWrite};
use crate::source::synthetic::SYNTHETIC_PREFIX;
use crate::source::{ImageSource, IteratorOptions, OpenOptions, SourceMetadata};

/// Options of [`EngineContext::convert`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// Method used to derive reduced levels
    pub resample: ResampleMethod,
    /// Output crop in full-resolution pixels
    pub crop: Option<CropRect>,
}

/// Registry and caches shared by every source opened through it.
pub struct EngineContext {
    config: CacheConfig,
    registry: SourceRegistry,
    tiles: Arc<TileCache>,
    handles: SourceHandleCache,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl EngineContext {
    /// Build the caches described by `config` with every built-in backend.
    pub fn new(config: CacheConfig) -> Self {
        let backend: Arc<dyn CacheBackend> = match config.cache_backend {
            CacheBackendKind::Memory => Arc::new(MemoryBackend::with_capacity(config.tile_cache_bytes())),
            CacheBackendKind::Memcached => Arc::new(MemcachedBackend::new(config.memcached_options())),
        };
        let handles = config.handle_capacity();
        info!(
            backend = backend.name(),
            handles,
            "engine context ready"
        );
        Self {
            registry: SourceRegistry::default(),
            tiles: Arc::new(TileCache::new(backend)),
            handles: SourceHandleCache::new(handles),
            config,
        }
    }

    /// Same caches, different backends.
    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use an existing tile cache, e.g. one shared with another context.
    pub fn with_tile_cache(mut self, tiles: Arc<TileCache>) -> Self {
        self.tiles = tiles;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.tiles
    }

    pub fn handle_cache(&self) -> &SourceHandleCache {
        &self.handles
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Open a path, reusing a cached handle when the file is unchanged.
    pub async fn open(&self, path: impl AsRef<Path>, options: &OpenOptions) -> Result<ImageSource, TileError> {
        let path = path.as_ref();
        let fingerprint = fingerprint(path, options).await?;
        let handle = self
            .handles
            .get_or_open(fingerprint, || self.registry.open(path, options))
            .await?;
        Ok(ImageSource::new(handle, self.tiles.clone()).with_max_small_image_size(self.config.max_small_image_size))
    }

    /// Drop a source's handle and every tile cached for it.
    ///
    /// The handle stays open while other clones of `source` are alive.
    /// Returns the number of tiles dropped.
    pub async fn forget(&self, source: ImageSource) -> usize {
        let fingerprint = source.fingerprint().clone();
        drop(source);
        let closed = self.handles.remove(&fingerprint).await;
        let dropped = self.tiles.invalidate_source(&fingerprint).await;
        debug!(source = %fingerprint, closed, dropped, "forgot source");
        dropped
    }

    // =========================================================================
    // Conversion
    // =========================================================================

    /// Copy every native tile of every frame of `source` into `sink`.
    ///
    /// Returns the number of tiles copied.
    pub async fn copy_into(&self, source: &ImageSource, sink: &PyramidSink) -> Result<usize, SinkError> {
        let meta = source.metadata();
        sink.set_calibration(meta.magnification, meta.mm_x, meta.mm_y).await;
        let axes = meta.frame_axes.clone().unwrap_or_default();
        sink.set_frame_axes(&axes).await;

        let mut copied = 0;
        for record in source.tile_iterator(IteratorOptions::default())? {
            let payload = record.tile().await?;
            let Some(pixels) = payload.as_pixels() else {
                return Err(SinkError::Encode("tile iterator produced encoded tiles".to_string()));
            };
            let write = TileWrite {
                axes: axes.decompose(record.address.frame),
                ..Default::default()
            };
            sink.add_tile(pixels, record.x, record.y, write).await?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Re-pyramid `source` into `destination`, whose extension picks the
    /// format. Returns the metadata read back from the written pyramid.
    pub async fn convert(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        options: ConvertOptions,
    ) -> Result<SourceMetadata, SinkError> {
        let (source, destination) = (source.as_ref(), destination.as_ref());
        let image = self.open(source, &OpenOptions::default()).await?;
        let sink = PyramidSink::new();
        let tiles = self.copy_into(&image, &sink).await?;
        info!(
            source = %source.display(),
            destination = %destination.display(),
            tiles,
            "copied source tiles"
        );

        sink.set_crop(options.crop).await;
        sink.write(destination, options.resample).await?;
        let written = self.open(destination, &OpenOptions::default()).await?;
        Ok(written.metadata().clone())
    }
}

/// Cache identity of a path: file metadata, or the label itself for
/// pseudo-paths with no backing file.
async fn fingerprint(path: &Path, options: &OpenOptions) -> Result<SourceFingerprint, TileError> {
    match path.to_str() {
        Some(label) if label.starts_with(SYNTHETIC_PREFIX) => Ok(SourceFingerprint::for_label(label, options)),
        _ => Ok(SourceFingerprint::for_file(path, options).await?),
    }
}
