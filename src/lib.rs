//! # Large Image
//!
//! Tile access and pyramid construction for very large multi-resolution
//! images.
//!
//! The library reads images tile by tile through format backends chosen by
//! probing, caches decoded tiles and open files, converts between pixel,
//! millimetre and magnification coordinates, and builds new pyramids from
//! tiles written at arbitrary offsets.
//!
//! ## Features
//!
//! - **Tiled reading**: tiles, regions, single pixels and lazy tile iteration
//!   at any scale
//! - **Format support**: pyramidal TIFF (including Aperio SVS), directory
//!   stores and zipped stores, plus a synthetic test-pattern source
//! - **Caching**: singleflight tile cache on an in-memory LRU or memcached,
//!   and a bounded cache of open sources
//! - **Pyramid sink**: accumulate tiles, derive reduced levels, crop and
//!   write any supported format
//!
//! ## Architecture
//!
//! - [`scale`] - units, descriptors and the scale algebra
//! - [`array`] / [`resample`] - pixel arrays and downsampling
//! - [`cache`] - tile cache backends and the source handle cache
//! - [`source`] - the `TileSource` abstraction and the `ImageSource` façade
//! - [`sink`] - pyramid construction
//! - [`mod@format`] - TIFF and store backends
//! - [`io`] - range readers over files and memory
//! - [`context`] / [`config`] - engine context and its configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use large_image::{EngineContext, OpenOptions, RenderParams, TileAddress};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), large_image::TileError> {
//!     let context = EngineContext::default();
//!     let source = context.open("slide.svs", &OpenOptions::default()).await?;
//!     let meta = source.metadata();
//!     println!("{}x{} in {} levels", meta.size_x, meta.size_y, meta.levels);
//!
//!     let tile = source
//!         .get_tile(TileAddress::new(0, 0, 0), &RenderParams::pixels())
//!         .await?;
//!     println!("{} bytes", tile.byte_cost());
//!     Ok(())
//! }
//! ```

pub mod array;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod io;
pub mod resample;
pub mod scale;
pub mod sink;
pub mod source;

// Re-export commonly used types
pub use array::{DType, Mask, PixelArray};
pub use cache::{
    CacheBackend, CacheKey, CacheStats, MemcachedBackend, MemcachedOptions, MemoryBackend,
    SourceFingerprint, SourceHandle, SourceHandleCache, TileCache,
};
pub use config::{CacheBackendKind, CacheConfig, Cli, Command, ConvertConfig, InfoConfig};
pub use context::{ConvertOptions, EngineContext};
pub use error::{
    CacheError, FormatError, IoError, ScaleError, SinkError, TiffError, TileError,
};
pub use format::{encoder_for_path, PyramidManifest, SourceRegistry};
pub use io::{FileRangeReader, MemoryRangeReader, RangeReader};
pub use resample::ResampleMethod;
pub use scale::{
    Calibration, LevelRounding, MagnificationInfo, Rect, RegionDescriptor, ScaleDescriptor, Units,
};
pub use sink::{CropRect, PyramidData, PyramidEncoder, PyramidSink, SinkState, TileWrite};
pub use source::{
    Encoding, FrameAxes, FrameInfo, ImageSource, IteratorOptions, OpenOptions, PixelValue,
    RegionOptions, RegionResult, RenderParams, SourceFactory, SourceMetadata, TileAddress,
    TileFormat, TileIterator, TilePayload, TileRecord, TileSource,
};
