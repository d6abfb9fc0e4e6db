//! Tile source abstraction.
//!
//! This module provides a unified interface over multi-resolution images
//! regardless of their underlying format.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              ImageSource                │
//! │ (regions, iteration, encoding, scales)  │
//! └──────────┬───────────────────┬──────────┘
//!            │                   │
//!            ▼                   ▼
//! ┌──────────────────┐  ┌──────────────────┐
//! │    TileCache     │  │   SourceHandle   │
//! │ (singleflight)   │  │ (pinned, cached) │
//! └──────────────────┘  └────────┬─────────┘
//!                                │
//!                                ▼
//!                 ┌─────────────────────────────┐
//!                 │      TileSource trait       │
//!                 └──────────────┬──────────────┘
//!                                │
//!          ┌─────────────────────┼──────────────────────┐
//!          ▼                     ▼                      ▼
//! ┌─────────────────┐  ┌──────────────────┐  ┌────────────────────┐
//! │   TiffSource    │  │   StoreSource    │  │  SyntheticSource   │
//! └─────────────────┘  └──────────────────┘  └────────────────────┘
//! ```

pub mod encoder;
mod image_source;
mod iterator;
pub mod synthetic;
mod tile;
mod traits;

pub use image_source::{ImageSource, PixelValue, RegionOptions, RegionResult};
pub use iterator::{IteratorOptions, TileIterator, TileRecord};
pub use synthetic::{SyntheticFactory, SyntheticOptions, SyntheticSource};
pub use tile::{Encoding, RenderParams, TileAddress, TileFormat, TilePayload, DEFAULT_JPEG_QUALITY};
pub use traits::{
    level_count, FrameAxes, FrameInfo, OpenOptions, SourceFactory, SourceMetadata, TileSource,
};
