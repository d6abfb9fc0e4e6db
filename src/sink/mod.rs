//! Pyramid construction.
//!
//! A [`PyramidSink`] accumulates tiles written at arbitrary pixel offsets,
//! derives the reduced levels on demand and hands the finished pyramid to a
//! [`PyramidEncoder`] chosen by destination.
//!
//! # Levels
//!
//! Inside the sink level `0` is the full resolution and level `L` is exactly
//! `floor(size(L - 1) / 2)` in each dimension. Readers number the same
//! levels the other way round (coarsest first).

mod frames;
mod pyramid;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::array::{DType, Mask, PixelArray};
use crate::error::SinkError;
use crate::source::FrameAxes;

pub use pyramid::{PyramidSink, SinkState};

/// Tile size of written pyramids.
pub const SINK_TILE_SIZE: u32 = 512;

/// Where a tile goes besides its pixel offset.
#[derive(Debug, Clone, Default)]
pub struct TileWrite {
    /// Frame axis indices, e.g. `{"c": 1, "z": 4}`
    pub axes: BTreeMap<String, usize>,
    /// Resolution level, `0` being full resolution
    pub level: u32,
    /// Only pixels whose mask is set overwrite existing data
    pub mask: Option<Mask>,
}

impl TileWrite {
    pub fn axis(mut self, name: impl Into<String>, index: usize) -> Self {
        self.axes.insert(name.into(), index);
        self
    }

    pub fn at_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// Output crop in full-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// A finished pyramid ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidData {
    /// `levels[level][frame]`, full resolution first
    pub levels: Vec<Vec<PixelArray>>,
    pub frame_axes: FrameAxes,
    pub band_count: usize,
    pub dtype: DType,
    pub tile_size: u32,
    pub magnification: Option<f64>,
    pub mm_x: Option<f64>,
    pub mm_y: Option<f64>,
}

impl PyramidData {
    /// Full-resolution size.
    pub fn size(&self) -> (u32, u32) {
        self.levels
            .first()
            .and_then(|frames| frames.first())
            .map_or((0, 0), |a| (a.width() as u32, a.height() as u32))
    }

    pub fn frame_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }
}

/// Writes a finished pyramid to a persisted format.
#[async_trait]
pub trait PyramidEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lowercase destination extensions without the dot.
    fn extensions(&self) -> &'static [&'static str];

    async fn write(&self, pyramid: Arc<PyramidData>, destination: &Path) -> Result<(), SinkError>;
}
