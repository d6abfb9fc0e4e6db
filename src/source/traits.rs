//! Backend traits and source metadata.
//!
//! Every image format plugs into the engine through two traits:
//!
//! - [`SourceFactory`] decides whether it can read a path and opens it
//! - [`TileSource`] is the opened image: metadata plus native tile decode
//!
//! Caching, band selection, encoding and region composition live above these
//! traits in [`super::ImageSource`], so a backend only has to produce pixels.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::array::{DType, PixelArray};
use crate::error::{FormatError, TileError};
use crate::scale::Calibration;

// =============================================================================
// Open options
// =============================================================================

/// Backend-specific options passed at open time.
///
/// Options are part of the source fingerprint, so the same file opened with
/// different options never shares cached tiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenOptions(BTreeMap<String, String>);

impl OpenOptions {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Stable `key=value;` rendering used for hashing.
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v};"))
            .collect()
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Named frame axes and their lengths, e.g. `c=2,z=3`.
///
/// The first axis varies fastest when enumerating linear frame indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameAxes {
    axes: Vec<(String, usize)>,
}

impl FrameAxes {
    pub fn new(axes: Vec<(String, usize)>) -> Self {
        Self {
            axes: axes.into_iter().filter(|(_, n)| *n > 0).collect(),
        }
    }

    /// Parse `"c=2,z=3"`. Returns `None` on malformed input.
    pub fn parse(text: &str) -> Option<Self> {
        let mut axes = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, count) = part.split_once('=')?;
            let count: usize = count.trim().parse().ok()?;
            let name = name.trim();
            if name.is_empty() || count == 0 {
                return None;
            }
            axes.push((name.to_ascii_lowercase(), count));
        }
        Some(Self { axes })
    }

    pub fn axes(&self) -> &[(String, usize)] {
        &self.axes
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Number of frames spanned by the axes (1 without axes).
    pub fn frame_count(&self) -> usize {
        self.axes.iter().map(|(_, n)| n).product()
    }

    /// Per-axis indices of a linear frame.
    pub fn decompose(&self, mut frame: usize) -> BTreeMap<String, usize> {
        let mut index = BTreeMap::new();
        for (name, count) in &self.axes {
            index.insert(name.clone(), frame % count);
            frame /= count;
        }
        index
    }

    /// Linear frame of per-axis indices; missing axes count as 0.
    pub fn compose(&self, index: &BTreeMap<String, usize>) -> Option<usize> {
        let mut frame = 0;
        let mut stride = 1;
        for (name, count) in &self.axes {
            let i = index.get(name).copied().unwrap_or(0);
            if i >= *count {
                return None;
            }
            frame += i * stride;
            stride *= count;
        }
        Some(frame)
    }

    /// Frame descriptors for metadata.
    pub fn frames(&self) -> Vec<FrameInfo> {
        (0..self.frame_count())
            .map(|frame| FrameInfo {
                frame,
                index: self.decompose(frame),
            })
            .collect()
    }
}

/// One entry of a multi-frame source's frame list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame: usize,
    pub index: BTreeMap<String, usize>,
}

// =============================================================================
// Metadata
// =============================================================================

/// Number of levels needed to bring an image down to a single tile.
pub fn level_count(size_x: u32, size_y: u32, tile_width: u32, tile_height: u32) -> u32 {
    let ratio = (size_x as f64 / tile_width.max(1) as f64).max(size_y as f64 / tile_height.max(1) as f64);
    if ratio <= 1.0 {
        return 1;
    }
    ratio.log2().ceil() as u32 + 1
}

/// Description of an opened source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Full-resolution width in pixels
    pub size_x: u32,
    /// Full-resolution height in pixels
    pub size_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Level count; `levels - 1` is the native resolution
    pub levels: u32,
    pub band_count: usize,
    pub dtype: DType,
    /// Frame list, absent for single-frame sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<FrameInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_axes: Option<FrameAxes>,
    pub magnification: Option<f64>,
    pub mm_x: Option<f64>,
    pub mm_y: Option<f64>,
}

impl SourceMetadata {
    pub fn new(
        size_x: u32,
        size_y: u32,
        tile_width: u32,
        tile_height: u32,
        band_count: usize,
        dtype: DType,
    ) -> Self {
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);
        Self {
            size_x,
            size_y,
            tile_width,
            tile_height,
            levels: level_count(size_x, size_y, tile_width, tile_height),
            band_count,
            dtype,
            frames: None,
            frame_axes: None,
            magnification: None,
            mm_x: None,
            mm_y: None,
        }
    }

    /// Attach frame axes; a single frame keeps `frames` absent.
    pub fn with_frames(mut self, axes: FrameAxes) -> Self {
        if axes.frame_count() > 1 {
            self.frames = Some(axes.frames());
            self.frame_axes = Some(axes);
        } else {
            self.frames = None;
            self.frame_axes = None;
        }
        self
    }

    pub fn with_magnification(mut self, magnification: Option<f64>) -> Self {
        self.magnification = magnification;
        self
    }

    pub fn with_mm(mut self, mm_x: Option<f64>, mm_y: Option<f64>) -> Self {
        self.mm_x = mm_x;
        self.mm_y = mm_y.or(mm_x);
        self
    }

    pub fn frame_count(&self) -> usize {
        self.frames.as_ref().map_or(1, Vec::len).max(1)
    }

    pub fn max_level(&self) -> u32 {
        self.levels.saturating_sub(1)
    }

    /// Downsample factor of a level relative to the native level.
    pub fn level_scale(&self, level: u32) -> u32 {
        1u32 << self.max_level().saturating_sub(level).min(31)
    }

    /// Pixel size of a level (at least 1x1).
    pub fn level_size(&self, level: u32) -> (u32, u32) {
        let scale = self.level_scale(level);
        ((self.size_x / scale).max(1), (self.size_y / scale).max(1))
    }

    /// Tile columns and rows of a level.
    pub fn tile_grid(&self, level: u32) -> (u32, u32) {
        let (w, h) = self.level_size(level);
        (w.div_ceil(self.tile_width), h.div_ceil(self.tile_height))
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            size_x: self.size_x,
            size_y: self.size_y,
            levels: self.levels,
            magnification: self.magnification,
            mm_x: self.mm_x,
            mm_y: self.mm_y,
        }
    }

    /// Validate a tile address against the grid.
    pub fn check_address(&self, level: u32, x: u32, y: u32, frame: usize) -> Result<(), TileError> {
        if level >= self.levels {
            return Err(TileError::InvalidLevel {
                level,
                levels: self.levels,
            });
        }
        let (max_x, max_y) = self.tile_grid(level);
        let frames = self.frame_count();
        if x >= max_x || y >= max_y || frame >= frames {
            return Err(TileError::OutOfRange {
                level,
                x,
                y,
                frame,
                max_x,
                max_y,
                frames,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Traits
// =============================================================================

/// An opened image.
///
/// `read_tile` returns the native pixels of one tile, clipped at the right
/// and bottom edges of the level. It is never cached by the backend itself.
#[async_trait]
pub trait TileSource: Send + Sync {
    fn metadata(&self) -> &SourceMetadata;

    fn calibration(&self) -> Calibration {
        self.metadata().calibration()
    }

    /// Decode one tile.
    async fn read_tile(&self, level: u32, x: u32, y: u32, frame: usize) -> Result<PixelArray, TileError>;

    /// Names of auxiliary images (label, macro, thumbnail, ...).
    fn associated_image_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Decode an auxiliary image; `None` when the source has no such image.
    async fn associated_image(&self, _name: &str) -> Result<Option<PixelArray>, TileError> {
        Ok(None)
    }

    /// Release backend resources. Called before the handle cache drops it.
    async fn close(&self) {}
}

/// Opens one family of formats.
///
/// Factories are probed in order of extension match and then priority
/// (lower values first); the first whose `can_read` accepts the path wins.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> u8 {
        100
    }

    /// Lowercase extensions without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Cheap check; must not fail.
    async fn can_read(&self, path: &Path) -> bool;

    async fn open(&self, path: &Path, options: &OpenOptions) -> Result<Arc<dyn TileSource>, FormatError>;
}
