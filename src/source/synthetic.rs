//! Deterministic test-pattern source.
//!
//! Useful for exercising the engine without any file on disk. Every pixel is
//! a function of its native-resolution position, band and frame, so lower
//! levels are point samples of the native level and any region can be
//! predicted exactly.
//!
//! Opened through the registry with a `synthetic:` pseudo-path whose query
//! sets the options, for example
//! `synthetic:size_x=1000&size_y=800&bands=3&frames=c=2,z=3`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{FrameAxes, OpenOptions, SourceFactory, SourceMetadata, TileSource};
use crate::array::{DType, PixelArray};
use crate::error::{FormatError, TileError};

/// Pseudo-path prefix recognized by [`SyntheticFactory`].
pub const SYNTHETIC_PREFIX: &str = "synthetic:";

/// Shape and calibration of a synthetic source.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticOptions {
    pub size_x: u32,
    pub size_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub bands: usize,
    pub dtype: DType,
    pub frames: FrameAxes,
    pub magnification: Option<f64>,
    pub mm_x: Option<f64>,
    pub mm_y: Option<f64>,
    pub associated: Vec<String>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            size_x: 4096,
            size_y: 4096,
            tile_width: 256,
            tile_height: 256,
            bands: 3,
            dtype: DType::Uint8,
            frames: FrameAxes::default(),
            magnification: Some(40.0),
            mm_x: Some(0.00025),
            mm_y: Some(0.00025),
            associated: vec!["label".to_string(), "macro".to_string()],
        }
    }
}

impl SyntheticOptions {
    /// Parse a `key=value&key=value` query.
    ///
    /// Unknown keys are rejected so typos do not silently fall back to
    /// defaults.
    pub fn parse_query(query: &str) -> Result<Self, FormatError> {
        let mut options = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| invalid(pair))?;
            options.set(key.trim(), value.trim())?;
        }
        Ok(options)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), FormatError> {
        fn num<T: FromStr>(key: &str, value: &str) -> Result<T, FormatError> {
            value.parse().map_err(|_| invalid(&format!("{key}={value}")))
        }
        fn opt_f64(key: &str, value: &str) -> Result<Option<f64>, FormatError> {
            if value.is_empty() || value == "none" {
                Ok(None)
            } else {
                num(key, value).map(Some)
            }
        }

        match key {
            "size_x" => self.size_x = num(key, value)?,
            "size_y" => self.size_y = num(key, value)?,
            "size" => {
                self.size_x = num(key, value)?;
                self.size_y = self.size_x;
            }
            "tile_width" => self.tile_width = num(key, value)?,
            "tile_height" => self.tile_height = num(key, value)?,
            "tile_size" => {
                self.tile_width = num(key, value)?;
                self.tile_height = self.tile_width;
            }
            "bands" => self.bands = num(key, value)?,
            "dtype" => {
                self.dtype = value
                    .parse()
                    .map_err(|_| invalid(&format!("{key}={value}")))?
            }
            "frames" => {
                self.frames = FrameAxes::parse(value).ok_or_else(|| invalid(value))?;
            }
            "magnification" => self.magnification = opt_f64(key, value)?,
            "mm_x" => self.mm_x = opt_f64(key, value)?,
            "mm_y" => self.mm_y = opt_f64(key, value)?,
            "associated" => {
                self.associated = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            _ => return Err(invalid(&format!("{key}={value}"))),
        }
        Ok(())
    }
}

fn invalid(what: &str) -> FormatError {
    FormatError::UnsupportedFormat {
        reason: format!("invalid synthetic option {what:?}"),
    }
}

/// Sample value at a native-resolution position.
pub fn pattern_value(x: u64, y: u64, band: usize, frame: usize) -> f64 {
    (((x / 16) * 3 + (y / 16) * 5 + band as u64 * 50 + frame as u64 * 17) % 256) as f64
}

// =============================================================================
// Source
// =============================================================================

/// A source whose pixels are computed on demand.
pub struct SyntheticSource {
    metadata: SourceMetadata,
    associated: Vec<String>,
}

impl SyntheticSource {
    pub fn new(options: SyntheticOptions) -> Self {
        let metadata = SourceMetadata::new(
            options.size_x.max(1),
            options.size_y.max(1),
            options.tile_width,
            options.tile_height,
            options.bands.max(1),
            options.dtype,
        )
        .with_frames(options.frames)
        .with_magnification(options.magnification)
        .with_mm(options.mm_x, options.mm_y);
        Self {
            metadata,
            associated: options.associated,
        }
    }
}

#[async_trait]
impl TileSource for SyntheticSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn read_tile(&self, level: u32, x: u32, y: u32, frame: usize) -> Result<PixelArray, TileError> {
        let meta = &self.metadata;
        meta.check_address(level, x, y, frame)?;

        let scale = meta.level_scale(level) as u64;
        let (level_w, level_h) = meta.level_size(level);
        let left = x * meta.tile_width;
        let top = y * meta.tile_height;
        let width = meta.tile_width.min(level_w - left) as usize;
        let height = meta.tile_height.min(level_h - top) as usize;

        Ok(PixelArray::from_fn(width, height, meta.band_count, meta.dtype, |px, py, band| {
            pattern_value(
                (left as u64 + px as u64) * scale,
                (top as u64 + py as u64) * scale,
                band,
                frame,
            )
        }))
    }

    fn associated_image_names(&self) -> Vec<String> {
        self.associated.clone()
    }

    async fn associated_image(&self, name: &str) -> Result<Option<PixelArray>, TileError> {
        let Some(position) = self.associated.iter().position(|n| n == name) else {
            return Ok(None);
        };
        let (width, height) = (64 * (position + 1), 32 * (position + 1));
        Ok(Some(PixelArray::from_fn(
            width,
            height,
            self.metadata.band_count,
            self.metadata.dtype,
            |x, y, band| ((x + y) * (position + 1) + band) as f64,
        )))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Opens `synthetic:` pseudo-paths.
#[derive(Debug, Default)]
pub struct SyntheticFactory;

#[async_trait]
impl SourceFactory for SyntheticFactory {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    async fn can_read(&self, path: &Path) -> bool {
        path.to_str().is_some_and(|p| p.starts_with(SYNTHETIC_PREFIX))
    }

    async fn open(&self, path: &Path, _options: &OpenOptions) -> Result<Arc<dyn TileSource>, FormatError> {
        let query = path
            .to_str()
            .and_then(|p| p.strip_prefix(SYNTHETIC_PREFIX))
            .ok_or_else(|| FormatError::NoReader {
                path: path.display().to_string(),
            })?;
        let options = SyntheticOptions::parse_query(query)?;
        Ok(Arc::new(SyntheticSource::new(options)))
    }
}
