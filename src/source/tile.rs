//! Tile addressing and payload types.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::array::PixelArray;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Position of one tile in a source's pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress {
    /// Pyramid level (`levels - 1` is the native resolution)
    pub level: u32,
    /// Tile column
    pub x: u32,
    /// Tile row
    pub y: u32,
    /// Linear frame index
    pub frame: usize,
}

impl TileAddress {
    pub fn new(level: u32, x: u32, y: u32) -> Self {
        Self {
            level,
            x,
            y,
            frame: 0,
        }
    }

    pub fn with_frame(mut self, frame: usize) -> Self {
        self.frame = frame;
        self
    }
}

/// Shape of a returned tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileFormat {
    /// Decoded samples
    #[default]
    Pixels,
    /// Compressed image bytes
    Encoded,
}

/// Compression for encoded payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Png,
    Jpeg {
        quality: u8,
    },
}

impl Encoding {
    pub fn jpeg() -> Self {
        Encoding::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub const fn mime_type(self) -> &'static str {
        match self {
            Encoding::Png => "image/png",
            Encoding::Jpeg { .. } => "image/jpeg",
        }
    }
}

/// Everything besides the address that shapes a tile payload.
///
/// Hashed verbatim into cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RenderParams {
    pub format: TileFormat,
    pub encoding: Encoding,
    /// Band subset, in output order
    pub bands: Option<Vec<usize>>,
}

impl RenderParams {
    pub fn pixels() -> Self {
        Self::default()
    }

    pub fn encoded(encoding: Encoding) -> Self {
        Self {
            format: TileFormat::Encoded,
            encoding,
            bands: None,
        }
    }

    pub fn with_bands(mut self, bands: Vec<usize>) -> Self {
        self.bands = Some(bands);
        self
    }
}

/// A tile or region as returned to callers.
///
/// Payloads are shared; cloning never copies sample data.
#[derive(Debug, Clone, PartialEq)]
pub enum TilePayload {
    Pixels(Arc<PixelArray>),
    Encoded { data: Bytes, encoding: Encoding },
}

impl TilePayload {
    /// Approximate memory held by the payload.
    pub fn byte_cost(&self) -> usize {
        match self {
            TilePayload::Pixels(array) => array.byte_cost(),
            TilePayload::Encoded { data, .. } => data.len(),
        }
    }

    pub fn as_pixels(&self) -> Option<&Arc<PixelArray>> {
        match self {
            TilePayload::Pixels(array) => Some(array),
            TilePayload::Encoded { .. } => None,
        }
    }

    pub fn as_encoded(&self) -> Option<&Bytes> {
        match self {
            TilePayload::Pixels(_) => None,
            TilePayload::Encoded { data, .. } => Some(data),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TilePayload::Pixels(array) => array.is_empty(),
            TilePayload::Encoded { data, .. } => data.is_empty(),
        }
    }
}
