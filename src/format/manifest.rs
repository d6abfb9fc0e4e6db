//! Pyramid description shared by the written formats.
//!
//! The TIFF writer embeds it as `{"large_image": {...}}` in the first
//! ImageDescription; the directory store keeps it in `manifest.json`.

use serde::{Deserialize, Serialize};

use crate::array::DType;
use crate::error::FormatError;
use crate::sink::PyramidData;
use crate::source::{FrameAxes, SourceMetadata};

/// Key wrapping the manifest inside a TIFF ImageDescription.
pub const DESCRIPTION_KEY: &str = "large_image";

/// Current manifest version.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidManifest {
    pub version: u32,
    pub size_x: u32,
    pub size_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Stored levels, full resolution being level 0
    pub levels: u32,
    pub band_count: usize,
    pub dtype: DType,
    #[serde(default)]
    pub frame_axes: FrameAxes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnification: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mm_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mm_y: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct Description {
    large_image: PyramidManifest,
}

impl PyramidManifest {
    pub fn from_pyramid(pyramid: &PyramidData) -> Self {
        let (size_x, size_y) = pyramid.size();
        Self {
            version: MANIFEST_VERSION,
            size_x,
            size_y,
            tile_width: pyramid.tile_size,
            tile_height: pyramid.tile_size,
            levels: pyramid.levels.len() as u32,
            band_count: pyramid.band_count,
            dtype: pyramid.dtype,
            frame_axes: pyramid.frame_axes.clone(),
            magnification: pyramid.magnification,
            mm_x: pyramid.mm_x,
            mm_y: pyramid.mm_y,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_axes.frame_count()
    }

    /// Reader-side metadata; levels are renumbered coarsest first.
    pub fn metadata(&self) -> SourceMetadata {
        let mut metadata = SourceMetadata::new(
            self.size_x,
            self.size_y,
            self.tile_width,
            self.tile_height,
            self.band_count,
            self.dtype,
        )
        .with_frames(self.frame_axes.clone())
        .with_magnification(self.magnification)
        .with_mm(self.mm_x, self.mm_y);
        metadata.levels = self.levels.max(1);
        metadata
    }

    pub fn to_json(&self) -> Result<String, FormatError> {
        serde_json::to_string_pretty(self).map_err(|e| FormatError::Store(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, FormatError> {
        let manifest: Self =
            serde_json::from_str(text).map_err(|e| FormatError::Store(format!("invalid manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// ImageDescription text for the first TIFF directory.
    pub fn to_description(&self) -> Result<String, FormatError> {
        serde_json::to_string(&Description {
            large_image: self.clone(),
        })
        .map_err(|e| FormatError::Store(e.to_string()))
    }

    /// Recover a manifest from an ImageDescription; `None` for foreign text.
    pub fn from_description(text: &str) -> Option<Self> {
        let description: Description = serde_json::from_str(text.trim()).ok()?;
        description.large_image.validate().ok()?;
        Some(description.large_image)
    }

    fn validate(&self) -> Result<(), FormatError> {
        if self.version > MANIFEST_VERSION {
            return Err(FormatError::Store(format!(
                "manifest version {} is newer than supported {}",
                self.version, MANIFEST_VERSION
            )));
        }
        if self.size_x == 0 || self.size_y == 0 || self.tile_width == 0 || self.tile_height == 0 {
            return Err(FormatError::Store("manifest has an empty image or tile size".into()));
        }
        if self.band_count == 0 {
            return Err(FormatError::Store("manifest has no bands".into()));
        }
        Ok(())
    }
}
