use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::frames::FrameSpace;
use super::{CropRect, PyramidData, PyramidEncoder, TileWrite, SINK_TILE_SIZE};
use crate::array::{DType, Mask, PixelArray};
use crate::error::SinkError;
use crate::format::encoder_for_path;
use crate::resample::{downsample_2x, ResampleMethod};
use crate::scale::{Calibration, RegionDescriptor};
use crate::source::{level_count, FrameAxes, SourceMetadata};

/// Lifecycle of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Nothing written
    Empty,
    /// Tiles written since the last `write()`
    Accumulating,
    /// Written out; still inspectable, and further writes reopen it
    Finalized,
}

/// One resolution level of the sink.
#[derive(Debug, Clone)]
struct Level {
    /// Logical bounds; frame arrays may be larger
    width: u32,
    height: u32,
    frames: BTreeMap<Vec<usize>, PixelArray>,
    /// Pixels set by `add_tile`, tracked for explicit levels only
    written: BTreeMap<Vec<usize>, Mask>,
    /// Written by `add_tile` rather than derived
    explicit: bool,
}

impl Level {
    fn new(explicit: bool) -> Self {
        Self {
            width: 0,
            height: 0,
            frames: BTreeMap::new(),
            written: BTreeMap::new(),
            explicit,
        }
    }

    /// The frame clipped or padded to the logical bounds.
    fn frame(&self, key: &[usize], bands: usize, dtype: DType) -> PixelArray {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.frames.get(key) {
            Some(array) if (array.width(), array.height()) == (w, h) => array.clone(),
            Some(array) => array.crop(0, 0, w, h).resized_canvas(w, h),
            None => PixelArray::new(w, h, bands, dtype),
        }
    }

    /// Which pixels of the frame were written, within the logical bounds.
    fn written(&self, key: &[usize]) -> Mask {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.written.get(key) {
            Some(mask) if (mask.width(), mask.height()) == (w, h) => mask.clone(),
            Some(mask) => mask.resized(w, h),
            None => Mask::new(w, h, false),
        }
    }
}

struct SinkInner {
    state: SinkState,
    dtype: Option<DType>,
    bands: Option<usize>,
    frames: FrameSpace,
    levels: BTreeMap<u32, Level>,
    crop: Option<CropRect>,
    magnification: Option<f64>,
    mm_x: Option<f64>,
    mm_y: Option<f64>,
    /// Bumped by every write so derived levels are only kept when current
    generation: u64,
}

/// A mutable image pyramid built from individually written tiles.
///
/// All methods take `&self`; writes are serialized by an internal lock, so a
/// sink can be shared across tasks behind an `Arc`.
pub struct PyramidSink {
    inner: RwLock<SinkInner>,
}

impl Default for PyramidSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PyramidSink {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SinkInner {
                state: SinkState::Empty,
                dtype: None,
                bands: None,
                frames: FrameSpace::default(),
                levels: BTreeMap::new(),
                crop: None,
                magnification: None,
                mm_x: None,
                mm_y: None,
                generation: 0,
            }),
        }
    }

    pub async fn state(&self) -> SinkState {
        self.inner.read().await.state
    }

    /// Physical calibration recorded in the written file.
    pub async fn set_calibration(&self, magnification: Option<f64>, mm_x: Option<f64>, mm_y: Option<f64>) {
        let mut inner = self.inner.write().await;
        inner.magnification = magnification;
        inner.mm_x = mm_x;
        inner.mm_y = mm_y.or(mm_x);
    }

    /// Write a block of pixels with its top-left corner at `(x, y)`.
    ///
    /// Bounds grow to include the block; the origin never moves. A write at
    /// level 0 discards every materialized reduced level.
    pub async fn add_tile(&self, tile: &PixelArray, x: u32, y: u32, write: TileWrite) -> Result<(), SinkError> {
        if let Some(mask) = &write.mask {
            if (mask.width(), mask.height()) != (tile.width(), tile.height()) {
                return Err(SinkError::MaskMismatch {
                    width: tile.width(),
                    height: tile.height(),
                    mask_width: mask.width(),
                    mask_height: mask.height(),
                });
            }
        }

        let mut inner = self.inner.write().await;
        if let Some(bands) = inner.bands {
            if bands != tile.bands() {
                return Err(SinkError::ShapeMismatch {
                    expected: bands,
                    actual: tile.bands(),
                });
            }
        }
        if let Some(dtype) = inner.dtype {
            if dtype != tile.dtype() {
                return Err(SinkError::DtypeMismatch {
                    expected: dtype.as_str(),
                    actual: tile.dtype().as_str(),
                });
            }
        }
        let bands = *inner.bands.get_or_insert(tile.bands());
        let dtype = *inner.dtype.get_or_insert(tile.dtype());

        let (key, added) = inner.frames.key_for(&write.axes);
        pad_frame_keys(&mut inner.levels, added);

        // Level 0 writes drop every reduced level; higher writes only drop
        // the derived levels at or above them.
        let target = write.level;
        inner
            .levels
            .retain(|&l, level| l == 0 || (target > 0 && (l < target || level.explicit)));

        let level = inner
            .levels
            .entry(target)
            .or_insert_with(|| Level::new(target > 0));
        let right = x + tile.width() as u32;
        let bottom = y + tile.height() as u32;
        level.width = level.width.max(right);
        level.height = level.height.max(bottom);

        if level.explicit {
            let written = level
                .written
                .entry(key.clone())
                .or_insert_with(|| Mask::new(0, 0, false));
            if written.width() < right as usize || written.height() < bottom as usize {
                let width = (right as usize).max(written.width() * 3 / 2);
                let height = (bottom as usize).max(written.height() * 3 / 2);
                *written = written.resized(width, height);
            }
            written.cover(x as usize, y as usize, tile.width(), tile.height(), write.mask.as_ref());
        }

        let array = level
            .frames
            .entry(key)
            .or_insert_with(|| PixelArray::new(0, 0, bands, dtype));
        if array.width() < right as usize || array.height() < bottom as usize {
            // Grow geometrically so row-major tiling does not copy per tile.
            let width = (right as usize).max(array.width() * 3 / 2);
            let height = (bottom as usize).max(array.height() * 3 / 2);
            *array = array.resized_canvas(width, height);
        }
        array.blit(tile, x as usize, y as usize, write.mask.as_ref());

        inner.state = SinkState::Accumulating;
        inner.generation += 1;
        debug!(
            x,
            y,
            width = tile.width(),
            height = tile.height(),
            level = target,
            "added tile to sink"
        );
        Ok(())
    }

    /// Fix the order and minimum sizes of frame axes before writing tiles.
    ///
    /// Axes first seen in a write are otherwise ordered by name.
    pub async fn set_frame_axes(&self, axes: &FrameAxes) {
        let mut inner = self.inner.write().await;
        let added = inner.frames.declare(axes);
        pad_frame_keys(&mut inner.levels, added);
    }

    /// Crop applied only when writing.
    pub async fn set_crop(&self, crop: Option<CropRect>) {
        self.inner.write().await.crop = crop;
    }

    pub async fn crop(&self) -> Option<CropRect> {
        self.inner.read().await.crop
    }

    /// Levels currently held, written or derived.
    pub async fn materialized_levels(&self) -> Vec<u32> {
        self.inner.read().await.levels.keys().copied().collect()
    }

    /// Live, uncropped description of the full-resolution image.
    ///
    /// An empty sink reports zero size and zero levels.
    pub async fn metadata(&self) -> SourceMetadata {
        let inner = self.inner.read().await;
        let (width, height) = inner
            .levels
            .get(&0)
            .map_or((0, 0), |l| (l.width, l.height));
        let mut metadata = SourceMetadata::new(
            width,
            height,
            SINK_TILE_SIZE,
            SINK_TILE_SIZE,
            inner.bands.unwrap_or(0),
            inner.dtype.unwrap_or(DType::Uint8),
        )
        .with_frames(inner.frames.axes())
        .with_magnification(inner.magnification)
        .with_mm(inner.mm_x, inner.mm_y);
        if width == 0 || height == 0 {
            metadata.levels = 0;
        }
        metadata
    }

    /// Full-resolution pixels of one frame, uncropped; unwritten areas are 0.
    ///
    /// Before anything is written at level 0 the region is a 0 x 0 array.
    pub async fn get_region(&self, region: &RegionDescriptor, frame: usize) -> Result<PixelArray, SinkError> {
        let inner = self.inner.read().await;
        let bands = inner.bands.unwrap_or(0);
        let dtype = inner.dtype.unwrap_or(DType::Uint8);
        let Some(level) = inner.levels.get(&0).filter(|l| l.width > 0 && l.height > 0) else {
            return Ok(PixelArray::new(0, 0, bands, dtype));
        };
        let key = inner
            .frames
            .key_of_frame(frame)
            .ok_or(SinkError::InvalidFrame {
                frame,
                frames: inner.frames.frame_count(),
            })?;

        let calibration = Calibration::uncalibrated(level.width, level.height, 1);
        let rect = region
            .to_base_rect(&calibration, None)?
            .clip(level.width as f64, level.height as f64);
        let left = rect.left.floor() as usize;
        let top = rect.top.floor() as usize;
        let width = (rect.right().ceil() as usize).saturating_sub(left);
        let height = (rect.bottom().ceil() as usize).saturating_sub(top);

        Ok(match level.frames.get(&key) {
            Some(array) => array.crop(left, top, width, height).resized_canvas(width, height),
            None => PixelArray::new(width, height, bands, dtype),
        })
    }

    /// Derive every level and apply the crop.
    pub async fn build(&self, method: ResampleMethod) -> Result<PyramidData, SinkError> {
        let (base, explicit, space, crop, calibration, bands, dtype, generation) = {
            let inner = self.inner.read().await;
            let (Some(bands), Some(dtype), Some(level0)) = (inner.bands, inner.dtype, inner.levels.get(&0)) else {
                return Err(SinkError::EmptySink);
            };
            if level0.width == 0 || level0.height == 0 {
                return Err(SinkError::EmptySink);
            }
            let space = inner.frames.clone();
            let base: Vec<PixelArray> = (0..space.frame_count())
                .filter_map(|f| space.key_of_frame(f))
                .map(|key| level0.frame(&key, bands, dtype))
                .collect();
            let explicit: HashMap<u32, Vec<(usize, PixelArray, Mask)>> = inner
                .levels
                .iter()
                .filter(|(_, level)| level.explicit)
                .map(|(&l, level)| {
                    let frames = level
                        .frames
                        .keys()
                        .filter_map(|key| {
                            let frame = space.frame_of_key(key)?;
                            Some((frame, level.frame(key, bands, dtype), level.written(key)))
                        })
                        .collect();
                    (l, frames)
                })
                .collect();
            (
                base,
                explicit,
                space,
                inner.crop,
                (inner.magnification, inner.mm_x, inner.mm_y),
                bands,
                dtype,
                inner.generation,
            )
        };

        let (width, height) = (base[0].width() as u32, base[0].height() as u32);
        let count = level_count(width, height, SINK_TILE_SIZE, SINK_TILE_SIZE);
        debug!(width, height, levels = count, frames = base.len(), "deriving pyramid levels");

        let levels = tokio::task::spawn_blocking(move || derive_levels(base, &explicit, count, method))
            .await
            .map_err(|e| SinkError::Encode(format!("level derivation failed: {e}")))?;

        {
            let mut inner = self.inner.write().await;
            if inner.generation == generation {
                for (l, frames) in levels.iter().enumerate().skip(1) {
                    let l = l as u32;
                    if inner.levels.get(&l).is_some_and(|level| level.explicit) {
                        continue;
                    }
                    let mut level = Level::new(false);
                    level.width = frames[0].width() as u32;
                    level.height = frames[0].height() as u32;
                    level.frames = frames
                        .iter()
                        .enumerate()
                        .filter_map(|(f, a)| Some((inner.frames.key_of_frame(f)?, a.clone())))
                        .collect();
                    inner.levels.insert(l, level);
                }
            }
        }

        let levels = match crop {
            Some(crop) => crop_levels(levels, crop)?,
            None => levels,
        };

        Ok(PyramidData {
            levels,
            frame_axes: space.axes(),
            band_count: bands,
            dtype,
            tile_size: SINK_TILE_SIZE,
            magnification: calibration.0,
            mm_x: calibration.1,
            mm_y: calibration.2,
        })
    }

    /// Write with the encoder matching the destination's extension.
    pub async fn write(&self, destination: &Path, method: ResampleMethod) -> Result<(), SinkError> {
        let encoder = encoder_for_path(destination)
            .ok_or_else(|| SinkError::UnsupportedDestination(destination.display().to_string()))?;
        self.write_with(encoder.as_ref(), destination, method).await
    }

    /// Write with an explicit encoder.
    pub async fn write_with(
        &self,
        encoder: &dyn PyramidEncoder,
        destination: &Path,
        method: ResampleMethod,
    ) -> Result<(), SinkError> {
        let pyramid = Arc::new(self.build(method).await?);
        let (width, height) = pyramid.size();
        encoder.write(pyramid.clone(), destination).await?;

        self.inner.write().await.state = SinkState::Finalized;
        info!(
            destination = %destination.display(),
            encoder = encoder.name(),
            width,
            height,
            levels = pyramid.levels.len(),
            frames = pyramid.frame_count(),
            "wrote pyramid"
        );
        Ok(())
    }
}

/// Extend every frame key with zeros for `added` new trailing axes.
fn pad_frame_keys(levels: &mut BTreeMap<u32, Level>, added: usize) {
    if added == 0 {
        return;
    }
    for level in levels.values_mut() {
        level.frames = pad_keys(std::mem::take(&mut level.frames), added);
        level.written = pad_keys(std::mem::take(&mut level.written), added);
    }
}

fn pad_keys<V>(map: BTreeMap<Vec<usize>, V>, added: usize) -> BTreeMap<Vec<usize>, V> {
    map.into_iter()
        .map(|(mut k, v)| {
            k.resize(k.len() + added, 0);
            (k, v)
        })
        .collect()
}

fn derive_levels(
    base: Vec<PixelArray>,
    explicit: &HashMap<u32, Vec<(usize, PixelArray, Mask)>>,
    count: u32,
    method: ResampleMethod,
) -> Vec<Vec<PixelArray>> {
    let mut levels = vec![base];
    for l in 1..count {
        let Some(previous) = levels.last() else {
            break;
        };
        let mut next: Vec<PixelArray> = previous
            .par_iter()
            .map(|frame| downsample_2x(frame, method))
            .collect();
        if let Some(written) = explicit.get(&l) {
            for (frame, array, mask) in written {
                if let Some(target) = next.get_mut(*frame) {
                    target.blit(array, 0, 0, Some(mask));
                }
            }
        }
        levels.push(next);
    }
    levels
}

/// Crop each level by `floor(edge / 2^level)`, dropping levels made empty
/// or superfluous by the smaller size.
fn crop_levels(levels: Vec<Vec<PixelArray>>, crop: CropRect) -> Result<Vec<Vec<PixelArray>>, SinkError> {
    let mut out = Vec::with_capacity(levels.len());
    for (l, frames) in levels.into_iter().enumerate() {
        let factor = 1u64 << l.min(63);
        let Some(first) = frames.first() else {
            break;
        };
        let (level_w, level_h) = (first.width() as u64, first.height() as u64);
        let left = (crop.left as u64 / factor).min(level_w);
        let top = (crop.top as u64 / factor).min(level_h);
        let right = ((crop.left as u64 + crop.width as u64) / factor).clamp(left, level_w);
        let bottom = ((crop.top as u64 + crop.height as u64) / factor).clamp(top, level_h);
        if right == left || bottom == top {
            break;
        }
        out.push(
            frames
                .iter()
                .map(|a| {
                    a.crop(
                        left as usize,
                        top as usize,
                        (right - left) as usize,
                        (bottom - top) as usize,
                    )
                })
                .collect::<Vec<_>>(),
        );
    }

    let Some(base) = out.first().and_then(|frames| frames.first()) else {
        return Err(SinkError::EmptySink);
    };
    let count = level_count(base.width() as u32, base.height() as u32, SINK_TILE_SIZE, SINK_TILE_SIZE);
    out.truncate(count as usize);
    Ok(out)
}
