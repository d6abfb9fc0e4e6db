//! The engine façade over an open source.
//!
//! [`ImageSource`] combines a pinned [`SourceHandle`] with the shared
//! [`TileCache`]. It validates addresses, applies render parameters (band
//! selection, PNG/JPEG encoding), composes regions from cached tiles and
//! exposes the scale algebra against the source's calibration.
//!
//! # Region composition
//!
//! A region request is resolved to a base-pixel rectangle, the output size
//! is derived from the requested scale and optional `max_width` /
//! `max_height`, and the finest level not coarser than the output is chosen.
//! Covering tiles are fetched through the cache, stitched, cropped and
//! resampled to the output size.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::encoder::encode_array;
use super::iterator::{IteratorOptions, TileIterator, TileRecord};
use super::{RenderParams, SourceMetadata, TileAddress, TileFormat, TilePayload, TileSource};
use crate::array::PixelArray;
use crate::cache::{CacheKey, SourceFingerprint, SourceHandle, TileCache};
use crate::error::TileError;
use crate::resample::{resize, ResampleMethod};
use crate::scale::{
    self, Calibration, LevelRounding, MagnificationInfo, Rect, RegionDescriptor, ScaleDescriptor, Units,
};

// =============================================================================
// Requests and results
// =============================================================================

/// Parameters of a region request.
#[derive(Debug, Clone, Default)]
pub struct RegionOptions {
    /// Area to read; `None` is the whole image
    pub region: Option<RegionDescriptor>,
    /// Output scale; `None` is native
    pub scale: Option<ScaleDescriptor>,
    /// Fit the output within this width, preserving aspect
    pub max_width: Option<u32>,
    /// Fit the output within this height, preserving aspect
    pub max_height: Option<u32>,
    pub frame: usize,
    pub params: RenderParams,
    /// Filter used when the output is smaller than the chosen level
    pub method: ResampleMethod,
}

impl RegionOptions {
    pub fn new(region: RegionDescriptor) -> Self {
        Self {
            region: Some(region),
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: ScaleDescriptor) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_max_size(mut self, max_width: Option<u32>, max_height: Option<u32>) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn with_frame(mut self, frame: usize) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_params(mut self, params: RenderParams) -> Self {
        self.params = params;
        self
    }
}

/// A composed region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionResult {
    pub payload: TilePayload,
    pub format: TileFormat,
    pub width: usize,
    pub height: usize,
}

impl RegionResult {
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Sample values at one point.
#[derive(Debug, Clone)]
pub struct PixelValue {
    /// One value per band; empty outside the image
    pub bands: Vec<f64>,
    /// The tile containing the point, when requested
    pub tile: Option<TileRecord>,
}

/// Where and how large a composed region is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RegionPlan {
    pub level: u32,
    /// Covered rectangle in base pixels
    pub base: Rect,
    pub out_width: usize,
    pub out_height: usize,
}

// =============================================================================
// ImageSource
// =============================================================================

/// An open source plus the cache it reads through.
///
/// Cloning is cheap and keeps the handle pinned.
#[derive(Clone)]
pub struct ImageSource {
    handle: SourceHandle,
    cache: Arc<TileCache>,
    /// Associated images larger than this on either side are shrunk to fit
    max_small_image_size: Option<u32>,
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSource")
            .field("fingerprint", self.handle.fingerprint())
            .finish()
    }
}

impl ImageSource {
    pub fn new(handle: SourceHandle, cache: Arc<TileCache>) -> Self {
        Self {
            handle,
            cache,
            max_small_image_size: None,
        }
    }

    pub fn with_max_small_image_size(mut self, size: u32) -> Self {
        self.max_small_image_size = Some(size.max(1));
        self
    }

    pub fn fingerprint(&self) -> &SourceFingerprint {
        self.handle.fingerprint()
    }

    pub fn handle(&self) -> &SourceHandle {
        &self.handle
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn metadata(&self) -> &SourceMetadata {
        self.handle.metadata()
    }

    pub fn calibration(&self) -> Calibration {
        self.handle.calibration()
    }

    // -------------------------------------------------------------------------
    // Tiles
    // -------------------------------------------------------------------------

    /// Fetch one tile through the cache.
    pub async fn get_tile(&self, address: TileAddress, params: &RenderParams) -> Result<TilePayload, TileError> {
        self.metadata()
            .check_address(address.level, address.x, address.y, address.frame)?;
        if let Some(bands) = &params.bands {
            self.check_bands(bands)?;
        }

        let key = CacheKey::new(self.fingerprint().clone(), address, params.clone());
        let source = self.handle.source().clone();
        self.cache
            .get_or_compute(key, || async move {
                let array = source
                    .read_tile(address.level, address.x, address.y, address.frame)
                    .await?;
                render(array, params)
            })
            .await
    }

    /// Native pixels of one tile, cached under the default render parameters.
    pub(crate) async fn tile_pixels(&self, address: TileAddress) -> Result<Arc<PixelArray>, TileError> {
        match self.get_tile(address, &RenderParams::pixels()).await? {
            TilePayload::Pixels(array) => Ok(array),
            TilePayload::Encoded { .. } => Err(TileError::SourceDecode {
                message: "pixel tile cached as encoded bytes".into(),
            }),
        }
    }

    fn check_bands(&self, bands: &[usize]) -> Result<(), TileError> {
        let count = self.metadata().band_count;
        match bands.iter().find(|&&b| b >= count) {
            Some(&band) => Err(TileError::InvalidBand { band, bands: count }),
            None => Ok(()),
        }
    }

    /// Lazy iterator over the tiles of a region.
    pub fn tile_iterator(&self, options: IteratorOptions) -> Result<TileIterator, TileError> {
        if let Some(bands) = &options.params.bands {
            self.check_bands(bands)?;
        }
        TileIterator::new(self.clone(), options)
    }

    // -------------------------------------------------------------------------
    // Regions
    // -------------------------------------------------------------------------

    /// Resolve a region request to a level, base rectangle and output size.
    ///
    /// `None` means the request cannot be satisfied (exact scale unavailable
    /// or an empty area).
    pub(crate) fn plan_region(
        &self,
        region: Option<&RegionDescriptor>,
        scale: Option<&ScaleDescriptor>,
        max_width: Option<u32>,
        max_height: Option<u32>,
    ) -> Result<Option<RegionPlan>, TileError> {
        let meta = self.metadata();
        let calibration = meta.calibration();
        let scale = scale.filter(|s| !s.is_native() || s.exact);

        if let Some(scale) = scale {
            if scale.exact
                && scale::level_for_magnification(&calibration, scale, LevelRounding::Round).is_none()
            {
                return Ok(None);
            }
        }

        let full = RegionDescriptor::full();
        let base = region
            .unwrap_or(&full)
            .to_base_rect(&calibration, scale)?
            .clip(meta.size_x as f64, meta.size_y as f64);
        if base.width <= 0.0 || base.height <= 0.0 {
            return Ok(None);
        }

        let (fx, fy) = calibration.scale_factors(scale)?;
        let mut out_w = (base.width / fx).round().max(1.0);
        let mut out_h = (base.height / fy).round().max(1.0);
        let fit = [
            max_width.map(|w| w as f64 / out_w),
            max_height.map(|h| h as f64 / out_h),
        ]
        .into_iter()
        .flatten()
        .fold(f64::INFINITY, f64::min);
        if fit < 1.0 {
            out_w = (out_w * fit).round().max(1.0);
            out_h = (out_h * fit).round().max(1.0);
        }

        let downsample = (base.width / out_w).min(base.height / out_h);
        let steps = if downsample > 1.0 {
            (downsample.log2() + 1e-9).floor() as u32
        } else {
            0
        };
        let level = meta.max_level().saturating_sub(steps);

        Ok(Some(RegionPlan {
            level,
            base,
            out_width: out_w as usize,
            out_height: out_h as usize,
        }))
    }

    /// Stitch and resample the pixels of a plan.
    pub(crate) async fn compose(
        &self,
        plan: &RegionPlan,
        frame: usize,
        method: ResampleMethod,
    ) -> Result<PixelArray, TileError> {
        let meta = self.metadata();
        let level = plan.level;
        let scale = meta.level_scale(level) as f64;
        let (level_w, level_h) = meta.level_size(level);
        let (tw, th) = (meta.tile_width, meta.tile_height);

        let x0 = ((plan.base.left / scale).floor() as u32).min(level_w - 1);
        let y0 = ((plan.base.top / scale).floor() as u32).min(level_h - 1);
        let x1 = ((plan.base.right() / scale).ceil() as u32).clamp(x0 + 1, level_w);
        let y1 = ((plan.base.bottom() / scale).ceil() as u32).clamp(y0 + 1, level_h);

        debug!(
            source = %self.fingerprint(),
            level,
            x0, y0, x1, y1,
            out_width = plan.out_width,
            out_height = plan.out_height,
            "composing region"
        );

        let mut canvas = PixelArray::new(
            (x1 - x0) as usize,
            (y1 - y0) as usize,
            meta.band_count,
            meta.dtype,
        );
        for ty in y0 / th..=(y1 - 1) / th {
            for tx in x0 / tw..=(x1 - 1) / tw {
                let tile = self
                    .tile_pixels(TileAddress::new(level, tx, ty).with_frame(frame))
                    .await?;
                let (ox, oy) = (tx * tw, ty * th);
                let left = x0.max(ox);
                let top = y0.max(oy);
                let right = x1.min(ox + tile.width() as u32);
                let bottom = y1.min(oy + tile.height() as u32);
                if right <= left || bottom <= top {
                    continue;
                }
                let part = tile.crop(
                    (left - ox) as usize,
                    (top - oy) as usize,
                    (right - left) as usize,
                    (bottom - top) as usize,
                );
                canvas.blit(&part, (left - x0) as usize, (top - y0) as usize, None);
            }
        }

        let (out_w, out_h) = (plan.out_width, plan.out_height);
        if (canvas.width(), canvas.height()) == (out_w, out_h) {
            return Ok(canvas);
        }
        tokio::task::spawn_blocking(move || resize(&canvas, out_w, out_h, method))
            .await
            .map_err(|e| TileError::SourceDecode {
                message: format!("resample task failed: {e}"),
            })
    }

    fn empty_region(&self, params: &RenderParams) -> RegionResult {
        let meta = self.metadata();
        let bands = params.bands.as_ref().map_or(meta.band_count, Vec::len);
        let payload = match params.format {
            TileFormat::Pixels => TilePayload::Pixels(Arc::new(PixelArray::new(0, 0, bands, meta.dtype))),
            TileFormat::Encoded => TilePayload::Encoded {
                data: Bytes::new(),
                encoding: params.encoding,
            },
        };
        RegionResult {
            payload,
            format: params.format,
            width: 0,
            height: 0,
        }
    }

    /// Compose a region at a scale.
    ///
    /// An exact scale the source cannot serve, or an area outside the
    /// image, yields an empty result rather than an error.
    pub async fn get_region(&self, options: RegionOptions) -> Result<RegionResult, TileError> {
        self.metadata().check_address(self.metadata().max_level(), 0, 0, options.frame)?;
        if let Some(bands) = &options.params.bands {
            self.check_bands(bands)?;
        }

        let Some(plan) = self.plan_region(
            options.region.as_ref(),
            options.scale.as_ref(),
            options.max_width,
            options.max_height,
        )?
        else {
            return Ok(self.empty_region(&options.params));
        };

        let array = self.compose(&plan, options.frame, options.method).await?;
        let (width, height) = (array.width(), array.height());
        let params = options.params;
        let payload = tokio::task::spawn_blocking(move || render(array, &params))
            .await
            .map_err(|e| TileError::Encode {
                message: format!("encode task failed: {e}"),
            })??;
        Ok(RegionResult {
            format: payload_format(&payload),
            payload,
            width,
            height,
        })
    }

    /// Region given at one scale, returned at another.
    pub async fn get_region_at_another_scale(
        &self,
        source_region: &RegionDescriptor,
        source_scale: Option<&ScaleDescriptor>,
        target_scale: Option<ScaleDescriptor>,
        mut options: RegionOptions,
    ) -> Result<RegionResult, TileError> {
        if options.region.is_some() {
            return Err(TileError::MutuallyExclusiveArguments(
                "region and source_region cannot both be given".into(),
            ));
        }
        options.region = Some(self.to_base_region(source_region, source_scale)?);
        options.scale = target_scale;
        self.get_region(options).await
    }

    /// Tile iterator over a region given at one scale, iterated at another.
    pub fn tile_iterator_at_another_scale(
        &self,
        source_region: &RegionDescriptor,
        source_scale: Option<&ScaleDescriptor>,
        target_scale: Option<ScaleDescriptor>,
        mut options: IteratorOptions,
    ) -> Result<TileIterator, TileError> {
        if options.region.is_some() {
            return Err(TileError::MutuallyExclusiveArguments(
                "region and source_region cannot both be given".into(),
            ));
        }
        options.region = Some(self.to_base_region(source_region, source_scale)?);
        options.scale = target_scale;
        self.tile_iterator(options)
    }

    fn to_base_region(
        &self,
        region: &RegionDescriptor,
        scale: Option<&ScaleDescriptor>,
    ) -> Result<RegionDescriptor, TileError> {
        let base = region.to_base_rect(&self.calibration(), scale)?;
        Ok(RegionDescriptor::rect(
            base.left,
            base.top,
            base.width,
            base.height,
            Units::BasePixels,
        ))
    }

    // -------------------------------------------------------------------------
    // Points
    // -------------------------------------------------------------------------

    /// Sample values at a point.
    ///
    /// The point is read from the finest level not coarser than `scale`.
    pub async fn get_pixel(
        &self,
        point: &RegionDescriptor,
        scale: Option<&ScaleDescriptor>,
        frame: usize,
        include_tile_record: bool,
    ) -> Result<PixelValue, TileError> {
        let meta = self.metadata();
        let calibration = meta.calibration();
        let base = point.to_base_rect(&calibration, scale)?;
        if base.left < 0.0
            || base.top < 0.0
            || base.left >= meta.size_x as f64
            || base.top >= meta.size_y as f64
        {
            return Ok(PixelValue {
                bands: Vec::new(),
                tile: None,
            });
        }

        let level = match scale {
            Some(scale) if scale.exact => {
                match scale::level_for_magnification(&calibration, scale, LevelRounding::Round) {
                    Some(level) => level as u32,
                    None => {
                        return Ok(PixelValue {
                            bands: Vec::new(),
                            tile: None,
                        })
                    }
                }
            }
            Some(scale) if !scale.is_native() => {
                scale::level_for_magnification(&calibration, scale, LevelRounding::Ceil)
                    .map_or(meta.max_level(), |l| l as u32)
            }
            _ => meta.max_level(),
        };
        let factor = meta.level_scale(level) as f64;
        let (level_w, level_h) = meta.level_size(level);
        let lx = ((base.left / factor).floor() as u32).min(level_w - 1);
        let ly = ((base.top / factor).floor() as u32).min(level_h - 1);
        let (tw, th) = (meta.tile_width, meta.tile_height);
        let address = TileAddress::new(level, lx / tw, ly / th).with_frame(frame);

        let tile = self.tile_pixels(address).await?;
        let bands = tile.pixel((lx % tw) as usize, (ly % th) as usize).to_vec();
        let tile = include_tile_record.then(|| TileRecord::native_tile(self.clone(), address, RenderParams::pixels()));
        Ok(PixelValue { bands, tile })
    }

    // -------------------------------------------------------------------------
    // Scale algebra
    // -------------------------------------------------------------------------

    pub fn convert_region_scale(
        &self,
        region: &RegionDescriptor,
        source_scale: Option<&ScaleDescriptor>,
        target_scale: Option<&ScaleDescriptor>,
        target_units: Option<Units>,
    ) -> Result<RegionDescriptor, TileError> {
        Ok(scale::convert_region(
            &self.calibration(),
            region,
            source_scale,
            target_scale,
            target_units,
        )?)
    }

    pub fn level_for_magnification(&self, scale: &ScaleDescriptor, rounding: LevelRounding) -> Option<f64> {
        scale::level_for_magnification(&self.calibration(), scale, rounding)
    }

    pub fn point_at_another_scale(
        &self,
        point: (f64, f64),
        source_scale: Option<&ScaleDescriptor>,
        source_units: Units,
        target_scale: Option<&ScaleDescriptor>,
        target_units: Units,
    ) -> Result<(f64, f64), TileError> {
        Ok(scale::point_at_another_scale(
            &self.calibration(),
            point,
            source_scale,
            source_units,
            target_scale,
            target_units,
        )?)
    }

    pub fn magnification_for_level(&self, level: Option<u32>) -> MagnificationInfo {
        self.calibration().magnification_for_level(level)
    }

    // -------------------------------------------------------------------------
    // Associated images
    // -------------------------------------------------------------------------

    pub fn associated_images(&self) -> Vec<String> {
        self.handle.associated_image_names()
    }

    pub async fn associated_image(&self, name: &str) -> Result<Option<PixelArray>, TileError> {
        let Some(image) = self.handle.associated_image(name).await? else {
            return Ok(None);
        };
        let Some(limit) = self.max_small_image_size.map(|l| l as usize) else {
            return Ok(Some(image));
        };
        let (width, height) = (image.width(), image.height());
        if width <= limit && height <= limit {
            return Ok(Some(image));
        }
        let factor = (limit as f64 / width as f64).min(limit as f64 / height as f64);
        let fitted_width = ((width as f64 * factor).round() as usize).clamp(1, limit);
        let fitted_height = ((height as f64 * factor).round() as usize).clamp(1, limit);
        debug!(name, width, height, fitted_width, fitted_height, "shrinking associated image");
        let fitted = tokio::task::spawn_blocking(move || {
            resize(&image, fitted_width, fitted_height, ResampleMethod::Mean)
        })
        .await
        .map_err(|e| TileError::SourceDecode {
            message: format!("resample task failed: {e}"),
        })?;
        Ok(Some(fitted))
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Apply band selection and output format to decoded pixels.
pub(crate) fn render(array: PixelArray, params: &RenderParams) -> Result<TilePayload, TileError> {
    let array = match &params.bands {
        Some(bands) => array.select_bands(bands).ok_or_else(|| TileError::InvalidBand {
            band: bands.iter().copied().max().unwrap_or(0),
            bands: array.bands(),
        })?,
        None => array,
    };
    match params.format {
        TileFormat::Pixels => Ok(TilePayload::Pixels(Arc::new(array))),
        TileFormat::Encoded => Ok(TilePayload::Encoded {
            data: encode_array(&array, params.encoding)?,
            encoding: params.encoding,
        }),
    }
}

fn payload_format(payload: &TilePayload) -> TileFormat {
    match payload {
        TilePayload::Pixels(_) => TileFormat::Pixels,
        TilePayload::Encoded { .. } => TileFormat::Encoded,
    }
}
