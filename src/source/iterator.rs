//! Lazy tile iteration.
//!
//! A [`TileIterator`] walks the tiles covering a region, frames outermost and
//! then row-major. Records are computed from grid arithmetic only; pixel data
//! is fetched when [`TileRecord::tile`] is first awaited and memoized in the
//! record.
//!
//! Two grids are possible:
//!
//! - **Native**: the source's own tiles at the chosen level, cropped to the
//!   region at the edges.
//! - **Output**: a grid laid over the requested output scale, used when
//!   resampling between levels or when a custom tile size is requested.
//!   Each record's payload is a composed region.

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::image_source::{render, ImageSource};
use super::{RenderParams, TileAddress, TilePayload};
use crate::error::TileError;
use crate::resample::ResampleMethod;
use crate::scale::{self, LevelRounding, MagnificationInfo, Rect, RegionDescriptor, ScaleDescriptor};

/// Parameters of a tile iteration.
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Area to cover; `None` is the whole image
    pub region: Option<RegionDescriptor>,
    /// Iteration scale; `None` is native
    pub scale: Option<ScaleDescriptor>,
    /// A single frame; `None` iterates every frame
    pub frame: Option<usize>,
    /// Produce tiles at exactly the requested scale between levels
    pub resample: bool,
    /// Output tile size; defaults to the source's tile size
    pub tile_size: Option<(u32, u32)>,
    pub params: RenderParams,
}

impl IteratorOptions {
    pub fn with_region(mut self, region: RegionDescriptor) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_scale(mut self, scale: ScaleDescriptor) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_frame(mut self, frame: usize) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_resample(mut self, resample: bool) -> Self {
        self.resample = resample;
        self
    }

    pub fn with_tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_size = Some((width.max(1), height.max(1)));
        self
    }

    pub fn with_params(mut self, params: RenderParams) -> Self {
        self.params = params;
        self
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone)]
enum Fetch {
    /// A native tile, optionally cropped (x, y, width, height in tile pixels)
    Native { crop: Option<(u32, u32, u32, u32)> },
    /// A composed region of exactly `width x height` output pixels
    Composed { base: Rect },
}

/// One tile of an iteration.
#[derive(Debug, Clone)]
pub struct TileRecord {
    pub address: TileAddress,
    /// Left edge in pixels of the iterated level or output grid
    pub x: u32,
    /// Top edge in pixels of the iterated level or output grid
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Scale of the iterated grid
    pub magnification: MagnificationInfo,
    /// Covered area in base pixels
    pub base: Rect,
    source: ImageSource,
    params: RenderParams,
    fetch: Fetch,
    payload: Arc<OnceCell<TilePayload>>,
}

impl TileRecord {
    /// A record for one whole native tile.
    pub(crate) fn native_tile(source: ImageSource, address: TileAddress, params: RenderParams) -> Self {
        let meta = source.metadata();
        let (level_w, level_h) = meta.level_size(address.level);
        let x = address.x * meta.tile_width;
        let y = address.y * meta.tile_height;
        let width = meta.tile_width.min(level_w - x);
        let height = meta.tile_height.min(level_h - y);
        let scale = meta.level_scale(address.level) as f64;
        Self {
            address,
            x,
            y,
            width,
            height,
            magnification: meta.calibration().magnification_for_level(Some(address.level)),
            base: Rect {
                left: x as f64 * scale,
                top: y as f64 * scale,
                width: width as f64 * scale,
                height: height as f64 * scale,
            },
            params,
            fetch: Fetch::Native { crop: None },
            source,
            payload: Arc::new(OnceCell::new()),
        }
    }

    /// The tile payload, fetched on first call and memoized.
    pub async fn tile(&self) -> Result<TilePayload, TileError> {
        self.payload.get_or_try_init(|| self.fetch()).await.cloned()
    }

    /// Whether the payload has been fetched.
    pub fn is_loaded(&self) -> bool {
        self.payload.initialized()
    }

    async fn fetch(&self) -> Result<TilePayload, TileError> {
        match &self.fetch {
            Fetch::Native { crop: None } => self.source.get_tile(self.address, &self.params).await,
            Fetch::Native {
                crop: Some((x, y, w, h)),
            } => {
                let tile = self.source.tile_pixels(self.address).await?;
                let part = tile.crop(*x as usize, *y as usize, *w as usize, *h as usize);
                render(part, &self.params)
            }
            Fetch::Composed { base } => {
                let plan = super::image_source::RegionPlan {
                    level: self.address.level,
                    base: *base,
                    out_width: self.width as usize,
                    out_height: self.height as usize,
                };
                let array = self
                    .source
                    .compose(&plan, self.address.frame, ResampleMethod::Mean)
                    .await?;
                render(array, &self.params)
            }
        }
    }
}

// =============================================================================
// Iterator
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Grid {
    Native,
    /// Base pixels per output pixel
    Output { fx: f64, fy: f64 },
}

#[derive(Debug, Clone)]
struct Plan {
    grid: Grid,
    level: u32,
    /// Covered area in grid pixels: x0, y0, x1, y1 (exclusive)
    bounds: (u32, u32, u32, u32),
    tile_width: u32,
    tile_height: u32,
    magnification: MagnificationInfo,
}

/// Forward-only iterator over [`TileRecord`]s.
#[derive(Debug)]
pub struct TileIterator {
    source: ImageSource,
    params: RenderParams,
    plan: Option<Plan>,
    frames: Vec<usize>,
    frame_pos: usize,
    col: u32,
    row: u32,
}

impl TileIterator {
    pub(crate) fn new(source: ImageSource, options: IteratorOptions) -> Result<Self, TileError> {
        let meta = source.metadata();
        let frames = match options.frame {
            Some(frame) => {
                meta.check_address(meta.max_level(), 0, 0, frame)?;
                vec![frame]
            }
            None => (0..meta.frame_count()).collect(),
        };
        let plan = Self::plan(&source, &options)?;
        let (col, row) = plan
            .as_ref()
            .map_or((0, 0), |p| (p.bounds.0 / p.tile_width, p.bounds.1 / p.tile_height));
        Ok(Self {
            params: options.params,
            source,
            plan,
            frames,
            frame_pos: 0,
            col,
            row,
        })
    }

    fn plan(source: &ImageSource, options: &IteratorOptions) -> Result<Option<Plan>, TileError> {
        let meta = source.metadata();
        let calibration = meta.calibration();
        let scale = options.scale.as_ref().filter(|s| !s.is_native() || s.exact);

        if let Some(scale) = scale {
            if scale.exact
                && scale::level_for_magnification(&calibration, scale, LevelRounding::Round).is_none()
            {
                return Ok(None);
            }
        }

        let full = RegionDescriptor::full();
        let base = options
            .region
            .as_ref()
            .unwrap_or(&full)
            .to_base_rect(&calibration, scale)?
            .clip(meta.size_x as f64, meta.size_y as f64);
        if base.width <= 0.0 || base.height <= 0.0 {
            return Ok(None);
        }

        let level = scale
            .and_then(|s| scale::level_for_magnification(&calibration, s, LevelRounding::Ceil))
            .map_or(meta.max_level(), |l| l as u32);
        let fractional = scale
            .and_then(|s| scale::level_for_magnification(&calibration, s, LevelRounding::Fractional))
            .is_some_and(|l| (l - l.round()).abs() > 1e-4);
        let native_tiles = (meta.tile_width, meta.tile_height);
        let (tile_width, tile_height) = options.tile_size.unwrap_or(native_tiles);

        if options.resample && fractional {
            let (fx, fy) = calibration.scale_factors(scale)?;
            let native = calibration.magnification_for_level(None);
            let magnification = MagnificationInfo {
                magnification: native.magnification.map(|m| m / fx),
                mm_x: native.mm_x.map(|mm| mm * fx),
                mm_y: native.mm_y.map(|mm| mm * fy),
                level,
                scale: fx,
            };
            return Ok(Some(Plan {
                grid: Grid::Output { fx, fy },
                level,
                bounds: grid_bounds(&base, fx, fy, meta.size_x, meta.size_y),
                tile_width,
                tile_height,
                magnification,
            }));
        }

        let factor = meta.level_scale(level) as f64;
        let magnification = calibration.magnification_for_level(Some(level));
        let grid = if (tile_width, tile_height) == native_tiles {
            Grid::Native
        } else {
            Grid::Output {
                fx: factor,
                fy: factor,
            }
        };
        Ok(Some(Plan {
            grid,
            level,
            bounds: grid_bounds(&base, factor, factor, meta.size_x, meta.size_y),
            tile_width,
            tile_height,
            magnification,
        }))
    }

    fn record(&self, plan: &Plan, frame: usize, col: u32, row: u32) -> Option<TileRecord> {
        let (x0, y0, x1, y1) = plan.bounds;
        let (tw, th) = (plan.tile_width, plan.tile_height);
        let (ox, oy) = (col * tw, row * th);
        let left = x0.max(ox);
        let top = y0.max(oy);
        let right = x1.min(ox + tw);
        let bottom = y1.min(oy + th);
        if right <= left || bottom <= top {
            return None;
        }
        let (width, height) = (right - left, bottom - top);
        let address = TileAddress::new(plan.level, col, row).with_frame(frame);

        let (fx, fy, fetch) = match plan.grid {
            Grid::Native => {
                let meta = self.source.metadata();
                let (level_w, level_h) = meta.level_size(plan.level);
                let full_w = tw.min(level_w - ox);
                let full_h = th.min(level_h - oy);
                let crop = (left != ox || top != oy || width != full_w || height != full_h)
                    .then_some((left - ox, top - oy, width, height));
                let factor = meta.level_scale(plan.level) as f64;
                (factor, factor, Fetch::Native { crop })
            }
            Grid::Output { fx, fy } => {
                let base = Rect {
                    left: left as f64 * fx,
                    top: top as f64 * fy,
                    width: width as f64 * fx,
                    height: height as f64 * fy,
                };
                (fx, fy, Fetch::Composed { base })
            }
        };

        Some(TileRecord {
            address,
            x: left,
            y: top,
            width,
            height,
            magnification: plan.magnification,
            base: Rect {
                left: left as f64 * fx,
                top: top as f64 * fy,
                width: width as f64 * fx,
                height: height as f64 * fy,
            },
            source: self.source.clone(),
            params: self.params.clone(),
            fetch,
            payload: Arc::new(OnceCell::new()),
        })
    }
}

/// Grid-pixel bounds of a base rectangle, clipped to the scaled image.
fn grid_bounds(base: &Rect, fx: f64, fy: f64, size_x: u32, size_y: u32) -> (u32, u32, u32, u32) {
    let max_x = ((size_x as f64 / fx).floor() as u32).max(1);
    let max_y = ((size_y as f64 / fy).floor() as u32).max(1);
    let x0 = ((base.left / fx).floor() as u32).min(max_x - 1);
    let y0 = ((base.top / fy).floor() as u32).min(max_y - 1);
    let x1 = ((base.right() / fx).ceil() as u32).clamp(x0 + 1, max_x);
    let y1 = ((base.bottom() / fy).ceil() as u32).clamp(y0 + 1, max_y);
    (x0, y0, x1, y1)
}

impl Iterator for TileIterator {
    type Item = TileRecord;

    fn next(&mut self) -> Option<TileRecord> {
        let plan = self.plan.clone()?;
        let (x0, y0, x1, y1) = plan.bounds;
        let first_col = x0 / plan.tile_width;
        let last_col = (x1 - 1) / plan.tile_width;
        let last_row = (y1 - 1) / plan.tile_height;

        while self.frame_pos < self.frames.len() {
            if self.row > last_row {
                self.frame_pos += 1;
                self.row = y0 / plan.tile_height;
                self.col = first_col;
                continue;
            }
            let (col, row) = (self.col, self.row);
            if self.col >= last_col {
                self.col = first_col;
                self.row += 1;
            } else {
                self.col += 1;
            }
            if let Some(record) = self.record(&plan, self.frames[self.frame_pos], col, row) {
                return Some(record);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{SourceFingerprint, SourceHandleCache, TileCache};
    use crate::source::synthetic::{pattern_value, SyntheticOptions, SyntheticSource};
    use crate::source::{FrameAxes, OpenOptions, TileSource};
    use crate::scale::Units;

    async fn open(options: SyntheticOptions) -> ImageSource {
        let handles = SourceHandleCache::new(4);
        let handle = handles
            .get_or_open(SourceFingerprint::for_label("iter", &OpenOptions::default()), || async move {
                Ok(Arc::new(SyntheticSource::new(options)) as Arc<dyn TileSource>)
            })
            .await
            .unwrap();
        ImageSource::new(handle, Arc::new(TileCache::memory(64 << 20)))
    }

    fn small() -> SyntheticOptions {
        SyntheticOptions {
            size_x: 1000,
            size_y: 600,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_iteration_is_row_major() {
        let source = open(small()).await;
        let records: Vec<_> = source.tile_iterator(IteratorOptions::default()).unwrap().collect();
        assert_eq!(records.len(), 12);
        let coords: Vec<_> = records.iter().map(|r| (r.address.x, r.address.y)).collect();
        assert_eq!(&coords[..5], &[(0, 0), (1, 0), (2, 0), (3, 0), (0, 1)]);

        let last = records.last().unwrap();
        assert_eq!((last.x, last.y, last.width, last.height), (768, 512, 232, 88));
        let tile = last.tile().await.unwrap();
        let pixels = tile.as_pixels().unwrap();
        assert_eq!((pixels.width(), pixels.height()), (232, 88));
    }

    #[tokio::test]
    async fn test_payload_is_lazy_and_memoized() {
        let source = open(small()).await;
        let record = source.tile_iterator(IteratorOptions::default()).unwrap().next().unwrap();
        assert!(!record.is_loaded());
        let first = record.tile().await.unwrap();
        assert!(record.is_loaded());
        let second = record.tile().await.unwrap();
        assert!(Arc::ptr_eq(first.as_pixels().unwrap(), second.as_pixels().unwrap()));
    }

    #[tokio::test]
    async fn test_region_crops_edge_tiles() {
        let source = open(small()).await;
        let options = IteratorOptions::default()
            .with_region(RegionDescriptor::rect(200.0, 100.0, 100.0, 50.0, Units::Pixels));
        let records: Vec<_> = source.tile_iterator(options).unwrap().collect();
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].x, records[0].width), (200, 56));
        assert_eq!((records[1].x, records[1].width), (256, 44));

        let tile = records[1].tile().await.unwrap();
        let pixels = tile.as_pixels().unwrap();
        assert_eq!((pixels.width(), pixels.height()), (44, 50));
        assert_eq!(pixels.get(0, 0, 0), pattern_value(256, 100, 0, 0));
    }

    #[tokio::test]
    async fn test_frames_are_outermost() {
        let source = open(SyntheticOptions {
            size_x: 512,
            size_y: 256,
            frames: FrameAxes::parse("c=2").unwrap(),
            ..Default::default()
        })
        .await;
        let records: Vec<_> = source.tile_iterator(IteratorOptions::default()).unwrap().collect();
        let order: Vec<_> = records
            .iter()
            .map(|r| (r.address.frame, r.address.x))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        let single: Vec<_> = source
            .tile_iterator(IteratorOptions::default().with_frame(1))
            .unwrap()
            .collect();
        assert_eq!(single.len(), 2);
        assert!(source
            .tile_iterator(IteratorOptions::default().with_frame(2))
            .is_err());
    }

    #[tokio::test]
    async fn test_exact_mismatch_yields_nothing() {
        let source = open(small()).await;
        let options =
            IteratorOptions::default().with_scale(ScaleDescriptor::magnification(15.0).exact());
        assert_eq!(source.tile_iterator(options).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_scale_between_levels_uses_finer_level() {
        let source = open(small()).await;
        let options = IteratorOptions::default().with_scale(ScaleDescriptor::magnification(15.0));
        let records: Vec<_> = source.tile_iterator(options).unwrap().collect();
        assert!(records.iter().all(|r| r.address.level == 1));
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn test_resampled_output_grid() {
        let source = open(small()).await;
        let options = IteratorOptions::default()
            .with_scale(ScaleDescriptor::magnification(16.0))
            .with_resample(true);
        let records: Vec<_> = source.tile_iterator(options).unwrap().collect();
        // 1000x600 at 40x is 400x240 at 16x.
        assert_eq!(records.len(), 2);
        assert_eq!((records[1].x, records[1].width, records[1].height), (256, 144, 240));
        assert_eq!(records[0].magnification.magnification, Some(16.0));

        let tile = records[1].tile().await.unwrap();
        let pixels = tile.as_pixels().unwrap();
        assert_eq!((pixels.width(), pixels.height()), (144, 240));
    }

    #[tokio::test]
    async fn test_custom_tile_size() {
        let source = open(small()).await;
        let options = IteratorOptions::default().with_tile_size(500, 300);
        let records: Vec<_> = source.tile_iterator(options).unwrap().collect();
        assert_eq!(records.len(), 4);
        let tile = records[3].tile().await.unwrap();
        let pixels = tile.as_pixels().unwrap();
        assert_eq!((pixels.width(), pixels.height()), (500, 300));
        assert_eq!(pixels.get(0, 0, 2), pattern_value(500, 300, 2, 0));
    }
}
