//! Tiled pyramidal TIFF as a tile source.
//!
//! The directory chain is sorted into frame series and associated images:
//!
//! - the first tiled directory is the full-resolution image of frame 0
//! - a later tiled directory of the same size starts the next frame
//! - a smaller tiled directory is a reduced level of the current frame
//! - everything else (stripped or foreign directories) is an associated
//!   image, named `label` or `macro` from its description, else `thumbnail`
//!   for the first unnamed one
//!
//! Levels the file stores at exactly the requested downsample and tile size
//! are served block by block; other levels are composed from the nearest
//! finer directory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::parser::{Ifd, TiffHeader};
use super::tags::{dtype_for, Compression, TiffTag, SAMPLE_FORMAT_UINT};
use crate::array::{DType, PixelArray};
use crate::error::{FormatError, TiffError, TileError};
use crate::format::jpeg::decode_block;
use crate::format::manifest::PyramidManifest;
use crate::io::{FileRangeReader, RangeReader};
use crate::resample::{resize, ResampleMethod};
use crate::source::{FrameAxes, OpenOptions, SourceFactory, SourceMetadata, TileSource};

/// ResolutionUnit codes.
const RESOLUTION_UNIT_INCH: u64 = 2;
const RESOLUTION_UNIT_CM: u64 = 3;

// =============================================================================
// Directories
// =============================================================================

/// Layout of one image directory, with its block index loaded.
#[derive(Debug, Clone)]
struct Directory {
    width: u32,
    height: u32,
    /// Tile size, or full width by rows-per-strip for stripped images
    block_width: u32,
    block_height: u32,
    tiled: bool,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
    compression: Compression,
    bands: usize,
    dtype: DType,
    jpeg_tables: Option<Bytes>,
    description: String,
}

impl Directory {
    async fn load(reader: &dyn RangeReader, header: &TiffHeader, ifd: &Ifd) -> Result<Self, TiffError> {
        let width = ifd.require_uint(header, TiffTag::ImageWidth)? as u32;
        let height = ifd.require_uint(header, TiffTag::ImageLength)? as u32;
        let tiled = ifd.is_tiled();
        let (block_width, block_height, offsets_tag, counts_tag) = if tiled {
            (
                ifd.require_uint(header, TiffTag::TileWidth)? as u32,
                ifd.require_uint(header, TiffTag::TileLength)? as u32,
                TiffTag::TileOffsets,
                TiffTag::TileByteCounts,
            )
        } else {
            let rows = ifd.uint_or(header, TiffTag::RowsPerStrip, height as u64).min(height as u64);
            (width, rows as u32, TiffTag::StripOffsets, TiffTag::StripByteCounts)
        };
        if width == 0 || height == 0 || block_width == 0 || block_height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: "ImageWidth",
                message: format!("empty image or block ({width}x{height}, block {block_width}x{block_height})"),
            });
        }
        if ifd.uint_or(header, TiffTag::PlanarConfiguration, 1) != 1 {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::PlanarConfiguration.name(),
                message: "only chunky samples are supported".into(),
            });
        }

        let offsets = ifd
            .entry(offsets_tag)
            .ok_or(TiffError::MissingTag(offsets_tag.name()))?
            .read_uints(reader, header)
            .await?;
        let byte_counts = ifd
            .entry(counts_tag)
            .ok_or(TiffError::MissingTag(counts_tag.name()))?
            .read_uints(reader, header)
            .await?;
        let blocks = (width.div_ceil(block_width) as usize) * (height.div_ceil(block_height) as usize);
        if offsets.len() < blocks || byte_counts.len() < blocks {
            return Err(TiffError::InvalidTagValue {
                tag: offsets_tag.name(),
                message: format!("{} offsets for {blocks} blocks", offsets.len()),
            });
        }

        let bands = ifd.uint_or(header, TiffTag::SamplesPerPixel, 1).max(1) as usize;
        let bits = match ifd.entry(TiffTag::BitsPerSample) {
            Some(entry) => entry.read_uints(reader, header).await?.first().copied().unwrap_or(1),
            None => 1,
        };
        let sample_format = ifd.uint_or(header, TiffTag::SampleFormat, SAMPLE_FORMAT_UINT as u64);
        let dtype = dtype_for(bits as u16, sample_format as u16).ok_or(TiffError::InvalidTagValue {
            tag: TiffTag::BitsPerSample.name(),
            message: format!("{bits} bits with sample format {sample_format}"),
        })?;

        let compression = Compression::from_u16(ifd.uint_or(header, TiffTag::Compression, 1) as u16);
        let jpeg_tables = match ifd.entry(TiffTag::JpegTables) {
            Some(entry) => Some(entry.read_bytes(reader, header).await?),
            None => None,
        };
        let description = match ifd.entry(TiffTag::ImageDescription) {
            Some(entry) => entry.read_string(reader, header).await?,
            None => String::new(),
        };

        Ok(Self {
            width,
            height,
            block_width,
            block_height,
            tiled,
            offsets,
            byte_counts,
            compression,
            bands,
            dtype,
            jpeg_tables,
            description,
        })
    }

    fn columns(&self) -> u32 {
        self.width.div_ceil(self.block_width)
    }

    fn rows(&self) -> u32 {
        self.height.div_ceil(self.block_height)
    }

    /// Pixel size of a block; strips shrink at the bottom edge.
    fn block_size(&self, row: u32) -> (u32, u32) {
        if self.tiled {
            (self.block_width, self.block_height)
        } else {
            (self.width, self.block_height.min(self.height - row * self.block_height))
        }
    }
}

/// Calibration found in a directory's description or resolution tags.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct FoundCalibration {
    magnification: Option<f64>,
    mm_x: Option<f64>,
    mm_y: Option<f64>,
}

/// Aperio descriptions look like `Aperio Image Library v12|AppMag = 20|MPP = 0.499`.
fn aperio_calibration(description: &str) -> FoundCalibration {
    let mut found = FoundCalibration::default();
    if !description.contains("Aperio") {
        return found;
    }
    for part in description.split('|') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().parse::<f64>().ok().filter(|v| *v > 0.0);
        match key.trim() {
            "AppMag" => found.magnification = value,
            "MPP" => {
                found.mm_x = value.map(|mpp| mpp / 1000.0);
                found.mm_y = found.mm_x;
            }
            _ => {}
        }
    }
    found
}

async fn resolution_calibration(
    reader: &dyn RangeReader,
    header: &TiffHeader,
    ifd: &Ifd,
) -> Result<FoundCalibration, TiffError> {
    let Some(unit) = ifd.entry(TiffTag::ResolutionUnit).and_then(|e| e.inline_uint(header)) else {
        return Ok(FoundCalibration::default());
    };
    let mm_per_unit = match unit {
        RESOLUTION_UNIT_INCH => 25.4,
        RESOLUTION_UNIT_CM => 10.0,
        _ => return Ok(FoundCalibration::default()),
    };
    let x = read_rational(reader, header, ifd, TiffTag::XResolution).await?.filter(|v| *v > 0.0);
    let y = read_rational(reader, header, ifd, TiffTag::YResolution).await?.filter(|v| *v > 0.0);
    Ok(FoundCalibration {
        magnification: None,
        mm_x: x.map(|x| mm_per_unit / x),
        mm_y: y.or(x).map(|y| mm_per_unit / y),
    })
}

async fn read_rational(
    reader: &dyn RangeReader,
    header: &TiffHeader,
    ifd: &Ifd,
    tag: TiffTag,
) -> Result<Option<f64>, TiffError> {
    match ifd.entry(tag) {
        Some(entry) => entry.read_rational(reader, header).await,
        None => Ok(None),
    }
}

// =============================================================================
// Source
// =============================================================================

/// A reduced copy of a frame, `downsample` times smaller than the base.
#[derive(Debug)]
struct SeriesLevel {
    downsample: u32,
    directory: Directory,
}

/// An opened TIFF file.
pub struct TiffSource {
    reader: Arc<dyn RangeReader>,
    little_endian: bool,
    metadata: SourceMetadata,
    /// Per frame, finest first
    series: Vec<Vec<SeriesLevel>>,
    associated: Vec<(String, Directory)>,
}

impl TiffSource {
    pub async fn open(reader: Arc<dyn RangeReader>) -> Result<Self, FormatError> {
        let header = TiffHeader::read(reader.as_ref()).await?;
        let ifds = Ifd::read_chain(reader.as_ref(), &header).await?;

        let mut series: Vec<Vec<SeriesLevel>> = Vec::new();
        let mut associated: Vec<(Directory, usize)> = Vec::new();
        let mut base_calibration = FoundCalibration::default();
        for (index, ifd) in ifds.iter().enumerate() {
            let directory = match Directory::load(reader.as_ref(), &header, ifd).await {
                Ok(directory) => directory,
                Err(e) if series.is_empty() && ifd.is_tiled() => return Err(e.into()),
                Err(e) => {
                    warn!(source = reader.identifier(), index, error = %e, "skipping unreadable directory");
                    continue;
                }
            };

            let base = series.first().and_then(|s| s.first()).map(|l| &l.directory);
            match base {
                None if directory.tiled => {
                    if !directory.compression.is_supported() {
                        return Err(TiffError::UnsupportedCompression(directory.compression.name()).into());
                    }
                    base_calibration = aperio_calibration(&directory.description);
                    if base_calibration.mm_x.is_none() {
                        let resolution = resolution_calibration(reader.as_ref(), &header, ifd).await?;
                        base_calibration.mm_x = resolution.mm_x;
                        base_calibration.mm_y = resolution.mm_y;
                    }
                    series.push(vec![SeriesLevel {
                        downsample: 1,
                        directory,
                    }]);
                }
                Some(base)
                    if directory.tiled
                        && directory.compression.is_supported()
                        && (directory.width, directory.height) == (base.width, base.height)
                        && (directory.bands, directory.dtype) == (base.bands, base.dtype) =>
                {
                    series.push(vec![SeriesLevel {
                        downsample: 1,
                        directory,
                    }]);
                }
                Some(base)
                    if directory.tiled
                        && directory.compression.is_supported()
                        && directory.width < base.width
                        && (directory.bands, directory.dtype) == (base.bands, base.dtype) =>
                {
                    let ratio = base.width as f64 / directory.width as f64;
                    let downsample = 1u32 << (ratio.log2().round().clamp(0.0, 31.0) as u32);
                    if let Some(current) = series.last_mut() {
                        current.push(SeriesLevel {
                            downsample,
                            directory,
                        });
                    }
                }
                _ => associated.push((directory, index)),
            }
        }

        for levels in &mut series {
            levels.sort_by_key(|l| l.downsample);
            levels.dedup_by_key(|l| l.downsample);
        }
        let Some(base) = series.first().and_then(|s| s.first()).map(|l| &l.directory) else {
            return Err(TiffError::StripOrganization.into());
        };

        let manifest = PyramidManifest::from_description(&base.description).filter(|m| {
            (m.size_x, m.size_y, m.band_count, m.dtype) == (base.width, base.height, base.bands, base.dtype)
                && m.frame_count() <= series.len()
        });
        let metadata = match manifest {
            Some(manifest) => manifest.metadata(),
            None => {
                let axes = if series.len() > 1 {
                    FrameAxes::new(vec![("frame".into(), series.len())])
                } else {
                    FrameAxes::default()
                };
                SourceMetadata::new(
                    base.width,
                    base.height,
                    base.block_width,
                    base.block_height,
                    base.bands,
                    base.dtype,
                )
                .with_frames(axes)
                .with_magnification(base_calibration.magnification)
                .with_mm(base_calibration.mm_x, base_calibration.mm_y)
            }
        };
        series.truncate(metadata.frame_count());

        let associated = name_associated(associated);
        debug!(
            source = reader.identifier(),
            width = metadata.size_x,
            height = metadata.size_y,
            levels = metadata.levels,
            frames = series.len(),
            associated = associated.len(),
            "opened TIFF"
        );

        Ok(Self {
            reader,
            little_endian: header.byte_order.is_little_endian(),
            metadata,
            series,
            associated,
        })
    }

    /// Decode one block of a directory.
    async fn read_block(&self, directory: &Directory, column: u32, row: u32) -> Result<PixelArray, TileError> {
        let index = (row * directory.columns() + column) as usize;
        let (width, height) = directory.block_size(row);
        let (offset, length) = (directory.offsets[index], directory.byte_counts[index]);
        if length == 0 {
            return Ok(PixelArray::new(width as usize, height as usize, directory.bands, directory.dtype));
        }
        let length = usize::try_from(length).map_err(|_| TileError::SourceDecode {
            message: format!("block {index} is too large"),
        })?;
        let data = self.reader.read_exact_at(offset, length).await?;

        match directory.compression {
            Compression::None => PixelArray::from_bytes(
                width as usize,
                height as usize,
                directory.bands,
                directory.dtype,
                &data,
                self.little_endian,
            )
            .ok_or_else(|| TileError::SourceDecode {
                message: format!("block {index} is truncated ({} bytes)", data.len()),
            }),
            Compression::Jpeg => {
                let tables = directory.jpeg_tables.clone();
                let bands = directory.bands;
                let array = tokio::task::spawn_blocking(move || decode_block(tables.as_deref(), &data))
                    .await
                    .map_err(|e| TileError::SourceDecode {
                        message: format!("decode task failed: {e}"),
                    })??;
                // Greyscale directories may still decode as RGB.
                let array = if bands == 1 && array.bands() == 3 {
                    array.select_bands(&[0]).unwrap_or(array)
                } else {
                    array
                };
                if array.bands() != bands {
                    return Err(TileError::SourceDecode {
                        message: format!("JPEG block has {} bands, expected {bands}", array.bands()),
                    });
                }
                Ok(array)
            }
            other => Err(TiffError::UnsupportedCompression(other.name()).into()),
        }
    }

    /// Stitch the blocks covering a rectangle of a directory.
    async fn read_area(
        &self,
        directory: &Directory,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    ) -> Result<PixelArray, TileError> {
        let right = (left + width).min(directory.width);
        let bottom = (top + height).min(directory.height);
        let mut canvas = PixelArray::new(
            right.saturating_sub(left) as usize,
            bottom.saturating_sub(top) as usize,
            directory.bands,
            directory.dtype,
        );
        if canvas.is_empty() {
            return Ok(canvas);
        }
        let (bw, bh) = (directory.block_width, directory.block_height);
        for row in top / bh..bottom.div_ceil(bh).min(directory.rows()) {
            for column in left / bw..right.div_ceil(bw).min(directory.columns()) {
                let block = self.read_block(directory, column, row).await?;
                let (bx, by) = (column * bw, row * bh);
                let src_left = left.saturating_sub(bx);
                let src_top = top.saturating_sub(by);
                let piece = block.crop(
                    src_left as usize,
                    src_top as usize,
                    (right - bx.max(left)) as usize,
                    (bottom - by.max(top)) as usize,
                );
                canvas.blit(&piece, (bx + src_left - left) as usize, (by + src_top - top) as usize, None);
            }
        }
        Ok(canvas)
    }
}

/// Name associated directories: `label`/`macro` by description, then
/// `thumbnail`, then `image_<index>`.
fn name_associated(directories: Vec<(Directory, usize)>) -> Vec<(String, Directory)> {
    let mut named: Vec<(String, Directory)> = Vec::new();
    for (directory, index) in directories {
        if !directory.compression.is_supported() {
            continue;
        }
        let lower = directory.description.to_ascii_lowercase();
        let mut name = if lower.contains("label") {
            "label".to_string()
        } else if lower.contains("macro") {
            "macro".to_string()
        } else {
            "thumbnail".to_string()
        };
        if named.iter().any(|(n, _)| *n == name) {
            name = format!("image_{index}");
        }
        named.push((name, directory));
    }
    named
}

#[async_trait]
impl TileSource for TiffSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn read_tile(&self, level: u32, x: u32, y: u32, frame: usize) -> Result<PixelArray, TileError> {
        let meta = &self.metadata;
        meta.check_address(level, x, y, frame)?;
        let levels = self.series.get(frame).ok_or(TileError::OutOfRange {
            level,
            x,
            y,
            frame,
            max_x: 0,
            max_y: 0,
            frames: self.series.len(),
        })?;

        let scale = meta.level_scale(level);
        let (level_w, level_h) = meta.level_size(level);
        let left = x * meta.tile_width;
        let top = y * meta.tile_height;
        let width = meta.tile_width.min(level_w - left);
        let height = meta.tile_height.min(level_h - top);

        // Finest stored directory at or above the requested resolution.
        let Some(stored) = levels.iter().rev().find(|l| l.downsample <= scale) else {
            return Err(TileError::InvalidLevel {
                level,
                levels: meta.levels,
            });
        };
        let directory = &stored.directory;

        if stored.downsample == scale
            && directory.tiled
            && (directory.block_width, directory.block_height) == (meta.tile_width, meta.tile_height)
            && x < directory.columns()
            && y < directory.rows()
        {
            let block = self.read_block(directory, x, y).await?;
            return Ok(block
                .crop(0, 0, width as usize, height as usize)
                .resized_canvas(width as usize, height as usize));
        }

        let factor = (scale / stored.downsample) as u64;
        let area = self
            .read_area(
                directory,
                (left as u64 * factor).min(u32::MAX as u64) as u32,
                (top as u64 * factor).min(u32::MAX as u64) as u32,
                (width as u64 * factor).min(u32::MAX as u64) as u32,
                (height as u64 * factor).min(u32::MAX as u64) as u32,
            )
            .await?;
        let (width, height) = (width as usize, height as usize);
        tokio::task::spawn_blocking(move || resize(&area, width, height, ResampleMethod::Mean))
            .await
            .map_err(|e| TileError::SourceDecode {
                message: format!("resample task failed: {e}"),
            })
    }

    fn associated_image_names(&self) -> Vec<String> {
        self.associated.iter().map(|(name, _)| name.clone()).collect()
    }

    async fn associated_image(&self, name: &str) -> Result<Option<PixelArray>, TileError> {
        let Some((_, directory)) = self.associated.iter().find(|(n, _)| n == name) else {
            return Ok(None);
        };
        let image = self
            .read_area(directory, 0, 0, directory.width, directory.height)
            .await?;
        Ok(Some(image))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Whether the bytes start with a TIFF or BigTIFF signature.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    matches!(
        bytes.get(0..4),
        Some(b"II\x2a\x00") | Some(b"MM\x00\x2a") | Some(b"II\x2b\x00") | Some(b"MM\x00\x2b")
    )
}

/// Opens `.tif`, `.tiff` and `.svs` files.
#[derive(Debug, Default)]
pub struct TiffFactory;

#[async_trait]
impl SourceFactory for TiffFactory {
    fn name(&self) -> &'static str {
        "tiff"
    }

    fn priority(&self) -> u8 {
        50
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tif", "tiff", "svs", "ptif"]
    }

    async fn can_read(&self, path: &Path) -> bool {
        let Ok(reader) = FileRangeReader::open(path).await else {
            return false;
        };
        if reader.size() < 8 {
            return false;
        }
        match reader.read_exact_at(0, 4).await {
            Ok(bytes) => is_tiff_header(&bytes),
            Err(_) => false,
        }
    }

    async fn open(&self, path: &Path, _options: &OpenOptions) -> Result<Arc<dyn TileSource>, FormatError> {
        let reader = FileRangeReader::open(path).await?;
        let source = TiffSource::open(Arc::new(reader)).await?;
        Ok(Arc::new(source))
    }
}
