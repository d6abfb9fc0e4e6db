//! Tiled pyramidal TIFF output.
//!
//! Files are little-endian classic TIFF with uncompressed, chunky tiles.
//! Directories are emitted frame by frame, each frame listing its levels
//! from full resolution down, so every frame starts with a full-size
//! directory. The first directory carries the pyramid manifest as JSON in
//! its ImageDescription.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::tags::{
    tiff_sample_type, FieldType, TiffTag, PHOTOMETRIC_MIN_IS_BLACK, PHOTOMETRIC_RGB, SUBFILE_REDUCED_IMAGE,
};
use crate::array::{DType, PixelArray};
use crate::error::{IoError, SinkError, TiffError};
use crate::format::manifest::PyramidManifest;
use crate::sink::{PyramidData, PyramidEncoder};

/// ResolutionUnit value for centimeters.
const RESOLUTION_UNIT_CM: u16 = 3;

/// ExtraSamples values.
const EXTRA_SAMPLE_UNSPECIFIED: u16 = 0;
const EXTRA_SAMPLE_UNASSOCIATED_ALPHA: u16 = 2;

const SOFTWARE: &str = concat!("large-image ", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Encoder
// =============================================================================

/// Writes `.tif` / `.tiff` destinations.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiffEncoder;

#[async_trait]
impl PyramidEncoder for TiffEncoder {
    fn name(&self) -> &'static str {
        "tiff"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tif", "tiff"]
    }

    async fn write(&self, pyramid: Arc<PyramidData>, destination: &Path) -> Result<(), SinkError> {
        let path = destination.to_path_buf();
        tokio::task::spawn_blocking(move || write_tiff(&pyramid, &path))
            .await
            .map_err(|e| SinkError::Encode(format!("TIFF writer task failed: {e}")))?
    }
}

fn write_tiff(pyramid: &PyramidData, path: &Path) -> Result<(), SinkError> {
    let manifest = PyramidManifest::from_pyramid(pyramid);
    let description = manifest.to_description()?;
    let file = File::create(path).map_err(|e| io_error(path, e))?;
    let mut writer = TiffWriter::new(BufWriter::new(file), path.to_path_buf())?;

    let frames = pyramid.frame_count();
    let mut first = true;
    for frame in 0..frames {
        for (level, arrays) in pyramid.levels.iter().enumerate() {
            let Some(array) = arrays.get(frame) else {
                continue;
            };
            let text = first.then_some(description.as_str());
            writer.write_directory(pyramid, array, level as u32, text)?;
            first = false;
        }
    }
    writer.finish()?;
    debug!(path = %path.display(), frames, levels = pyramid.levels.len(), "wrote TIFF");
    Ok(())
}

fn io_error(path: &Path, err: std::io::Error) -> SinkError {
    SinkError::Io(IoError::from_std(path.display().to_string(), err))
}

// =============================================================================
// Low-level writer
// =============================================================================

/// One directory entry with its little-endian value bytes.
struct Entry {
    tag: TiffTag,
    field_type: FieldType,
    count: u32,
    data: Vec<u8>,
}

impl Entry {
    fn shorts(tag: TiffTag, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: FieldType::Short,
            count: values.len() as u32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn longs(tag: TiffTag, values: &[u32]) -> Self {
        Self {
            tag,
            field_type: FieldType::Long,
            count: values.len() as u32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn ascii(tag: TiffTag, text: &str) -> Self {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        Self {
            tag,
            field_type: FieldType::Ascii,
            count: data.len() as u32,
            data,
        }
    }

    fn rational(tag: TiffTag, value: f64) -> Self {
        // Fixed denominator keeps micrometer-scale resolutions exact enough.
        let denominator = 1000u32;
        let numerator = (value * denominator as f64).round().clamp(1.0, u32::MAX as f64) as u32;
        Self {
            tag,
            field_type: FieldType::Rational,
            count: 1,
            data: [numerator.to_le_bytes(), denominator.to_le_bytes()].concat(),
        }
    }
}

struct TiffWriter {
    out: BufWriter<File>,
    path: PathBuf,
    pos: u64,
    /// Where the offset of the next directory must be patched in
    next_pointer: u64,
}

impl TiffWriter {
    fn new(mut out: BufWriter<File>, path: PathBuf) -> Result<Self, SinkError> {
        out.write_all(b"II").map_err(|e| io_error(&path, e))?;
        out.write_all(&42u16.to_le_bytes()).map_err(|e| io_error(&path, e))?;
        out.write_all(&0u32.to_le_bytes()).map_err(|e| io_error(&path, e))?;
        Ok(Self {
            out,
            path,
            pos: 8,
            next_pointer: 4,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let end = self.pos + bytes.len() as u64;
        if end > u32::MAX as u64 {
            return Err(TiffError::TooLarge(end).into());
        }
        self.out.write_all(bytes).map_err(|e| io_error(&self.path, e))?;
        self.pos = end;
        Ok(())
    }

    /// Pad to an even offset, as TIFF requires for values and directories.
    fn align(&mut self) -> Result<(), SinkError> {
        if self.pos % 2 == 1 {
            self.write(&[0])?;
        }
        Ok(())
    }

    fn patch(&mut self, at: u64, value: u32) -> Result<(), SinkError> {
        let path = self.path.clone();
        self.out.seek(SeekFrom::Start(at)).map_err(|e| io_error(&path, e))?;
        self.out.write_all(&value.to_le_bytes()).map_err(|e| io_error(&path, e))?;
        self.out.seek(SeekFrom::Start(self.pos)).map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    fn write_directory(
        &mut self,
        pyramid: &PyramidData,
        array: &PixelArray,
        level: u32,
        description: Option<&str>,
    ) -> Result<(), SinkError> {
        let tile = pyramid.tile_size as usize;
        let (width, height) = (array.width(), array.height());
        let columns = width.div_ceil(tile);
        let rows = height.div_ceil(tile);

        let mut offsets = Vec::with_capacity(columns * rows);
        let mut counts = Vec::with_capacity(columns * rows);
        for row in 0..rows {
            for col in 0..columns {
                let block = array
                    .crop(col * tile, row * tile, tile, tile)
                    .resized_canvas(tile, tile)
                    .to_bytes();
                self.align()?;
                offsets.push(self.pos as u32);
                counts.push(block.len() as u32);
                self.write(&block)?;
            }
        }

        let entries = directory_entries(pyramid, array, level, description, offsets, counts);

        // Out-of-line values go right before the directory.
        let mut value_offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.data.len() > 4 {
                self.align()?;
                value_offsets.push(Some(self.pos as u32));
                self.write(&entry.data)?;
            } else {
                value_offsets.push(None);
            }
        }

        self.align()?;
        let ifd_offset = self.pos as u32;
        self.patch(self.next_pointer, ifd_offset)?;

        let mut ifd = Vec::with_capacity(2 + entries.len() * 12 + 4);
        ifd.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (entry, value_offset) in entries.iter().zip(&value_offsets) {
            ifd.extend_from_slice(&entry.tag.as_u16().to_le_bytes());
            ifd.extend_from_slice(&(entry.field_type as u16).to_le_bytes());
            ifd.extend_from_slice(&entry.count.to_le_bytes());
            match value_offset {
                Some(offset) => ifd.extend_from_slice(&offset.to_le_bytes()),
                None => {
                    let mut inline = [0u8; 4];
                    inline[..entry.data.len()].copy_from_slice(&entry.data);
                    ifd.extend_from_slice(&inline);
                }
            }
        }
        self.next_pointer = ifd_offset as u64 + 2 + entries.len() as u64 * 12;
        ifd.extend_from_slice(&0u32.to_le_bytes());
        self.write(&ifd)
    }

    fn finish(mut self) -> Result<(), SinkError> {
        self.out.flush().map_err(|e| io_error(&self.path, e))
    }
}

/// Directory entries in ascending tag order.
fn directory_entries(
    pyramid: &PyramidData,
    array: &PixelArray,
    level: u32,
    description: Option<&str>,
    offsets: Vec<u32>,
    counts: Vec<u32>,
) -> Vec<Entry> {
    let bands = pyramid.band_count.max(1);
    let (bits, sample_format) = tiff_sample_type(pyramid.dtype);
    let rgb = pyramid.dtype == DType::Uint8 && (bands == 3 || bands == 4);
    let photometric = if rgb { PHOTOMETRIC_RGB } else { PHOTOMETRIC_MIN_IS_BLACK };
    let color_bands = if rgb { 3 } else { 1 };

    let mut entries = vec![
        Entry::longs(
            TiffTag::NewSubfileType,
            &[if level > 0 { SUBFILE_REDUCED_IMAGE } else { 0 }],
        ),
        Entry::longs(TiffTag::ImageWidth, &[array.width() as u32]),
        Entry::longs(TiffTag::ImageLength, &[array.height() as u32]),
        Entry::shorts(TiffTag::BitsPerSample, &vec![bits; bands]),
        Entry::shorts(TiffTag::Compression, &[1]),
        Entry::shorts(TiffTag::PhotometricInterpretation, &[photometric]),
    ];
    if let Some(description) = description {
        entries.push(Entry::ascii(TiffTag::ImageDescription, description));
    }
    entries.push(Entry::shorts(TiffTag::SamplesPerPixel, &[bands as u16]));

    let scale = (1u64 << level.min(63)) as f64;
    if let (Some(mm_x), Some(mm_y)) = (pyramid.mm_x, pyramid.mm_y.or(pyramid.mm_x)) {
        if mm_x > 0.0 && mm_y > 0.0 {
            entries.push(Entry::rational(TiffTag::XResolution, 10.0 / (mm_x * scale)));
            entries.push(Entry::rational(TiffTag::YResolution, 10.0 / (mm_y * scale)));
        }
    }
    entries.push(Entry::shorts(TiffTag::PlanarConfiguration, &[1]));
    if pyramid.mm_x.is_some() {
        entries.push(Entry::shorts(TiffTag::ResolutionUnit, &[RESOLUTION_UNIT_CM]));
    }
    entries.push(Entry::ascii(TiffTag::Software, SOFTWARE));
    entries.push(Entry::longs(TiffTag::TileWidth, &[pyramid.tile_size]));
    entries.push(Entry::longs(TiffTag::TileLength, &[pyramid.tile_size]));
    entries.push(Entry::longs(TiffTag::TileOffsets, &offsets));
    entries.push(Entry::longs(TiffTag::TileByteCounts, &counts));
    if bands > color_bands {
        let extra: Vec<u16> = (color_bands..bands)
            .map(|b| {
                if rgb && b == 3 {
                    EXTRA_SAMPLE_UNASSOCIATED_ALPHA
                } else {
                    EXTRA_SAMPLE_UNSPECIFIED
                }
            })
            .collect();
        entries.push(Entry::shorts(TiffTag::ExtraSamples, &extra));
    }
    entries.push(Entry::shorts(TiffTag::SampleFormat, &vec![sample_format; bands]));
    entries
}
