//! Test utilities for integration tests.
//!
//! This module provides a counting tile source, helpers for writing test
//! files, and builders for small TIFF files with various layouts.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use large_image::config::CacheConfig;
use large_image::source::synthetic::{SyntheticOptions, SyntheticSource};
use large_image::{
    EngineContext, FormatError, OpenOptions, PixelArray, SourceFactory, SourceMetadata,
    SourceRegistry, TileError, TileSource,
};

// =============================================================================
// Contexts and files
// =============================================================================

/// A context with a small tile cache and a handful of handles.
pub fn test_context() -> EngineContext {
    EngineContext::new(CacheConfig {
        cache_tilesource_maximum: 4,
        ..Default::default()
    })
}

/// Write `bytes` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

// =============================================================================
// Counting Source
// =============================================================================

/// Shared counters of a [`CountingFactory`].
#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// A synthetic source that counts reads and closes, and reads slowly so
/// concurrent callers overlap.
pub struct CountingSource {
    inner: SyntheticSource,
    counters: Arc<Counters>,
    delay: Duration,
}

#[async_trait]
impl TileSource for CountingSource {
    fn metadata(&self) -> &SourceMetadata {
        self.inner.metadata()
    }

    async fn read_tile(&self, level: u32, x: u32, y: u32, frame: usize) -> Result<PixelArray, TileError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.read_tile(level, x, y, frame).await
    }

    async fn close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens `.count` files, whatever their content, as 1024x1024 synthetic
/// images.
pub struct CountingFactory {
    pub counters: Arc<Counters>,
    pub delay: Duration,
}

impl CountingFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            delay,
        }
    }
}

#[async_trait]
impl SourceFactory for CountingFactory {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["count"]
    }

    async fn can_read(&self, path: &Path) -> bool {
        path.extension().is_some_and(|e| e == "count") && path.is_file()
    }

    async fn open(&self, _path: &Path, _options: &OpenOptions) -> Result<Arc<dyn TileSource>, FormatError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Arc::new(CountingSource {
            inner: SyntheticSource::new(SyntheticOptions {
                size_x: 1024,
                size_y: 1024,
                ..Default::default()
            }),
            counters: self.counters.clone(),
            delay: self.delay,
        }))
    }
}

/// A context whose only backend is a [`CountingFactory`].
pub fn counting_context(handles: usize, delay: Duration) -> (EngineContext, Arc<Counters>) {
    let factory = CountingFactory::new(delay);
    let counters = factory.counters.clone();
    let context = EngineContext::new(CacheConfig {
        cache_tilesource_maximum: handles,
        ..Default::default()
    })
    .with_registry(SourceRegistry::empty().with(Arc::new(factory)));
    (context, counters)
}

// =============================================================================
// Test JPEG Creation
// =============================================================================

/// Create a test JPEG image with a simple gradient pattern.
pub fn create_test_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
    let img = GrayImage::from_fn(width, height, |x, y| {
        let val = ((x + y) % 256) as u8;
        Luma([val])
    });

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(&img).unwrap();
    buf
}

/// Split a JPEG stream into its tables blob (SOI + tables + EOI) and an
/// abbreviated stream (SOI + scan + EOI).
pub fn split_jpeg_stream(jpeg: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut i = 2;
    while i + 3 < jpeg.len() {
        if jpeg[i] == 0xFF && jpeg[i + 1] == 0xDA {
            let mut tables = vec![0xFF, 0xD8];
            tables.extend_from_slice(&jpeg[2..i]);
            tables.extend_from_slice(&[0xFF, 0xD9]);
            let mut abbreviated = vec![0xFF, 0xD8];
            abbreviated.extend_from_slice(&jpeg[i..]);
            return (tables, abbreviated);
        }
        // Skip the marker segment.
        let len = u16::from_be_bytes([jpeg[i + 2], jpeg[i + 3]]) as usize;
        i += 2 + len;
    }
    panic!("JPEG stream has no scan");
}

// =============================================================================
// TIFF File Builders
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrderType {
    LittleEndian,
    BigEndian,
}

/// Builder for classic single-directory TIFF files.
///
/// Blobs (tile data) are appended right after the header; the directory and
/// its out-of-line values follow when the file is finished.
pub struct TiffBuilder {
    byte_order: ByteOrderType,
    data: Vec<u8>,
    entries: Vec<(u16, u16, u32, Vec<u8>)>,
}

impl TiffBuilder {
    pub fn new(byte_order: ByteOrderType) -> Self {
        let mut data = match byte_order {
            ByteOrderType::LittleEndian => b"II".to_vec(),
            ByteOrderType::BigEndian => b"MM".to_vec(),
        };
        let mut builder = Self {
            byte_order,
            data: Vec::new(),
            entries: Vec::new(),
        };
        data.extend(builder.u16_bytes(42));
        data.extend([0u8; 4]);
        builder.data = data;
        builder
    }

    fn u16_bytes(&self, value: u16) -> [u8; 2] {
        match self.byte_order {
            ByteOrderType::LittleEndian => value.to_le_bytes(),
            ByteOrderType::BigEndian => value.to_be_bytes(),
        }
    }

    fn u32_bytes(&self, value: u32) -> [u8; 4] {
        match self.byte_order {
            ByteOrderType::LittleEndian => value.to_le_bytes(),
            ByteOrderType::BigEndian => value.to_be_bytes(),
        }
    }

    /// Append raw data and return its offset.
    pub fn blob(&mut self, bytes: &[u8]) -> u32 {
        if self.data.len() % 2 == 1 {
            self.data.push(0);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        offset
    }

    pub fn shorts(mut self, tag: u16, values: &[u16]) -> Self {
        let bytes = values.iter().flat_map(|v| self.u16_bytes(*v)).collect();
        self.entries.push((tag, 3, values.len() as u32, bytes));
        self
    }

    pub fn longs(mut self, tag: u16, values: &[u32]) -> Self {
        let bytes = values.iter().flat_map(|v| self.u32_bytes(*v)).collect();
        self.entries.push((tag, 4, values.len() as u32, bytes));
        self
    }

    pub fn ascii(mut self, tag: u16, text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.entries.push((tag, 2, bytes.len() as u32, bytes));
        self
    }

    pub fn undefined(mut self, tag: u16, bytes: &[u8]) -> Self {
        self.entries.push((tag, 7, bytes.len() as u32, bytes.to_vec()));
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.entries.sort_by_key(|e| e.0);
        if self.data.len() % 2 == 1 {
            self.data.push(0);
        }
        let ifd_offset = self.data.len() as u32;
        let header_offset = self.u32_bytes(ifd_offset);
        self.data[4..8].copy_from_slice(&header_offset);

        let mut external_offset = ifd_offset + 2 + 12 * self.entries.len() as u32 + 4;
        let mut external = Vec::new();
        let mut directory = Vec::new();
        directory.extend(self.u16_bytes(self.entries.len() as u16));
        for (tag, field_type, count, bytes) in &self.entries {
            directory.extend(self.u16_bytes(*tag));
            directory.extend(self.u16_bytes(*field_type));
            directory.extend(self.u32_bytes(*count));
            if bytes.len() <= 4 {
                let mut inline = bytes.clone();
                inline.resize(4, 0);
                directory.extend(inline);
            } else {
                directory.extend(self.u32_bytes(external_offset));
                external.extend_from_slice(bytes);
                if bytes.len() % 2 == 1 {
                    external.push(0);
                }
                external_offset += bytes.len().next_multiple_of(2) as u32;
            }
        }
        directory.extend([0u8; 4]);

        self.data.extend(directory);
        self.data.extend(external);
        self.data
    }
}

/// Options of [`create_jpeg_tiff`].
#[derive(Clone, Debug)]
pub struct JpegTiffOptions {
    pub byte_order: ByteOrderType,
    pub width: u32,
    pub height: u32,
    pub tile: u32,
    /// Store tables once in `JPEGTables` and abbreviated streams per tile
    pub jpeg_tables: bool,
    pub description: Option<String>,
    pub compression: u16,
    pub quality: u8,
}

impl Default for JpegTiffOptions {
    fn default() -> Self {
        Self {
            byte_order: ByteOrderType::LittleEndian,
            width: 2048,
            height: 1536,
            tile: 256,
            jpeg_tables: false,
            description: None,
            compression: 7,
            quality: 90,
        }
    }
}

/// A single-level greyscale TIFF whose tiles all hold the same
/// `(x + y) % 256` gradient.
pub fn create_jpeg_tiff(options: &JpegTiffOptions) -> Vec<u8> {
    let jpeg = create_test_jpeg(options.tile, options.tile, options.quality);
    let (tables, tile) = if options.jpeg_tables {
        let (tables, abbreviated) = split_jpeg_stream(&jpeg);
        (Some(tables), abbreviated)
    } else {
        (None, jpeg)
    };

    let mut builder = TiffBuilder::new(options.byte_order);
    let tile_offset = builder.blob(&tile);
    let count = (options.width.div_ceil(options.tile) * options.height.div_ceil(options.tile)) as usize;

    let mut builder = builder
        .longs(256, &[options.width])
        .longs(257, &[options.height])
        .shorts(258, &[8])
        .shorts(259, &[options.compression])
        .shorts(262, &[1])
        .shorts(277, &[1])
        .longs(322, &[options.tile])
        .longs(323, &[options.tile])
        .longs(324, &vec![tile_offset; count])
        .longs(325, &vec![tile.len() as u32; count]);
    if let Some(tables) = &tables {
        builder = builder.undefined(347, tables);
    }
    if let Some(description) = &options.description {
        builder = builder.ascii(270, description);
    }
    builder.finish()
}

/// Create a minimal valid TIFF file with JPEG tile data.
pub fn create_tiff_with_jpeg_tile(byte_order: ByteOrderType) -> Vec<u8> {
    create_jpeg_tiff(&JpegTiffOptions {
        byte_order,
        ..Default::default()
    })
}

/// Create an SVS-like TIFF with JPEGTables and an Aperio description.
pub fn create_svs_with_jpeg_tables() -> Vec<u8> {
    create_jpeg_tiff(&JpegTiffOptions {
        jpeg_tables: true,
        description: Some(
            "Aperio Image Library v12.0.5\r\n2048x1536 [0,0 2048x1536] (256x256) JPEG/RGB Q=70\
             |AppMag = 20|MPP = 0.4990"
                .to_string(),
        ),
        ..Default::default()
    })
}

/// Create a TIFF file with unsupported LZW compression.
pub fn create_tiff_with_lzw_compression() -> Vec<u8> {
    create_jpeg_tiff(&JpegTiffOptions {
        compression: 5,
        ..Default::default()
    })
}

/// Create a TIFF file with strip organization (not tiled).
pub fn create_strip_tiff() -> Vec<u8> {
    let jpeg = create_test_jpeg(512, 512, 90);
    let mut builder = TiffBuilder::new(ByteOrderType::LittleEndian);
    let offset = builder.blob(&jpeg);
    builder
        .longs(256, &[512])
        .longs(257, &[512])
        .shorts(258, &[8])
        .shorts(259, &[7])
        .longs(273, &[offset])
        .shorts(277, &[1])
        .longs(278, &[512])
        .longs(279, &[jpeg.len() as u32])
        .finish()
}

/// Create a BigTIFF file with JPEG tile data.
pub fn create_bigtiff_with_jpeg_tile() -> Vec<u8> {
    let jpeg_data = create_test_jpeg(256, 256, 90);
    let jpeg_len = jpeg_data.len() as u64;
    let tile_count = 48u64; // 8x6 tiles

    let mut data = Vec::new();

    // Header - Little endian BigTIFF
    data.extend(b"II");
    data.extend(&43u16.to_le_bytes());
    data.extend(&8u16.to_le_bytes());
    data.extend(&0u16.to_le_bytes());
    data.extend(&16u64.to_le_bytes());

    let entry_count = 8u64;
    data.extend(&entry_count.to_le_bytes());

    // BigTIFF entries: tag (2) + type (2) + count (8) + value/offset (8)
    let write_entry = |data: &mut Vec<u8>, tag: u16, typ: u16, count: u64, value: u64| {
        data.extend(&tag.to_le_bytes());
        data.extend(&typ.to_le_bytes());
        data.extend(&count.to_le_bytes());
        data.extend(&value.to_le_bytes());
    };

    let ifd_end = 16 + 8 + (entry_count as usize * 20) + 8;
    let tile_offsets_offset = ifd_end as u64;
    let tile_byte_counts_offset = tile_offsets_offset + tile_count * 8;
    let tile_data_offset = tile_byte_counts_offset + tile_count * 8;

    write_entry(&mut data, 256, 4, 1, 2048);
    write_entry(&mut data, 257, 4, 1, 1536);
    write_entry(&mut data, 258, 3, 1, 8);
    write_entry(&mut data, 259, 3, 1, 7);
    write_entry(&mut data, 322, 3, 1, 256);
    write_entry(&mut data, 323, 3, 1, 256);
    write_entry(&mut data, 324, 16, tile_count, tile_offsets_offset);
    write_entry(&mut data, 325, 16, tile_count, tile_byte_counts_offset);

    data.extend(&0u64.to_le_bytes());

    for _ in 0..tile_count {
        data.extend(&tile_data_offset.to_le_bytes());
    }
    for _ in 0..tile_count {
        data.extend(&jpeg_len.to_le_bytes());
    }
    data.extend(&jpeg_data);

    data
}
