//! Format reading integration tests.
//!
//! Tests verify:
//! - Little- and big-endian classic TIFF and BigTIFF tile reading
//! - JPEGTables merging and Aperio calibration
//! - Reduced levels missing from the file are derived from finer ones
//! - Unsupported layouts are rejected with typed errors
//! - Backends are found by content when the extension says nothing

use large_image::{FormatError, OpenOptions, RenderParams, TiffError, TileAddress, TileError};

use super::test_utils::{
    create_bigtiff_with_jpeg_tile, create_strip_tiff, create_svs_with_jpeg_tables,
    create_jpeg_tiff, create_tiff_with_jpeg_tile, create_tiff_with_lzw_compression, test_context,
    write_file, ByteOrderType, JpegTiffOptions,
};

/// Whether a decoded gradient sample is close to `(x + y) % 256`.
fn near_gradient(value: f64, x: u32, y: u32) -> bool {
    (value - ((x + y) % 256) as f64).abs() <= 6.0
}

// =============================================================================
// TIFF Variants
// =============================================================================

#[tokio::test]
async fn test_little_endian_tiff_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "le.tif", &create_tiff_with_jpeg_tile(ByteOrderType::LittleEndian));
    let context = test_context();
    let source = context.open(&path, &OpenOptions::default()).await.unwrap();

    let meta = source.metadata();
    assert_eq!((meta.size_x, meta.size_y), (2048, 1536));
    assert_eq!((meta.tile_width, meta.tile_height), (256, 256));
    assert_eq!(meta.band_count, 1);
    assert_eq!(meta.levels, 4);
    assert!(source.associated_images().is_empty());

    let tile = source
        .get_tile(TileAddress::new(3, 7, 5), &RenderParams::pixels())
        .await
        .unwrap();
    let pixels = tile.as_pixels().unwrap();
    assert_eq!((pixels.width(), pixels.height()), (256, 256));
    assert!(near_gradient(pixels.get(10, 20, 0), 10, 20));
    assert!(near_gradient(pixels.get(200, 40, 0), 200, 40));
}

#[tokio::test]
async fn test_greyscale_jpeg_tiles_keep_one_band() {
    let dir = tempfile::tempdir().unwrap();
    for (name, jpeg_tables) in [("grey.tif", false), ("grey-tables.tif", true)] {
        let tiff = create_jpeg_tiff(&JpegTiffOptions {
            width: 512,
            height: 512,
            jpeg_tables,
            quality: 1,
            ..Default::default()
        });
        let path = write_file(dir.path(), name, &tiff);
        let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();
        assert_eq!(source.metadata().band_count, 1, "{name}");

        let tile = source
            .get_tile(TileAddress::new(1, 1, 1), &RenderParams::pixels())
            .await
            .unwrap();
        let pixels = tile.as_pixels().unwrap();
        assert_eq!((pixels.width(), pixels.height(), pixels.bands()), (256, 256, 1), "{name}");
    }
}

#[tokio::test]
async fn test_big_endian_matches_little_endian() {
    let dir = tempfile::tempdir().unwrap();
    let le = write_file(dir.path(), "le.tif", &create_tiff_with_jpeg_tile(ByteOrderType::LittleEndian));
    let be = write_file(dir.path(), "be.tif", &create_tiff_with_jpeg_tile(ByteOrderType::BigEndian));
    let context = test_context();

    let address = TileAddress::new(3, 1, 1);
    let le_tile = context
        .open(&le, &OpenOptions::default())
        .await
        .unwrap()
        .get_tile(address, &RenderParams::pixels())
        .await
        .unwrap();
    let be_tile = context
        .open(&be, &OpenOptions::default())
        .await
        .unwrap()
        .get_tile(address, &RenderParams::pixels())
        .await
        .unwrap();
    assert_eq!(le_tile, be_tile);
}

#[tokio::test]
async fn test_bigtiff_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "big.tif", &create_bigtiff_with_jpeg_tile());
    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();

    assert_eq!((source.metadata().size_x, source.metadata().size_y), (2048, 1536));
    let tile = source
        .get_tile(TileAddress::new(3, 0, 0), &RenderParams::pixels())
        .await
        .unwrap();
    assert!(near_gradient(tile.as_pixels().unwrap().get(5, 5, 0), 5, 5));
}

#[tokio::test]
async fn test_jpeg_tables_and_aperio_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "slide.svs", &create_svs_with_jpeg_tables());
    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();

    let meta = source.metadata();
    assert_eq!(meta.magnification, Some(20.0));
    let mm_x = meta.mm_x.unwrap();
    assert!((mm_x - 0.000499).abs() < 1e-9);

    let tile = source
        .get_tile(TileAddress::new(3, 2, 3), &RenderParams::pixels())
        .await
        .unwrap();
    let pixels = tile.as_pixels().unwrap();
    assert!(near_gradient(pixels.get(100, 50, 0), 100, 50));

    let info = source.magnification_for_level(Some(2));
    assert_eq!(info.magnification, Some(10.0));
    assert_eq!(info.scale, 2.0);
}

#[tokio::test]
async fn test_missing_levels_are_derived() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "le.tif", &create_tiff_with_jpeg_tile(ByteOrderType::LittleEndian));
    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();

    // Level 0 is the whole image reduced 8 times: one 256x192 tile.
    let tile = source
        .get_tile(TileAddress::new(0, 0, 0), &RenderParams::pixels())
        .await
        .unwrap();
    let pixels = tile.as_pixels().unwrap();
    assert_eq!((pixels.width(), pixels.height()), (256, 192));
    assert_eq!(pixels.bands(), 1);

    let beyond = source
        .get_tile(TileAddress::new(0, 1, 0), &RenderParams::pixels())
        .await;
    assert!(matches!(beyond, Err(TileError::OutOfRange { .. })));
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test]
async fn test_strip_tiff_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "strips.tif", &create_strip_tiff());
    let err = test_context().open(&path, &OpenOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        TileError::Format(FormatError::Tiff(TiffError::StripOrganization))
    ));
}

#[tokio::test]
async fn test_lzw_tiff_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "lzw.tif", &create_tiff_with_lzw_compression());
    let err = test_context().open(&path, &OpenOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        TileError::Format(FormatError::Tiff(TiffError::UnsupportedCompression(_)))
    ));
}

#[tokio::test]
async fn test_unknown_content_has_no_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "notes.tif", b"not an image at all");
    let err = test_context().open(&path, &OpenOptions::default()).await.unwrap_err();
    assert!(matches!(err, TileError::Format(FormatError::NoReader { .. })));
}

// =============================================================================
// Backend Selection
// =============================================================================

#[tokio::test]
async fn test_tiff_found_by_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "slide.dat", &create_tiff_with_jpeg_tile(ByteOrderType::LittleEndian));
    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();
    assert_eq!(source.metadata().size_x, 2048);
}

#[tokio::test]
async fn test_synthetic_pseudo_path() {
    let source = test_context()
        .open("synthetic:size_x=3000&size_y=2000&bands=1&frames=c=3", &OpenOptions::default())
        .await
        .unwrap();
    let meta = source.metadata();
    assert_eq!((meta.size_x, meta.size_y), (3000, 2000));
    assert_eq!(meta.frame_count(), 3);
    assert_eq!(meta.frames.as_ref().map(Vec::len), Some(3));
}
