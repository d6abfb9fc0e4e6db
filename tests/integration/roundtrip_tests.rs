//! Conversion round-trip integration tests.
//!
//! Tests verify:
//! - Sources re-pyramided to TIFF, directory stores and zip stores read
//!   back with the same geometry, bands, dtype, frames and pixels
//! - Output crops and chained conversions

use std::path::Path;

use large_image::source::synthetic::pattern_value;
use large_image::{
    ConvertOptions, CropRect, DType, EngineContext, OpenOptions, RenderParams, SinkError,
    TileAddress,
};

use super::test_utils::test_context;

/// Check a few full-resolution samples of every frame against the pattern,
/// offset by `(left, top)`.
async fn assert_pattern(context: &EngineContext, path: &Path, left: u64, top: u64) {
    let source = context.open(path, &OpenOptions::default()).await.unwrap();
    let meta = source.metadata().clone();
    let native = meta.max_level();
    for frame in 0..meta.frame_count() {
        let tile = source
            .get_tile(TileAddress::new(native, 0, 0).with_frame(frame), &RenderParams::pixels())
            .await
            .unwrap();
        let pixels = tile.as_pixels().unwrap();
        for (x, y) in [(0usize, 0usize), (37, 101), (pixels.width() - 1, pixels.height() - 1)] {
            for band in 0..meta.band_count {
                assert_eq!(
                    pixels.get(x, y, band),
                    pattern_value(left + x as u64, top + y as u64, band, frame),
                    "{} frame {frame} band {band} at ({x}, {y})",
                    path.display()
                );
            }
        }
    }
}

// =============================================================================
// Destinations
// =============================================================================

#[tokio::test]
async fn test_convert_to_every_destination() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context();
    let source = "synthetic:size_x=700&size_y=500";

    for name in ["out.tif", "out.pyr", "out.zip"] {
        let destination = dir.path().join(name);
        let meta = context
            .convert(source, &destination, ConvertOptions::default())
            .await
            .unwrap();
        assert_eq!((meta.size_x, meta.size_y), (700, 500), "{name}");
        assert_eq!(meta.band_count, 3, "{name}");
        assert_eq!(meta.dtype, DType::Uint8, "{name}");
        assert_eq!(meta.levels, 2, "{name}");
        assert_eq!(meta.magnification, Some(40.0), "{name}");
        assert!((meta.mm_x.unwrap() - 0.00025).abs() < 1e-9, "{name}");
        assert_pattern(&context, &destination, 0, 0).await;
    }
}

#[tokio::test]
async fn test_convert_multiband_uint16_frames() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context();
    let source = "synthetic:size_x=600&size_y=400&bands=2&dtype=uint16&frames=c=2";

    for name in ["frames.tif", "frames.zip"] {
        let destination = dir.path().join(name);
        let meta = context
            .convert(source, &destination, ConvertOptions::default())
            .await
            .unwrap();
        assert_eq!(meta.band_count, 2, "{name}");
        assert_eq!(meta.dtype, DType::Uint16, "{name}");
        assert_eq!(meta.frame_count(), 2, "{name}");
        let axes = meta.frame_axes.as_ref().unwrap();
        assert_eq!(axes.axes(), &[("c".to_string(), 2)]);
        assert_pattern(&context, &destination, 0, 0).await;
    }
}

#[tokio::test]
async fn test_reduced_level_is_half_size() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context();
    let destination = dir.path().join("out.tif");
    context
        .convert("synthetic:size_x=700&size_y=500", &destination, ConvertOptions::default())
        .await
        .unwrap();

    let source = context.open(&destination, &OpenOptions::default()).await.unwrap();
    let tile = source
        .get_tile(TileAddress::new(0, 0, 0), &RenderParams::pixels())
        .await
        .unwrap();
    let pixels = tile.as_pixels().unwrap();
    assert_eq!((pixels.width(), pixels.height()), (350, 250));
}

// =============================================================================
// Options
// =============================================================================

#[tokio::test]
async fn test_convert_with_crop() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context();
    let destination = dir.path().join("cropped.pyr");
    let options = ConvertOptions {
        crop: Some(CropRect {
            left: 100,
            top: 50,
            width: 300,
            height: 200,
        }),
        ..Default::default()
    };
    let meta = context
        .convert("synthetic:size=1024", &destination, options)
        .await
        .unwrap();
    assert_eq!((meta.size_x, meta.size_y), (300, 200));
    assert_eq!(meta.levels, 1);
    assert_pattern(&context, &destination, 100, 50).await;
}

#[tokio::test]
async fn test_chained_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context();
    let tiff = dir.path().join("first.tif");
    let store = dir.path().join("second.pyr");

    let first = context
        .convert("synthetic:size_x=900&size_y=300&frames=z=3", &tiff, ConvertOptions::default())
        .await
        .unwrap();
    let second = context
        .convert(&tiff, &store, ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!((second.size_x, second.size_y), (first.size_x, first.size_y));
    assert_eq!(second.frame_count(), 3);
    assert_eq!(second.magnification, first.magnification);
    assert_pattern(&context, &store, 0, 0).await;
}

#[tokio::test]
async fn test_unsupported_destination() {
    let dir = tempfile::tempdir().unwrap();
    let err = test_context()
        .convert("synthetic:size=256", dir.path().join("out.png"), ConvertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::UnsupportedDestination(_)));
}
