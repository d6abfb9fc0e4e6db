//! Source façade integration tests.
//!
//! Tests verify:
//! - Regions at native and reduced scales, with output fitting
//! - Exact scales the source cannot serve yield empty results
//! - Tile iteration order, resampled iteration and lazy payloads
//! - Pixel queries and the scale algebra against a calibrated source

use large_image::source::synthetic::pattern_value;
use large_image::{
    Encoding, IteratorOptions, LevelRounding, OpenOptions, RegionDescriptor, RegionOptions,
    RenderParams, ScaleDescriptor, TileAddress, TileError, TileFormat, Units,
};

use super::test_utils::test_context;

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

// =============================================================================
// Regions
// =============================================================================

#[tokio::test]
async fn test_native_region_matches_pattern() {
    let source = test_context()
        .open("synthetic:size=4096", &OpenOptions::default())
        .await
        .unwrap();
    let region = source
        .get_region(RegionOptions::new(RegionDescriptor::rect(
            100.0,
            50.0,
            300.0,
            200.0,
            Units::BasePixels,
        )))
        .await
        .unwrap();
    assert_eq!((region.width, region.height), (300, 200));
    assert_eq!(region.format, TileFormat::Pixels);

    let pixels = region.payload.as_pixels().unwrap();
    for (x, y) in [(0, 0), (155, 17), (299, 199)] {
        for band in 0..3 {
            assert_eq!(
                pixels.get(x, y, band),
                pattern_value(100 + x as u64, 50 + y as u64, band, 0)
            );
        }
    }
}

#[tokio::test]
async fn test_region_at_magnification_with_fitting() {
    let source = test_context()
        .open("synthetic:size=4096", &OpenOptions::default())
        .await
        .unwrap();
    let region = source
        .get_region(RegionOptions::default().with_scale(ScaleDescriptor::magnification(10.0)))
        .await
        .unwrap();
    assert_eq!((region.width, region.height), (1024, 1024));

    let fitted = source
        .get_region(
            RegionOptions::default()
                .with_scale(ScaleDescriptor::magnification(10.0))
                .with_max_size(Some(500), None),
        )
        .await
        .unwrap();
    assert_eq!((fitted.width, fitted.height), (500, 500));
}

#[tokio::test]
async fn test_region_encoded_as_png() {
    let source = test_context()
        .open("synthetic:size=1000", &OpenOptions::default())
        .await
        .unwrap();
    let region = source
        .get_region(
            RegionOptions::new(RegionDescriptor::size(64.0, 32.0, Units::BasePixels))
                .with_params(RenderParams::encoded(Encoding::Png)),
        )
        .await
        .unwrap();
    assert_eq!(region.format, TileFormat::Encoded);
    assert!(region.payload.as_encoded().unwrap().starts_with(&PNG_MAGIC));
}

#[tokio::test]
async fn test_exact_scale_mismatch_is_empty() {
    let source = test_context()
        .open("synthetic:size=4096", &OpenOptions::default())
        .await
        .unwrap();
    let exact = ScaleDescriptor::magnification(15.0).exact();

    let region = source
        .get_region(RegionOptions::default().with_scale(exact))
        .await
        .unwrap();
    assert!(region.is_empty());

    let records = source
        .tile_iterator(IteratorOptions::default().with_scale(exact))
        .unwrap()
        .count();
    assert_eq!(records, 0);

    let served = source
        .tile_iterator(
            IteratorOptions::default().with_scale(ScaleDescriptor::magnification(20.0).exact()),
        )
        .unwrap()
        .count();
    assert_eq!(served, 64);
}

// =============================================================================
// Iteration
// =============================================================================

#[tokio::test]
async fn test_iteration_is_frame_outer_row_major() {
    let source = test_context()
        .open("synthetic:size_x=1000&size_y=600&frames=c=2", &OpenOptions::default())
        .await
        .unwrap();
    let records: Vec<_> = source.tile_iterator(IteratorOptions::default()).unwrap().collect();
    assert_eq!(records.len(), 2 * 4 * 3);

    let addresses: Vec<_> = records
        .iter()
        .map(|r| (r.address.frame, r.address.y, r.address.x))
        .collect();
    let mut sorted = addresses.clone();
    sorted.sort();
    assert_eq!(addresses, sorted);

    let last = records.last().unwrap();
    assert_eq!((last.x, last.y), (768, 512));
    assert_eq!((last.width, last.height), (1000 - 768, 600 - 512));
    assert!(!last.is_loaded());

    let payload = last.tile().await.unwrap();
    assert!(last.is_loaded());
    let pixels = payload.as_pixels().unwrap();
    assert_eq!((pixels.width(), pixels.height()), (232, 88));
    assert_eq!(pixels.get(0, 0, 1), pattern_value(768, 512, 1, 1));
}

#[tokio::test]
async fn test_resampled_iteration_between_levels() {
    let source = test_context()
        .open("synthetic:size=1280", &OpenOptions::default())
        .await
        .unwrap();
    let options = IteratorOptions::default()
        .with_scale(ScaleDescriptor::magnification(32.0))
        .with_resample(true);
    let records: Vec<_> = source.tile_iterator(options).unwrap().collect();

    // 1280 / (40 / 32) = 1024 output pixels, four 256-pixel tiles a side.
    assert_eq!(records.len(), 16);
    let first = &records[0];
    assert!((first.magnification.magnification.unwrap() - 32.0).abs() < 1e-6);
    assert_eq!((first.width, first.height), (256, 256));

    let payload = first.tile().await.unwrap();
    let pixels = payload.as_pixels().unwrap();
    assert_eq!((pixels.width() as u32, pixels.height() as u32), (first.width, first.height));
}

#[tokio::test]
async fn test_mutually_exclusive_region_arguments() {
    let source = test_context()
        .open("synthetic:size=2048", &OpenOptions::default())
        .await
        .unwrap();
    let source_region = RegionDescriptor::rect(0.0, 0.0, 0.5, 0.5, Units::Fraction);
    let result = source.tile_iterator_at_another_scale(
        &source_region,
        None,
        Some(ScaleDescriptor::magnification(10.0)),
        IteratorOptions::default().with_region(RegionDescriptor::full()),
    );
    assert!(matches!(result, Err(TileError::MutuallyExclusiveArguments(_))));

    let region = source
        .get_region_at_another_scale(
            &source_region,
            None,
            Some(ScaleDescriptor::magnification(10.0)),
            RegionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((region.width, region.height), (256, 256));
}

// =============================================================================
// Pixels and Scale Algebra
// =============================================================================

#[tokio::test]
async fn test_get_pixel() {
    let source = test_context()
        .open("synthetic:size=2048&frames=z=2", &OpenOptions::default())
        .await
        .unwrap();
    let value = source
        .get_pixel(&RegionDescriptor::point(300.0, 700.0, Units::BasePixels), None, 1, true)
        .await
        .unwrap();
    assert_eq!(
        value.bands,
        (0..3).map(|b| pattern_value(300, 700, b, 1)).collect::<Vec<_>>()
    );
    let record = value.tile.unwrap();
    assert_eq!(record.address, TileAddress::new(3, 1, 2).with_frame(1));

    let outside = source
        .get_pixel(&RegionDescriptor::point(5000.0, 0.0, Units::BasePixels), None, 0, false)
        .await
        .unwrap();
    assert!(outside.bands.is_empty());
}

#[tokio::test]
async fn test_get_pixel_in_mm_matches_pixels() {
    let source = test_context()
        .open("synthetic:size=2048&mm_x=0.25&mm_y=0.25", &OpenOptions::default())
        .await
        .unwrap();
    let in_pixels = source
        .get_pixel(&RegionDescriptor::point(300.0, 700.0, Units::BasePixels), None, 0, false)
        .await
        .unwrap();
    let in_mm = source
        .get_pixel(&RegionDescriptor::point(75.0, 175.0, Units::Mm), None, 0, false)
        .await
        .unwrap();
    assert_eq!(in_pixels.bands, in_mm.bands);
    assert!(in_mm.tile.is_none());
}

#[tokio::test]
async fn test_level_for_magnification_values() {
    let source = test_context()
        .open(
            "synthetic:size=32768&magnification=40&mm_x=0.000252&mm_y=0.000252",
            &OpenOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(source.metadata().levels, 8);

    let level = |scale: ScaleDescriptor, rounding: LevelRounding| source.level_for_magnification(&scale, rounding);
    let near = |actual: Option<f64>, expected: f64| (actual.unwrap() - expected).abs() < 1e-9;
    let mag = ScaleDescriptor::magnification;

    assert_eq!(level(mag(40.0), LevelRounding::Round), Some(7.0));
    assert_eq!(level(mag(20.0), LevelRounding::Round), Some(6.0));
    assert_eq!(level(mag(15.0), LevelRounding::Round), Some(6.0));
    assert_eq!(level(mag(25.0), LevelRounding::Round), Some(6.0));
    assert_eq!(level(mag(15.0), LevelRounding::Ceil), Some(6.0));
    assert_eq!(level(mag(25.0), LevelRounding::Ceil), Some(7.0));
    assert!(near(level(mag(15.0), LevelRounding::Fractional), 5.585));
    assert!(near(level(mag(25.0), LevelRounding::Fractional), 6.3219));
    assert!(near(level(mag(45.0), LevelRounding::Fractional), 7.0));
    assert!(near(level(mag(45.0), LevelRounding::Unbounded), 7.1699));
    assert_eq!(level(mag(80.0), LevelRounding::Round), Some(7.0));
    assert_eq!(level(mag(80.0).exact(), LevelRounding::Round), None);
    assert_eq!(level(mag(0.1), LevelRounding::Round), Some(0.0));

    assert_eq!(level(ScaleDescriptor::mm(0.0005, None), LevelRounding::Round), Some(6.0));
    assert_eq!(level(ScaleDescriptor::mm(0.0005, Some(0.002)), LevelRounding::Round), Some(5.0));
    assert_eq!(level(ScaleDescriptor::mm(0.0005, None).exact(), LevelRounding::Round), None);
    assert_eq!(level(ScaleDescriptor::mm(0.000504, None).exact(), LevelRounding::Round), Some(6.0));
}

#[tokio::test]
async fn test_region_scale_conversion_round_trip() {
    let source = test_context()
        .open("synthetic:size=4096", &OpenOptions::default())
        .await
        .unwrap();
    let region = RegionDescriptor::rect(1000.0, 2000.0, 400.0, 200.0, Units::BasePixels);
    let at_ten = ScaleDescriptor::magnification(10.0);

    let converted = source
        .convert_region_scale(&region, None, Some(&at_ten), Some(Units::Pixels))
        .unwrap();
    assert_eq!(converted.units, Units::MagPixels);
    assert_eq!(converted.left, Some(250.0));
    assert_eq!(converted.width, Some(100.0));

    let back = source
        .convert_region_scale(&converted, Some(&at_ten), None, Some(Units::BasePixels))
        .unwrap();
    assert_eq!(back.left, Some(1000.0));
    assert_eq!(back.top, Some(2000.0));
    assert_eq!(back.height, Some(200.0));

    let point = source
        .point_at_another_scale((1000.0, 2000.0), None, Units::BasePixels, Some(&at_ten), Units::MagPixels)
        .unwrap();
    assert_eq!(point, (250.0, 500.0));
}
