//! Pyramid sink integration tests.
//!
//! Tests verify:
//! - Tiles written to a sink read back from every destination format
//! - Explicitly written reduced levels survive level derivation
//! - Masked writes and frame axes reach the written file
//! - The sink reopens for writing after it has been finalized

use large_image::{
    DType, Mask, OpenOptions, PixelArray, PyramidSink, RenderParams, ResampleMethod, SinkState,
    TileAddress, TileWrite,
};

use super::test_utils::test_context;

fn constant(width: usize, height: usize, value: f64) -> PixelArray {
    PixelArray::from_fn(width, height, 1, DType::Uint8, |_, _, _| value)
}

// =============================================================================
// Writing
// =============================================================================

#[tokio::test]
async fn test_tiles_read_back_from_every_format() {
    let dir = tempfile::tempdir().unwrap();
    let sink = PyramidSink::new();
    sink.add_tile(&constant(512, 512, 10.0), 0, 0, TileWrite::default())
        .await
        .unwrap();
    sink.add_tile(&constant(300, 512, 20.0), 512, 0, TileWrite::default())
        .await
        .unwrap();

    let context = test_context();
    for name in ["sink.tif", "sink.pyr", "sink.zip"] {
        let path = dir.path().join(name);
        sink.write(&path, ResampleMethod::Mean).await.unwrap();

        let source = context.open(&path, &OpenOptions::default()).await.unwrap();
        let meta = source.metadata();
        assert_eq!((meta.size_x, meta.size_y), (812, 512), "{name}");
        assert_eq!(meta.band_count, 1, "{name}");

        let right = source
            .get_tile(TileAddress::new(meta.max_level(), 1, 0), &RenderParams::pixels())
            .await
            .unwrap();
        let right = right.as_pixels().unwrap();
        assert_eq!((right.width(), right.height()), (300, 512), "{name}");
        assert_eq!(right.get(150, 200, 0), 20.0, "{name}");
    }
    assert_eq!(sink.state().await, SinkState::Finalized);
}

#[tokio::test]
async fn test_explicit_reduced_level_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let sink = PyramidSink::new();
    for (x, y) in [(0, 0), (512, 0), (0, 512), (512, 512)] {
        sink.add_tile(&constant(512, 512, 10.0), x, y, TileWrite::default())
            .await
            .unwrap();
    }
    sink.add_tile(&constant(100, 100, 200.0), 0, 0, TileWrite::default().at_level(1))
        .await
        .unwrap();

    let path = dir.path().join("levels.tif");
    sink.write(&path, ResampleMethod::Mean).await.unwrap();

    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();
    assert_eq!(source.metadata().levels, 2);
    let reduced = source
        .get_tile(TileAddress::new(0, 0, 0), &RenderParams::pixels())
        .await
        .unwrap();
    let reduced = reduced.as_pixels().unwrap();
    assert_eq!((reduced.width(), reduced.height()), (512, 512));
    assert_eq!(reduced.get(50, 50, 0), 200.0);
    assert_eq!(reduced.get(300, 300, 0), 10.0);
}

#[tokio::test]
async fn test_masked_write_reaches_file() {
    let dir = tempfile::tempdir().unwrap();
    let sink = PyramidSink::new();
    sink.add_tile(&constant(512, 512, 5.0), 0, 0, TileWrite::default())
        .await
        .unwrap();
    let left_half = Mask::from_fn(512, 512, |x, _| x < 256);
    sink.add_tile(&constant(512, 512, 9.0), 0, 0, TileWrite::default().with_mask(left_half))
        .await
        .unwrap();

    let path = dir.path().join("masked.pyr");
    sink.write(&path, ResampleMethod::Mean).await.unwrap();

    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();
    let tile = source
        .get_tile(TileAddress::new(0, 0, 0), &RenderParams::pixels())
        .await
        .unwrap();
    let tile = tile.as_pixels().unwrap();
    assert_eq!(tile.get(10, 10, 0), 9.0);
    assert_eq!(tile.get(300, 10, 0), 5.0);
}

#[tokio::test]
async fn test_frame_axes_reach_file() {
    let dir = tempfile::tempdir().unwrap();
    let sink = PyramidSink::new();
    for z in 0..3 {
        sink.add_tile(
            &constant(256, 128, 40.0 * (z + 1) as f64),
            0,
            0,
            TileWrite::default().axis("z", z),
        )
        .await
        .unwrap();
    }

    let path = dir.path().join("frames.tif");
    sink.write(&path, ResampleMethod::Mean).await.unwrap();

    let source = test_context().open(&path, &OpenOptions::default()).await.unwrap();
    let meta = source.metadata();
    assert_eq!(meta.frame_count(), 3);
    assert_eq!(meta.frame_axes.as_ref().unwrap().axes(), &[("z".to_string(), 3)]);
    for frame in 0..3 {
        let tile = source
            .get_tile(TileAddress::new(0, 0, 0).with_frame(frame), &RenderParams::pixels())
            .await
            .unwrap();
        assert_eq!(tile.as_pixels().unwrap().get(100, 100, 0), 40.0 * (frame + 1) as f64);
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_finalized_sink_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let sink = PyramidSink::new();
    sink.add_tile(&constant(64, 64, 1.0), 0, 0, TileWrite::default())
        .await
        .unwrap();
    sink.write(&dir.path().join("first.pyr"), ResampleMethod::Mean)
        .await
        .unwrap();
    assert_eq!(sink.state().await, SinkState::Finalized);

    sink.add_tile(&constant(64, 64, 2.0), 64, 0, TileWrite::default())
        .await
        .unwrap();
    assert_eq!(sink.state().await, SinkState::Accumulating);

    let second = dir.path().join("second.pyr");
    sink.write(&second, ResampleMethod::Nearest).await.unwrap();
    let source = test_context().open(&second, &OpenOptions::default()).await.unwrap();
    assert_eq!(source.metadata().size_x, 128);
}
