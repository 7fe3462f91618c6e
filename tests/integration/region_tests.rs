//! Region stitching integration tests.
//!
//! Tests verify:
//! - Regions are composed from exactly the tiles they touch
//! - Every stitched sample matches the source pixels
//! - Boundary handling under the strict and clamp policies
//! - Sparse gaps, background values and multiple channels
//! - JPEG tiles decode through the built-in decoder

use std::sync::Arc;

use wsi_mosaic::error::{FrameIndexError, RegionError};
use wsi_mosaic::format::{FocalPlane, FramePosition, ImageFrameDecoder, OpticalPath, WarningKind};
use wsi_mosaic::slide::{Slide, TileCoord};
use wsi_mosaic::{BoundsPolicy, Region, RegionRequest, SlideConfig};

use super::test_utils::{
    close_to, full_level, jpeg_level, open, open_with, sample_at, sparse_level,
    sparse_z_concatenation, sparse_z_level, tile_color, LevelSpec,
};

fn default_channel() -> (OpticalPath, FocalPlane) {
    (OpticalPath::default(), FocalPlane::default())
}

async fn read(
    slide: &Slide,
    x: i64,
    y: i64,
    width: u32,
    height: u32,
) -> Result<Region, RegionError> {
    let (path, plane) = default_channel();
    slide.read_region(0, &path, plane, x, y, width, height).await
}

/// Assert that every pixel of `region` at `(x, y)` matches the pattern.
fn assert_matches_pattern(region: &Region, x: u32, y: u32, channel: u8) {
    for j in 0..region.height {
        for i in 0..region.width {
            let pixel = region.pixel(i, j);
            for (s, &value) in pixel.iter().enumerate() {
                assert_eq!(
                    value,
                    sample_at(x + i, y + j, s as u16, channel),
                    "pixel ({i}, {j}) sample {s}"
                );
            }
        }
    }
}

// =============================================================================
// Tile Coverage
// =============================================================================

#[tokio::test]
async fn test_region_touches_covering_tiles_only() {
    // 10 x 8 grid of 256 px tiles
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 2560, 2048, 256))]);
    assert_eq!(slide.levels()[0].tiles_x(), 10);
    assert_eq!(slide.levels()[0].tiles_y(), 8);

    let region = read(&slide, 100, 200, 400, 300).await.unwrap();

    assert_eq!(
        region.tiles,
        vec![
            TileCoord::new(0, 0),
            TileCoord::new(1, 0),
            TileCoord::new(0, 1),
            TileCoord::new(1, 1),
        ]
    );
    assert_eq!(region.len(), 400 * 300);
    assert_eq!((region.width, region.height), (400, 300));
    assert_matches_pattern(&region, 100, 200, 0);

    let stats = slide.cache_stats().await;
    assert_eq!(stats.decodes, 4);
}

#[tokio::test]
async fn test_buffer_size_matches_sample_layout() {
    let slide = open(&[full_level(&LevelSpec::new("rgb.dcm", 96, 64, 32).rgb())]);
    let region = read(&slide, 10, 5, 50, 40).await.unwrap();

    assert_eq!(region.samples_per_pixel, 3);
    assert_eq!(region.bytes_per_sample, 1);
    assert_eq!(region.len(), 50 * 40 * 3);
    assert_eq!(region.pixel(0, 0).len(), 3);
    assert_matches_pattern(&region, 10, 5, 0);
}

#[tokio::test]
async fn test_tile_aligned_region_equals_tile() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 1024, 1024, 256))]);
    let (path, plane) = default_channel();

    let region = read(&slide, 256, 512, 256, 256).await.unwrap();
    let tile = slide.read_tile(0, &path, plane, 1, 2).await.unwrap();

    assert_eq!(region.tiles, vec![TileCoord::new(1, 2)]);
    assert_eq!(region.data, tile.data);
}

#[tokio::test]
async fn test_repeated_reads_are_identical() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 512, 512, 128))]);

    let first = read(&slide, 33, 77, 300, 200).await.unwrap();
    let decodes = slide.cache_stats().await.decodes;
    let second = read(&slide, 33, 77, 300, 200).await.unwrap();

    assert_eq!(first.data, second.data);
    assert_eq!(first.tiles, second.tiles);
    // Served entirely from the cache
    assert_eq!(slide.cache_stats().await.decodes, decodes);
}

#[tokio::test]
async fn test_region_at_level_edge() {
    // 1000 x 700 leaves partial tiles on the right and bottom
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 1000, 700, 256))]);

    let region = read(&slide, 744, 444, 256, 256).await.unwrap();
    assert_eq!(region.tiles.len(), 4);
    assert_matches_pattern(&region, 744, 444, 0);

    let single = read(&slide, 999, 699, 1, 1).await.unwrap();
    assert_eq!(single.pixel(0, 0), &[sample_at(999, 699, 0, 0)]);
}

#[tokio::test]
async fn test_zero_area_region_is_empty() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 64, 64, 16))]);

    let region = read(&slide, 10, 10, 0, 20).await.unwrap();
    assert!(region.is_empty());
    assert!(region.tiles.is_empty());
    assert_eq!(slide.cache_stats().await.decodes, 0);
}

// =============================================================================
// Bounds
// =============================================================================

#[tokio::test]
async fn test_strict_bounds_rejects_overflow() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 1000, 700, 256))]);

    let cases = [
        (745, 444, 256, 256),
        (0, 0, 1001, 1),
        (-1, 0, 10, 10),
        (0, 690, 10, 11),
    ];
    for (x, y, w, h) in cases {
        let err = read(&slide, x, y, w, h).await.unwrap_err();
        assert!(
            matches!(
                err,
                RegionError::OutOfBounds {
                    level_width: 1000,
                    level_height: 700,
                    ..
                }
            ),
            "({x}, {y}) {w}x{h}: {err}"
        );
    }
    assert_eq!(slide.cache_stats().await.decodes, 0);
}

#[tokio::test]
async fn test_clamp_pads_with_background() {
    let config = SlideConfig {
        bounds_policy: BoundsPolicy::Clamp,
        ..SlideConfig::default()
    };
    let slide = open_with(
        &[full_level(&LevelSpec::new("level0.dcm", 64, 64, 16))],
        Arc::new(ImageFrameDecoder::new()),
        config,
    );

    let region = read(&slide, -10, -10, 20, 20).await.unwrap();
    assert_eq!(region.len(), 400);
    assert_eq!(region.tiles, vec![TileCoord::new(0, 0)]);
    // 8-bit background defaults to the maximum sample value
    assert_eq!(region.pixel(0, 0), &[255]);
    assert_eq!(region.pixel(9, 19), &[255]);
    assert_eq!(region.pixel(19, 9), &[255]);
    assert_eq!(region.pixel(10, 10), &[sample_at(0, 0, 0, 0)]);
    assert_eq!(region.pixel(19, 19), &[sample_at(9, 9, 0, 0)]);

    // Entirely outside: background only, nothing fetched
    let outside = read(&slide, 500, 500, 8, 8).await.unwrap();
    assert!(outside.tiles.is_empty());
    assert!(outside.data.iter().all(|&b| b == 255));
}

#[tokio::test]
async fn test_far_edge_past_coordinate_range_is_out_of_bounds() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 64, 64, 16))]);
    let (path, plane) = default_channel();

    for bounds in [BoundsPolicy::Strict, BoundsPolicy::Clamp] {
        let request = RegionRequest::new(0, i64::MAX - 1, 0, 8, 8)
            .with_channel(path.clone(), plane)
            .with_bounds(bounds);
        assert!(matches!(
            slide.read(&request).await,
            Err(RegionError::OutOfBounds { .. })
        ));

        let request = RegionRequest::new(0, 0, i64::MAX, 1, 1)
            .with_channel(path.clone(), plane)
            .with_bounds(bounds);
        assert!(matches!(
            slide.read(&request).await,
            Err(RegionError::OutOfBounds { .. })
        ));
    }
}

#[tokio::test]
async fn test_request_overrides_bounds_policy() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 64, 64, 16))]);
    let (path, plane) = default_channel();

    let request = RegionRequest::new(0, 60, 60, 8, 8)
        .with_channel(path, plane)
        .with_bounds(BoundsPolicy::Clamp);
    let region = slide.read(&request).await.unwrap();

    assert_eq!(region.pixel(3, 3), &[sample_at(63, 63, 0, 0)]);
    assert_eq!(region.pixel(4, 4), &[255]);
}

#[tokio::test]
async fn test_invalid_level() {
    let slide = open(&[full_level(&LevelSpec::new("level0.dcm", 64, 64, 16))]);
    let (path, plane) = default_channel();

    let err = slide.read_region(3, &path, plane, 0, 0, 1, 1).await.unwrap_err();
    assert!(matches!(
        err,
        RegionError::InvalidLevel {
            level: 3,
            level_count: 1
        }
    ));
}

// =============================================================================
// Sparse Levels
// =============================================================================

#[tokio::test]
async fn test_sparse_gaps_filled_with_background() {
    let spec = LevelSpec::new("sparse.dcm", 64, 64, 16);
    let config = SlideConfig {
        background: Some(7),
        ..SlideConfig::default()
    };
    let slide = open_with(
        &[sparse_level(&spec, &[(0, 0), (1, 1), (2, 2), (3, 3)])],
        Arc::new(ImageFrameDecoder::new()),
        config,
    );

    let region = read(&slide, 0, 0, 32, 32).await.unwrap();
    assert_eq!(region.tiles, vec![TileCoord::new(0, 0), TileCoord::new(1, 1)]);
    assert_eq!(region.pixel(4, 4), &[sample_at(4, 4, 0, 0)]);
    assert_eq!(region.pixel(20, 4), &[7]);
    assert_eq!(region.pixel(4, 20), &[7]);
    assert_eq!(region.pixel(20, 20), &[sample_at(20, 20, 0, 0)]);

    let (path, plane) = default_channel();
    let gap = slide.read_tile(0, &path, plane, 3, 0).await.unwrap();
    assert_eq!(gap.len(), 16 * 16);
    assert!(gap.data.iter().all(|&b| b == 7));
}

#[tokio::test]
async fn test_background_clamped_to_bit_depth() {
    let config = SlideConfig {
        background: Some(1000),
        ..SlideConfig::default()
    };
    let slide = open_with(
        &[sparse_level(&LevelSpec::new("sparse.dcm", 32, 32, 16), &[(0, 0)])],
        Arc::new(ImageFrameDecoder::new()),
        config,
    );

    let region = read(&slide, 16, 16, 4, 4).await.unwrap();
    assert!(region.tiles.is_empty());
    assert!(region.data.iter().all(|&b| b == 255));
}

#[tokio::test]
async fn test_misaligned_sparse_frame_skipped_with_warning() {
    let spec = LevelSpec::new("sparse.dcm", 32, 32, 16);
    let mut level = sparse_level(&spec, &[(0, 0), (1, 1)]);
    level.dataset = level
        .dataset
        .with_positions(vec![FramePosition::new(1, 1), FramePosition::new(20, 17)]);
    let slide = open(&[level]);

    let region = read(&slide, 0, 0, 32, 32).await.unwrap();
    assert_eq!(region.tiles, vec![TileCoord::new(0, 0)]);
    assert_eq!(region.pixel(20, 20), &[255]);
    assert!(slide
        .warnings()
        .iter()
        .any(|w| w.kind == WarningKind::MisalignedFramePosition));
}

// =============================================================================
// Channels
// =============================================================================

#[tokio::test]
async fn test_optical_paths_read_independently() {
    let spec = LevelSpec::new("fluo.dcm", 32, 32, 16).optical_paths(&["DAPI", "FITC"]);
    let slide = open(&[full_level(&spec)]);
    assert_eq!(
        slide.optical_paths(),
        &[OpticalPath::new("DAPI"), OpticalPath::new("FITC")]
    );

    for (channel, name) in ["DAPI", "FITC"].into_iter().enumerate() {
        let region = slide
            .read_region(0, &OpticalPath::new(name), FocalPlane::default(), 5, 5, 20, 20)
            .await
            .unwrap();
        assert_matches_pattern(&region, 5, 5, channel as u8);
    }

    let err = slide
        .read_region(0, &OpticalPath::new("CY5"), FocalPlane::default(), 0, 0, 4, 4)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegionError::FrameIndex(FrameIndexError::ChannelNotFound { .. })
    ));
}

// =============================================================================
// Focal Planes
// =============================================================================

#[tokio::test]
async fn test_focal_planes_read_independently() {
    let spec = LevelSpec::new("zstack.dcm", 48, 32, 16).focal_planes(3, 0.002);
    let slide = open(&[full_level(&spec)]);
    assert_eq!(
        slide.focal_planes(),
        &[
            FocalPlane::from_micrometers(0.0),
            FocalPlane::from_micrometers(2.0),
            FocalPlane::from_micrometers(4.0),
        ]
    );

    for plane in 0..3 {
        let region = slide
            .read_region(0, &OpticalPath::default(), spec.plane(plane), 3, 3, 40, 25)
            .await
            .unwrap();
        assert_eq!(region.tiles.len(), 6);
        assert_matches_pattern(&region, 3, 3, spec.channel(0, plane));
    }

    let err = slide
        .read_region(0, &OpticalPath::default(), FocalPlane::from_micrometers(1.0), 0, 0, 4, 4)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegionError::FrameIndex(FrameIndexError::ChannelNotFound { .. })
    ));
}

#[tokio::test]
async fn test_paths_and_planes_follow_full_frame_order() {
    let spec = LevelSpec::new("fluo-z.dcm", 32, 32, 16)
        .optical_paths(&["DAPI", "FITC"])
        .focal_planes(2, 0.001);
    let slide = open(&[full_level(&spec)]);

    for (path, name) in ["DAPI", "FITC"].into_iter().enumerate() {
        for plane in 0..2 {
            let region = slide
                .read_region(0, &OpticalPath::new(name), spec.plane(plane), 8, 8, 16, 16)
                .await
                .unwrap();
            assert_matches_pattern(&region, 8, 8, spec.channel(path, plane));
        }
    }
    assert_eq!(slide.cache_stats().await.decodes, 16);
}

#[tokio::test]
async fn test_sparse_focal_planes_filtered() {
    let spec = LevelSpec::new("sparse-z.dcm", 32, 32, 16).focal_planes(2, 0.0015);
    let slide = open(&[sparse_z_level(&spec, &[(0, 0), (1, 1)])]);
    assert_eq!(slide.focal_planes(), &[spec.plane(0), spec.plane(1)]);

    for plane in 0..2 {
        let region = slide
            .read_region(0, &OpticalPath::default(), spec.plane(plane), 0, 0, 32, 32)
            .await
            .unwrap();
        assert_eq!(region.tiles, vec![TileCoord::new(0, 0), TileCoord::new(1, 1)]);
        let channel = spec.channel(0, plane);
        assert_eq!(region.pixel(5, 5), &[sample_at(5, 5, 0, channel)]);
        assert_eq!(region.pixel(21, 21), &[sample_at(21, 21, 0, channel)]);
        assert_eq!(region.pixel(21, 5), &[255]);
    }
}

#[tokio::test]
async fn test_sparse_concatenation_split_by_plane() {
    let spec = LevelSpec::new("sparse-z.dcm", 32, 32, 16).focal_planes(2, 0.002);
    let mut parts = sparse_z_concatenation(&spec, &[(0, 0), (1, 0), (0, 1)]);
    parts.reverse();
    let slide = open(&parts);

    assert_eq!(slide.levels()[0].groups.len(), 1);
    assert_eq!(slide.focal_planes(), &[spec.plane(0), spec.plane(1)]);

    for plane in 0..2 {
        let region = slide
            .read_region(0, &OpticalPath::default(), spec.plane(plane), 0, 0, 32, 32)
            .await
            .unwrap();
        assert_eq!(region.tiles.len(), 3);
        let channel = spec.channel(0, plane);
        assert_eq!(region.pixel(20, 3), &[sample_at(20, 3, 0, channel)]);
        assert_eq!(region.pixel(3, 20), &[sample_at(3, 20, 0, channel)]);
        assert_eq!(region.pixel(20, 20), &[255]);
    }
}

// =============================================================================
// JPEG Tiles
// =============================================================================

#[tokio::test]
async fn test_jpeg_tiles_stitched() {
    let slide = open(&[jpeg_level(&LevelSpec::new("jpeg.dcm", 64, 64, 32).rgb())]);

    let region = read(&slide, 16, 16, 32, 32).await.unwrap();
    assert_eq!(region.tiles.len(), 4);
    assert_eq!(region.len(), 32 * 32 * 3);

    let corners = [
        ((0, 0), (0, 0)),
        ((31, 0), (1, 0)),
        ((0, 31), (0, 1)),
        ((31, 31), (1, 1)),
    ];
    for ((x, y), (column, row)) in corners {
        let expected = tile_color(column, row);
        let pixel = region.pixel(x, y);
        for s in 0..3 {
            assert!(
                close_to(pixel[s], expected[s], 6),
                "pixel ({x}, {y}) = {pixel:?}, expected {expected:?}"
            );
        }
    }
}
