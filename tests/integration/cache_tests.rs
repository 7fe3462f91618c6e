//! Cache and read lifecycle integration tests.
//!
//! Tests verify:
//! - Concurrent reads of one tile share a single decode
//! - Failed decodes are reported but never cached
//! - Capacity limits evict least recently used tiles
//! - Timeouts and cancellation end reads without poisoning the cache
//! - Closing a slide drops cached tiles and rejects reads

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use wsi_mosaic::error::{DecodeError, RegionError, TileError};
use wsi_mosaic::format::{FocalPlane, OpticalPath, WarningKind};
use wsi_mosaic::slide::{Slide, SlideState, TileCoord};
use wsi_mosaic::{CancelToken, RegionRequest, SlideConfig};

use super::test_utils::{
    full_level, init_tracing, open_with, sample_at, CountingDecoder, LevelSpec,
};

fn level() -> LevelSpec {
    LevelSpec::new("level0.dcm", 128, 128, 32)
}

fn open_counting(decoder: &Arc<CountingDecoder>, config: SlideConfig) -> Slide {
    open_with(&[full_level(&level())], decoder.clone(), config)
}

fn request(x: i64, y: i64, width: u32, height: u32) -> RegionRequest {
    RegionRequest::new(0, x, y, width, height)
}

// =============================================================================
// Single Flight
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tile_reads_decode_once() {
    let decoder = Arc::new(CountingDecoder::new().with_delay(Duration::from_millis(50)));
    let slide = open_counting(&decoder, SlideConfig::default());

    let mut reads = JoinSet::new();
    for _ in 0..16 {
        let slide = slide.clone();
        reads.spawn(async move {
            slide
                .read_tile(0, &OpticalPath::default(), FocalPlane::default(), 1, 1)
                .await
        });
    }

    let mut tiles = Vec::new();
    while let Some(joined) = reads.join_next().await {
        tiles.push(joined.unwrap().unwrap());
    }

    assert_eq!(decoder.calls(), 1);
    assert!(tiles.iter().all(|t| t.data == tiles[0].data));
    assert_eq!(slide.cache_stats().await.decodes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_regions_share_decodes() {
    let decoder = Arc::new(CountingDecoder::new().with_delay(Duration::from_millis(20)));
    let slide = open_counting(&decoder, SlideConfig::default());

    let mut reads = JoinSet::new();
    for i in 0..8 {
        let slide = slide.clone();
        // All regions lie within tiles (0, 0) .. (1, 1)
        reads.spawn(async move { slide.read(&request(i, i, 40, 40)).await });
    }

    while let Some(joined) = reads.join_next().await {
        let region = joined.unwrap().unwrap();
        assert_eq!(region.tiles.len(), 4);
    }
    assert_eq!(decoder.calls(), 4);
}

#[tokio::test]
async fn test_cache_hits_counted() {
    let decoder = Arc::new(CountingDecoder::new());
    let slide = open_counting(&decoder, SlideConfig::default());

    slide.read(&request(0, 0, 64, 64)).await.unwrap();
    slide.read(&request(0, 0, 64, 64)).await.unwrap();

    let stats = slide.cache_stats().await;
    assert_eq!(stats.entries, 4);
    assert_eq!(stats.decodes, 4);
    assert_eq!(stats.hits, 4);
    assert_eq!(stats.bytes, 4 * 32 * 32);
    assert_eq!(decoder.calls(), 4);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_failed_decode_not_cached() {
    let decoder = Arc::new(CountingDecoder::new().failing_first(1));
    let slide = open_counting(&decoder, SlideConfig::default());

    let err = slide.read(&request(0, 0, 8, 8)).await.unwrap_err();
    match err {
        RegionError::Tile {
            column: 0,
            row: 0,
            source: TileError::Decode(DecodeError::Malformed { message }),
        } => assert_eq!(message, "injected failure"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(slide.cache_stats().await.entries, 0);

    // The next read retries the decode
    let region = slide.read(&request(0, 0, 8, 8)).await.unwrap();
    assert_eq!(region.pixel(7, 7), &[sample_at(7, 7, 0, 0)]);
    assert_eq!(decoder.calls(), 2);
}

#[tokio::test]
async fn test_failure_isolated_to_its_tile() {
    let decoder = Arc::new(CountingDecoder::new().failing_first(1));
    let slide = open_counting(&decoder, SlideConfig::default());

    assert!(slide
        .read_tile(0, &OpticalPath::default(), FocalPlane::default(), 3, 3)
        .await
        .is_err());

    let region = slide.read(&request(0, 0, 32, 32)).await.unwrap();
    assert_eq!(region.tiles, vec![TileCoord::new(0, 0)]);
    assert_eq!(region.pixel(31, 31), &[sample_at(31, 31, 0, 0)]);
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test]
async fn test_capacity_evicts_least_recently_used() {
    let decoder = Arc::new(CountingDecoder::new());
    let config = SlideConfig {
        cache_tiles: 16,
        ..SlideConfig::default()
    };
    let slide = open_with(
        &[full_level(&LevelSpec::new("level0.dcm", 160, 128, 32))],
        decoder.clone(),
        config,
    );

    // 5 x 4 = 20 tiles
    slide.read(&request(0, 0, 160, 128)).await.unwrap();
    let stats = slide.cache_stats().await;
    assert_eq!(stats.entries, 16);
    assert_eq!(stats.evictions, 4);

    // Still correct after eviction, at the cost of new decodes
    let region = slide.read(&request(0, 0, 160, 128)).await.unwrap();
    assert_eq!(region.pixel(150, 120), &[sample_at(150, 120, 0, 0)]);
    assert!(decoder.calls() > 20);
}

#[tokio::test]
async fn test_zero_capacity_clamped_with_warning() {
    let decoder = Arc::new(CountingDecoder::new());
    let config = SlideConfig {
        cache_tiles: 0,
        ..SlideConfig::default()
    };
    let slide = open_counting(&decoder, config);

    assert!(slide
        .warnings()
        .iter()
        .any(|w| w.kind == WarningKind::CacheCapacityMisconfiguration));

    slide.read(&request(0, 0, 128, 128)).await.unwrap();
    assert_eq!(slide.cache_stats().await.entries, 16);
}

// =============================================================================
// Timeout and Cancellation
// =============================================================================

#[tokio::test]
async fn test_region_timeout() {
    let decoder = Arc::new(CountingDecoder::new().with_delay(Duration::from_millis(300)));
    let config = SlideConfig {
        region_timeout_ms: Some(20),
        ..SlideConfig::default()
    };
    let slide = open_counting(&decoder, config);

    let err = slide.read(&request(0, 0, 8, 8)).await.unwrap_err();
    assert!(matches!(
        err,
        RegionError::TimedOut { after } if after == Duration::from_millis(20)
    ));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let decoder = Arc::new(CountingDecoder::new());
    let slide = open_counting(&decoder, SlideConfig::default());

    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(cancel.is_cancelled());

    let err = slide
        .read_region_cancellable(&request(0, 0, 8, 8), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RegionError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_read_still_populates_cache() {
    init_tracing();
    let decoder = Arc::new(CountingDecoder::new().with_delay(Duration::from_millis(200)));
    let slide = open_counting(&decoder, SlideConfig::default());

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = slide
        .read_region_cancellable(&request(0, 0, 8, 8), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RegionError::Cancelled));

    // The abandoned decode finishes and is reused
    let region = slide.read(&request(0, 0, 8, 8)).await.unwrap();
    assert_eq!(region.pixel(0, 0), &[sample_at(0, 0, 0, 0)]);
    assert_eq!(decoder.calls(), 1);
}

// =============================================================================
// Closing
// =============================================================================

#[tokio::test]
async fn test_close_clears_cache_and_rejects_reads() {
    let decoder = Arc::new(CountingDecoder::new());
    let slide = open_counting(&decoder, SlideConfig::default());

    slide.read(&request(0, 0, 64, 64)).await.unwrap();
    assert_eq!(slide.cache_stats().await.entries, 4);

    slide.close().await;
    assert_eq!(slide.state(), SlideState::Closed);
    assert_eq!(slide.cache_stats().await.entries, 0);

    assert!(matches!(
        slide.read(&request(0, 0, 8, 8)).await,
        Err(RegionError::SlideClosed)
    ));
    assert!(matches!(
        slide
            .read_tile(0, &OpticalPath::default(), FocalPlane::default(), 0, 0)
            .await,
        Err(RegionError::SlideClosed)
    ));
    assert!(matches!(
        slide
            .read_region_cancellable(&request(0, 0, 8, 8), &CancelToken::new())
            .await,
        Err(RegionError::SlideClosed)
    ));

    // Metadata stays available
    assert_eq!(slide.levels().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_during_decode_leaves_cache_empty() {
    let decoder = Arc::new(CountingDecoder::new().with_delay(Duration::from_millis(300)));
    let slide = open_counting(&decoder, SlideConfig::default());

    let pending = {
        let slide = slide.clone();
        tokio::spawn(async move { slide.read(&request(0, 0, 64, 64)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    slide.close().await;

    // Decodes started before closing run to completion
    let _ = pending.await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let stats = slide.cache_stats().await;
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.bytes, 0);
    assert_eq!(slide.state(), SlideState::Closed);
}

#[tokio::test]
async fn test_close_affects_every_clone() {
    let decoder = Arc::new(CountingDecoder::new());
    let slide = open_counting(&decoder, SlideConfig::default());
    let other = slide.clone();

    other.close().await;
    assert_eq!(slide.state(), SlideState::Closed);
    assert!(matches!(
        slide.read(&request(0, 0, 8, 8)).await,
        Err(RegionError::SlideClosed)
    ));
}
