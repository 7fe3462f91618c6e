//! Region stitcher.
//!
//! Turns a pixel rectangle of one level and channel into a contiguous sample
//! buffer by fetching the covering tiles through the [`TileCache`] and
//! copying their overlaps row by row.
//!
//! # Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RegionStitcher                           │
//! │  1. Resolve level    3. Look up frame index  5. Fetch tiles     │
//! │  2. Check bounds     4. Fill background         concurrently    │
//! │                                              6. Copy overlaps   │
//! └──────────┬───────────────────┬────────────────────┬─────────────┘
//!            ▼                   ▼                    ▼
//!     ┌─────────────┐   ┌──────────────────┐   ┌─────────────┐
//!     │LevelPyramid │   │FrameIndexRegistry│   │  TileCache  │
//!     └─────────────┘   └──────────────────┘   └──────┬──────┘
//!                                                     ▼
//!                                        read_frame → spawn_blocking decode
//! ```
//!
//! Tiles without a frame (sparse gaps) and pixels outside the level (with
//! [`BoundsPolicy::Clamp`]) are filled with the background value.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use super::cache::{fill_samples, DecodedTile, TileCache, TileKey};
use crate::config::{BoundsPolicy, SlideConfig};
use crate::error::{DecodeError, RegionError, TileError};
use crate::format::{FocalPlane, FrameDecoder, Instance, OpticalPath};
use crate::slide::{
    Availability, FrameIndexRegistry, FrameLocator, Level, LevelPyramid, TileCoord,
};

// =============================================================================
// Request and Result
// =============================================================================

/// A rectangle of one level and channel.
///
/// `x` and `y` may be negative, and the rectangle may extend past the level,
/// when the request uses [`BoundsPolicy::Clamp`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegionRequest {
    pub level: usize,
    pub optical_path: OpticalPath,
    pub focal_plane: FocalPlane,
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    /// Overrides the slide's default bounds policy
    pub bounds: Option<BoundsPolicy>,
}

impl RegionRequest {
    /// Request a rectangle of the default channel.
    pub fn new(level: usize, x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            level,
            optical_path: OpticalPath::default(),
            focal_plane: FocalPlane::default(),
            x,
            y,
            width,
            height,
            bounds: None,
        }
    }

    pub fn with_channel(mut self, optical_path: OpticalPath, focal_plane: FocalPlane) -> Self {
        self.optical_path = optical_path;
        self.focal_plane = focal_plane;
        self
    }

    pub fn with_bounds(mut self, bounds: BoundsPolicy) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

/// Stitched pixels of a region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    /// Row-major interleaved samples, `width * height * samples_per_pixel *
    /// bytes_per_sample` bytes
    #[serde(skip)]
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub samples_per_pixel: u16,
    pub bytes_per_sample: usize,
    /// Tiles that contributed pixels, sorted
    pub tiles: Vec<TileCoord>,
}

impl Region {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Samples of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let pixel_bytes = self.samples_per_pixel as usize * self.bytes_per_sample;
        let start = (y as usize * self.width as usize + x as usize) * pixel_bytes;
        &self.data[start..start + pixel_bytes]
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation for region reads.
///
/// Cancelling makes pending reads return [`RegionError::Cancelled`]. Tile
/// decodes already dispatched keep running and still populate the cache.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Region Stitcher
// =============================================================================

/// Reads regions and tiles of one slide.
///
/// Cloning is cheap; clones share the pyramid, indices and cache.
#[derive(Clone)]
pub struct RegionStitcher {
    pyramid: Arc<LevelPyramid>,
    indices: Arc<FrameIndexRegistry>,
    cache: TileCache,
    decoder: Arc<dyn FrameDecoder>,
    background: Option<u16>,
    bounds: BoundsPolicy,
    timeout: Option<Duration>,
}

impl RegionStitcher {
    pub fn new(
        pyramid: Arc<LevelPyramid>,
        indices: Arc<FrameIndexRegistry>,
        cache: TileCache,
        decoder: Arc<dyn FrameDecoder>,
        config: &SlideConfig,
    ) -> Self {
        Self {
            pyramid,
            indices,
            cache,
            decoder,
            background: config.background,
            bounds: config.bounds_policy,
            timeout: config.region_timeout(),
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Read a region, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `RegionError::InvalidLevel` or `LevelUnavailable` for levels
    /// that cannot be read, `OutOfBounds` for rectangles past the level
    /// under the strict policy, `FrameIndex` if the level lacks the channel,
    /// `Tile` if a covering tile fails, and `TimedOut` when the timeout
    /// elapses first.
    pub async fn read(&self, request: &RegionRequest) -> Result<Region, RegionError> {
        match self.timeout {
            Some(after) => tokio::time::timeout(after, self.stitch(request))
                .await
                .map_err(|_| RegionError::TimedOut { after })?,
            None => self.stitch(request).await,
        }
    }

    /// Read a region, returning `RegionError::Cancelled` as soon as
    /// `cancel` fires.
    pub async fn read_cancellable(
        &self,
        request: &RegionRequest,
        cancel: &CancelToken,
    ) -> Result<Region, RegionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RegionError::Cancelled),
            result = self.read(request) => result,
        }
    }

    /// Read one whole decoded tile. Sparse gaps yield a background tile.
    ///
    /// # Errors
    ///
    /// Returns `RegionError::OutOfBounds` for coordinates outside the tile
    /// grid, plus the level, channel and tile errors of [`read`](Self::read).
    pub async fn tile(
        &self,
        level: usize,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
        coord: TileCoord,
    ) -> Result<Arc<DecodedTile>, RegionError> {
        let level = self.readable_level(level)?;
        if coord.column >= level.tiles_x() || coord.row >= level.tiles_y() {
            return Err(RegionError::OutOfBounds {
                level: level.index,
                x: coord.column as i64 * level.tile_width as i64,
                y: coord.row as i64 * level.tile_height as i64,
                width: level.tile_width,
                height: level.tile_height,
                level_width: level.width,
                level_height: level.height,
            });
        }

        let index = self.indices.get(level.index, optical_path, focal_plane)?;
        match index.locate(coord) {
            Some(locator) => {
                let key = TileKey::new(
                    level.index,
                    optical_path.clone(),
                    focal_plane,
                    coord.column,
                    coord.row,
                );
                let fetched = match instance_for(level, locator) {
                    Ok(instance) => self.fetch(key, instance, locator.frame).await,
                    Err(err) => Err(err),
                };
                fetched.map_err(|source| RegionError::Tile {
                    column: coord.column,
                    row: coord.row,
                    source,
                })
            }
            None => Ok(Arc::new(DecodedTile::filled(
                level.tile_width,
                level.tile_height,
                level.sample_format.samples_per_pixel,
                level.sample_format.bytes_per_sample(),
                self.background_value(level),
            ))),
        }
    }

    fn readable_level(&self, index: usize) -> Result<&Level, RegionError> {
        let level = self.pyramid.level(index)?;
        match &level.availability {
            Availability::Available => Ok(level),
            Availability::Disabled { reason } => Err(RegionError::LevelUnavailable {
                level: index,
                reason: reason.clone(),
            }),
        }
    }

    /// Background sample value for a level, clamped to its bit depth.
    fn background_value(&self, level: &Level) -> u16 {
        let bits = level.sample_format.bits_allocated.min(16);
        let max = ((1u32 << bits) - 1) as u16;
        self.background.map_or(max, |value| value.min(max))
    }

    async fn stitch(&self, request: &RegionRequest) -> Result<Region, RegionError> {
        let level = self.readable_level(request.level)?;
        let samples_per_pixel = level.sample_format.samples_per_pixel;
        let bytes_per_sample = level.sample_format.bytes_per_sample();
        let pixel_bytes = level.sample_format.bytes_per_pixel();

        if request.width == 0 || request.height == 0 {
            return Ok(Region {
                data: Bytes::new(),
                width: request.width,
                height: request.height,
                samples_per_pixel,
                bytes_per_sample,
                tiles: Vec::new(),
            });
        }

        let (x, y) = (request.x, request.y);
        let (level_width, level_height) = (level.width as i64, level.height as i64);
        let out_of_bounds = || RegionError::OutOfBounds {
            level: level.index,
            x,
            y,
            width: request.width,
            height: request.height,
            level_width: level.width,
            level_height: level.height,
        };

        // Rectangles whose far edge is not representable are outside any level
        let right = x
            .checked_add(request.width as i64)
            .ok_or_else(out_of_bounds)?;
        let bottom = y
            .checked_add(request.height as i64)
            .ok_or_else(out_of_bounds)?;

        if request.bounds.unwrap_or(self.bounds) == BoundsPolicy::Strict
            && (x < 0 || y < 0 || right > level_width || bottom > level_height)
        {
            return Err(out_of_bounds());
        }

        let index = self
            .indices
            .get(level.index, &request.optical_path, request.focal_plane)?;

        let background = self.background_value(level);
        let mut data = fill_samples(
            request.width as usize * request.height as usize * samples_per_pixel as usize,
            bytes_per_sample,
            background,
        );

        // Part of the request inside the level
        let (x0, y0) = (x.max(0), y.max(0));
        let (x1, y1) = (right.min(level_width), bottom.min(level_height));

        let mut tiles = Vec::new();
        if x0 < x1 && y0 < y1 {
            let (tw, th) = (level.tile_width as i64, level.tile_height as i64);
            let mut fetches = JoinSet::new();

            for row in (y0 / th)..=((y1 - 1) / th) {
                for column in (x0 / tw)..=((x1 - 1) / tw) {
                    let coord = TileCoord::new(column as u32, row as u32);
                    let Some(locator) = index.locate(coord) else {
                        continue;
                    };
                    let key = TileKey::new(
                        level.index,
                        request.optical_path.clone(),
                        request.focal_plane,
                        coord.column,
                        coord.row,
                    );
                    let instance =
                        instance_for(level, locator).map_err(|source| RegionError::Tile {
                            column: coord.column,
                            row: coord.row,
                            source,
                        })?;
                    let stitcher = self.clone();
                    fetches.spawn(async move {
                        let result = stitcher.fetch(key, instance, locator.frame).await;
                        (coord, result)
                    });
                }
            }

            let stride = request.width as usize * pixel_bytes;
            while let Some(joined) = fetches.join_next().await {
                let (coord, result) = joined.map_err(|err| RegionError::Aborted(err.to_string()))?;
                let tile = result.map_err(|source| RegionError::Tile {
                    column: coord.column,
                    row: coord.row,
                    source,
                })?;

                let (tile_x, tile_y) = (coord.column as i64 * tw, coord.row as i64 * th);
                let ox0 = x0.max(tile_x);
                let ox1 = x1.min(tile_x + tile.width as i64);
                let oy0 = y0.max(tile_y);
                let oy1 = y1.min(tile_y + tile.height as i64);
                if ox0 >= ox1 || oy0 >= oy1 {
                    continue;
                }

                let src_start = (ox0 - tile_x) as usize * pixel_bytes;
                let len = (ox1 - ox0) as usize * pixel_bytes;
                for py in oy0..oy1 {
                    let src = &tile.row((py - tile_y) as u32)[src_start..src_start + len];
                    let dst = (py - y) as usize * stride + (ox0 - x) as usize * pixel_bytes;
                    data[dst..dst + len].copy_from_slice(src);
                }
                tiles.push(coord);
            }
        }
        tiles.sort_unstable_by_key(|c| (c.row, c.column));

        debug!(
            level = level.index,
            x,
            y,
            width = request.width,
            height = request.height,
            tiles = tiles.len(),
            "Stitched region"
        );

        Ok(Region {
            data: Bytes::from(data),
            width: request.width,
            height: request.height,
            samples_per_pixel,
            bytes_per_sample,
            tiles,
        })
    }

    /// Get a decoded tile through the cache, loading it on a miss.
    async fn fetch(
        &self,
        key: TileKey,
        instance: Arc<Instance>,
        frame: u32,
    ) -> Result<Arc<DecodedTile>, TileError> {
        let decoder = Arc::clone(&self.decoder);
        self.cache
            .get_or_decode(key, move || load_tile(instance, frame, decoder))
            .await
    }
}

fn instance_for(level: &Level, locator: FrameLocator) -> Result<Arc<Instance>, TileError> {
    level
        .instances
        .get(locator.instance as usize)
        .cloned()
        .ok_or_else(|| {
            TileError::Aborted(format!(
                "level {} has no instance {}",
                level.index, locator.instance
            ))
        })
}

/// Read one frame and decode it on the blocking pool.
async fn load_tile(
    instance: Arc<Instance>,
    frame: u32,
    decoder: Arc<dyn FrameDecoder>,
) -> Result<Arc<DecodedTile>, TileError> {
    let encoded = instance.read_frame(frame).await?;
    let params = instance.decode_params();
    let expected = params.decoded_len();

    let (samples, params) = tokio::task::spawn_blocking(move || {
        decoder
            .decode(&encoded, &params)
            .map(|samples| (samples, params))
    })
    .await
    .map_err(|err| TileError::Aborted(err.to_string()))??;

    if samples.len() != expected {
        return Err(DecodeError::SizeMismatch {
            expected,
            actual: samples.len(),
        }
        .into());
    }

    Ok(Arc::new(DecodedTile {
        data: Bytes::from(samples),
        width: params.columns,
        height: params.rows,
        samples_per_pixel: params.samples_per_pixel,
        bytes_per_sample: params.bytes_per_sample(),
    }))
}

// =============================================================================
// Tests
// =============================================================================
