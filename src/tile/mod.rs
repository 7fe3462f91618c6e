//! Tile layer.
//!
//! This module decodes tiles on demand, caches them and stitches them into
//! regions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Slide                   │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │            RegionStitcher               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │  FrameDecoder   │  │
//! │  │  (decoded    │  │  (blocking      │  │
//! │  │   tiles)     │  │   pool)         │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │      LevelPyramid + FrameIndex          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`RegionStitcher`]: Covers a rectangle with tiles and composites them
//! - [`TileCache`]: Single-flight LRU cache of decoded tiles
//! - [`TileKey`]: Level, channel and grid position of a tile
//! - [`RegionRequest`] / [`Region`]: Input and output of a region read
//! - [`CancelToken`]: Abandons pending region reads

mod cache;
mod stitcher;

pub use cache::{
    CacheCapacity, CacheStats, DecodedTile, TileCache, TileKey, MIN_CACHE_BYTES, MIN_CACHE_TILES,
};
pub use stitcher::{CancelToken, Region, RegionRequest, RegionStitcher};
