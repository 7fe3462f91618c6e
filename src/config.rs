//! Configuration for opening slides.
//!
//! [`SlideConfig`] can be built in code, parsed from command-line arguments
//! via clap (or flattened into a host application's own parser), or read from
//! environment variables with the `WSI_` prefix:
//!
//! - `WSI_CACHE_TILES` - Max decoded tiles to cache per slide (default: 1024)
//! - `WSI_CACHE_BYTES` - Byte budget for decoded tiles; overrides the tile count
//! - `WSI_BACKGROUND` - Sample value for pixels without a tile (default: max value)
//! - `WSI_CONCATENATION_POLICY` - `fail-slide` or `disable-level` (default: fail-slide)
//! - `WSI_CHANNEL_COVERAGE` - `allow-partial` or `require-complete` (default: allow-partial)
//! - `WSI_BOUNDS_POLICY` - `strict` or `clamp` (default: strict)
//! - `WSI_REGION_TIMEOUT_MS` - Upper bound for a single region read
//! - `WSI_STRICT_ATTRIBUTES` - Require frame of reference and optical path identifiers
//!
//! # Example
//!
//! ```
//! use wsi_mosaic::config::{BoundsPolicy, SlideConfig};
//!
//! let config = SlideConfig {
//!     cache_tiles: 256,
//!     bounds_policy: BoundsPolicy::Clamp,
//!     ..SlideConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tile::CacheCapacity;

// =============================================================================
// Default Values
// =============================================================================

/// Default number of decoded tiles to cache per slide.
pub const DEFAULT_CACHE_TILES: usize = 1024;

// =============================================================================
// Policies
// =============================================================================

/// What to do when a concatenation does not cover its frames exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcatenationPolicy {
    /// Opening the slide fails
    #[default]
    FailSlide,
    /// The affected level stays in the pyramid but cannot be read
    DisableLevel,
}

/// Whether every level must provide every channel of the slide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelCoverage {
    /// Missing channels only fail reads of that channel
    #[default]
    AllowPartial,
    /// Opening fails if a level lacks a channel present elsewhere
    RequireComplete,
}

/// How region reads handle rectangles extending past the level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundsPolicy {
    /// Out-of-extent requests fail
    #[default]
    Strict,
    /// Pixels outside the level are filled with background
    Clamp,
}

// =============================================================================
// Slide Configuration
// =============================================================================

/// Options applied when opening a slide and serving reads from it.
#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(name = "wsi-mosaic")]
#[serde(default)]
pub struct SlideConfig {
    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Maximum number of decoded tiles to keep per slide.
    #[arg(long, default_value_t = DEFAULT_CACHE_TILES, env = "WSI_CACHE_TILES")]
    pub cache_tiles: usize,

    /// Byte budget for decoded tiles. Takes precedence over the tile count.
    #[arg(long, env = "WSI_CACHE_BYTES")]
    pub cache_bytes: Option<usize>,

    // =========================================================================
    // Read Configuration
    // =========================================================================
    /// Sample value used for pixels no tile covers.
    ///
    /// Defaults to the maximum sample value of the level (white for 8-bit).
    #[arg(long, env = "WSI_BACKGROUND")]
    pub background: Option<u16>,

    /// Default handling of out-of-extent region requests.
    #[arg(long, value_enum, default_value_t = BoundsPolicy::Strict, env = "WSI_BOUNDS_POLICY")]
    pub bounds_policy: BoundsPolicy,

    /// Upper bound for one region read, in milliseconds.
    #[arg(long, env = "WSI_REGION_TIMEOUT_MS")]
    pub region_timeout_ms: Option<u64>,

    // =========================================================================
    // Validation Configuration
    // =========================================================================
    /// Handling of inconsistent concatenations.
    #[arg(
        long,
        value_enum,
        default_value_t = ConcatenationPolicy::FailSlide,
        env = "WSI_CONCATENATION_POLICY"
    )]
    pub concatenation_policy: ConcatenationPolicy,

    /// Whether all levels must provide the same channels.
    #[arg(
        long,
        value_enum,
        default_value_t = ChannelCoverage::AllowPartial,
        env = "WSI_CHANNEL_COVERAGE"
    )]
    pub channel_coverage: ChannelCoverage,

    /// Require frame of reference UID and optical path identifiers.
    #[arg(long, env = "WSI_STRICT_ATTRIBUTES")]
    pub strict_attributes: bool,
}

impl Default for SlideConfig {
    fn default() -> Self {
        Self {
            cache_tiles: DEFAULT_CACHE_TILES,
            cache_bytes: None,
            background: None,
            bounds_policy: BoundsPolicy::default(),
            region_timeout_ms: None,
            concatenation_policy: ConcatenationPolicy::default(),
            channel_coverage: ChannelCoverage::default(),
            strict_attributes: false,
        }
    }
}

impl SlideConfig {
    /// Validate configuration values.
    ///
    /// Cache capacity is not checked here: a zero or tiny capacity is
    /// clamped by the cache with a warning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "region_timeout_ms",
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Cache capacity as configured (before clamping).
    pub fn cache_capacity(&self) -> CacheCapacity {
        match self.cache_bytes {
            Some(bytes) => CacheCapacity::Bytes(bytes),
            None => CacheCapacity::Tiles(self.cache_tiles),
        }
    }

    pub fn region_timeout(&self) -> Option<Duration> {
        self.region_timeout_ms.map(Duration::from_millis)
    }
}

// =============================================================================
// Tests
// =============================================================================
