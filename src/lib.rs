//! # WSI Mosaic
//!
//! Tile indexing and region stitching for DICOM Whole Slide Images.
//!
//! A DICOM slide is a pyramid of resolution levels, each cut into fixed-size
//! tiles (frames) and spread over one or more instance files. A level may be
//! split across concatenated files, and several optical paths and focal
//! planes may share a level. This library groups the instances into a
//! validated pyramid, indexes where every tile lives, and reads arbitrary
//! pixel rectangles by decoding, cropping and compositing the tiles that
//! cover them.
//!
//! ## Features
//!
//! - **Lazy pixels**: metadata is validated at open, frames are read and
//!   decoded only when a read touches them
//! - **Concatenations**: frame sequences split across files are resolved and
//!   checked for gaps and overlaps
//! - **Sparse tiling**: per-frame positions, missing tiles filled with a
//!   background value
//! - **Single-flight cache**: concurrent reads of a tile share one decode
//! - **Built-in DICOM parsing**: Part 10 headers are decoded with
//!   `dicom-object`; other containers plug in through [`DatasetParser`]
//!
//! ## Architecture
//!
//! - [`io`] - Positional byte access to instance files
//! - [`mod@format`] - Instance metadata, DICOM parsing, optical paths and frame decoding
//! - [`slide`] - Grouping into levels, frame indices and the [`Slide`] handle
//! - [`tile`] - Decoded tile cache and region stitching
//! - [`config`] - Configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wsi_mosaic::{
//!     FocalPlane, ImageFrameDecoder, InstanceSource, OpticalPath, Slide, SlideConfig,
//! };
//!
//! # async fn example(sources: Vec<InstanceSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let slide = Slide::open_datasets(
//!     sources,
//!     Arc::new(ImageFrameDecoder::new()),
//!     SlideConfig::default(),
//! )?;
//!
//! let region = slide
//!     .read_region(0, &OpticalPath::default(), FocalPlane::default(), 0, 0, 512, 512)
//!     .await?;
//! println!("{} bytes from {} tiles", region.len(), region.tiles.len());
//!
//! slide.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use config::{BoundsPolicy, ChannelCoverage, ConcatenationPolicy, SlideConfig};
pub use error::{
    ConcatenationError, ConfigError, DatasetError, DecodeError, FrameIndexError, IoError,
    LutError, OpenError, PyramidError, RegionError, TileError, ValidationError,
};
pub use format::{
    Attribute, ByteRange, Dataset, DatasetParser, DicomObjectParser, ExtendedDepthOfField,
    FocalPlane, FocusMethod, FramePosition, FrameDecoder, ImageFlavor, ImageFrameDecoder,
    InMemoryDataset, Instance, OpticalPath, OpticalPathInfo, PaletteLut, PixelSpacing,
    SlideWarning, TransferSyntax, WarningKind,
};
pub use io::{FileRangeReader, MemoryRangeReader, RangeReader};
pub use slide::{
    AssociatedImage, FrameIndex, InstanceSource, Level, LevelDescriptor, LevelRequest, Point,
    Slide, SlideExtent, SlideIdentity, SlideState, TileCoord,
};
pub use tile::{CacheCapacity, CacheStats, CancelToken, DecodedTile, Region, RegionRequest};
