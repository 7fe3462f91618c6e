//! Parsed dataset interface.
//!
//! Turning a DICOM file into attributes is the job of a parser collaborator.
//! This module defines what the tile index needs from it: attribute lookup,
//! the transfer syntax, and where every frame's bytes live.

use std::collections::HashMap;

use async_trait::async_trait;

use super::attributes::{Attribute, Value};
use super::instance::{FocalPlane, OpticalPath};
use super::optical::OpticalPathInfo;
use crate::error::DatasetError;
use crate::io::RangeReader;

/// Byte range of one encoded frame within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// Position of one frame of a sparse instance.
///
/// Column and row are the 1-based pixel position of the frame's top-left
/// corner within the total pixel matrix, as stored in the per-frame plane
/// position sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePosition {
    pub column: u32,
    pub row: u32,
    /// Focal plane of the frame; `None` means the instance's only plane
    pub focal_plane: Option<FocalPlane>,
    /// Optical path of the frame; `None` means the instance's first path
    pub optical_path: Option<OpticalPath>,
}

impl FramePosition {
    pub fn new(column: u32, row: u32) -> Self {
        Self {
            column,
            row,
            focal_plane: None,
            optical_path: None,
        }
    }

    /// Set the z offset in µm.
    pub fn with_z_offset(mut self, micrometers: f64) -> Self {
        self.focal_plane = Some(FocalPlane::from_micrometers(micrometers));
        self
    }

    pub fn with_optical_path(mut self, path: impl Into<OpticalPath>) -> Self {
        self.optical_path = Some(path.into());
        self
    }
}

/// A parsed instance, as produced by a [`DatasetParser`].
pub trait Dataset: Send + Sync {
    /// Identifier of the source stream (for logging and error messages).
    fn identifier(&self) -> &str;

    /// Look up an attribute by tag.
    fn attribute(&self, attribute: Attribute) -> Option<&Value>;

    /// Transfer syntax UID of the pixel data.
    fn transfer_syntax(&self) -> &str;

    /// Number of frames present in the pixel data.
    fn frame_count(&self) -> u32 {
        self.frame_ranges().len() as u32
    }

    /// Byte ranges of every frame, in frame order.
    fn frame_ranges(&self) -> &[ByteRange];

    /// Per-frame positions, present for sparse tile organization.
    fn frame_positions(&self) -> Option<&[FramePosition]>;

    /// Items of the optical path sequence.
    fn optical_path_info(&self) -> &[OpticalPathInfo] {
        &[]
    }
}

/// Turns a byte stream into a [`Dataset`].
#[async_trait]
pub trait DatasetParser: Send + Sync {
    /// Parse the stream's attributes and frame table.
    ///
    /// # Errors
    /// Returns `DatasetError` if the stream cannot be read or parsed.
    async fn parse(&self, reader: &dyn RangeReader) -> Result<Box<dyn Dataset>, DatasetError>;
}

// =============================================================================
// InMemoryDataset
// =============================================================================

/// Map-backed dataset for callers that already hold parsed attributes.
///
/// # Example
///
/// ```
/// use wsi_mosaic::format::{Attribute, ByteRange, Dataset, InMemoryDataset};
///
/// let dataset = InMemoryDataset::new("level0.dcm", "1.2.840.10008.1.2.1")
///     .with(Attribute::Rows, 256u32)
///     .with(Attribute::Columns, 256u32)
///     .with_frames(vec![ByteRange::new(1024, 196_608)]);
///
/// assert_eq!(dataset.frame_count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    identifier: String,
    transfer_syntax: String,
    attributes: HashMap<Attribute, Value>,
    frames: Vec<ByteRange>,
    positions: Option<Vec<FramePosition>>,
    optical_path_info: Vec<OpticalPathInfo>,
}

impl InMemoryDataset {
    pub fn new(identifier: impl Into<String>, transfer_syntax: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            transfer_syntax: transfer_syntax.into(),
            ..Default::default()
        }
    }

    /// Set an attribute value.
    pub fn with(mut self, attribute: Attribute, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute, value.into());
        self
    }

    /// Remove an attribute.
    pub fn without(mut self, attribute: Attribute) -> Self {
        self.attributes.remove(&attribute);
        self
    }

    pub fn with_frames(mut self, frames: Vec<ByteRange>) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_positions(mut self, positions: Vec<FramePosition>) -> Self {
        self.positions = Some(positions);
        self
    }

    /// Append an optical path sequence item.
    pub fn with_optical_path_info(mut self, info: OpticalPathInfo) -> Self {
        self.optical_path_info.push(info);
        self
    }

    pub fn set(&mut self, attribute: Attribute, value: impl Into<Value>) {
        self.attributes.insert(attribute, value.into());
    }
}

impl Dataset for InMemoryDataset {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn attribute(&self, attribute: Attribute) -> Option<&Value> {
        self.attributes.get(&attribute)
    }

    fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    fn frame_ranges(&self) -> &[ByteRange] {
        &self.frames
    }

    fn frame_positions(&self) -> Option<&[FramePosition]> {
        self.positions.as_deref()
    }

    fn optical_path_info(&self) -> &[OpticalPathInfo] {
        &self.optical_path_info
    }
}
