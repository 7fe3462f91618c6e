//! Level pyramid.
//!
//! Levels are ordered from finest (index 0) to coarsest by declared pixel
//! spacing. Ratios between levels are whatever the instances declare; they
//! are never assumed to be powers of two.

use std::sync::Arc;

use serde::Serialize;

use super::frame_index::FrameLocator;
use crate::error::PyramidError;
use crate::format::{
    ExtendedDepthOfField, FocalPlane, FocusMethod, Instance, OpticalPath, PixelSpacing,
    SampleFormat, TileOrganization,
};

/// Relative slack when comparing a level's spacing to a requested spacing.
const SELECTION_TOLERANCE: f64 = 1e-6;

// =============================================================================
// Channel Groups
// =============================================================================

/// One instance's share of a channel group's frame sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    /// Index into the level's instances
    pub instance: usize,
    /// First frame of this member within the group's sequence
    pub first_frame: u64,
    pub frame_count: u32,
}

/// A frame sequence feeding one or more channels of a level.
///
/// A group is either a single instance or a resolved concatenation whose
/// members partition the sequence into contiguous ranges.
#[derive(Debug, Clone)]
pub struct ChannelGroup {
    /// Concatenation UID, or the instance UID for a single instance
    pub uid: String,
    /// Members ordered by first frame
    pub members: Vec<GroupMember>,
    pub optical_paths: Vec<OpticalPath>,
    pub focal_planes: Vec<FocalPlane>,
    pub organization: TileOrganization,
}

impl ChannelGroup {
    pub fn total_frames(&self) -> u64 {
        self.members.iter().map(|m| m.frame_count as u64).sum()
    }

    /// Translate a frame of the group's sequence to the member holding it.
    pub fn locate(&self, frame: u64) -> Option<FrameLocator> {
        let idx = self
            .members
            .partition_point(|m| m.first_frame <= frame)
            .checked_sub(1)?;
        let member = &self.members[idx];
        let local = frame - member.first_frame;
        if local >= member.frame_count as u64 {
            return None;
        }
        Some(FrameLocator {
            instance: member.instance as u32,
            frame: local as u32,
        })
    }

    /// Position of a channel within the group's path and plane lists.
    pub fn channel_position(
        &self,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
    ) -> Option<(usize, usize)> {
        let path_idx = self.optical_paths.iter().position(|p| p == optical_path)?;
        let plane_idx = self.focal_planes.iter().position(|z| *z == focal_plane)?;
        Some((path_idx, plane_idx))
    }

    pub fn channels(&self) -> impl Iterator<Item = (OpticalPath, FocalPlane)> + '_ {
        self.optical_paths
            .iter()
            .flat_map(move |p| self.focal_planes.iter().map(move |z| (p.clone(), *z)))
    }
}

// =============================================================================
// Level
// =============================================================================

/// Whether a level can serve reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Disabled { reason: String },
}

/// One resolution level of the slide.
#[derive(Debug, Clone)]
pub struct Level {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub pixel_spacing: PixelSpacing,
    /// Downsample factor relative to level 0
    pub downsample: f64,
    pub organization: TileOrganization,
    pub sample_format: SampleFormat,
    pub instances: Vec<Arc<Instance>>,
    pub groups: Vec<ChannelGroup>,
    pub availability: Availability,
}

impl Level {
    /// Number of tiles in X direction.
    pub fn tiles_x(&self) -> u32 {
        self.width.div_ceil(self.tile_width)
    }

    /// Number of tiles in Y direction.
    pub fn tiles_y(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    /// Find the group providing a channel, with the channel's path and
    /// plane index inside that group.
    pub fn channel_group(
        &self,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
    ) -> Option<(&ChannelGroup, usize, usize)> {
        self.groups.iter().find_map(|group| {
            group
                .channel_position(optical_path, focal_plane)
                .map(|(p, z)| (group, p, z))
        })
    }

    /// All channels of this level, sorted.
    pub fn channels(&self) -> Vec<(OpticalPath, FocalPlane)> {
        let mut channels: Vec<_> = self.groups.iter().flat_map(|g| g.channels()).collect();
        channels.sort();
        channels.dedup();
        channels
    }

    pub fn descriptor(&self) -> LevelDescriptor {
        let channels = self.channels();
        let mut optical_paths: Vec<OpticalPath> =
            channels.iter().map(|(p, _)| p.clone()).collect();
        optical_paths.dedup();
        let mut focal_planes: Vec<FocalPlane> = channels.iter().map(|(_, z)| *z).collect();
        focal_planes.sort_unstable();
        focal_planes.dedup();
        let first = self.instances.first();

        LevelDescriptor {
            index: self.index,
            width: self.width,
            height: self.height,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            tiles_x: self.tiles_x(),
            tiles_y: self.tiles_y(),
            pixel_spacing: self.pixel_spacing,
            downsample: self.downsample,
            organization: self.organization,
            sample_format: self.sample_format.clone(),
            optical_paths,
            focal_planes,
            focus_method: first.and_then(|i| i.focus_method),
            extended_depth_of_field: first.and_then(|i| i.extended_depth_of_field),
            slice_thickness: first.and_then(|i| i.slice_thickness),
            available: self.is_available(),
        }
    }
}

/// Snapshot of level metadata for callers and export layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelDescriptor {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub pixel_spacing: PixelSpacing,
    pub downsample: f64,
    pub organization: TileOrganization,
    pub sample_format: SampleFormat,
    pub optical_paths: Vec<OpticalPath>,
    pub focal_planes: Vec<FocalPlane>,
    pub focus_method: Option<FocusMethod>,
    pub extended_depth_of_field: Option<ExtendedDepthOfField>,
    /// Depth of field of one plane in mm
    pub slice_thickness: Option<f64>,
    pub available: bool,
}

// =============================================================================
// Pyramid
// =============================================================================

/// Target resolution for level selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LevelRequest {
    /// Pixel spacing in mm
    PixelSpacing(f64),
    /// Downsample factor relative to level 0
    Downsample(f64),
}

/// A point in a level's pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Ordered levels of one slide.
#[derive(Debug, Clone, Default)]
pub struct LevelPyramid {
    levels: Vec<Level>,
}

impl LevelPyramid {
    /// Create a pyramid from levels already sorted finest first.
    pub fn new(levels: Vec<Level>) -> Self {
        Self { levels }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Get a level by index.
    ///
    /// # Errors
    /// Returns `PyramidError::InvalidLevel` if the index is out of range.
    pub fn level(&self, index: usize) -> Result<&Level, PyramidError> {
        self.levels.get(index).ok_or(PyramidError::InvalidLevel {
            level: index,
            level_count: self.levels.len(),
        })
    }

    fn base_spacing(&self) -> Result<f64, PyramidError> {
        self.levels
            .first()
            .map(|l| l.pixel_spacing.mean())
            .ok_or(PyramidError::InvalidLevel {
                level: 0,
                level_count: 0,
            })
    }

    /// Select the level best matching a requested resolution.
    ///
    /// Without upscaling, the coarsest available level whose pixel spacing
    /// does not exceed the request is chosen, so the result is never
    /// coarser than asked for. With upscaling, the available level closest
    /// to the request in log scale wins. Ties go to the finer level.
    ///
    /// # Errors
    ///
    /// Returns `PyramidError::InvalidRequest` for non-positive requests and
    /// `PyramidError::NoSuitableLevel` if no available level qualifies.
    pub fn select_level(
        &self,
        request: LevelRequest,
        allow_upscale: bool,
    ) -> Result<&Level, PyramidError> {
        let target = match request {
            LevelRequest::PixelSpacing(spacing) => spacing,
            LevelRequest::Downsample(factor) => {
                if !(factor.is_finite() && factor > 0.0) {
                    return Err(PyramidError::InvalidRequest {
                        message: format!("downsample {factor} must be positive"),
                    });
                }
                self.base_spacing()? * factor
            }
        };
        if !(target.is_finite() && target > 0.0) {
            return Err(PyramidError::InvalidRequest {
                message: format!("pixel spacing {target} must be positive"),
            });
        }

        let available = self.levels.iter().filter(|l| l.is_available());

        let selected = if allow_upscale {
            available.fold(None::<(&Level, f64)>, |best, level| {
                let distance = (level.pixel_spacing.mean() / target).ln().abs();
                match best {
                    Some((_, d)) if d <= distance => best,
                    _ => Some((level, distance)),
                }
            })
        } else {
            let limit = target * (1.0 + SELECTION_TOLERANCE);
            available
                .filter(|level| level.pixel_spacing.mean() <= limit)
                .fold(None::<(&Level, f64)>, |best, level| {
                    let spacing = level.pixel_spacing.mean();
                    match best {
                        Some((_, s)) if s >= spacing => best,
                        _ => Some((level, spacing)),
                    }
                })
        };

        selected
            .map(|(level, _)| level)
            .ok_or(PyramidError::NoSuitableLevel { requested: target })
    }

    /// Map a point between levels using their declared pixel spacings.
    ///
    /// # Errors
    /// Returns `PyramidError::InvalidLevel` if either level is out of range.
    pub fn map_coordinate(
        &self,
        point: Point,
        from: usize,
        to: usize,
    ) -> Result<Point, PyramidError> {
        let from = self.level(from)?.pixel_spacing;
        let to = self.level(to)?.pixel_spacing;
        Ok(Point::new(
            point.x * from.x / to.x,
            point.y * from.y / to.y,
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
