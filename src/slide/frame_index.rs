//! Frame index.
//!
//! A [`FrameIndex`] maps tile coordinates of one (level, optical path, focal
//! plane) channel to the frame that holds the tile:
//!
//! ```text
//!   TileCoord (column, row)
//!          │
//!          ▼
//!   ┌──────────────────────────────┐
//!   │ FrameIndex                   │
//!   │  Full:   dense Vec, row-major│
//!   │  Sparse: HashMap, may be     │
//!   │          partial             │
//!   └──────────────┬───────────────┘
//!                  ▼
//!   FrameLocator (instance, local frame)
//! ```
//!
//! Indices are built on first use and memoized by [`FrameIndexRegistry`] for
//! the lifetime of the slide.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;
use tracing::debug;

use super::pyramid::{ChannelGroup, Level, LevelPyramid};
use crate::error::FrameIndexError;
use crate::format::{
    FocalPlane, OpticalPath, SlideWarning, TileOrganization, ValidationReport, WarningKind,
};

// =============================================================================
// Types
// =============================================================================

/// Position of a tile within a level's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileCoord {
    pub column: u32,
    pub row: u32,
}

impl TileCoord {
    pub const fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

/// Where a tile's encoded bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameLocator {
    /// Index into the level's instances
    pub instance: u32,
    /// Frame within that instance
    pub frame: u32,
}

/// Tile coordinate to frame mapping for one channel of one level.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameIndex {
    /// Every grid position has a frame; `locators` is row-major
    Full {
        columns: u32,
        rows: u32,
        locators: Vec<FrameLocator>,
    },
    /// Only listed positions have frames
    Sparse {
        columns: u32,
        rows: u32,
        locators: HashMap<TileCoord, FrameLocator>,
    },
}

impl FrameIndex {
    /// Find the frame for a tile. `None` for positions outside the grid and
    /// for sparse gaps.
    pub fn locate(&self, coord: TileCoord) -> Option<FrameLocator> {
        match self {
            FrameIndex::Full {
                columns,
                rows,
                locators,
            } => {
                if coord.column >= *columns || coord.row >= *rows {
                    return None;
                }
                locators
                    .get(coord.row as usize * *columns as usize + coord.column as usize)
                    .copied()
            }
            FrameIndex::Sparse { locators, .. } => locators.get(&coord).copied(),
        }
    }

    /// Grid size in tiles.
    pub fn grid(&self) -> (u32, u32) {
        match self {
            FrameIndex::Full { columns, rows, .. } | FrameIndex::Sparse { columns, rows, .. } => {
                (*columns, *rows)
            }
        }
    }

    /// Number of positions that have a frame.
    pub fn len(&self) -> usize {
        match self {
            FrameIndex::Full { locators, .. } => locators.len(),
            FrameIndex::Sparse { locators, .. } => locators.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every grid position has a frame.
    pub fn is_total(&self) -> bool {
        let (columns, rows) = self.grid();
        self.len() == columns as usize * rows as usize
    }
}

// =============================================================================
// Frame Enumeration
// =============================================================================

/// Frame numbers of a full-organization channel, row-major.
///
/// DICOM TILED_FULL orders frames with columns fastest, then rows, then
/// focal planes, then optical paths.
pub fn full_frames(
    group: &ChannelGroup,
    path_idx: usize,
    plane_idx: usize,
    columns: u32,
    rows: u32,
) -> impl Iterator<Item = (TileCoord, u64)> {
    let planes = group.focal_planes.len() as u64;
    let grid = columns as u64 * rows as u64;
    let base = (path_idx as u64 * planes + plane_idx as u64) * grid;

    (0..rows).flat_map(move |row| {
        (0..columns).map(move |column| {
            (
                TileCoord::new(column, row),
                base + row as u64 * columns as u64 + column as u64,
            )
        })
    })
}

/// One frame of a sparse channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SparseFrame {
    Tile(TileCoord, FrameLocator),
    /// Position not on the tile grid or outside it
    Misaligned {
        instance: String,
        frame: u32,
        column: u32,
        row: u32,
    },
}

/// Frames of a sparse channel, in group member order.
pub fn sparse_frames<'a>(
    level: &'a Level,
    group: &'a ChannelGroup,
    optical_path: &'a OpticalPath,
    focal_plane: FocalPlane,
) -> impl Iterator<Item = SparseFrame> + 'a {
    let (tile_width, tile_height) = (level.tile_width, level.tile_height);
    let (columns, rows) = (level.tiles_x(), level.tiles_y());

    group.members.iter().flat_map(move |member| {
        let instance = &level.instances[member.instance];
        instance
            .frame_positions()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter(move |(_, pos)| {
                instance.frame_optical_path(pos) == optical_path
                    && instance.frame_focal_plane(pos) == focal_plane
            })
            .map(move |(frame, pos)| {
                let frame = frame as u32;
                let x = pos.column.wrapping_sub(1);
                let y = pos.row.wrapping_sub(1);
                let aligned = pos.column >= 1
                    && pos.row >= 1
                    && x % tile_width == 0
                    && y % tile_height == 0
                    && x / tile_width < columns
                    && y / tile_height < rows;

                if aligned {
                    SparseFrame::Tile(
                        TileCoord::new(x / tile_width, y / tile_height),
                        FrameLocator {
                            instance: member.instance as u32,
                            frame,
                        },
                    )
                } else {
                    SparseFrame::Misaligned {
                        instance: instance.identifier.clone(),
                        frame,
                        column: pos.column,
                        row: pos.row,
                    }
                }
            })
    })
}

// =============================================================================
// Builder
// =============================================================================

/// Build the frame index of one channel.
///
/// # Errors
///
/// Returns `FrameIndexError::ChannelNotFound` if no group of the level
/// provides the channel, and `FrameIndexError::MissingFrame` if a full
/// channel's frame cannot be resolved to an instance.
pub fn build(
    level: &Level,
    optical_path: &OpticalPath,
    focal_plane: FocalPlane,
    report: &mut ValidationReport,
) -> Result<FrameIndex, FrameIndexError> {
    let (group, path_idx, plane_idx) = level
        .channel_group(optical_path, focal_plane)
        .ok_or_else(|| FrameIndexError::ChannelNotFound {
            level: level.index,
            optical_path: optical_path.to_string(),
            focal_plane: focal_plane.to_string(),
        })?;

    let (columns, rows) = (level.tiles_x(), level.tiles_y());

    let index = match group.organization {
        TileOrganization::Full => {
            let locators = full_frames(group, path_idx, plane_idx, columns, rows)
                .map(|(_, frame)| {
                    group.locate(frame).ok_or(FrameIndexError::MissingFrame {
                        level: level.index,
                        frame,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            FrameIndex::Full {
                columns,
                rows,
                locators,
            }
        }
        TileOrganization::Sparse => {
            let mut locators = HashMap::new();
            for frame in sparse_frames(level, group, optical_path, focal_plane) {
                match frame {
                    SparseFrame::Tile(coord, locator) => {
                        if locators.insert(coord, locator).is_some() {
                            report.add_warning(
                                WarningKind::DuplicateTileCoordinate,
                                format!(
                                    "level {} channel ({optical_path}, {focal_plane}): \
                                     tile ({}, {}) has more than one frame, using the last",
                                    level.index, coord.column, coord.row
                                ),
                            );
                        }
                    }
                    SparseFrame::Misaligned {
                        instance,
                        frame,
                        column,
                        row,
                    } => report.add_warning(
                        WarningKind::MisalignedFramePosition,
                        format!(
                            "{instance} frame {frame}: position ({column}, {row}) \
                             is not on the tile grid, skipped"
                        ),
                    ),
                }
            }
            FrameIndex::Sparse {
                columns,
                rows,
                locators,
            }
        }
    };

    debug!(
        level = level.index,
        optical_path = %optical_path,
        focal_plane = %focal_plane,
        tiles = index.len(),
        "Built frame index"
    );

    Ok(index)
}

// =============================================================================
// Registry
// =============================================================================

/// Identifies one channel of one level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub level: usize,
    pub optical_path: OpticalPath,
    pub focal_plane: FocalPlane,
}

type IndexSlot = OnceLock<Result<Arc<FrameIndex>, FrameIndexError>>;

/// Memoized frame indices of every channel of a slide.
///
/// Slots are created at open for every channel the levels provide; each is
/// built at most once, on first request.
pub struct FrameIndexRegistry {
    pyramid: Arc<LevelPyramid>,
    slots: HashMap<ChannelKey, IndexSlot>,
    warnings: Mutex<Vec<SlideWarning>>,
}

impl FrameIndexRegistry {
    pub fn new(pyramid: Arc<LevelPyramid>) -> Self {
        let slots = pyramid
            .levels()
            .iter()
            .flat_map(|level| {
                level.channels().into_iter().map(move |(optical_path, focal_plane)| {
                    (
                        ChannelKey {
                            level: level.index,
                            optical_path,
                            focal_plane,
                        },
                        OnceLock::new(),
                    )
                })
            })
            .collect();

        Self {
            pyramid,
            slots,
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Get the frame index of a channel, building it on first use.
    ///
    /// # Errors
    /// Returns `FrameIndexError::ChannelNotFound` if the level does not
    /// provide the channel.
    pub fn get(
        &self,
        level: usize,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
    ) -> Result<Arc<FrameIndex>, FrameIndexError> {
        let key = ChannelKey {
            level,
            optical_path: optical_path.clone(),
            focal_plane,
        };
        let not_found = || FrameIndexError::ChannelNotFound {
            level,
            optical_path: optical_path.to_string(),
            focal_plane: focal_plane.to_string(),
        };

        let slot = self.slots.get(&key).ok_or_else(not_found)?;
        slot.get_or_init(|| {
            let level = self.pyramid.level(level).map_err(|_| not_found())?;
            let mut report = ValidationReport::new();
            let index = build(level, optical_path, focal_plane, &mut report);
            self.warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend(report.into_warnings());
            index.map(Arc::new)
        })
        .clone()
    }

    /// Channels that have a slot.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        self.slots.keys()
    }

    /// Warnings recorded while building indices so far.
    pub fn warnings(&self) -> Vec<SlideWarning> {
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
