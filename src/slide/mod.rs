//! Slide assembly.
//!
//! This module turns validated instances into an open slide.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Slide                   │
//! │   (open / read / close, owns the rest)  │
//! └────────────────────┬────────────────────┘
//!                      │
//!          ┌───────────┼────────────────┐
//!          ▼           ▼                ▼
//! ┌──────────────┐ ┌──────────────┐ ┌────────────────────┐
//! │  Collector   │ │ LevelPyramid │ │ FrameIndexRegistry │
//! │ (levels and  │ │ (selection,  │ │ (tile → frame,     │
//! │  channels)   │ │  mapping)    │ │  built lazily)     │
//! └──────────────┘ └──────────────┘ └────────────────────┘
//! ```
//!
//! Pixel reads go through [`crate::tile`], which consumes the pyramid and
//! the frame indices built here.

mod collector;
mod frame_index;
mod handle;
mod pyramid;

pub use collector::{
    group_instances, AssociatedImage, CollectedSlide, SlideExtent, SlideIdentity,
};
pub use frame_index::{
    build as build_frame_index, full_frames, sparse_frames, ChannelKey, FrameIndex,
    FrameIndexRegistry, FrameLocator, SparseFrame, TileCoord,
};
pub use handle::{InstanceSource, Slide, SlideState};
pub use pyramid::{
    Availability, ChannelGroup, GroupMember, Level, LevelDescriptor, LevelPyramid, LevelRequest,
    Point,
};
