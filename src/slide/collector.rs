//! Dataset collector.
//!
//! Groups validated instances into pyramid levels and channel groups,
//! checks that instances agree with each other, and resolves
//! concatenations into contiguous frame sequences.
//!
//! # Grouping
//!
//! ```text
//!   instances ──► identity checks (UIDs, study, series, frame of reference)
//!       │
//!       ├──► LABEL / OVERVIEW / THUMBNAIL ──► associated images
//!       │
//!       └──► VOLUME ──► bucket by total pixel matrix size
//!                          │
//!                          ├──► per level: tile size, spacing, sample format
//!                          ├──► channel groups (single or concatenation)
//!                          └──► sort by pixel spacing, finest first
//! ```

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::pyramid::{Availability, ChannelGroup, GroupMember, Level};
use crate::config::{ChannelCoverage, ConcatenationPolicy, SlideConfig};
use crate::error::{ConcatenationError, OpenError, ValidationError};
use crate::format::optical::merge_optical_path_info;
use crate::format::{
    FocalPlane, ImageFlavor, Instance, OpticalPath, OpticalPathInfo, PixelSpacing,
    TileOrganization, ValidationReport, WarningKind,
};

// =============================================================================
// Output Types
// =============================================================================

/// Identity shared by every instance of a slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlideIdentity {
    pub study_uid: String,
    pub series_uid: String,
    pub frame_of_reference_uid: Option<String>,
}

/// Physical size of the imaged area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlideExtent {
    pub width_mm: f64,
    pub height_mm: f64,
}

/// A non-pyramid image stored alongside the slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociatedImage {
    pub kind: ImageFlavor,
    pub width: u32,
    pub height: u32,
    pub instance_uid: String,
}

/// Result of grouping: everything a slide needs besides its caches.
#[derive(Debug)]
pub struct CollectedSlide {
    /// Levels sorted finest first
    pub levels: Vec<Level>,
    pub identity: SlideIdentity,
    pub extent: SlideExtent,
    pub optical_paths: Vec<OpticalPath>,
    /// Optical path descriptions merged across levels
    pub optical_path_info: Vec<OpticalPathInfo>,
    pub focal_planes: Vec<FocalPlane>,
    pub associated_images: Vec<AssociatedImage>,
}

// =============================================================================
// Grouping
// =============================================================================

/// Group instances into levels and channels.
///
/// # Errors
///
/// Returns `OpenError::Validation` when instances disagree on identity or
/// level geometry, when no volume instance exists, or when levels do not
/// strictly decrease in resolution. Returns
/// `OpenError::InconsistentConcatenation` for broken concatenations unless
/// the configured policy disables the level instead.
pub fn group_instances(
    instances: Vec<Instance>,
    config: &SlideConfig,
    report: &mut ValidationReport,
) -> Result<CollectedSlide, OpenError> {
    let identity = check_identity(&instances)?;

    let (volumes, associated): (Vec<Instance>, Vec<Instance>) = instances
        .into_iter()
        .partition(|i| i.flavor == ImageFlavor::Volume);
    if volumes.is_empty() {
        return Err(ValidationError::NoVolumeInstances.into());
    }

    let associated_images = associated
        .iter()
        .map(|i| AssociatedImage {
            kind: i.flavor,
            width: i.image_width,
            height: i.image_height,
            instance_uid: i.uid.clone(),
        })
        .collect();

    // Bucket by total pixel matrix size, first seen first
    let mut buckets: Vec<((u32, u32), Vec<Instance>)> = Vec::new();
    for instance in volumes {
        let size = (instance.image_width, instance.image_height);
        match buckets.iter_mut().find(|(s, _)| *s == size) {
            Some((_, members)) => members.push(instance),
            None => buckets.push((size, vec![instance])),
        }
    }

    let mut levels = buckets
        .into_iter()
        .map(|(_, members)| build_level(members, config, report))
        .collect::<Result<Vec<_>, _>>()?;

    order_levels(&mut levels)?;
    check_channel_coverage(&levels, config.channel_coverage, report)?;

    let channels: BTreeSet<(OpticalPath, FocalPlane)> =
        levels.iter().flat_map(|l| l.channels()).collect();
    let optical_paths: BTreeSet<OpticalPath> = channels.iter().map(|(p, _)| p.clone()).collect();
    let focal_planes: BTreeSet<FocalPlane> = channels.iter().map(|(_, z)| *z).collect();
    let optical_path_info = merge_optical_path_info(
        levels
            .iter()
            .flat_map(|l| l.instances.iter())
            .flat_map(|i| i.optical_path_info.iter()),
    );

    let extent = slide_extent(&levels[0]);

    for level in &levels {
        debug!(
            level = level.index,
            width = level.width,
            height = level.height,
            tile_width = level.tile_width,
            tile_height = level.tile_height,
            downsample = level.downsample,
            instances = level.instances.len(),
            available = level.is_available(),
            "Collected level"
        );
    }
    info!(
        levels = levels.len(),
        optical_paths = optical_paths.len(),
        focal_planes = focal_planes.len(),
        "Grouped instances into pyramid"
    );

    Ok(CollectedSlide {
        levels,
        identity,
        extent,
        optical_paths: optical_paths.into_iter().collect(),
        optical_path_info,
        focal_planes: focal_planes.into_iter().collect(),
        associated_images,
    })
}

/// Check UID uniqueness and that all instances belong to one slide.
///
/// Frame of reference is only compared between instances that declare one.
fn check_identity(instances: &[Instance]) -> Result<SlideIdentity, ValidationError> {
    let first = instances.first().ok_or(ValidationError::NoVolumeInstances)?;

    let mut seen = HashSet::new();
    for instance in instances {
        if !seen.insert(instance.uid.as_str()) {
            return Err(ValidationError::DuplicateInstance {
                uid: instance.uid.clone(),
            });
        }
    }

    let frame_of_reference_uid = instances
        .iter()
        .find_map(|i| i.frame_of_reference_uid.clone());

    for instance in instances {
        let mismatch = |attribute: &'static str, expected: &str, found: &str| {
            ValidationError::IdentityMismatch {
                instance: instance.identifier.clone(),
                attribute,
                expected: Some(expected.to_string()),
                found: Some(found.to_string()),
            }
        };

        if instance.study_uid != first.study_uid {
            return Err(mismatch("StudyInstanceUID", &first.study_uid, &instance.study_uid));
        }
        if instance.series_uid != first.series_uid {
            return Err(mismatch("SeriesInstanceUID", &first.series_uid, &instance.series_uid));
        }
        if let (Some(expected), Some(found)) =
            (&frame_of_reference_uid, &instance.frame_of_reference_uid)
        {
            if expected != found {
                return Err(mismatch("FrameOfReferenceUID", expected, found));
            }
        }
    }

    Ok(SlideIdentity {
        study_uid: first.study_uid.clone(),
        series_uid: first.series_uid.clone(),
        frame_of_reference_uid,
    })
}

// =============================================================================
// Levels
// =============================================================================

/// Build one level from the instances sharing a total pixel matrix size.
///
/// `index` and `downsample` are placeholders until the levels are ordered.
fn build_level(
    members: Vec<Instance>,
    config: &SlideConfig,
    report: &mut ValidationReport,
) -> Result<Level, OpenError> {
    let reference = &members[0];
    let (width, height) = (reference.image_width, reference.image_height);
    let pixel_spacing = reference
        .pixel_spacing
        .ok_or_else(|| ValidationError::MissingAttribute {
            instance: reference.identifier.clone(),
            attribute: "PixelSpacing",
        })?;

    for instance in &members[1..] {
        check_level_member(reference, pixel_spacing, instance, report)?;
    }

    let tile_width = reference.tile_width;
    let tile_height = reference.tile_height;
    let sample_format = reference.sample_format.clone();
    let instances: Vec<Arc<Instance>> = members.into_iter().map(Arc::new).collect();

    let mut availability = Availability::Available;
    let mut groups = Vec::new();
    for (uid, indices) in pending_groups(&instances) {
        let group = match uid {
            None => single_group(&instances, indices[0], report)?,
            Some(uid) => match concatenation_group(&instances, &uid, &indices) {
                Ok(group) => group,
                Err(err) => match config.concatenation_policy {
                    ConcatenationPolicy::FailSlide => return Err(err.into()),
                    ConcatenationPolicy::DisableLevel => {
                        report.add_warning(
                            WarningKind::LevelDisabled,
                            format!("level {width}x{height}: {err}"),
                        );
                        availability = Availability::Disabled {
                            reason: err.to_string(),
                        };
                        fallback_group(&instances, &uid, &indices)
                    }
                },
            },
        };
        groups.push(group);
    }

    let mut seen = HashSet::new();
    for (optical_path, focal_plane) in groups.iter().flat_map(|g| g.channels()) {
        if !seen.insert((optical_path.clone(), focal_plane)) {
            return Err(ValidationError::DuplicateChannel {
                width,
                height,
                optical_path: optical_path.to_string(),
                focal_plane: focal_plane.to_string(),
            }
            .into());
        }
    }

    let organization = if groups
        .iter()
        .all(|g| g.organization == TileOrganization::Full)
    {
        TileOrganization::Full
    } else {
        TileOrganization::Sparse
    };

    Ok(Level {
        index: 0,
        width,
        height,
        tile_width,
        tile_height,
        pixel_spacing,
        downsample: 1.0,
        organization,
        sample_format,
        instances,
        groups,
        availability,
    })
}

fn check_level_member(
    reference: &Instance,
    spacing: PixelSpacing,
    instance: &Instance,
    report: &mut ValidationReport,
) -> Result<(), ValidationError> {
    let (width, height) = (reference.image_width, reference.image_height);

    let expected = (reference.tile_width, reference.tile_height);
    let found = (instance.tile_width, instance.tile_height);
    if expected != found {
        return Err(ValidationError::TileSizeMismatch {
            width,
            height,
            instance: instance.identifier.clone(),
            expected,
            found,
        });
    }

    match instance.pixel_spacing {
        Some(other) if other.approx_eq(&spacing) => {}
        other => {
            return Err(ValidationError::PixelSpacingMismatch {
                width,
                height,
                instance: instance.identifier.clone(),
                expected: spacing.as_tuple(),
                found: other.map_or((0.0, 0.0), |s| s.as_tuple()),
            })
        }
    }

    let (a, b) = (&reference.sample_format, &instance.sample_format);
    if !a.is_compatible(b) {
        return Err(ValidationError::SampleFormatMismatch {
            width,
            height,
            instance: instance.identifier.clone(),
            message: format!(
                "{} samples of {} bits, expected {} samples of {} bits",
                b.samples_per_pixel, b.bits_allocated, a.samples_per_pixel, a.bits_allocated
            ),
        });
    }
    if a.photometric_interpretation != b.photometric_interpretation {
        report.add_warning(
            WarningKind::PhotometricMismatch,
            format!(
                "{}: {} vs {} in level {width}x{height}",
                instance.identifier, b.photometric_interpretation, a.photometric_interpretation
            ),
        );
    }

    Ok(())
}

/// Sort levels finest first and assign indices and downsample factors.
fn order_levels(levels: &mut [Level]) -> Result<(), ValidationError> {
    levels.sort_by(|a, b| a.pixel_spacing.mean().total_cmp(&b.pixel_spacing.mean()));

    for pair in levels.windows(2) {
        let (finer, coarser) = (&pair[0].pixel_spacing, &pair[1].pixel_spacing);
        if coarser.approx_eq(finer) || coarser.mean() <= finer.mean() {
            return Err(ValidationError::NonDecreasingResolution {
                spacing: coarser.mean(),
            });
        }
    }

    let base = levels.first().map_or(1.0, |l| l.pixel_spacing.mean());
    for (index, level) in levels.iter_mut().enumerate() {
        level.index = index;
        level.downsample = level.pixel_spacing.mean() / base;
    }
    Ok(())
}

fn check_channel_coverage(
    levels: &[Level],
    policy: ChannelCoverage,
    report: &mut ValidationReport,
) -> Result<(), ValidationError> {
    let available: Vec<&Level> = levels.iter().filter(|l| l.is_available()).collect();
    let all: BTreeSet<(OpticalPath, FocalPlane)> =
        available.iter().flat_map(|l| l.channels()).collect();

    for level in available {
        let present: BTreeSet<_> = level.channels().into_iter().collect();
        let missing: Vec<String> = all
            .difference(&present)
            .map(|(p, z)| format!("({p}, {z})"))
            .collect();
        if missing.is_empty() {
            continue;
        }

        let missing = missing.join(", ");
        match policy {
            ChannelCoverage::RequireComplete => {
                return Err(ValidationError::IncompleteChannels {
                    level: level.index,
                    missing,
                })
            }
            ChannelCoverage::AllowPartial => report.add_warning(
                WarningKind::PartialChannelCoverage,
                format!("level {} lacks {missing}", level.index),
            ),
        }
    }
    Ok(())
}

fn slide_extent(base: &Level) -> SlideExtent {
    let (width_mm, height_mm) = base
        .instances
        .iter()
        .find_map(|i| i.imaged_size)
        .unwrap_or((
            base.width as f64 * base.pixel_spacing.x,
            base.height as f64 * base.pixel_spacing.y,
        ));
    SlideExtent {
        width_mm,
        height_mm,
    }
}

// =============================================================================
// Channel Groups
// =============================================================================

/// Instances of a level bucketed by concatenation UID. Instances outside a
/// concatenation form a group of their own.
fn pending_groups(instances: &[Arc<Instance>]) -> Vec<(Option<String>, Vec<usize>)> {
    let mut pending: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    for (idx, instance) in instances.iter().enumerate() {
        match &instance.concatenation {
            None => pending.push((None, vec![idx])),
            Some(info) => match pending
                .iter_mut()
                .find(|(uid, _)| uid.as_deref() == Some(info.uid.as_str()))
            {
                Some((_, members)) => members.push(idx),
                None => pending.push((Some(info.uid.clone()), vec![idx])),
            },
        }
    }
    pending
}

fn single_group(
    instances: &[Arc<Instance>],
    idx: usize,
    report: &mut ValidationReport,
) -> Result<ChannelGroup, ValidationError> {
    let instance = &instances[idx];

    if instance.organization == TileOrganization::Full {
        let expected = instance.full_frame_total();
        let actual = instance.frame_count as u64;
        if actual < expected {
            return Err(ValidationError::InvalidAttribute {
                instance: instance.identifier.clone(),
                attribute: "NumberOfFrames",
                message: format!("{actual} frames cannot cover {expected} tiles"),
            });
        }
        if actual > expected {
            report.add_warning(
                WarningKind::FrameCountMismatch,
                format!(
                    "{}: {actual} frames for {expected} tiles, extra frames ignored",
                    instance.identifier
                ),
            );
        }
    }

    Ok(ChannelGroup {
        uid: instance.uid.clone(),
        members: vec![GroupMember {
            instance: idx,
            first_frame: 0,
            frame_count: instance.frame_count,
        }],
        optical_paths: instance.optical_paths.clone(),
        focal_planes: instance.focal_planes.clone(),
        organization: instance.organization,
    })
}

/// Resolve a concatenation into one frame sequence.
fn concatenation_group(
    instances: &[Arc<Instance>],
    uid: &str,
    indices: &[usize],
) -> Result<ChannelGroup, ConcatenationError> {
    let first = &instances[indices[0]];

    // Full members must describe the same frame sequence. Sparse members
    // position every frame, so each may hold any subset of the channels.
    for &idx in &indices[1..] {
        let instance = &instances[idx];
        let full = first.organization == TileOrganization::Full;
        let message = if instance.organization != first.organization {
            Some("tile organization differs")
        } else if full && instance.optical_paths != first.optical_paths {
            Some("optical paths differ")
        } else if full && instance.focal_planes != first.focal_planes {
            Some("focal planes differ")
        } else {
            None
        };
        if let Some(message) = message {
            return Err(ConcatenationError::MemberMismatch {
                uid: uid.to_string(),
                instance: instance.identifier.clone(),
                message: message.to_string(),
            });
        }
    }

    let mut ordered = Vec::with_capacity(indices.len());
    for &idx in indices {
        let instance = &instances[idx];
        let number = instance
            .concatenation
            .as_ref()
            .and_then(|c| c.number)
            .ok_or_else(|| ConcatenationError::MissingPosition {
                uid: uid.to_string(),
                instance: instance.identifier.clone(),
            })?;
        ordered.push((number, idx));
    }
    ordered.sort_unstable();
    for pair in ordered.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(ConcatenationError::DuplicatePosition {
                uid: uid.to_string(),
                position: pair[0].0,
            });
        }
    }

    let declared_total = indices
        .iter()
        .find_map(|&idx| instances[idx].concatenation.as_ref().and_then(|c| c.total));
    if let Some(declared) = declared_total {
        if declared as usize != indices.len() {
            return Err(ConcatenationError::InstanceCountMismatch {
                uid: uid.to_string(),
                declared,
                actual: indices.len() as u32,
            });
        }
    }

    let mut members = Vec::with_capacity(ordered.len());
    let mut expected = 0u64;
    for &(_, idx) in &ordered {
        let instance = &instances[idx];
        let found = instance
            .concatenation
            .as_ref()
            .map_or(0, |c| c.frame_offset);
        if found != expected {
            let (uid, instance) = (uid.to_string(), instance.identifier.clone());
            return Err(if found > expected {
                ConcatenationError::Gap {
                    uid,
                    instance,
                    expected,
                    found,
                }
            } else {
                ConcatenationError::Overlap {
                    uid,
                    instance,
                    expected,
                    found,
                }
            });
        }
        members.push(GroupMember {
            instance: idx,
            first_frame: expected,
            frame_count: instance.frame_count,
        });
        expected += instance.frame_count as u64;
    }

    if first.organization == TileOrganization::Full {
        let declared = first.full_frame_total();
        if expected != declared {
            return Err(ConcatenationError::FrameCountMismatch {
                uid: uid.to_string(),
                declared,
                actual: expected,
            });
        }
    }

    let (optical_paths, focal_planes) = merged_channels(instances, indices);
    Ok(ChannelGroup {
        uid: uid.to_string(),
        members,
        optical_paths,
        focal_planes,
        organization: first.organization,
    })
}

/// Channels covered by a set of group members: the first member's lists for
/// full organization, the union of every member's lists for sparse.
fn merged_channels(
    instances: &[Arc<Instance>],
    indices: &[usize],
) -> (Vec<OpticalPath>, Vec<FocalPlane>) {
    let first = &instances[indices[0]];
    if first.organization == TileOrganization::Full {
        return (first.optical_paths.clone(), first.focal_planes.clone());
    }

    let mut optical_paths: Vec<OpticalPath> = Vec::new();
    let mut focal_planes = BTreeSet::new();
    for &idx in indices {
        let instance = &instances[idx];
        for path in &instance.optical_paths {
            if !optical_paths.contains(path) {
                optical_paths.push(path.clone());
            }
        }
        focal_planes.extend(instance.focal_planes.iter().copied());
    }
    (optical_paths, focal_planes.into_iter().collect())
}

/// Best-effort group for a disabled level, so its channels stay listed.
fn fallback_group(instances: &[Arc<Instance>], uid: &str, indices: &[usize]) -> ChannelGroup {
    let mut ordered: Vec<usize> = indices.to_vec();
    ordered.sort_by_key(|&idx| {
        instances[idx]
            .concatenation
            .as_ref()
            .map(|c| (c.number.unwrap_or(u32::MAX), c.frame_offset))
    });

    let mut first_frame = 0u64;
    let members = ordered
        .into_iter()
        .map(|idx| {
            let frame_count = instances[idx].frame_count;
            let member = GroupMember {
                instance: idx,
                first_frame,
                frame_count,
            };
            first_frame += frame_count as u64;
            member
        })
        .collect();

    let (optical_paths, focal_planes) = merged_channels(instances, indices);
    ChannelGroup {
        uid: uid.to_string(),
        members,
        optical_paths,
        focal_planes,
        organization: instances[indices[0]].organization,
    }
}

// =============================================================================
// Tests
// =============================================================================
