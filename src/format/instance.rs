//! Instance model.
//!
//! An [`Instance`] is the validated, immutable metadata of one DICOM file:
//! its geometry, channels, concatenation membership and where each frame's
//! bytes live. Instances are built from a parsed [`Dataset`] at open time;
//! pixel data is only read later, one frame at a time.
//!
//! # Tile Organization
//!
//! - **Full** (`TILED_FULL`): frames cover the whole grid in a fixed order,
//!   columns fastest, then rows, focal planes and optical paths.
//! - **Sparse**: every frame carries its own position; gaps are allowed.

use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::Serialize;

use super::attributes::{Attribute, Value, WSI_SOP_CLASS_UID};
use super::dataset::{ByteRange, Dataset, FramePosition};
use super::decoder::{DecodeParams, TransferSyntax};
use super::optical::OpticalPathInfo;
use super::validation::{ValidationReport, WarningKind};
use crate::error::{IoError, TileError, ValidationError};
use crate::io::RangeReader;

// =============================================================================
// Channel Identifiers
// =============================================================================

/// Identifier of an optical path (illumination/filter configuration).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OpticalPath(String);

impl OpticalPath {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Instances without an optical path sequence have a single path "0".
impl Default for OpticalPath {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl From<&str> for OpticalPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OpticalPath {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for OpticalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Focal plane, stored as a z offset in whole nanometres so that planes can
/// be hashed and compared exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FocalPlane(i64);

impl FocalPlane {
    pub fn from_micrometers(z: f64) -> Self {
        Self((z * 1000.0).round() as i64)
    }

    pub const fn from_nanometers(z: i64) -> Self {
        Self(z)
    }

    pub fn micrometers(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub const fn nanometers(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FocalPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}µm", self.micrometers())
    }
}

// =============================================================================
// Instance Properties
// =============================================================================

/// Image flavour, from the third value of ImageType.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFlavor {
    Volume,
    Label,
    Overview,
    Thumbnail,
}

impl ImageFlavor {
    pub fn from_image_type(values: &[&str]) -> Option<Self> {
        match values.get(2).map(|v| v.to_ascii_uppercase()).as_deref() {
            Some("VOLUME") => Some(ImageFlavor::Volume),
            Some("LABEL") => Some(ImageFlavor::Label),
            Some("OVERVIEW") => Some(ImageFlavor::Overview),
            Some("THUMBNAIL") => Some(ImageFlavor::Thumbnail),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ImageFlavor::Volume => "VOLUME",
            ImageFlavor::Label => "LABEL",
            ImageFlavor::Overview => "OVERVIEW",
            ImageFlavor::Thumbnail => "THUMBNAIL",
        }
    }
}

/// How frames map onto the tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileOrganization {
    Full,
    Sparse,
}

/// Relative tolerance when comparing declared pixel spacings.
const SPACING_TOLERANCE: f64 = 1e-5;

/// Physical size of one pixel in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PixelSpacing {
    /// Horizontal spacing (between columns)
    pub x: f64,
    /// Vertical spacing (between rows)
    pub y: f64,
}

impl PixelSpacing {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Build from the DICOM PixelSpacing value, which lists the row
    /// spacing first.
    pub fn from_dicom(values: &[f64]) -> Option<Self> {
        match values {
            [row, column] => Some(Self::new(*column, *row)),
            [both] => Some(Self::new(*both, *both)),
            _ => None,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.x > 0.0 && self.y > 0.0
    }

    /// Mean of both axes, used for level ordering and selection.
    pub fn mean(&self) -> f64 {
        (self.x + self.y) / 2.0
    }

    pub fn approx_eq(&self, other: &PixelSpacing) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= SPACING_TOLERANCE * a.abs().max(b.abs());
        close(self.x, other.x) && close(self.y, other.y)
    }

    pub fn as_tuple(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

/// Sample layout shared by all instances of a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleFormat {
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub photometric_interpretation: String,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_allocated as usize).div_ceil(8)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.samples_per_pixel as usize * self.bytes_per_sample()
    }

    /// Same samples-per-pixel and bits-allocated. Photometric
    /// interpretation may differ.
    pub fn is_compatible(&self, other: &SampleFormat) -> bool {
        self.samples_per_pixel == other.samples_per_pixel
            && self.bits_allocated == other.bits_allocated
    }
}

/// How the scanner focused the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FocusMethod {
    Auto,
    Manual,
}

impl FocusMethod {
    pub fn from_dicom(value: &str) -> Option<Self> {
        match value {
            "AUTO" => Some(FocusMethod::Auto),
            "MANUAL" => Some(FocusMethod::Manual),
            _ => None,
        }
    }
}

/// Frames that combine several focal planes into one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExtendedDepthOfField {
    /// Number of planes combined
    pub focal_planes: u32,
    /// Distance between the combined planes in µm
    pub distance: f64,
}

/// Concatenation membership of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatenationInfo {
    pub uid: String,
    /// 1-based position within the concatenation
    pub number: Option<u32>,
    /// Declared number of instances in the concatenation
    pub total: Option<u32>,
    /// Index of this instance's first frame in the concatenated sequence
    pub frame_offset: u64,
}

// =============================================================================
// Attribute Access
// =============================================================================

/// Typed attribute lookups with instance-tagged errors.
struct Attributes<'a> {
    dataset: &'a dyn Dataset,
    instance: &'a str,
}

impl<'a> Attributes<'a> {
    fn value(&self, attribute: Attribute) -> Option<&'a Value> {
        self.dataset.attribute(attribute)
    }

    fn invalid(&self, attribute: Attribute, message: impl Into<String>) -> ValidationError {
        ValidationError::InvalidAttribute {
            instance: self.instance.to_string(),
            attribute: attribute.keyword(),
            message: message.into(),
        }
    }

    fn missing(&self, attribute: Attribute) -> ValidationError {
        ValidationError::MissingAttribute {
            instance: self.instance.to_string(),
            attribute: attribute.keyword(),
        }
    }

    fn string(&self, attribute: Attribute) -> Option<String> {
        self.value(attribute)
            .and_then(Value::as_str)
            .map(|s| s.trim_end_matches('\0').trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn required_string(&self, attribute: Attribute) -> Result<String, ValidationError> {
        self.string(attribute).ok_or_else(|| self.missing(attribute))
    }

    fn strings(&self, attribute: Attribute) -> Vec<String> {
        self.value(attribute)
            .and_then(Value::as_strs)
            .map(|v| {
                v.into_iter()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn u32(&self, attribute: Attribute) -> Result<Option<u32>, ValidationError> {
        match self.value(attribute) {
            None => Ok(None),
            Some(value) => value.as_u32().map(Some).ok_or_else(|| {
                self.invalid(attribute, format!("{value:?} is not an unsigned integer"))
            }),
        }
    }

    fn required_u32(&self, attribute: Attribute) -> Result<u32, ValidationError> {
        self.u32(attribute)?.ok_or_else(|| self.missing(attribute))
    }

    fn positive_u32(&self, attribute: Attribute) -> Result<u32, ValidationError> {
        match self.required_u32(attribute)? {
            0 => Err(self.invalid(attribute, "must be greater than zero")),
            v => Ok(v),
        }
    }

    fn u16(&self, attribute: Attribute) -> Result<u16, ValidationError> {
        let value = self.positive_u32(attribute)?;
        u16::try_from(value)
            .map_err(|_| self.invalid(attribute, format!("{value} is out of range")))
    }

    fn float(&self, attribute: Attribute) -> Result<Option<f64>, ValidationError> {
        match self.value(attribute) {
            None => Ok(None),
            Some(value) => value
                .as_float()
                .map(Some)
                .ok_or_else(|| self.invalid(attribute, format!("{value:?} is not a number"))),
        }
    }

    fn floats(&self, attribute: Attribute) -> Result<Option<Vec<f64>>, ValidationError> {
        match self.value(attribute) {
            None => Ok(None),
            Some(value) => value.as_floats().map(Some).ok_or_else(|| {
                self.invalid(attribute, format!("{value:?} is not a list of numbers"))
            }),
        }
    }
}

/// Check whether a dataset is a whole slide microscopy image.
///
/// Datasets without a SOP class UID are accepted.
pub fn is_whole_slide_image(dataset: &dyn Dataset) -> bool {
    dataset
        .attribute(Attribute::SopClassUid)
        .and_then(Value::as_str)
        .map_or(true, |uid| uid.trim_end_matches('\0') == WSI_SOP_CLASS_UID)
}

// =============================================================================
// Instance
// =============================================================================

/// Validated metadata of one instance, plus access to its frames.
pub struct Instance {
    pub uid: String,
    /// Identifier of the source stream
    pub identifier: String,
    pub study_uid: String,
    pub series_uid: String,
    pub frame_of_reference_uid: Option<String>,
    pub flavor: ImageFlavor,
    pub tile_width: u32,
    pub tile_height: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub pixel_spacing: Option<PixelSpacing>,
    /// Physical size of the imaged area in mm, when declared
    pub imaged_size: Option<(f64, f64)>,
    pub transfer_syntax: TransferSyntax,
    pub sample_format: SampleFormat,
    pub organization: TileOrganization,
    pub optical_paths: Vec<OpticalPath>,
    /// Optical path sequence items of the declared paths
    pub optical_path_info: Vec<OpticalPathInfo>,
    pub focal_planes: Vec<FocalPlane>,
    pub focus_method: Option<FocusMethod>,
    pub extended_depth_of_field: Option<ExtendedDepthOfField>,
    /// Depth of field of one plane in mm
    pub slice_thickness: Option<f64>,
    pub concatenation: Option<ConcatenationInfo>,
    pub frame_count: u32,
    default_focal_plane: FocalPlane,
    frames: Arc<[ByteRange]>,
    positions: Option<Arc<[FramePosition]>>,
    reader: RwLock<Option<Arc<dyn RangeReader>>>,
}

impl Instance {
    /// Validate a parsed dataset into an instance.
    ///
    /// # Arguments
    ///
    /// * `dataset` - Parsed attributes and frame table
    /// * `reader` - Stream the frame byte ranges refer to
    /// * `strict` - Also require frame of reference and optical path identifiers
    /// * `report` - Receives non-fatal findings
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if a required attribute is missing or
    /// unusable, or if the tile organization cannot be determined.
    pub fn from_dataset(
        dataset: &dyn Dataset,
        reader: Arc<dyn RangeReader>,
        strict: bool,
        report: &mut ValidationReport,
    ) -> Result<Self, ValidationError> {
        let identifier = dataset.identifier().to_string();
        let attrs = Attributes {
            dataset,
            instance: &identifier,
        };

        let uid = attrs.required_string(Attribute::SopInstanceUid)?;
        let study_uid = attrs.required_string(Attribute::StudyInstanceUid)?;
        let series_uid = attrs.required_string(Attribute::SeriesInstanceUid)?;
        let frame_of_reference_uid = attrs.string(Attribute::FrameOfReferenceUid);
        if strict && frame_of_reference_uid.is_none() {
            return Err(attrs.missing(Attribute::FrameOfReferenceUid));
        }

        let image_type = attrs.strings(Attribute::ImageType);
        if image_type.is_empty() {
            return Err(attrs.missing(Attribute::ImageType));
        }
        let image_type_refs: Vec<&str> = image_type.iter().map(String::as_str).collect();
        let flavor = ImageFlavor::from_image_type(&image_type_refs).ok_or_else(|| {
            attrs.invalid(
                Attribute::ImageType,
                format!("unknown image flavour in {}", image_type.join("\\")),
            )
        })?;

        let tile_width = attrs.positive_u32(Attribute::Columns)?;
        let tile_height = attrs.positive_u32(Attribute::Rows)?;

        let (image_width, image_height) = match flavor {
            ImageFlavor::Volume => (
                attrs.positive_u32(Attribute::TotalPixelMatrixColumns)?,
                attrs.positive_u32(Attribute::TotalPixelMatrixRows)?,
            ),
            _ => (
                attrs
                    .u32(Attribute::TotalPixelMatrixColumns)?
                    .unwrap_or(tile_width),
                attrs
                    .u32(Attribute::TotalPixelMatrixRows)?
                    .unwrap_or(tile_height),
            ),
        };

        let sample_format = SampleFormat {
            samples_per_pixel: attrs.u16(Attribute::SamplesPerPixel)?,
            bits_allocated: attrs.u16(Attribute::BitsAllocated)?,
            photometric_interpretation: attrs
                .required_string(Attribute::PhotometricInterpretation)?,
        };

        let imaged_size = match (
            attrs.float(Attribute::ImagedVolumeWidth)?,
            attrs.float(Attribute::ImagedVolumeHeight)?,
        ) {
            (Some(w), Some(h)) if w > 0.0 && h > 0.0 => Some((w, h)),
            _ => None,
        };

        let pixel_spacing = Self::read_pixel_spacing(
            &attrs,
            imaged_size,
            (image_width, image_height),
            report,
        )?;
        if flavor == ImageFlavor::Volume && pixel_spacing.is_none() {
            return Err(attrs.missing(Attribute::PixelSpacing));
        }

        // Frame table
        let frames: Arc<[ByteRange]> = dataset.frame_ranges().into();
        let frame_count = frames.len() as u32;
        if frame_count == 0 {
            return Err(attrs.invalid(Attribute::NumberOfFrames, "instance has no frames"));
        }
        let declared_frames = attrs.u32(Attribute::NumberOfFrames)?.unwrap_or(1);
        if declared_frames != frame_count {
            return Err(attrs.invalid(
                Attribute::NumberOfFrames,
                format!("declares {declared_frames} frames, pixel data holds {frame_count}"),
            ));
        }

        let positions = dataset.frame_positions();
        let organization = match attrs.string(Attribute::DimensionOrganizationType).as_deref() {
            Some("TILED_FULL") => TileOrganization::Full,
            _ if positions.is_some() => TileOrganization::Sparse,
            _ if frame_count == 1 => TileOrganization::Full,
            _ => {
                return Err(ValidationError::UndeterminedTileOrganization {
                    instance: identifier,
                })
            }
        };

        let positions: Option<Arc<[FramePosition]>> = match organization {
            TileOrganization::Sparse => {
                let positions = positions.unwrap_or_default();
                if positions.len() != frames.len() {
                    return Err(attrs.invalid(
                        Attribute::NumberOfFrames,
                        format!(
                            "{} frame positions for {} frames",
                            positions.len(),
                            frames.len()
                        ),
                    ));
                }
                Some(positions.into())
            }
            TileOrganization::Full => None,
        };

        let path_info = dataset.optical_path_info();
        let optical_paths =
            Self::read_optical_paths(&attrs, path_info, strict, positions.as_deref())?;
        let optical_path_info = path_info
            .iter()
            .filter(|info| optical_paths.contains(&info.identifier))
            .cloned()
            .collect();
        let (focal_planes, default_focal_plane) =
            Self::read_focal_planes(&attrs, organization, positions.as_deref())?;

        let focus_method = attrs
            .string(Attribute::FocusMethod)
            .and_then(|v| FocusMethod::from_dicom(&v));
        let extended_depth_of_field = Self::read_extended_depth_of_field(&attrs)?;
        let slice_thickness = match attrs.float(Attribute::SliceThickness)? {
            Some(thickness) => Some(thickness),
            None => attrs
                .float(Attribute::ImagedVolumeDepth)?
                .map(|depth_um| depth_um / 1000.0 / focal_planes.len() as f64),
        }
        .filter(|t| t.is_finite() && *t > 0.0);

        let concatenation = attrs
            .string(Attribute::ConcatenationUid)
            .or_else(|| attrs.string(Attribute::SopInstanceUidOfConcatenationSource))
            .map(|uid| -> Result<ConcatenationInfo, ValidationError> {
                Ok(ConcatenationInfo {
                    uid,
                    number: attrs.u32(Attribute::InConcatenationNumber)?,
                    total: attrs.u32(Attribute::InConcatenationTotalNumber)?,
                    frame_offset: attrs
                        .u32(Attribute::ConcatenationFrameOffsetNumber)?
                        .unwrap_or(0) as u64,
                })
            })
            .transpose()?;

        Ok(Self {
            uid,
            identifier,
            study_uid,
            series_uid,
            frame_of_reference_uid,
            flavor,
            tile_width,
            tile_height,
            image_width,
            image_height,
            pixel_spacing,
            imaged_size,
            transfer_syntax: TransferSyntax::from_uid(dataset.transfer_syntax()),
            sample_format,
            organization,
            optical_paths,
            optical_path_info,
            focal_planes,
            focus_method,
            extended_depth_of_field,
            slice_thickness,
            concatenation,
            frame_count,
            default_focal_plane,
            frames,
            positions,
            reader: RwLock::new(Some(reader)),
        })
    }

    fn read_pixel_spacing(
        attrs: &Attributes<'_>,
        imaged_size: Option<(f64, f64)>,
        (width, height): (u32, u32),
        report: &mut ValidationReport,
    ) -> Result<Option<PixelSpacing>, ValidationError> {
        let declared = match attrs.floats(Attribute::PixelSpacing)? {
            Some(values) => Some(PixelSpacing::from_dicom(&values).ok_or_else(|| {
                attrs.invalid(
                    Attribute::PixelSpacing,
                    format!("expected 2 values, found {}", values.len()),
                )
            })?),
            None => None,
        };

        let declared = match declared {
            Some(spacing) if spacing.x == 0.0 || spacing.y == 0.0 => {
                report.add_warning(
                    WarningKind::InvalidPixelSpacing,
                    format!("{}: pixel spacing is zero, treating as missing", attrs.instance),
                );
                None
            }
            Some(spacing) if !spacing.is_positive() => {
                return Err(attrs.invalid(
                    Attribute::PixelSpacing,
                    format!("{:?} is not positive", spacing.as_tuple()),
                ))
            }
            other => other,
        };

        Ok(declared.or_else(|| {
            imaged_size.map(|(w, h)| PixelSpacing::new(w / width as f64, h / height as f64))
        }))
    }

    fn read_optical_paths(
        attrs: &Attributes<'_>,
        path_info: &[OpticalPathInfo],
        strict: bool,
        positions: Option<&[FramePosition]>,
    ) -> Result<Vec<OpticalPath>, ValidationError> {
        let mut ids = attrs.strings(Attribute::OpticalPathIdentifier);
        if ids.is_empty() {
            ids = path_info
                .iter()
                .map(|info| info.identifier.as_str().to_string())
                .collect();
        }
        let declared = attrs.u32(Attribute::NumberOfOpticalPaths)?;

        let paths: Vec<OpticalPath> = if ids.is_empty() {
            if strict {
                return Err(attrs.missing(Attribute::OpticalPathIdentifier));
            }
            let count = declared.unwrap_or(1).max(1);
            (0..count).map(|i| OpticalPath::new(i.to_string())).collect()
        } else {
            if let Some(declared) = declared {
                if declared as usize != ids.len() {
                    return Err(attrs.invalid(
                        Attribute::NumberOfOpticalPaths,
                        format!("declares {declared} paths, {} identifiers present", ids.len()),
                    ));
                }
            }
            ids.into_iter().map(OpticalPath::from).collect()
        };

        for (i, path) in paths.iter().enumerate() {
            if paths[..i].contains(path) {
                return Err(attrs.invalid(
                    Attribute::OpticalPathIdentifier,
                    format!("identifier {path} appears more than once"),
                ));
            }
        }

        if let Some(positions) = positions {
            if let Some(unknown) = positions
                .iter()
                .filter_map(|p| p.optical_path.as_ref())
                .find(|p| !paths.contains(p))
            {
                return Err(attrs.invalid(
                    Attribute::OpticalPathIdentifier,
                    format!("frame references unknown optical path {unknown}"),
                ));
            }
        }

        Ok(paths)
    }

    fn read_extended_depth_of_field(
        attrs: &Attributes<'_>,
    ) -> Result<Option<ExtendedDepthOfField>, ValidationError> {
        match attrs.string(Attribute::ExtendedDepthOfField).as_deref() {
            None | Some("NO") => Ok(None),
            Some("YES") => {
                let focal_planes = attrs.positive_u32(Attribute::NumberOfFocalPlanes)?;
                let distance = attrs
                    .float(Attribute::DistanceBetweenFocalPlanes)?
                    .ok_or_else(|| attrs.missing(Attribute::DistanceBetweenFocalPlanes))?;
                Ok(Some(ExtendedDepthOfField {
                    focal_planes,
                    distance,
                }))
            }
            Some(other) => Err(attrs.invalid(
                Attribute::ExtendedDepthOfField,
                format!("expected YES or NO, found {other}"),
            )),
        }
    }

    fn read_focal_planes(
        attrs: &Attributes<'_>,
        organization: TileOrganization,
        positions: Option<&[FramePosition]>,
    ) -> Result<(Vec<FocalPlane>, FocalPlane), ValidationError> {
        let z0 = attrs
            .float(Attribute::ZOffsetInSlideCoordinateSystem)?
            .unwrap_or(0.0);
        let default_plane = FocalPlane::from_micrometers(z0);

        match (organization, positions) {
            (TileOrganization::Sparse, Some(positions)) => {
                let mut planes: Vec<FocalPlane> = positions
                    .iter()
                    .map(|p| p.focal_plane.unwrap_or(default_plane))
                    .collect();
                planes.sort_unstable();
                planes.dedup();
                Ok((planes, default_plane))
            }
            _ => {
                let count = attrs
                    .u32(Attribute::TotalPixelMatrixFocalPlanes)?
                    .unwrap_or(1);
                if count == 0 {
                    return Err(attrs.invalid(
                        Attribute::TotalPixelMatrixFocalPlanes,
                        "must be greater than zero",
                    ));
                }
                if count == 1 {
                    return Ok((vec![default_plane], default_plane));
                }

                let spacing_mm = attrs
                    .float(Attribute::SpacingBetweenSlices)?
                    .ok_or_else(|| attrs.missing(Attribute::SpacingBetweenSlices))?;
                if spacing_mm <= 0.0 {
                    return Err(attrs.invalid(
                        Attribute::SpacingBetweenSlices,
                        "must be greater than zero",
                    ));
                }

                let planes = (0..count)
                    .map(|i| FocalPlane::from_micrometers(z0 + i as f64 * spacing_mm * 1000.0))
                    .collect();
                Ok((planes, default_plane))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Geometry
    // -------------------------------------------------------------------------

    /// Number of tile columns covering the image.
    pub fn grid_columns(&self) -> u32 {
        self.image_width.div_ceil(self.tile_width)
    }

    /// Number of tile rows covering the image.
    pub fn grid_rows(&self) -> u32 {
        self.image_height.div_ceil(self.tile_height)
    }

    /// Frames a full-organization frame sequence holds for this geometry.
    pub fn full_frame_total(&self) -> u64 {
        self.grid_columns() as u64
            * self.grid_rows() as u64
            * self.focal_planes.len() as u64
            * self.optical_paths.len() as u64
    }

    /// Per-frame positions (sparse organization only).
    pub fn frame_positions(&self) -> Option<&[FramePosition]> {
        self.positions.as_deref()
    }

    /// Focal plane a sparse frame belongs to.
    pub fn frame_focal_plane(&self, position: &FramePosition) -> FocalPlane {
        position.focal_plane.unwrap_or(self.default_focal_plane)
    }

    /// Optical path a sparse frame belongs to.
    pub fn frame_optical_path<'a>(&'a self, position: &'a FramePosition) -> &'a OpticalPath {
        position
            .optical_path
            .as_ref()
            .or_else(|| self.optical_paths.first())
            .unwrap_or_else(|| default_optical_path())
    }

    pub fn decode_params(&self) -> DecodeParams {
        DecodeParams {
            transfer_syntax: self.transfer_syntax.clone(),
            rows: self.tile_height,
            columns: self.tile_width,
            bits_allocated: self.sample_format.bits_allocated,
            samples_per_pixel: self.sample_format.samples_per_pixel,
            photometric_interpretation: self.sample_format.photometric_interpretation.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Frame Access
    // -------------------------------------------------------------------------

    /// Read the encoded bytes of one frame.
    ///
    /// # Errors
    ///
    /// Returns `TileError::FrameOutOfRange` for frames past the frame table,
    /// or `TileError::Io` if the read fails or the stream was released.
    pub async fn read_frame(&self, frame: u32) -> Result<Bytes, TileError> {
        let range = self
            .frames
            .get(frame as usize)
            .copied()
            .ok_or_else(|| TileError::FrameOutOfRange {
                instance: self.identifier.clone(),
                frame,
                frame_count: self.frame_count,
            })?;

        let reader = self.reader()?;
        let len = usize::try_from(range.length).map_err(|_| IoError::RangeOutOfBounds {
            offset: range.offset,
            requested: range.length,
            size: reader.size(),
        })?;

        Ok(reader.read_exact_at(range.offset, len).await?)
    }

    fn reader(&self) -> Result<Arc<dyn RangeReader>, IoError> {
        self.reader
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| IoError::Released(self.identifier.clone()))
    }

    /// Drop the stream handle. Later frame reads fail.
    pub fn release(&self) {
        *self
            .reader
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

fn default_optical_path() -> &'static OpticalPath {
    static DEFAULT: std::sync::OnceLock<OpticalPath> = std::sync::OnceLock::new();
    DEFAULT.get_or_init(OpticalPath::default)
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("uid", &self.uid)
            .field("identifier", &self.identifier)
            .field("flavor", &self.flavor)
            .field("image", &(self.image_width, self.image_height))
            .field("tile", &(self.tile_width, self.tile_height))
            .field("organization", &self.organization)
            .field("frame_count", &self.frame_count)
            .field("concatenation", &self.concatenation)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
