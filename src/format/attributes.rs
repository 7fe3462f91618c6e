//! DICOM attribute vocabulary used by the instance model.
//!
//! This module defines the subset of DICOM attributes the tile index needs:
//! - Identity (SOP, study, series and frame-of-reference UIDs)
//! - Image geometry (tile size, total pixel matrix, pixel spacing)
//! - Acquisition (focus method, extended depth of field)
//! - Channel layout (optical paths, focal planes)
//! - Concatenation bookkeeping
//!
//! Attributes are keyed on their standard dictionary [`Tag`]. Values arrive
//! from the dataset parser already decoded into [`Value`].

use dicom_core::Tag;
use dicom_dictionary_std::tags;

// =============================================================================
// Attributes
// =============================================================================

/// DICOM attributes relevant to tile indexing.
///
/// Attributes not listed here are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------
    /// Image type, value 3 carries the flavour (VOLUME, LABEL, OVERVIEW)
    ImageType,

    SopClassUid,

    SopInstanceUid,

    StudyInstanceUid,

    SeriesInstanceUid,

    FrameOfReferenceUid,

    // -------------------------------------------------------------------------
    // Pixel Description
    // -------------------------------------------------------------------------
    SamplesPerPixel,

    PhotometricInterpretation,

    NumberOfFrames,

    /// Tile height in pixels
    Rows,

    /// Tile width in pixels
    Columns,

    BitsAllocated,

    BitsStored,

    // -------------------------------------------------------------------------
    // Total Pixel Matrix
    // -------------------------------------------------------------------------
    TotalPixelMatrixColumns,

    TotalPixelMatrixRows,

    TotalPixelMatrixFocalPlanes,

    /// Physical width of the imaged volume in mm
    ImagedVolumeWidth,

    /// Physical height of the imaged volume in mm
    ImagedVolumeHeight,

    /// Physical depth of the imaged volume in µm
    ImagedVolumeDepth,

    /// Row and column spacing in mm, from the pixel measures sequence
    PixelSpacing,

    /// Depth of field in mm, from the pixel measures sequence
    SliceThickness,

    /// Distance between focal planes in mm
    SpacingBetweenSlices,

    /// Z offset of the first focal plane in µm
    ZOffsetInSlideCoordinateSystem,

    // -------------------------------------------------------------------------
    // Acquisition
    // -------------------------------------------------------------------------
    /// AUTO or MANUAL
    FocusMethod,

    /// YES when several planes were combined into each frame
    ExtendedDepthOfField,

    /// Planes combined into an extended depth of field frame
    NumberOfFocalPlanes,

    /// Distance between combined planes in µm
    DistanceBetweenFocalPlanes,

    // -------------------------------------------------------------------------
    // Channels
    // -------------------------------------------------------------------------
    NumberOfOpticalPaths,

    /// Identifiers of every item in the optical path sequence
    OpticalPathIdentifier,

    /// TILED_FULL or TILED_SPARSE
    DimensionOrganizationType,

    // -------------------------------------------------------------------------
    // Concatenation
    // -------------------------------------------------------------------------
    ConcatenationUid,

    SopInstanceUidOfConcatenationSource,

    InConcatenationNumber,

    InConcatenationTotalNumber,

    ConcatenationFrameOffsetNumber,
}

impl Attribute {
    /// All attributes known to the instance model.
    pub const ALL: [Attribute; 35] = [
        Attribute::ImageType,
        Attribute::SopClassUid,
        Attribute::SopInstanceUid,
        Attribute::StudyInstanceUid,
        Attribute::SeriesInstanceUid,
        Attribute::FrameOfReferenceUid,
        Attribute::SamplesPerPixel,
        Attribute::PhotometricInterpretation,
        Attribute::NumberOfFrames,
        Attribute::Rows,
        Attribute::Columns,
        Attribute::BitsAllocated,
        Attribute::BitsStored,
        Attribute::TotalPixelMatrixColumns,
        Attribute::TotalPixelMatrixRows,
        Attribute::TotalPixelMatrixFocalPlanes,
        Attribute::ImagedVolumeWidth,
        Attribute::ImagedVolumeHeight,
        Attribute::ImagedVolumeDepth,
        Attribute::PixelSpacing,
        Attribute::SliceThickness,
        Attribute::SpacingBetweenSlices,
        Attribute::ZOffsetInSlideCoordinateSystem,
        Attribute::FocusMethod,
        Attribute::ExtendedDepthOfField,
        Attribute::NumberOfFocalPlanes,
        Attribute::DistanceBetweenFocalPlanes,
        Attribute::NumberOfOpticalPaths,
        Attribute::OpticalPathIdentifier,
        Attribute::DimensionOrganizationType,
        Attribute::ConcatenationUid,
        Attribute::SopInstanceUidOfConcatenationSource,
        Attribute::InConcatenationNumber,
        Attribute::InConcatenationTotalNumber,
        Attribute::ConcatenationFrameOffsetNumber,
    ];

    /// Look an attribute up by tag.
    ///
    /// Returns `None` for tags outside the supported vocabulary.
    pub fn from_tag(tag: Tag) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.tag() == tag)
    }

    /// Standard dictionary tag of the attribute.
    pub const fn tag(self) -> Tag {
        match self {
            Attribute::ImageType => tags::IMAGE_TYPE,
            Attribute::SopClassUid => tags::SOP_CLASS_UID,
            Attribute::SopInstanceUid => tags::SOP_INSTANCE_UID,
            Attribute::StudyInstanceUid => tags::STUDY_INSTANCE_UID,
            Attribute::SeriesInstanceUid => tags::SERIES_INSTANCE_UID,
            Attribute::FrameOfReferenceUid => tags::FRAME_OF_REFERENCE_UID,
            Attribute::SamplesPerPixel => tags::SAMPLES_PER_PIXEL,
            Attribute::PhotometricInterpretation => tags::PHOTOMETRIC_INTERPRETATION,
            Attribute::NumberOfFrames => tags::NUMBER_OF_FRAMES,
            Attribute::Rows => tags::ROWS,
            Attribute::Columns => tags::COLUMNS,
            Attribute::BitsAllocated => tags::BITS_ALLOCATED,
            Attribute::BitsStored => tags::BITS_STORED,
            Attribute::TotalPixelMatrixColumns => tags::TOTAL_PIXEL_MATRIX_COLUMNS,
            Attribute::TotalPixelMatrixRows => tags::TOTAL_PIXEL_MATRIX_ROWS,
            Attribute::TotalPixelMatrixFocalPlanes => tags::TOTAL_PIXEL_MATRIX_FOCAL_PLANES,
            Attribute::ImagedVolumeWidth => tags::IMAGED_VOLUME_WIDTH,
            Attribute::ImagedVolumeHeight => tags::IMAGED_VOLUME_HEIGHT,
            Attribute::ImagedVolumeDepth => tags::IMAGED_VOLUME_DEPTH,
            Attribute::PixelSpacing => tags::PIXEL_SPACING,
            Attribute::SliceThickness => tags::SLICE_THICKNESS,
            Attribute::SpacingBetweenSlices => tags::SPACING_BETWEEN_SLICES,
            Attribute::ZOffsetInSlideCoordinateSystem => tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM,
            Attribute::FocusMethod => tags::FOCUS_METHOD,
            Attribute::ExtendedDepthOfField => tags::EXTENDED_DEPTH_OF_FIELD,
            Attribute::NumberOfFocalPlanes => tags::NUMBER_OF_FOCAL_PLANES,
            Attribute::DistanceBetweenFocalPlanes => tags::DISTANCE_BETWEEN_FOCAL_PLANES,
            Attribute::NumberOfOpticalPaths => tags::NUMBER_OF_OPTICAL_PATHS,
            Attribute::OpticalPathIdentifier => tags::OPTICAL_PATH_IDENTIFIER,
            Attribute::DimensionOrganizationType => tags::DIMENSION_ORGANIZATION_TYPE,
            Attribute::ConcatenationUid => tags::CONCATENATION_UID,
            Attribute::SopInstanceUidOfConcatenationSource => {
                tags::SOP_INSTANCE_UID_OF_CONCATENATION_SOURCE
            }
            Attribute::InConcatenationNumber => tags::IN_CONCATENATION_NUMBER,
            Attribute::InConcatenationTotalNumber => tags::IN_CONCATENATION_TOTAL_NUMBER,
            Attribute::ConcatenationFrameOffsetNumber => tags::CONCATENATION_FRAME_OFFSET_NUMBER,
        }
    }

    #[inline]
    pub const fn group(self) -> u16 {
        self.tag().0
    }

    #[inline]
    pub const fn element(self) -> u16 {
        self.tag().1
    }

    /// DICOM keyword, used in error messages.
    pub const fn keyword(self) -> &'static str {
        match self {
            Attribute::ImageType => "ImageType",
            Attribute::SopClassUid => "SOPClassUID",
            Attribute::SopInstanceUid => "SOPInstanceUID",
            Attribute::StudyInstanceUid => "StudyInstanceUID",
            Attribute::SeriesInstanceUid => "SeriesInstanceUID",
            Attribute::FrameOfReferenceUid => "FrameOfReferenceUID",
            Attribute::SamplesPerPixel => "SamplesPerPixel",
            Attribute::PhotometricInterpretation => "PhotometricInterpretation",
            Attribute::NumberOfFrames => "NumberOfFrames",
            Attribute::Rows => "Rows",
            Attribute::Columns => "Columns",
            Attribute::BitsAllocated => "BitsAllocated",
            Attribute::BitsStored => "BitsStored",
            Attribute::TotalPixelMatrixColumns => "TotalPixelMatrixColumns",
            Attribute::TotalPixelMatrixRows => "TotalPixelMatrixRows",
            Attribute::TotalPixelMatrixFocalPlanes => "TotalPixelMatrixFocalPlanes",
            Attribute::ImagedVolumeWidth => "ImagedVolumeWidth",
            Attribute::ImagedVolumeHeight => "ImagedVolumeHeight",
            Attribute::ImagedVolumeDepth => "ImagedVolumeDepth",
            Attribute::PixelSpacing => "PixelSpacing",
            Attribute::SliceThickness => "SliceThickness",
            Attribute::SpacingBetweenSlices => "SpacingBetweenSlices",
            Attribute::ZOffsetInSlideCoordinateSystem => "ZOffsetInSlideCoordinateSystem",
            Attribute::FocusMethod => "FocusMethod",
            Attribute::ExtendedDepthOfField => "ExtendedDepthOfField",
            Attribute::NumberOfFocalPlanes => "NumberOfFocalPlanes",
            Attribute::DistanceBetweenFocalPlanes => "DistanceBetweenFocalPlanes",
            Attribute::NumberOfOpticalPaths => "NumberOfOpticalPaths",
            Attribute::OpticalPathIdentifier => "OpticalPathIdentifier",
            Attribute::DimensionOrganizationType => "DimensionOrganizationType",
            Attribute::ConcatenationUid => "ConcatenationUID",
            Attribute::SopInstanceUidOfConcatenationSource => "SOPInstanceUIDOfConcatenationSource",
            Attribute::InConcatenationNumber => "InConcatenationNumber",
            Attribute::InConcatenationTotalNumber => "InConcatenationTotalNumber",
            Attribute::ConcatenationFrameOffsetNumber => "ConcatenationFrameOffsetNumber",
        }
    }
}

/// SOP class UID of VL Whole Slide Microscopy Image Storage.
pub const WSI_SOP_CLASS_UID: &str = "1.2.840.10008.5.1.4.1.1.77.1.6";

// =============================================================================
// Values
// =============================================================================

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Strs(Vec<String>),
    Int(i64),
    Float(f64),
    Floats(Vec<f64>),
}

impl Value {
    /// Single string value. Multi-valued strings yield their first item.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.trim()),
            Value::Strs(v) => v.first().map(|s| s.trim()),
            _ => None,
        }
    }

    /// All string values.
    pub fn as_strs(&self) -> Option<Vec<&str>> {
        match self {
            Value::Str(s) => Some(s.split('\\').map(str::trim).collect()),
            Value::Strs(v) => Some(v.iter().map(|s| s.trim()).collect()),
            _ => None,
        }
    }

    /// Integer value. Accepts integral floats and numeric strings.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_int().and_then(|v| u32::try_from(v).ok())
    }

    /// Float value. Decimal strings (DICOM DS) are parsed.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Floats(v) => v.first().copied(),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Strs(v) => v.first().and_then(|s| s.trim().parse().ok()),
        }
    }

    /// All float values.
    pub fn as_floats(&self) -> Option<Vec<f64>> {
        match self {
            Value::Floats(v) => Some(v.clone()),
            Value::Float(v) => Some(vec![*v]),
            Value::Int(v) => Some(vec![*v as f64]),
            Value::Str(s) => s.split('\\').map(|p| p.trim().parse().ok()).collect(),
            Value::Strs(v) => v.iter().map(|p| p.trim().parse().ok()).collect(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<&str>> for Value {
    fn from(value: Vec<&str>) -> Self {
        Value::Strs(value.into_iter().map(str::to_string).collect())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::Floats(value)
    }
}

// =============================================================================
// Tests
// =============================================================================
