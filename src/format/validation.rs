//! Non-fatal validation findings.
//!
//! Fatal problems abort opening with a [`ValidationError`]. Everything that
//! still yields a usable slide is recorded here as a [`SlideWarning`] and
//! logged, so callers can surface it after open.
//!
//! [`ValidationError`]: crate::error::ValidationError

use serde::Serialize;
use tracing::warn;

// =============================================================================
// Warnings
// =============================================================================

/// Category of a non-fatal finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Instance is not a whole slide image and was ignored
    UnsupportedInstance,
    /// Pixel spacing was zero and treated as missing
    InvalidPixelSpacing,
    /// Instances of one level disagree on photometric interpretation
    PhotometricMismatch,
    /// Frame count does not match the declared geometry
    FrameCountMismatch,
    /// Two sparse frames claim the same tile position
    DuplicateTileCoordinate,
    /// A sparse frame is not aligned to the tile grid or lies outside it
    MisalignedFramePosition,
    /// A level was disabled because its concatenation is inconsistent
    LevelDisabled,
    /// A level lacks channels present at other levels
    PartialChannelCoverage,
    /// Cache capacity was zero or too small and has been clamped
    CacheCapacityMisconfiguration,
}

impl WarningKind {
    pub const fn name(self) -> &'static str {
        match self {
            WarningKind::UnsupportedInstance => "unsupported instance",
            WarningKind::InvalidPixelSpacing => "invalid pixel spacing",
            WarningKind::PhotometricMismatch => "photometric mismatch",
            WarningKind::FrameCountMismatch => "frame count mismatch",
            WarningKind::DuplicateTileCoordinate => "duplicate tile coordinate",
            WarningKind::MisalignedFramePosition => "misaligned frame position",
            WarningKind::LevelDisabled => "level disabled",
            WarningKind::PartialChannelCoverage => "partial channel coverage",
            WarningKind::CacheCapacityMisconfiguration => "cache capacity misconfiguration",
        }
    }
}

/// A non-fatal finding recorded while opening or indexing a slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlideWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl SlideWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SlideWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

// =============================================================================
// Validation Report
// =============================================================================

/// Accumulates warnings while a slide is being validated.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    warnings: Vec<SlideWarning>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log a warning.
    pub fn add_warning(&mut self, kind: WarningKind, message: impl Into<String>) {
        let warning = SlideWarning::new(kind, message);
        warn!(kind = warning.kind.name(), "{}", warning.message);
        self.warnings.push(warning);
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.warnings.extend(other.warnings);
    }

    pub fn warnings(&self) -> &[SlideWarning] {
        &self.warnings
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<SlideWarning> {
        self.warnings
    }
}
