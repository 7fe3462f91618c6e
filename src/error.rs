use std::time::Duration;

use thiserror::Error;

/// I/O errors that can occur when reading instance bytes
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from the underlying file or stream
    #[error("I/O error on {identifier}: {message}")]
    Io { identifier: String, message: String },

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The stream was released when its slide was closed
    #[error("Stream released: {0}")]
    Released(String),
}

impl IoError {
    /// Wrap a `std::io::Error` for the given stream identifier.
    pub fn from_std(identifier: impl Into<String>, err: std::io::Error) -> Self {
        let identifier = identifier.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(identifier)
        } else {
            IoError::Io {
                identifier,
                message: err.to_string(),
            }
        }
    }
}

/// Errors reported by the dataset parser collaborator
#[derive(Debug, Clone, Error)]
pub enum DatasetError {
    /// I/O error while reading the container
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// The container could not be parsed into attributes
    #[error("Failed to parse dataset {identifier}: {message}")]
    Parse { identifier: String, message: String },
}

/// Errors building a palette color lookup table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LutError {
    /// Segment opcode other than discrete (0) or linear (1)
    #[error("Unsupported palette segment type {0}")]
    UnsupportedSegment(u16),

    /// A segment declares more values than the data holds
    #[error("Palette segment at word {position} is truncated")]
    TruncatedSegment { position: usize },

    /// Red, green and blue tables expand to different lengths
    #[error("Palette tables have {red}, {green} and {blue} entries")]
    ChannelLengthMismatch {
        red: usize,
        green: usize,
        blue: usize,
    },

    /// Expanded table does not match the descriptor's entry count
    #[error("Palette descriptor declares {declared} entries, tables hold {found}")]
    EntryCountMismatch { declared: usize, found: usize },

    /// Entries must be 8 or 16 bits wide
    #[error("Unsupported palette entry width of {0} bits")]
    UnsupportedBits(u16),
}

/// Fatal metadata problems detected while opening a slide.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required attribute is absent
    #[error("Instance {instance} is missing required attribute {attribute}")]
    MissingAttribute {
        instance: String,
        attribute: &'static str,
    },

    /// An attribute is present but unusable
    #[error("Instance {instance} has invalid {attribute}: {message}")]
    InvalidAttribute {
        instance: String,
        attribute: &'static str,
        message: String,
    },

    /// Two inputs carry the same SOP instance UID
    #[error("Duplicate instance UID {uid}")]
    DuplicateInstance { uid: String },

    /// Instances do not share the same study, series or frame of reference
    #[error("Instance {instance} has {attribute} {found:?}, expected {expected:?}")]
    IdentityMismatch {
        instance: String,
        attribute: &'static str,
        expected: Option<String>,
        found: Option<String>,
    },

    /// Tile organization could not be derived
    #[error("Instance {instance}: undetermined tile organization")]
    UndeterminedTileOrganization { instance: String },

    /// Instances of one level disagree on tile size
    #[error("Level {width}x{height}: instance {instance} has tile size {found:?}, expected {expected:?}")]
    TileSizeMismatch {
        width: u32,
        height: u32,
        instance: String,
        expected: (u32, u32),
        found: (u32, u32),
    },

    /// Instances of one level disagree on pixel spacing
    #[error("Level {width}x{height}: instance {instance} has pixel spacing {found:?}, expected {expected:?}")]
    PixelSpacingMismatch {
        width: u32,
        height: u32,
        instance: String,
        expected: (f64, f64),
        found: (f64, f64),
    },

    /// Instances of one level disagree on sample layout
    #[error("Level {width}x{height}: instance {instance} has incompatible sample format: {message}")]
    SampleFormatMismatch {
        width: u32,
        height: u32,
        instance: String,
        message: String,
    },

    /// Two frame sources provide the same channel at one level
    #[error("Level {width}x{height}: channel ({optical_path}, {focal_plane}) provided twice")]
    DuplicateChannel {
        width: u32,
        height: u32,
        optical_path: String,
        focal_plane: String,
    },

    /// Two levels have the same or inverted resolution order
    #[error("Levels are not strictly decreasing in resolution at pixel spacing {spacing} mm")]
    NonDecreasingResolution { spacing: f64 },

    /// A level lacks channels that exist elsewhere in the slide
    #[error("Level {level} is missing channels: {missing}")]
    IncompleteChannels { level: usize, missing: String },

    /// No pyramid (VOLUME) instances were supplied
    #[error("No volume instances found")]
    NoVolumeInstances,
}

/// Concatenated instances do not reconstruct their frame sequence exactly once.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConcatenationError {
    /// A member lacks its in-concatenation number
    #[error("Concatenation {uid}: instance {instance} has no in-concatenation number")]
    MissingPosition { uid: String, instance: String },

    /// Two members claim the same in-concatenation number
    #[error("Concatenation {uid}: position {position} appears more than once")]
    DuplicatePosition { uid: String, position: u32 },

    /// Frames are missing between two members
    #[error("Concatenation {uid}: gap before instance {instance} (expected frame offset {expected}, found {found})")]
    Gap {
        uid: String,
        instance: String,
        expected: u64,
        found: u64,
    },

    /// Two members claim the same frames
    #[error("Concatenation {uid}: instance {instance} overlaps previous frames (expected frame offset {expected}, found {found})")]
    Overlap {
        uid: String,
        instance: String,
        expected: u64,
        found: u64,
    },

    /// Frame counts do not add up to the declared total
    #[error("Concatenation {uid}: frames sum to {actual}, declared total is {declared}")]
    FrameCountMismatch {
        uid: String,
        declared: u64,
        actual: u64,
    },

    /// Member count does not match the in-concatenation total number
    #[error("Concatenation {uid}: {actual} instances present, declared {declared}")]
    InstanceCountMismatch {
        uid: String,
        declared: u32,
        actual: u32,
    },

    /// Members disagree on geometry or channel layout
    #[error("Concatenation {uid}: instance {instance} does not match the other members ({message})")]
    MemberMismatch {
        uid: String,
        instance: String,
        message: String,
    },
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Errors returned by `Slide::open`.
///
/// Opening either yields a fully validated slide or one of these; there is
/// no partially usable slide.
#[derive(Debug, Clone, Error)]
pub enum OpenError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Inconsistent concatenation: {0}")]
    InconsistentConcatenation(#[from] ConcatenationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the pixel codec collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// No codec is available for this transfer syntax
    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    /// The compressed stream could not be decoded
    #[error("Failed to decode frame: {message}")]
    Malformed { message: String },

    /// Decoded output does not match the declared frame geometry
    #[error("Decoded frame has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Failures fetching one tile. Cloneable so that every caller waiting on the
/// same decode observes the same outcome.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Locator points past the instance's frame table
    #[error("Frame {frame} out of range for instance {instance} ({frame_count} frames)")]
    FrameOutOfRange {
        instance: String,
        frame: u32,
        frame_count: u32,
    },

    /// The decode task ended without producing a result
    #[error("Tile fetch aborted: {0}")]
    Aborted(String),
}

/// Errors from building a frame index
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameIndexError {
    #[error("Level {level} has no channel ({optical_path}, {focal_plane})")]
    ChannelNotFound {
        level: usize,
        optical_path: String,
        focal_plane: String,
    },

    /// A full-organization grid position resolved to no frame
    #[error("Level {level}: frame {frame} is not covered by any instance")]
    MissingFrame { level: usize, frame: u64 },
}

/// Errors from level selection and coordinate mapping
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PyramidError {
    #[error("Invalid level {level}: slide has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    #[error("No level satisfies pixel spacing {requested} mm")]
    NoSuitableLevel { requested: f64 },

    #[error("Invalid level request: {message}")]
    InvalidRequest { message: String },
}

/// Errors returned by region reads.
///
/// Per-tile failures are reported here and never affect other reads or
/// other cached tiles.
#[derive(Debug, Clone, Error)]
pub enum RegionError {
    #[error("Region ({x}, {y}) {width}x{height} exceeds level {level} extent {level_width}x{level_height}")]
    OutOfBounds {
        level: usize,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
        level_width: u32,
        level_height: u32,
    },

    #[error("Invalid level {level}: slide has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    /// The level was disabled at open (see concatenation policy)
    #[error("Level {level} is unavailable: {reason}")]
    LevelUnavailable { level: usize, reason: String },

    #[error("Frame index error: {0}")]
    FrameIndex(#[from] FrameIndexError),

    #[error("Tile ({column}, {row}) failed: {source}")]
    Tile {
        column: u32,
        row: u32,
        #[source]
        source: TileError,
    },

    #[error("Region read aborted: {0}")]
    Aborted(String),

    #[error("Region read cancelled")]
    Cancelled,

    #[error("Region read timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("Slide is closed")]
    SlideClosed,
}

impl From<PyramidError> for RegionError {
    fn from(error: PyramidError) -> Self {
        match error {
            PyramidError::InvalidLevel { level, level_count } => {
                RegionError::InvalidLevel { level, level_count }
            }
            other => RegionError::Aborted(other.to_string()),
        }
    }
}
