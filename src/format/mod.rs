//! DICOM instance metadata and frame decoding.
//!
//! This module turns parsed datasets into validated [`Instance`] records and
//! decodes their frames.
//!
//! # Layout
//!
//! - [`attributes`]: the DICOM attribute vocabulary and decoded values
//! - [`dataset`]: the interface a dataset parser provides
//! - [`dicom`]: the built-in parser for DICOM Part 10 files
//! - [`instance`]: the validated per-file metadata record
//! - [`optical`]: optical path descriptions, ICC profiles and palettes
//! - [`decoder`]: transfer syntaxes and the frame decoder interface
//! - [`validation`]: non-fatal findings collected during open

pub mod attributes;
pub mod dataset;
pub mod decoder;
pub mod dicom;
pub mod instance;
pub mod optical;
pub mod validation;

pub use attributes::{Attribute, Value, WSI_SOP_CLASS_UID};
pub use dataset::{ByteRange, Dataset, DatasetParser, FramePosition, InMemoryDataset};
pub use decoder::{DecodeParams, FrameDecoder, ImageFrameDecoder, TransferSyntax};
pub use dicom::DicomObjectParser;
pub use instance::{
    is_whole_slide_image, ConcatenationInfo, ExtendedDepthOfField, FocalPlane, FocusMethod,
    ImageFlavor, Instance, OpticalPath, PixelSpacing, SampleFormat, TileOrganization,
};
pub use optical::{LutDescriptor, OpticalPathInfo, PaletteLut};
pub use validation::{SlideWarning, ValidationReport, WarningKind};
