//! Test utilities for integration tests.
//!
//! This module builds synthetic slides in memory: native tiles whose samples
//! follow a known pattern, JPEG tiles, sparse and concatenated levels, plus
//! mock readers, parsers and decoders that count, delay or fail. Levels can
//! also be written out as DICOM Part 10 files.

use async_trait::async_trait;
use bytes::Bytes;
use dicom_core::value::DataSetSequence;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wsi_mosaic::error::{DatasetError, DecodeError, IoError};
use wsi_mosaic::format::{
    Attribute, ByteRange, Dataset, DatasetParser, DecodeParams, FocalPlane, FrameDecoder,
    FramePosition, ImageFrameDecoder, InMemoryDataset, WSI_SOP_CLASS_UID,
};
use wsi_mosaic::io::{MemoryRangeReader, RangeReader};
use wsi_mosaic::slide::{InstanceSource, Slide};
use wsi_mosaic::SlideConfig;

pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

pub const STUDY_UID: &str = "1.2.826.0.1.3680043.1";
pub const SERIES_UID: &str = "1.2.826.0.1.3680043.1.1";
pub const FRAME_OF_REFERENCE_UID: &str = "1.2.826.0.1.3680043.1.2";

/// Route library logs to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Sample Pattern
// =============================================================================

/// Expected sample at level coordinates `(x, y)`.
///
/// Every native tile is generated from this function, so any stitched pixel
/// can be checked against it.
pub fn sample_at(x: u32, y: u32, sample: u16, channel: u8) -> u8 {
    ((x * 7 + y * 13 + sample as u32 * 101 + channel as u32 * 53) % 251) as u8
}

/// Solid colour of JPEG tile `(column, row)`.
pub fn tile_color(column: u32, row: u32) -> [u8; 3] {
    [(column * 60 + 20) as u8, (row * 60 + 20) as u8, 128]
}

/// Check that two 8-bit samples differ by at most `tolerance`.
pub fn close_to(actual: u8, expected: u8, tolerance: u8) -> bool {
    actual.abs_diff(expected) <= tolerance
}

// =============================================================================
// Level Builders
// =============================================================================

/// Geometry of a synthetic level.
#[derive(Debug, Clone)]
pub struct LevelSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub tile: u32,
    pub samples_per_pixel: u16,
    pub spacing: f64,
    pub optical_paths: Vec<String>,
    pub focal_planes: u32,
    /// Distance between focal planes in mm
    pub slice_spacing: f64,
}

impl LevelSpec {
    /// Single channel, 8-bit monochrome level with square tiles.
    pub fn new(name: &str, width: u32, height: u32, tile: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            tile,
            samples_per_pixel: 1,
            spacing: 0.00025,
            optical_paths: Vec::new(),
            focal_planes: 1,
            slice_spacing: 0.0,
        }
    }

    pub fn rgb(mut self) -> Self {
        self.samples_per_pixel = 3;
        self
    }

    pub fn spacing(mut self, spacing: f64) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn optical_paths(mut self, paths: &[&str]) -> Self {
        self.optical_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// A z-stack of `count` planes, `spacing_mm` apart, starting at z = 0.
    pub fn focal_planes(mut self, count: u32, spacing_mm: f64) -> Self {
        self.focal_planes = count;
        self.slice_spacing = spacing_mm;
        self
    }

    /// Plane `index` of the z-stack.
    pub fn plane(&self, index: u32) -> FocalPlane {
        FocalPlane::from_micrometers(index as f64 * self.slice_spacing * 1000.0)
    }

    pub fn grid(&self) -> (u32, u32) {
        (self.width.div_ceil(self.tile), self.height.div_ceil(self.tile))
    }

    fn path_count(&self) -> usize {
        self.optical_paths.len().max(1)
    }

    /// Pattern channel of a (path, plane) pair.
    pub fn channel(&self, path: usize, plane: u32) -> u8 {
        (path as u32 * self.focal_planes + plane) as u8
    }

    /// Attributes shared by every instance of the level, without frames.
    pub fn dataset(&self, identifier: &str, transfer_syntax: &str) -> InMemoryDataset {
        let photometric = match (self.samples_per_pixel, transfer_syntax) {
            (1, _) => "MONOCHROME2",
            (_, JPEG_BASELINE) => "YBR_FULL_422",
            _ => "RGB",
        };

        let mut dataset = InMemoryDataset::new(identifier, transfer_syntax)
            .with(Attribute::SopClassUid, WSI_SOP_CLASS_UID)
            .with(Attribute::SopInstanceUid, format!("{SERIES_UID}.{identifier}"))
            .with(Attribute::StudyInstanceUid, STUDY_UID)
            .with(Attribute::SeriesInstanceUid, SERIES_UID)
            .with(Attribute::FrameOfReferenceUid, FRAME_OF_REFERENCE_UID)
            .with(Attribute::ImageType, "ORIGINAL\\PRIMARY\\VOLUME\\NONE")
            .with(Attribute::Rows, self.tile)
            .with(Attribute::Columns, self.tile)
            .with(Attribute::TotalPixelMatrixColumns, self.width)
            .with(Attribute::TotalPixelMatrixRows, self.height)
            .with(Attribute::SamplesPerPixel, self.samples_per_pixel as u32)
            .with(Attribute::BitsAllocated, 8u32)
            .with(Attribute::PhotometricInterpretation, photometric)
            .with(Attribute::PixelSpacing, vec![self.spacing, self.spacing]);

        if !self.optical_paths.is_empty() {
            let ids: Vec<&str> = self.optical_paths.iter().map(String::as_str).collect();
            dataset = dataset
                .with(Attribute::NumberOfOpticalPaths, ids.len() as u32)
                .with(Attribute::OpticalPathIdentifier, ids);
        }
        if self.focal_planes > 1 {
            dataset = dataset
                .with(Attribute::TotalPixelMatrixFocalPlanes, self.focal_planes)
                .with(Attribute::SpacingBetweenSlices, self.slice_spacing);
        }
        dataset
    }
}

/// Native samples of tile `(column, row)` of one channel, including the
/// padding past the level edge.
pub fn native_tile(spec: &LevelSpec, column: u32, row: u32, channel: u8) -> Vec<u8> {
    let spp = spec.samples_per_pixel;
    let mut data = Vec::with_capacity((spec.tile * spec.tile) as usize * spp as usize);
    for ty in 0..spec.tile {
        for tx in 0..spec.tile {
            for s in 0..spp {
                data.push(sample_at(
                    column * spec.tile + tx,
                    row * spec.tile + ty,
                    s,
                    channel,
                ));
            }
        }
    }
    data
}

/// A dataset and the bytes its frame table points into.
#[derive(Debug, Clone)]
pub struct SyntheticInstance {
    pub dataset: InMemoryDataset,
    pub data: Vec<u8>,
}

impl SyntheticInstance {
    pub fn identifier(&self) -> String {
        self.dataset.identifier().to_string()
    }

    pub fn reader(&self) -> Arc<dyn RangeReader> {
        Arc::new(MemoryRangeReader::new(self.identifier(), self.data.clone()))
    }

    pub fn source(&self) -> InstanceSource {
        InstanceSource::new(self.dataset.clone(), self.reader())
    }

    /// Source backed by a reader that records every read.
    pub fn tracked_source(&self) -> (InstanceSource, TrackingMockReader) {
        let reader = TrackingMockReader::new(self.data.clone(), self.identifier());
        let source = InstanceSource::new(self.dataset.clone(), Arc::new(reader.clone()));
        (source, reader)
    }
}

/// Append frames to `data`, returning their byte ranges.
fn pack_frames(frames: impl IntoIterator<Item = Vec<u8>>, data: &mut Vec<u8>) -> Vec<ByteRange> {
    frames
        .into_iter()
        .map(|frame| {
            let range = ByteRange::new(data.len() as u64, frame.len() as u64);
            data.extend_from_slice(&frame);
            range
        })
        .collect()
}

/// Native frames of a full level, in TILED_FULL order: columns fastest,
/// then rows, focal planes and optical paths.
fn full_frames(spec: &LevelSpec) -> Vec<Vec<u8>> {
    let (columns, rows) = spec.grid();
    let mut frames = Vec::new();
    for path in 0..spec.path_count() {
        for plane in 0..spec.focal_planes {
            for row in 0..rows {
                for column in 0..columns {
                    frames.push(native_tile(spec, column, row, spec.channel(path, plane)));
                }
            }
        }
    }
    frames
}

/// A TILED_FULL level in a single instance.
pub fn full_level(spec: &LevelSpec) -> SyntheticInstance {
    let mut data = Vec::new();
    let frames = pack_frames(full_frames(spec), &mut data);
    let dataset = spec
        .dataset(&spec.name, EXPLICIT_VR_LITTLE_ENDIAN)
        .with(Attribute::DimensionOrganizationType, "TILED_FULL")
        .with(Attribute::NumberOfFrames, frames.len() as u32)
        .with_frames(frames);
    SyntheticInstance { dataset, data }
}

/// A TILED_SPARSE level holding only the `present` tiles.
pub fn sparse_level(spec: &LevelSpec, present: &[(u32, u32)]) -> SyntheticInstance {
    let mut data = Vec::new();
    let frames = pack_frames(
        present
            .iter()
            .map(|&(column, row)| native_tile(spec, column, row, 0)),
        &mut data,
    );
    let positions = present
        .iter()
        .map(|&(column, row)| FramePosition::new(column * spec.tile + 1, row * spec.tile + 1))
        .collect();

    let dataset = spec
        .dataset(&spec.name, EXPLICIT_VR_LITTLE_ENDIAN)
        .with(Attribute::DimensionOrganizationType, "TILED_SPARSE")
        .with(Attribute::NumberOfFrames, frames.len() as u32)
        .with_frames(frames)
        .with_positions(positions);
    SyntheticInstance { dataset, data }
}

/// Frames and positions of the `present` tiles on every plane of `planes`.
fn sparse_plane_frames(
    spec: &LevelSpec,
    present: &[(u32, u32)],
    planes: &[u32],
) -> (Vec<Vec<u8>>, Vec<FramePosition>) {
    planes
        .iter()
        .flat_map(|&plane| {
            present.iter().map(move |&(column, row)| {
                let position = FramePosition::new(column * spec.tile + 1, row * spec.tile + 1)
                    .with_z_offset(spec.plane(plane).micrometers());
                (native_tile(spec, column, row, spec.channel(0, plane)), position)
            })
        })
        .unzip()
}

/// A TILED_SPARSE z-stack holding the `present` tiles on every plane.
pub fn sparse_z_level(spec: &LevelSpec, present: &[(u32, u32)]) -> SyntheticInstance {
    let planes: Vec<u32> = (0..spec.focal_planes).collect();
    let (frames, positions) = sparse_plane_frames(spec, present, &planes);
    let mut data = Vec::new();
    let frames = pack_frames(frames, &mut data);

    let dataset = spec
        .dataset(&spec.name, EXPLICIT_VR_LITTLE_ENDIAN)
        .without(Attribute::TotalPixelMatrixFocalPlanes)
        .with(Attribute::DimensionOrganizationType, "TILED_SPARSE")
        .with(Attribute::NumberOfFrames, frames.len() as u32)
        .with_frames(frames)
        .with_positions(positions);
    SyntheticInstance { dataset, data }
}

/// A TILED_SPARSE z-stack concatenated one focal plane per part.
pub fn sparse_z_concatenation(spec: &LevelSpec, present: &[(u32, u32)]) -> Vec<SyntheticInstance> {
    let uid = format!("{SERIES_UID}.{}.0", spec.name);
    let per_part = present.len() as u32;

    (0..spec.focal_planes)
        .map(|plane| {
            let (frames, positions) = sparse_plane_frames(spec, present, &[plane]);
            let mut data = Vec::new();
            let ranges = pack_frames(frames, &mut data);
            let identifier = format!("{}-part{}", spec.name, plane + 1);
            let dataset = spec
                .dataset(&identifier, EXPLICIT_VR_LITTLE_ENDIAN)
                .without(Attribute::TotalPixelMatrixFocalPlanes)
                .with(Attribute::DimensionOrganizationType, "TILED_SPARSE")
                .with(Attribute::ConcatenationUid, uid.as_str())
                .with(Attribute::InConcatenationNumber, plane + 1)
                .with(Attribute::InConcatenationTotalNumber, spec.focal_planes)
                .with(Attribute::ConcatenationFrameOffsetNumber, plane * per_part)
                .with(Attribute::NumberOfFrames, ranges.len() as u32)
                .with_frames(ranges)
                .with_positions(positions);
            SyntheticInstance { dataset, data }
        })
        .collect()
}

/// A full level split into concatenated parts of `parts[i]` frames each.
pub fn concatenated_level(spec: &LevelSpec, parts: &[u32]) -> Vec<SyntheticInstance> {
    let mut offset = 0;
    let layout: Vec<(u32, u32)> = parts
        .iter()
        .map(|&frames| {
            let part = (frames, offset);
            offset += frames;
            part
        })
        .collect();
    concatenated_level_with_offsets(spec, &layout)
}

/// Like [`concatenated_level`], with explicit `(frames, frame_offset)` per
/// part. Frames are still taken consecutively, so wrong offsets describe a
/// broken concatenation.
pub fn concatenated_level_with_offsets(
    spec: &LevelSpec,
    parts: &[(u32, u32)],
) -> Vec<SyntheticInstance> {
    let mut frames = full_frames(spec).into_iter();
    let uid = format!("{SERIES_UID}.{}.0", spec.name);

    parts
        .iter()
        .enumerate()
        .map(|(i, &(count, offset))| {
            let mut data = Vec::new();
            let ranges = pack_frames(frames.by_ref().take(count as usize), &mut data);
            let identifier = format!("{}-part{}", spec.name, i + 1);
            let dataset = spec
                .dataset(&identifier, EXPLICIT_VR_LITTLE_ENDIAN)
                .with(Attribute::DimensionOrganizationType, "TILED_FULL")
                .with(Attribute::ConcatenationUid, uid.as_str())
                .with(Attribute::InConcatenationNumber, i as u32 + 1)
                .with(Attribute::InConcatenationTotalNumber, parts.len() as u32)
                .with(Attribute::ConcatenationFrameOffsetNumber, offset)
                .with(Attribute::NumberOfFrames, ranges.len() as u32)
                .with_frames(ranges);
            SyntheticInstance { dataset, data }
        })
        .collect()
}

/// Encode a solid colour RGB JPEG.
pub fn solid_jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(rgb));
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 95);
    encoder.encode_image(&img).unwrap();
    buf
}

/// A TILED_FULL level of JPEG baseline tiles, each a solid [`tile_color`].
pub fn jpeg_level(spec: &LevelSpec) -> SyntheticInstance {
    let (columns, rows) = spec.grid();
    let mut data = Vec::new();
    let frames = pack_frames(
        (0..rows).flat_map(|row| {
            (0..columns)
                .map(move |column| solid_jpeg(spec.tile, spec.tile, tile_color(column, row)))
        }),
        &mut data,
    );
    let dataset = spec
        .dataset(&spec.name, JPEG_BASELINE)
        .with(Attribute::SamplesPerPixel, 3u32)
        .with(Attribute::PhotometricInterpretation, "YBR_FULL_422")
        .with(Attribute::DimensionOrganizationType, "TILED_FULL")
        .with(Attribute::NumberOfFrames, frames.len() as u32)
        .with_frames(frames);
    SyntheticInstance { dataset, data }
}

/// A single-frame LABEL image.
pub fn label_image(name: &str) -> SyntheticInstance {
    let data = vec![200u8; 32 * 16 * 3];
    let dataset = InMemoryDataset::new(name, EXPLICIT_VR_LITTLE_ENDIAN)
        .with(Attribute::SopClassUid, WSI_SOP_CLASS_UID)
        .with(Attribute::SopInstanceUid, format!("{SERIES_UID}.{name}"))
        .with(Attribute::StudyInstanceUid, STUDY_UID)
        .with(Attribute::SeriesInstanceUid, SERIES_UID)
        .with(Attribute::FrameOfReferenceUid, FRAME_OF_REFERENCE_UID)
        .with(Attribute::ImageType, "ORIGINAL\\PRIMARY\\LABEL\\NONE")
        .with(Attribute::Rows, 16u32)
        .with(Attribute::Columns, 32u32)
        .with(Attribute::SamplesPerPixel, 3u32)
        .with(Attribute::BitsAllocated, 8u32)
        .with(Attribute::PhotometricInterpretation, "RGB")
        .with(Attribute::NumberOfFrames, 1u32)
        .with_frames(vec![ByteRange::new(0, data.len() as u64)]);
    SyntheticInstance { dataset, data }
}

// =============================================================================
// Opening
// =============================================================================

pub fn sources(instances: &[SyntheticInstance]) -> Vec<InstanceSource> {
    instances.iter().map(SyntheticInstance::source).collect()
}

/// Open with the built-in decoder and default configuration.
pub fn open(instances: &[SyntheticInstance]) -> Slide {
    open_with(instances, Arc::new(ImageFrameDecoder::new()), SlideConfig::default())
}

pub fn open_with(
    instances: &[SyntheticInstance],
    decoder: Arc<dyn FrameDecoder>,
    config: SlideConfig,
) -> Slide {
    init_tracing();
    Slide::open_datasets(sources(instances), decoder, config).unwrap()
}

// =============================================================================
// Mock Range Reader with Request Tracking
// =============================================================================

/// A mock range reader that tracks all read requests.
///
/// This is useful for verifying that pixel data is only read on demand.
pub struct TrackingMockReader {
    data: Bytes,
    identifier: String,
    request_count: Arc<AtomicUsize>,
}

impl TrackingMockReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            request_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }
}

impl Clone for TrackingMockReader {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            identifier: self.identifier.clone(),
            request_count: Arc::clone(&self.request_count),
        }
    }
}

#[async_trait]
impl RangeReader for TrackingMockReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// DICOM Files
// =============================================================================

/// Unique path in the temp directory for this test process.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("wsi-mosaic-{}-{name}", std::process::id()))
}

fn sequence_item(elements: Vec<InMemElement>) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(elements)
}

/// A TILED_FULL native level as a DICOM object, pixel spacing in the shared
/// functional groups.
pub fn dicom_level(spec: &LevelSpec, uid: &str) -> InMemDicomObject {
    let level = full_level(spec);
    let frames = level.dataset.frame_count();
    let photometric = if spec.samples_per_pixel == 1 {
        "MONOCHROME2"
    } else {
        "RGB"
    };
    let pixel_measures = sequence_item(vec![DataElement::new(
        tags::PIXEL_SPACING,
        VR::DS,
        PrimitiveValue::from(format!("{}\\{}", spec.spacing, spec.spacing)),
    )]);
    let shared = sequence_item(vec![DataElement::new(
        tags::PIXEL_MEASURES_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(vec![pixel_measures]),
    )]);

    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::IMAGE_TYPE,
            VR::CS,
            PrimitiveValue::from("ORIGINAL\\PRIMARY\\VOLUME\\NONE"),
        ),
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(WSI_SOP_CLASS_UID)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(uid)),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(STUDY_UID)),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(SERIES_UID)),
        DataElement::new(
            tags::FRAME_OF_REFERENCE_UID,
            VR::UI,
            PrimitiveValue::from(FRAME_OF_REFERENCE_UID),
        ),
        DataElement::new(
            tags::DIMENSION_ORGANIZATION_TYPE,
            VR::CS,
            PrimitiveValue::from("TILED_FULL"),
        ),
        DataElement::new(
            tags::SAMPLES_PER_PIXEL,
            VR::US,
            PrimitiveValue::from(spec.samples_per_pixel),
        ),
        DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from(photometric),
        ),
        DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(frames.to_string()),
        ),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(spec.tile as u16)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(spec.tile as u16)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8u16)),
        DataElement::new(
            tags::TOTAL_PIXEL_MATRIX_COLUMNS,
            VR::UL,
            PrimitiveValue::from(spec.width),
        ),
        DataElement::new(tags::TOTAL_PIXEL_MATRIX_ROWS, VR::UL, PrimitiveValue::from(spec.height)),
        DataElement::new(
            tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(vec![shared]),
        ),
        DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(level.data)),
    ])
}

/// Add an optical path sequence with one described path.
pub fn with_optical_path(
    mut object: InMemDicomObject,
    identifier: &str,
    description: &str,
    icc_profile: &[u8],
) -> InMemDicomObject {
    let item = sequence_item(vec![
        DataElement::new(tags::ICC_PROFILE, VR::OB, PrimitiveValue::from(icc_profile.to_vec())),
        DataElement::new(
            tags::OPTICAL_PATH_IDENTIFIER,
            VR::SH,
            PrimitiveValue::from(identifier),
        ),
        DataElement::new(
            tags::OPTICAL_PATH_DESCRIPTION,
            VR::ST,
            PrimitiveValue::from(description),
        ),
    ]);
    object.put(DataElement::new(
        tags::OPTICAL_PATH_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(vec![item]),
    ));
    object
}

/// Write a DICOM object as an explicit VR little endian Part 10 file.
pub fn write_dicom_file(object: InMemDicomObject, uid: &str, path: &Path) {
    let file = object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(WSI_SOP_CLASS_UID)
                .media_storage_sop_instance_uid(uid),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

// =============================================================================
// Mock Dataset Parser
// =============================================================================

/// Parser that looks datasets up by the reader's identifier suffix.
#[derive(Default)]
pub struct MockParser {
    datasets: HashMap<String, InMemoryDataset>,
}

impl MockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: impl Into<String>, dataset: InMemoryDataset) -> Self {
        self.datasets.insert(name.into(), dataset);
        self
    }
}

#[async_trait]
impl DatasetParser for MockParser {
    async fn parse(&self, reader: &dyn RangeReader) -> Result<Box<dyn Dataset>, DatasetError> {
        self.datasets
            .iter()
            .find(|(name, _)| reader.identifier().ends_with(name.as_str()))
            .map(|(_, dataset)| Box::new(dataset.clone()) as Box<dyn Dataset>)
            .ok_or_else(|| DatasetError::Parse {
                identifier: reader.identifier().to_string(),
                message: "not a DICOM file".to_string(),
            })
    }
}

// =============================================================================
// Counting Decoder
// =============================================================================

/// Decoder that counts calls, and can be slowed down or made to fail.
#[derive(Default)]
pub struct CountingDecoder {
    inner: ImageFrameDecoder,
    calls: AtomicUsize,
    delay: Option<Duration>,
    failures: AtomicUsize,
}

impl CountingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every decode.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `count` decodes.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FrameDecoder for CountingDecoder {
    fn decode(&self, data: &[u8], params: &DecodeParams) -> Result<Vec<u8>, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DecodeError::Malformed {
                message: "injected failure".to_string(),
            });
        }
        self.inner.decode(data, params)
    }
}
