//! Built-in parser for DICOM Part 10 files.
//!
//! The attribute header is decoded with `dicom-object`; pixel data is never
//! loaded. The parser reads a growing prefix of the stream until it holds the
//! whole header, then records where every frame's bytes lie:
//!
//! ```text
//!   preamble │ DICM │ meta group │ data set ... │ (7FE0,0010) header │ frames
//!   ◄──────── decoded by dicom-object ─────────►  ◄── walked here ──►
//! ```
//!
//! Native pixel data is cut into equal frames. Encapsulated pixel data is
//! located through the extended offset table when present, else by walking
//! the fragment items; each frame must then be a single fragment.
//!
//! Only little endian transfer syntaxes are supported.

use std::borrow::Cow;

use async_trait::async_trait;
use bytes::Bytes;
use dicom_core::value::{PrimitiveValue, Value as DicomValue};
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use tracing::debug;

use super::attributes::{Attribute, Value};
use super::dataset::{ByteRange, Dataset, DatasetParser, FramePosition, InMemoryDataset};
use super::optical::{LutDescriptor, OpticalPathInfo, PaletteLut};
use crate::error::DatasetError;
use crate::io::RangeReader;

/// Bytes read on the first attempt; doubled until the header fits.
const INITIAL_READ: usize = 1 << 20;

const MAGIC: &[u8; 4] = b"DICM";
const PREAMBLE_LEN: usize = 128;
/// (7FE0,0010) in little endian
const PIXEL_DATA_TAG: [u8; 4] = [0xE0, 0x7F, 0x10, 0x00];
const ITEM: Tag = Tag(0xFFFE, 0xE000);
const SEQUENCE_DELIMITER: Tag = Tag(0xFFFE, 0xE0DD);
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

/// Functional group sequences searched for attributes shared by all frames.
const SHARED_GROUPS: [Tag; 3] = [
    tags::PIXEL_MEASURES_SEQUENCE,
    tags::PLANE_POSITION_SLIDE_SEQUENCE,
    tags::OPTICAL_PATH_IDENTIFICATION_SEQUENCE,
];

// =============================================================================
// Parser
// =============================================================================

/// [`DatasetParser`] for DICOM Part 10 files, backed by `dicom-object`.
#[derive(Debug, Clone)]
pub struct DicomObjectParser {
    initial_read: usize,
}

impl Default for DicomObjectParser {
    fn default() -> Self {
        Self {
            initial_read: INITIAL_READ,
        }
    }
}

impl DicomObjectParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the first header read.
    pub fn with_initial_read(mut self, bytes: usize) -> Self {
        self.initial_read = bytes.max(PREAMBLE_LEN + MAGIC.len());
        self
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<Header, DatasetError> {
        let size = reader.size();
        let mut want = self.initial_read as u64;
        let mut resume = 0;

        loop {
            let len = usize::try_from(want.min(size)).unwrap_or(usize::MAX);
            let bytes = reader.read_exact_at(0, len).await?;
            let start = magic_offset(&bytes)
                .ok_or_else(|| parse_error(reader, "missing DICM magic code"))?;

            match scan_header(&bytes, start, &mut resume) {
                Some(header) => return Ok(header),
                None if (len as u64) < size => want = want.saturating_mul(2),
                None => return Err(parse_error(reader, "no pixel data element")),
            }
        }
    }
}

#[async_trait]
impl DatasetParser for DicomObjectParser {
    async fn parse(&self, reader: &dyn RangeReader) -> Result<Box<dyn Dataset>, DatasetError> {
        let header = self.read_header(reader).await?;
        let transfer_syntax = header.object.meta().transfer_syntax().to_string();

        let frames = frame_table(reader, &header).await?;
        let dataset = build_dataset(reader.identifier(), &transfer_syntax, &header.object)
            .map_err(|message| parse_error(reader, message))?
            .with_frames(frames);

        debug!(
            identifier = reader.identifier(),
            transfer_syntax = %transfer_syntax,
            frames = dataset.frame_count(),
            header_bytes = header.pixel_data.offset,
            "Parsed DICOM header"
        );
        Ok(Box::new(dataset))
    }
}

fn parse_error(reader: &dyn RangeReader, message: impl Into<String>) -> DatasetError {
    DatasetError::Parse {
        identifier: reader.identifier().to_string(),
        message: message.into(),
    }
}

// =============================================================================
// Header Scan
// =============================================================================

/// Position of the pixel data element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelDataHeader {
    /// Offset of the element tag
    offset: u64,
    /// Offset of the first value byte
    value_start: u64,
    /// Value length; `None` for encapsulated pixel data
    length: Option<u64>,
}

struct Header {
    object: dicom_object::DefaultDicomObject,
    pixel_data: PixelDataHeader,
}

/// Start of the DICM magic code, after the preamble when one is present.
fn magic_offset(bytes: &[u8]) -> Option<usize> {
    if bytes.get(PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()) == Some(MAGIC.as_slice()) {
        Some(PREAMBLE_LEN)
    } else if bytes.starts_with(MAGIC) {
        Some(0)
    } else {
        None
    }
}

/// Find the top-level pixel data element in a stream prefix.
///
/// Every occurrence of the pixel data tag is a candidate; the first one
/// before which the header decodes cleanly wins. Candidates already
/// rejected are skipped on the next call through `resume`. Returns `None`
/// when the prefix is too short.
fn scan_header(bytes: &[u8], start: usize, resume: &mut usize) -> Option<Header> {
    let mut pos = (*resume).max(start + MAGIC.len());

    while let Some(found) = find(&bytes[pos..], &PIXEL_DATA_TAG) {
        let candidate = pos + found;
        if let Ok(object) = dicom_object::from_reader(&bytes[start..candidate]) {
            let explicit = object.meta().transfer_syntax() != IMPLICIT_VR_LITTLE_ENDIAN;
            let header_len = if explicit { 12 } else { 8 };
            let Some(element) = bytes.get(candidate..candidate + header_len) else {
                *resume = candidate;
                return None;
            };
            if let Some(pixel_data) = pixel_data_header(element, candidate as u64, explicit) {
                return Some(Header { object, pixel_data });
            }
        }
        pos = candidate + 1;
    }

    // The tag may straddle the end of the prefix
    *resume = bytes.len().saturating_sub(PIXEL_DATA_TAG.len() - 1).max(pos);
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decode the pixel data element header at `offset`.
fn pixel_data_header(element: &[u8], offset: u64, explicit: bool) -> Option<PixelDataHeader> {
    let (length, header_len) = if explicit {
        let vr = &element[4..6];
        if (vr != b"OB" && vr != b"OW") || element[6..8] != [0, 0] {
            return None;
        }
        (le_u32(&element[8..12]), 12)
    } else {
        (le_u32(&element[4..8]), 8)
    };

    Some(PixelDataHeader {
        offset,
        value_start: offset + header_len,
        length: (length != UNDEFINED_LENGTH).then_some(length as u64),
    })
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// =============================================================================
// Frame Table
// =============================================================================

async fn frame_table(
    reader: &dyn RangeReader,
    header: &Header,
) -> Result<Vec<ByteRange>, DatasetError> {
    let object: &InMemDicomObject = &header.object;
    let frame_count = find_element(object, tags::NUMBER_OF_FRAMES)
        .and_then(|e| e.to_int::<u64>().ok())
        .unwrap_or(1);
    let pixel_data = header.pixel_data;

    match pixel_data.length {
        Some(length) => {
            let frame_size = native_frame_size(object)
                .ok_or_else(|| parse_error(reader, "cannot size native frames"))?;
            if frame_count.saturating_mul(frame_size) > length {
                return Err(parse_error(
                    reader,
                    format!("{frame_count} frames of {frame_size} bytes exceed {length} bytes"),
                ));
            }
            Ok((0..frame_count)
                .map(|i| ByteRange::new(pixel_data.value_start + i * frame_size, frame_size))
                .collect())
        }
        None => encapsulated_frames(
            reader,
            pixel_data.value_start,
            frame_count,
            extended_offset_table(object),
        )
        .await
        .map_err(|message| parse_error(reader, message)),
    }
}

fn native_frame_size(object: &InMemDicomObject) -> Option<u64> {
    let value = |tag| {
        find_element(object, tag)
            .and_then(|e| e.to_int::<u64>().ok())
            .filter(|v| *v > 0)
    };
    let bits = value(tags::ROWS)?
        * value(tags::COLUMNS)?
        * value(tags::SAMPLES_PER_PIXEL)?
        * value(tags::BITS_ALLOCATED)?;
    Some(bits.div_ceil(8))
}

/// Offsets and lengths of the extended offset table.
fn extended_offset_table(object: &InMemDicomObject) -> Option<(Vec<u64>, Vec<u64>)> {
    let offsets = object.element(tags::EXTENDED_OFFSET_TABLE).ok()?;
    let lengths = object.element(tags::EXTENDED_OFFSET_TABLE_LENGTHS).ok()?;
    Some((u64_values(offsets)?, u64_values(lengths)?))
}

async fn item_header(reader: &dyn RangeReader, offset: u64) -> Result<(Tag, u32), String> {
    let bytes = reader
        .read_exact_at(offset, 8)
        .await
        .map_err(|e| e.to_string())?;
    let tag = Tag(
        u16::from_le_bytes([bytes[0], bytes[1]]),
        u16::from_le_bytes([bytes[2], bytes[3]]),
    );
    Ok((tag, le_u32(&bytes[4..8])))
}

/// Locate the frames of encapsulated pixel data starting at `value_start`.
async fn encapsulated_frames(
    reader: &dyn RangeReader,
    value_start: u64,
    frame_count: u64,
    extended_offsets: Option<(Vec<u64>, Vec<u64>)>,
) -> Result<Vec<ByteRange>, String> {
    let (tag, table_len) = item_header(reader, value_start).await?;
    if tag != ITEM {
        return Err(format!("expected basic offset table item, found {tag}"));
    }
    let first_fragment = value_start + 8 + table_len as u64;

    if let Some((offsets, lengths)) = extended_offsets {
        if offsets.len() as u64 != frame_count || lengths.len() != offsets.len() {
            return Err(format!(
                "extended offset table lists {} frames, expected {frame_count}",
                offsets.len()
            ));
        }
        return Ok(offsets
            .iter()
            .zip(&lengths)
            .map(|(offset, length)| ByteRange::new(first_fragment + offset + 8, *length))
            .collect());
    }

    let mut fragments = Vec::new();
    let mut pos = first_fragment;
    loop {
        let (tag, length) = item_header(reader, pos).await?;
        match tag {
            ITEM => {
                fragments.push(ByteRange::new(pos + 8, length as u64));
                pos += 8 + length as u64;
            }
            SEQUENCE_DELIMITER => break,
            other => return Err(format!("unexpected {other} in pixel data at {pos}")),
        }
    }

    if fragments.len() as u64 != frame_count {
        return Err(format!(
            "{} fragments for {frame_count} frames; multi-fragment frames need an \
             extended offset table",
            fragments.len()
        ));
    }
    Ok(fragments)
}

// =============================================================================
// Attributes
// =============================================================================

fn build_dataset(
    identifier: &str,
    transfer_syntax: &str,
    object: &InMemDicomObject,
) -> Result<InMemoryDataset, String> {
    let mut dataset = InMemoryDataset::new(identifier, transfer_syntax);

    // Identifiers come from the optical path sequence, in sequence order
    for attribute in Attribute::ALL {
        if attribute == Attribute::OpticalPathIdentifier {
            continue;
        }
        if let Some(value) = find_element(object, attribute.tag()).and_then(convert) {
            dataset.set(attribute, value);
        }
    }

    for info in optical_path_info(object)? {
        dataset = dataset.with_optical_path_info(info);
    }

    let full = find_element(object, tags::DIMENSION_ORGANIZATION_TYPE)
        .and_then(|e| e.to_str().ok())
        .is_some_and(|v| v.trim() == "TILED_FULL");
    if !full {
        if let Some(positions) = frame_positions(object)? {
            dataset = dataset.with_positions(positions);
        }
    }

    Ok(dataset)
}

/// Find an element at top level, else in the shared functional groups.
fn find_element(object: &InMemDicomObject, tag: Tag) -> Option<&InMemElement> {
    if let Ok(element) = object.element(tag) {
        return Some(element);
    }
    let shared = first_item(object, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE)?;
    SHARED_GROUPS
        .iter()
        .find_map(|group| first_item(shared, *group)?.element(tag).ok())
}

fn first_item(object: &InMemDicomObject, tag: Tag) -> Option<&InMemDicomObject> {
    object.element(tag).ok()?.items()?.first()
}

fn string(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Decode an element into a [`Value`] according to its VR.
fn convert(element: &InMemElement) -> Option<Value> {
    match element.vr() {
        VR::SQ | VR::OB | VR::OW | VR::UN => None,
        VR::US | VR::UL | VR::SS | VR::SL | VR::UV | VR::SV | VR::IS => {
            match element.to_multi_int::<i64>().ok()?.as_slice() {
                [] => None,
                [single] => Some(Value::Int(*single)),
                many => Some(Value::Floats(many.iter().map(|v| *v as f64).collect())),
            }
        }
        VR::FD | VR::FL | VR::DS => match element.to_multi_float64().ok()?.as_slice() {
            [] => None,
            [single] => Some(Value::Float(*single)),
            many => Some(Value::Floats(many.to_vec())),
        },
        _ => {
            let strings: Cow<'_, [String]> = element.to_multi_str().ok()?;
            match strings.as_ref() {
                [] => None,
                [single] => Some(Value::Str(single.clone())),
                many => Some(Value::Strs(many.to_vec())),
            }
        }
    }
}

/// 16-bit words of an OW element.
fn words(element: &InMemElement) -> Option<Vec<u16>> {
    match element.value() {
        DicomValue::Primitive(PrimitiveValue::U16(values)) => Some(values.to_vec()),
        DicomValue::Primitive(PrimitiveValue::U8(bytes)) => Some(
            bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        _ => element.to_multi_int::<u16>().ok(),
    }
}

/// 64-bit values of an OV element.
fn u64_values(element: &InMemElement) -> Option<Vec<u64>> {
    match element.value() {
        DicomValue::Primitive(PrimitiveValue::U64(values)) => Some(values.to_vec()),
        DicomValue::Primitive(PrimitiveValue::U8(bytes)) => Some(
            bytes
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        _ => element.to_multi_int::<u64>().ok(),
    }
}

fn optical_path_info(object: &InMemDicomObject) -> Result<Vec<OpticalPathInfo>, String> {
    let Some(items) = object
        .element(tags::OPTICAL_PATH_SEQUENCE)
        .ok()
        .and_then(|e| e.items())
    else {
        return Ok(Vec::new());
    };

    let mut infos = Vec::with_capacity(items.len());
    for item in items {
        let Some(identifier) = string(item, tags::OPTICAL_PATH_IDENTIFIER) else {
            continue;
        };
        let mut info = OpticalPathInfo::new(identifier);
        info.description = string(item, tags::OPTICAL_PATH_DESCRIPTION);
        info.icc_profile = item
            .element(tags::ICC_PROFILE)
            .ok()
            .and_then(|e| e.to_bytes().ok())
            .filter(|b| !b.is_empty())
            .map(|b| Bytes::copy_from_slice(&b));
        info.lut = palette(item)
            .map_err(|e| format!("optical path {}: {e}", info.identifier))?;
        infos.push(info);
    }
    Ok(infos)
}

/// Palette color lookup table of an optical path item, segmented or not.
fn palette(item: &InMemDicomObject) -> Result<Option<PaletteLut>, String> {
    let Some(table) = first_item(item, tags::PALETTE_COLOR_LOOKUP_TABLE_SEQUENCE) else {
        return Ok(None);
    };
    let descriptor = table
        .element(tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR)
        .ok()
        .and_then(|e| e.to_multi_int::<i64>().ok())
        .and_then(|v| LutDescriptor::from_values(&v))
        .ok_or("missing or invalid palette descriptor")?;
    let channel = |tag| table.element(tag).ok().and_then(words);

    let segmented = (
        channel(tags::SEGMENTED_RED_PALETTE_COLOR_LOOKUP_TABLE_DATA),
        channel(tags::SEGMENTED_GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA),
        channel(tags::SEGMENTED_BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA),
    );
    let lut = match segmented {
        (Some(red), Some(green), Some(blue)) => {
            PaletteLut::from_segmented(descriptor, &red, &green, &blue)
        }
        _ => match (
            channel(tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA),
            channel(tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA),
            channel(tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA),
        ) {
            (Some(red), Some(green), Some(blue)) => {
                PaletteLut::new(descriptor.first_mapped, descriptor.bits, red, green, blue)
            }
            _ => return Err("palette table data missing".to_string()),
        },
    };
    lut.map(Some).map_err(|e| e.to_string())
}

/// Per-frame positions from the per-frame functional groups.
fn frame_positions(object: &InMemDicomObject) -> Result<Option<Vec<FramePosition>>, String> {
    let Some(items) = object
        .element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)
        .ok()
        .and_then(|e| e.items())
    else {
        return Ok(None);
    };

    items
        .iter()
        .enumerate()
        .map(|(frame, item)| {
            let plane = first_item(item, tags::PLANE_POSITION_SLIDE_SEQUENCE)
                .ok_or_else(|| format!("frame {frame} has no plane position"))?;
            let coordinate = |tag| {
                plane
                    .element(tag)
                    .ok()
                    .and_then(|e| e.to_int::<u32>().ok())
                    .ok_or_else(|| format!("frame {frame} has no valid pixel matrix position"))
            };

            let mut position = FramePosition::new(
                coordinate(tags::COLUMN_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX)?,
                coordinate(tags::ROW_POSITION_IN_TOTAL_IMAGE_PIXEL_MATRIX)?,
            );
            if let Some(z) = plane
                .element(tags::Z_OFFSET_IN_SLIDE_COORDINATE_SYSTEM)
                .ok()
                .and_then(|e| e.to_float64().ok())
            {
                position = position.with_z_offset(z);
            }
            if let Some(path) = first_item(item, tags::OPTICAL_PATH_IDENTIFICATION_SEQUENCE)
                .and_then(|p| string(p, tags::OPTICAL_PATH_IDENTIFIER))
            {
                position = position.with_optical_path(path);
            }
            Ok(position)
        })
        .collect::<Result<Vec<_>, String>>()
        .map(Some)
}

// =============================================================================
// Tests
// =============================================================================
