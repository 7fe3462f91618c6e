//! Optical path descriptions.
//!
//! Each optical path of a slide may carry a free-text description, an ICC
//! profile for color management and, for fluorescence channels, a palette
//! color lookup table mapping monochrome samples to display colors.
//!
//! Palette tables are usually stored segmented (PS3.3 C.7.9.2): a stream of
//! `(opcode, length, ...)` words where opcode 0 lists `length` values
//! verbatim and opcode 1 ramps linearly from the previous value to the next
//! word over `length` entries.

use bytes::Bytes;

use super::instance::OpticalPath;
use crate::error::LutError;

// =============================================================================
// Palette Lookup Table
// =============================================================================

const SEGMENT_DISCRETE: u16 = 0;
const SEGMENT_LINEAR: u16 = 1;

/// First two values of a palette color lookup table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutDescriptor {
    /// Number of entries
    pub entries: usize,
    /// First input value mapped by the table
    pub first_mapped: u16,
    /// Bits per entry (8 or 16)
    pub bits: u16,
}

impl LutDescriptor {
    /// Build from the three descriptor values. An entry count of 0 means
    /// 65536 entries.
    pub fn from_values(values: &[i64]) -> Option<Self> {
        match values {
            [entries, first, bits] => Some(Self {
                entries: match *entries {
                    0 => 65536,
                    n => usize::try_from(n).ok()?,
                },
                first_mapped: u16::try_from(*first).ok()?,
                bits: u16::try_from(*bits).ok()?,
            }),
            _ => None,
        }
    }
}

/// Palette color lookup table of one optical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteLut {
    first_mapped: u16,
    bits: u16,
    red: Vec<u16>,
    green: Vec<u16>,
    blue: Vec<u16>,
}

impl PaletteLut {
    /// Build from expanded tables.
    ///
    /// # Errors
    ///
    /// Returns `LutError` if the tables differ in length or the entry width
    /// is neither 8 nor 16 bits.
    pub fn new(
        first_mapped: u16,
        bits: u16,
        red: Vec<u16>,
        green: Vec<u16>,
        blue: Vec<u16>,
    ) -> Result<Self, LutError> {
        if bits != 8 && bits != 16 {
            return Err(LutError::UnsupportedBits(bits));
        }
        if red.len() != green.len() || red.len() != blue.len() {
            return Err(LutError::ChannelLengthMismatch {
                red: red.len(),
                green: green.len(),
                blue: blue.len(),
            });
        }
        Ok(Self {
            first_mapped,
            bits,
            red,
            green,
            blue,
        })
    }

    /// Build from segmented red, green and blue table data.
    ///
    /// # Errors
    ///
    /// Returns `LutError` for unsupported or truncated segments, or if an
    /// expanded table does not hold the descriptor's entry count.
    pub fn from_segmented(
        descriptor: LutDescriptor,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> Result<Self, LutError> {
        let red = expand_segments(red)?;
        let green = expand_segments(green)?;
        let blue = expand_segments(blue)?;
        for table in [&red, &green, &blue] {
            if table.len() != descriptor.entries {
                return Err(LutError::EntryCountMismatch {
                    declared: descriptor.entries,
                    found: table.len(),
                });
            }
        }
        Self::new(descriptor.first_mapped, descriptor.bits, red, green, blue)
    }

    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }

    pub fn first_mapped(&self) -> u16 {
        self.first_mapped
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }

    pub fn red(&self) -> &[u16] {
        &self.red
    }

    pub fn green(&self) -> &[u16] {
        &self.green
    }

    pub fn blue(&self) -> &[u16] {
        &self.blue
    }

    /// RGB entry for an input value. Values outside the table map to its
    /// first or last entry.
    pub fn entry(&self, value: u16) -> Option<[u16; 3]> {
        let last = self.len().checked_sub(1)?;
        let idx = (value.saturating_sub(self.first_mapped) as usize).min(last);
        Some([self.red[idx], self.green[idx], self.blue[idx]])
    }

    /// Map 8-bit monochrome samples to interleaved 8-bit RGB.
    ///
    /// An empty table yields an empty result.
    pub fn apply(&self, samples: &[u8]) -> Vec<u8> {
        let shift = self.bits - 8;
        let mut out = Vec::with_capacity(samples.len() * 3);
        for &sample in samples {
            let Some(rgb) = self.entry(sample as u16) else {
                return Vec::new();
            };
            out.extend(rgb.map(|v| (v >> shift) as u8));
        }
        out
    }
}

/// Expand one segmented table.
fn expand_segments(data: &[u16]) -> Result<Vec<u16>, LutError> {
    let mut table: Vec<u16> = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (opcode, length) = match data.get(pos..pos + 2) {
            Some(&[opcode, length]) => (opcode, length as usize),
            _ => return Err(LutError::TruncatedSegment { position: pos }),
        };
        match opcode {
            SEGMENT_DISCRETE => {
                let values = data
                    .get(pos + 2..pos + 2 + length)
                    .ok_or(LutError::TruncatedSegment { position: pos })?;
                table.extend_from_slice(values);
                pos += 2 + length;
            }
            SEGMENT_LINEAR => {
                let end = *data
                    .get(pos + 2)
                    .ok_or(LutError::TruncatedSegment { position: pos })?;
                // A ramp opening the table starts at its own end value
                let start = table.last().copied().unwrap_or(end) as f64;
                let step = (end as f64 - start) / length.max(1) as f64;
                table.extend((1..=length).map(|i| (start + step * i as f64).round() as u16));
                pos += 3;
            }
            other => return Err(LutError::UnsupportedSegment(other)),
        }
    }

    Ok(table)
}

// =============================================================================
// Optical Path Description
// =============================================================================

/// Description of one optical path, from the optical path sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct OpticalPathInfo {
    pub identifier: OpticalPath,
    pub description: Option<String>,
    /// Embedded ICC profile
    pub icc_profile: Option<Bytes>,
    pub lut: Option<PaletteLut>,
}

impl OpticalPathInfo {
    pub fn new(identifier: impl Into<OpticalPath>) -> Self {
        Self {
            identifier: identifier.into(),
            description: None,
            icc_profile: None,
            lut: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_icc_profile(mut self, profile: impl Into<Bytes>) -> Self {
        self.icc_profile = Some(profile.into());
        self
    }

    pub fn with_lut(mut self, lut: PaletteLut) -> Self {
        self.lut = Some(lut);
        self
    }

    /// Take the fields this description lacks from another description of
    /// the same path.
    pub fn fill_from(&mut self, other: &OpticalPathInfo) {
        if self.description.is_none() {
            self.description.clone_from(&other.description);
        }
        if self.icc_profile.is_none() {
            self.icc_profile.clone_from(&other.icc_profile);
        }
        if self.lut.is_none() {
            self.lut.clone_from(&other.lut);
        }
    }
}

/// Merge path descriptions from several instances, first seen first.
pub fn merge_optical_path_info<'a>(
    infos: impl IntoIterator<Item = &'a OpticalPathInfo>,
) -> Vec<OpticalPathInfo> {
    let mut merged: Vec<OpticalPathInfo> = Vec::new();
    for info in infos {
        match merged.iter_mut().find(|m| m.identifier == info.identifier) {
            Some(existing) => existing.fill_from(info),
            None => merged.push(info.clone()),
        }
    }
    merged
}

// =============================================================================
// Tests
// =============================================================================
