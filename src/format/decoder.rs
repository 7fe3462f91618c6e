//! Frame decoding.
//!
//! Decoding compressed frames is delegated to a [`FrameDecoder`]. The crate
//! ships [`ImageFrameDecoder`], which handles native (uncompressed) pixel
//! data and baseline/extended JPEG through the `image` crate. Any other
//! transfer syntax is reported as unsupported so callers can plug in their
//! own codec.
//!
//! # Output Layout
//!
//! Decoders return interleaved samples, row-major, with multi-byte samples
//! in little-endian order: `rows * columns * samples_per_pixel *
//! bytes_per_sample` bytes per frame.

use std::io::Cursor;

use image::ImageReader;

use crate::error::DecodeError;

// =============================================================================
// Transfer Syntax
// =============================================================================

/// Transfer syntaxes the tile index distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransferSyntax {
    ImplicitVrLittleEndian,
    ExplicitVrLittleEndian,
    ExplicitVrBigEndian,
    JpegBaseline,
    JpegExtended,
    Jpeg2000Lossless,
    Jpeg2000,
    /// Any other UID
    Other(String),
}

impl TransferSyntax {
    /// Create a TransferSyntax from its UID.
    pub fn from_uid(uid: &str) -> Self {
        match uid.trim().trim_end_matches('\0') {
            "1.2.840.10008.1.2" => TransferSyntax::ImplicitVrLittleEndian,
            "1.2.840.10008.1.2.1" => TransferSyntax::ExplicitVrLittleEndian,
            "1.2.840.10008.1.2.2" => TransferSyntax::ExplicitVrBigEndian,
            "1.2.840.10008.1.2.4.50" => TransferSyntax::JpegBaseline,
            "1.2.840.10008.1.2.4.51" => TransferSyntax::JpegExtended,
            "1.2.840.10008.1.2.4.90" => TransferSyntax::Jpeg2000Lossless,
            "1.2.840.10008.1.2.4.91" => TransferSyntax::Jpeg2000,
            other => TransferSyntax::Other(other.to_string()),
        }
    }

    /// Get the UID.
    pub fn uid(&self) -> &str {
        match self {
            TransferSyntax::ImplicitVrLittleEndian => "1.2.840.10008.1.2",
            TransferSyntax::ExplicitVrLittleEndian => "1.2.840.10008.1.2.1",
            TransferSyntax::ExplicitVrBigEndian => "1.2.840.10008.1.2.2",
            TransferSyntax::JpegBaseline => "1.2.840.10008.1.2.4.50",
            TransferSyntax::JpegExtended => "1.2.840.10008.1.2.4.51",
            TransferSyntax::Jpeg2000Lossless => "1.2.840.10008.1.2.4.90",
            TransferSyntax::Jpeg2000 => "1.2.840.10008.1.2.4.91",
            TransferSyntax::Other(uid) => uid,
        }
    }

    /// Whether frames are stored uncompressed.
    pub const fn is_native(&self) -> bool {
        matches!(
            self,
            TransferSyntax::ImplicitVrLittleEndian
                | TransferSyntax::ExplicitVrLittleEndian
                | TransferSyntax::ExplicitVrBigEndian
        )
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        match self {
            TransferSyntax::ImplicitVrLittleEndian => "Implicit VR Little Endian",
            TransferSyntax::ExplicitVrLittleEndian => "Explicit VR Little Endian",
            TransferSyntax::ExplicitVrBigEndian => "Explicit VR Big Endian",
            TransferSyntax::JpegBaseline => "JPEG Baseline",
            TransferSyntax::JpegExtended => "JPEG Extended",
            TransferSyntax::Jpeg2000Lossless => "JPEG 2000 Lossless",
            TransferSyntax::Jpeg2000 => "JPEG 2000",
            TransferSyntax::Other(uid) => uid,
        }
    }
}

// =============================================================================
// Decoder Interface
// =============================================================================

/// Geometry and encoding of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeParams {
    pub transfer_syntax: TransferSyntax,
    /// Frame height in pixels
    pub rows: u32,
    /// Frame width in pixels
    pub columns: u32,
    pub bits_allocated: u16,
    pub samples_per_pixel: u16,
    pub photometric_interpretation: String,
}

impl DecodeParams {
    /// Bytes per sample in decoded output.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_allocated as usize).div_ceil(8)
    }

    /// Size of one decoded frame in bytes.
    pub fn decoded_len(&self) -> usize {
        self.rows as usize
            * self.columns as usize
            * self.samples_per_pixel as usize
            * self.bytes_per_sample()
    }
}

/// Decodes one encoded frame into raw samples.
///
/// Decoding runs on the blocking thread pool; implementations may be CPU
/// heavy but must not block on I/O.
pub trait FrameDecoder: Send + Sync {
    /// Decode `data` into interleaved little-endian samples.
    ///
    /// # Errors
    /// Returns `DecodeError::UnsupportedTransferSyntax` for codecs the
    /// implementation does not handle.
    fn decode(&self, data: &[u8], params: &DecodeParams) -> Result<Vec<u8>, DecodeError>;
}

// =============================================================================
// ImageFrameDecoder
// =============================================================================

/// Built-in decoder for native and JPEG frames.
#[derive(Debug, Clone, Default)]
pub struct ImageFrameDecoder;

impl ImageFrameDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_native(&self, data: &[u8], params: &DecodeParams) -> Result<Vec<u8>, DecodeError> {
        let expected = params.decoded_len();
        if data.len() < expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        // Frames may carry a trailing pad byte
        let mut out = data[..expected].to_vec();

        if params.transfer_syntax == TransferSyntax::ExplicitVrBigEndian
            && params.bytes_per_sample() == 2
        {
            for pair in out.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }

        Ok(out)
    }

    fn decode_jpeg(&self, data: &[u8], params: &DecodeParams) -> Result<Vec<u8>, DecodeError> {
        if params.bytes_per_sample() != 1 {
            return Err(DecodeError::Malformed {
                message: format!(
                    "{} with {} bits allocated is not supported",
                    params.transfer_syntax.name(),
                    params.bits_allocated
                ),
            });
        }

        let reader = ImageReader::with_format(Cursor::new(data), image::ImageFormat::Jpeg);
        let img = reader.decode().map_err(|e| DecodeError::Malformed {
            message: e.to_string(),
        })?;

        if (img.width(), img.height()) != (params.columns, params.rows) {
            return Err(DecodeError::Malformed {
                message: format!(
                    "decoded {}x{} frame, expected {}x{}",
                    img.width(),
                    img.height(),
                    params.columns,
                    params.rows
                ),
            });
        }

        // The JPEG decoder already converts YBR to RGB
        match params.samples_per_pixel {
            1 => Ok(img.into_luma8().into_raw()),
            3 => Ok(img.into_rgb8().into_raw()),
            other => Err(DecodeError::Malformed {
                message: format!("{other} samples per pixel is not supported for JPEG"),
            }),
        }
    }
}

impl FrameDecoder for ImageFrameDecoder {
    fn decode(&self, data: &[u8], params: &DecodeParams) -> Result<Vec<u8>, DecodeError> {
        match &params.transfer_syntax {
            TransferSyntax::ImplicitVrLittleEndian
            | TransferSyntax::ExplicitVrLittleEndian
            | TransferSyntax::ExplicitVrBigEndian => self.decode_native(data, params),
            TransferSyntax::JpegBaseline | TransferSyntax::JpegExtended => {
                self.decode_jpeg(data, params)
            }
            other @ (TransferSyntax::Jpeg2000Lossless
            | TransferSyntax::Jpeg2000
            | TransferSyntax::Other(_)) => {
                Err(DecodeError::UnsupportedTransferSyntax(other.uid().to_string()))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
