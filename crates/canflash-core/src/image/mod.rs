//! Firmware image parsing
//!
//! Turns a build artifact into an ordered list of addressed [`Segment`]s plus
//! the checksums the bootloader verifies against. Two container formats are
//! recognised by their leading marker:
//!
//! - ELF (`\x7FELF`): allocated `PROGBITS` sections placed at their load address
//! - Intel HEX (`:` start code): data records, as produced by the STM32 builds
//!
//! Parsing is pure: no I/O, no bus access, identical input gives an identical
//! image.

mod elf_file;
mod intel_hex;

use std::fmt;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::Serialize;
use thiserror::Error;

use crate::error::FlashError;

/// CRC used for segment and whole-image checksums (zlib/Ethernet polynomial).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const ELF_MAGIC: &[u8] = b"\x7FELF";
const HEX_START_CODE: u8 = b':';

/// Errors raised while decoding a firmware artifact.
///
/// Any of these is fatal for the whole run: flashing never starts with a
/// partially decoded image.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedImage {
    #[error("Unrecognised image format (expected ELF magic or Intel HEX start code)")]
    UnknownFormat,

    #[error("Invalid ELF: {0}")]
    Elf(String),

    #[error("{what} at offset {offset:#x} (length {len:#x}) runs past end of input ({size:#x} bytes)")]
    OutOfBounds {
        what: String,
        offset: u64,
        len: u64,
        size: usize,
    },

    #[error("Intel HEX line {line}: {reason}")]
    Hex { line: usize, reason: String },

    #[error("Address {0:#x} is outside the 32-bit address space")]
    AddressRange(u64),

    #[error("Segments overlap at {address:#010x}")]
    Overlap { address: u32 },

    #[error("Image contains no loadable data")]
    Empty,
}

/// Container format an image was decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Elf,
    IntelHex,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elf => write!(f, "ELF"),
            Self::IntelHex => write!(f, "Intel HEX"),
        }
    }
}

/// A contiguous block of firmware bytes destined for one flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Absolute address of the first byte
    pub base_address: u32,
    /// Segment contents
    pub data: Bytes,
    /// CRC32 of `data`
    pub crc32: u32,
}

impl Segment {
    pub fn new(base_address: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let crc32 = CRC32.checksum(&data);
        Self {
            base_address,
            data,
            crc32,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last address covered by this segment.
    pub fn end_address(&self) -> u64 {
        u64::from(self.base_address) + self.data.len() as u64
    }
}

/// A parsed firmware image.
///
/// Segments are sorted by address and never overlap. The image is immutable
/// once built and is shared read-only between board sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    format: ImageFormat,
    segments: Vec<Segment>,
    crc32: u32,
    total_size: u32,
    entry_point: Option<u32>,
}

impl FirmwareImage {
    /// Decode a build artifact, picking the container format from its marker.
    pub fn parse(raw: &[u8]) -> Result<Self, MalformedImage> {
        if raw.starts_with(ELF_MAGIC) {
            elf_file::parse(raw)
        } else if raw.first() == Some(&HEX_START_CODE) {
            intel_hex::parse(raw)
        } else {
            Err(MalformedImage::UnknownFormat)
        }
    }

    /// Read and decode an artifact from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| FlashError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let image = Self::parse(&raw)?;
        tracing::info!(
            path = %path.display(),
            format = %image.format,
            segments = image.segments.len(),
            size = image.total_size,
            crc32 = %format!("{:#010x}", image.crc32),
            "Firmware image loaded"
        );
        Ok(image)
    }

    /// Build an image from loose `(address, bytes)` pieces.
    ///
    /// Pieces are sorted, address-contiguous pieces are merged into one
    /// segment, and empty pieces are dropped. Overlapping pieces are rejected.
    pub fn from_pieces(
        format: ImageFormat,
        mut pieces: Vec<(u32, Vec<u8>)>,
        entry_point: Option<u32>,
    ) -> Result<Self, MalformedImage> {
        pieces.retain(|(_, data)| !data.is_empty());
        pieces.sort_by_key(|(address, _)| *address);

        let mut merged: Vec<(u32, BytesMut)> = Vec::new();
        for (address, data) in pieces {
            let end = u64::from(address) + data.len() as u64;
            if end > 1 << 32 {
                return Err(MalformedImage::AddressRange(end - 1));
            }

            match merged.last_mut() {
                Some((base, buf)) => {
                    let current_end = u64::from(*base) + buf.len() as u64;
                    if u64::from(address) < current_end {
                        return Err(MalformedImage::Overlap { address });
                    }
                    if u64::from(address) == current_end {
                        buf.extend_from_slice(&data);
                    } else {
                        merged.push((address, BytesMut::from(&data[..])));
                    }
                }
                None => merged.push((address, BytesMut::from(&data[..]))),
            }
        }

        if merged.is_empty() {
            return Err(MalformedImage::Empty);
        }

        let segments: Vec<Segment> = merged
            .into_iter()
            .map(|(base, buf)| Segment::new(base, buf.freeze()))
            .collect();

        let total: u64 = segments.iter().map(|s| s.len() as u64).sum();
        let total_size = u32::try_from(total).map_err(|_| MalformedImage::AddressRange(total))?;

        let mut digest = CRC32.digest();
        for segment in &segments {
            digest.update(&segment.data);
        }

        Ok(Self {
            format,
            segments,
            crc32: digest.finalize(),
            total_size,
            entry_point,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// CRC32 over every segment's bytes, concatenated in address order
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Number of firmware bytes across all segments (gaps excluded)
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    /// Lowest address written by the image
    pub fn min_address(&self) -> u32 {
        self.segments[0].base_address
    }

    /// One past the highest address written by the image
    pub fn end_address(&self) -> u64 {
        self.segments[self.segments.len() - 1].end_address()
    }
}

/// Decode a build artifact into a [`FirmwareImage`].
pub fn parse(raw: &[u8]) -> Result<FirmwareImage, MalformedImage> {
    FirmwareImage::parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pieces_sorted_and_coalesced() {
        let image = FirmwareImage::from_pieces(
            ImageFormat::IntelHex,
            vec![
                (0x1000, vec![0xAA; 16]),
                (0x0000, vec![0x11; 0x80]),
                (0x0080, vec![0x22; 0x80]),
            ],
            None,
        )
        .unwrap();

        let segments = image.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].base_address, 0x0000);
        assert_eq!(segments[0].len(), 0x100);
        assert_eq!(segments[1].base_address, 0x1000);
        assert_eq!(segments[1].len(), 16);
        assert_eq!(image.total_size(), 0x110);
        assert_eq!(image.min_address(), 0x0000);
        assert_eq!(image.end_address(), 0x1010);
    }

    #[test]
    fn test_image_crc_covers_segments_in_address_order() {
        let image = FirmwareImage::from_pieces(
            ImageFormat::Elf,
            vec![(0x2000, b"world".to_vec()), (0x1000, b"hello".to_vec())],
            None,
        )
        .unwrap();

        assert_eq!(image.crc32(), CRC32.checksum(b"helloworld"));
        assert_eq!(image.segments()[0].crc32, CRC32.checksum(b"hello"));
        assert_eq!(image.segments()[1].crc32, CRC32.checksum(b"world"));
    }

    #[test]
    fn test_overlapping_pieces_rejected() {
        let err = FirmwareImage::from_pieces(
            ImageFormat::Elf,
            vec![(0x1000, vec![0; 0x20]), (0x1010, vec![0; 4])],
            None,
        )
        .unwrap_err();
        assert_eq!(err, MalformedImage::Overlap { address: 0x1010 });
    }

    #[test]
    fn test_piece_past_address_space_rejected() {
        let err = FirmwareImage::from_pieces(
            ImageFormat::Elf,
            vec![(0xFFFF_FFF0, vec![0; 0x20])],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MalformedImage::AddressRange(_)));
    }

    #[test]
    fn test_empty_image_rejected() {
        let err = FirmwareImage::from_pieces(ImageFormat::Elf, vec![(0x0, vec![])], None)
            .unwrap_err();
        assert_eq!(err, MalformedImage::Empty);
    }

    #[test]
    fn test_unknown_marker_rejected() {
        assert_eq!(
            FirmwareImage::parse(b"MZ\x90\x00garbage").unwrap_err(),
            MalformedImage::UnknownFormat
        );
        assert_eq!(FirmwareImage::parse(b"").unwrap_err(), MalformedImage::UnknownFormat);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.hex");
        std::fs::write(&path, ":0400000001020304F2\n:00000001FF\n").unwrap();

        let image = FirmwareImage::load(&path).unwrap();
        assert_eq!(image.format(), ImageFormat::IntelHex);
        assert_eq!(&image.segments()[0].data[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = FirmwareImage::load("/nonexistent/app.elf").unwrap_err();
        assert!(matches!(err, FlashError::Io { .. }));
    }
}
