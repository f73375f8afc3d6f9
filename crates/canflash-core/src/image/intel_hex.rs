//! Intel HEX record decoding
//!
//! Supports the record types emitted by arm-none-eabi objcopy: data (00),
//! end-of-file (01), extended segment address (02), start segment address
//! (03), extended linear address (04) and start linear address (05).

use super::{FirmwareImage, ImageFormat, MalformedImage};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Byte count + address (2) + record type + checksum
const RECORD_OVERHEAD: usize = 5;

fn hex_error(line: usize, reason: impl Into<String>) -> MalformedImage {
    MalformedImage::Hex {
        line,
        reason: reason.into(),
    }
}

pub(super) fn parse(raw: &[u8]) -> Result<FirmwareImage, MalformedImage> {
    let text = std::str::from_utf8(raw).map_err(|_| hex_error(0, "file is not ASCII text"))?;

    let mut upper: u32 = 0;
    let mut entry_point = None;
    let mut seen_eof = false;
    let mut pieces: Vec<(u32, Vec<u8>)> = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if seen_eof {
            return Err(hex_error(line_no, "record after end-of-file record"));
        }

        let body = line
            .strip_prefix(':')
            .ok_or_else(|| hex_error(line_no, "missing ':' start code"))?;
        let record = hex::decode(body).map_err(|e| hex_error(line_no, e.to_string()))?;
        if record.len() < RECORD_OVERHEAD {
            return Err(hex_error(line_no, "record too short"));
        }

        let count = record[0] as usize;
        if record.len() != count + RECORD_OVERHEAD {
            return Err(hex_error(
                line_no,
                format!(
                    "byte count {} does not match record length {}",
                    count,
                    record.len() - RECORD_OVERHEAD
                ),
            ));
        }

        let sum = record.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(hex_error(line_no, "checksum mismatch"));
        }

        let offset = u16::from_be_bytes([record[1], record[2]]);
        let kind = record[3];
        let data = &record[4..4 + count];

        match kind {
            RECORD_DATA => {
                let address = upper + u32::from(offset);
                match pieces.last_mut() {
                    Some((base, buf))
                        if u64::from(*base) + buf.len() as u64 == u64::from(address) =>
                    {
                        buf.extend_from_slice(data);
                    }
                    _ => pieces.push((address, data.to_vec())),
                }
            }
            RECORD_EOF => seen_eof = true,
            RECORD_EXT_SEGMENT => {
                let value = expect_u16(line_no, data)?;
                upper = u32::from(value) << 4;
            }
            RECORD_EXT_LINEAR => {
                let value = expect_u16(line_no, data)?;
                upper = u32::from(value) << 16;
            }
            RECORD_START_SEGMENT => {
                let value = expect_u32(line_no, data)?;
                let (cs, ip) = (value >> 16, value & 0xFFFF);
                entry_point = Some((cs << 4) + ip);
            }
            RECORD_START_LINEAR => {
                entry_point = Some(expect_u32(line_no, data)?);
            }
            other => {
                return Err(hex_error(
                    line_no,
                    format!("unsupported record type {:#04x}", other),
                ));
            }
        }
    }

    if !seen_eof {
        return Err(hex_error(
            text.lines().count(),
            "missing end-of-file record",
        ));
    }

    FirmwareImage::from_pieces(ImageFormat::IntelHex, pieces, entry_point)
}

fn expect_u16(line: usize, data: &[u8]) -> Result<u16, MalformedImage> {
    let bytes: [u8; 2] = data
        .try_into()
        .map_err(|_| hex_error(line, "address record must carry 2 bytes"))?;
    Ok(u16::from_be_bytes(bytes))
}

fn expect_u32(line: usize, data: &[u8]) -> Result<u32, MalformedImage> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| hex_error(line, "start address record must carry 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}
