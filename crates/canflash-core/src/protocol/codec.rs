//! Message <-> frame conversion
//!
//! Stateless and symmetric: `decode(&encode(m, id)?)? == m` for every message
//! whose chunk fits [`MAX_CHUNK_LEN`]. Splitting firmware into chunks is the
//! session's job, never the codec's.

use bytes::Bytes;
use thiserror::Error;

use super::frame::{Frame, PayloadTooLong, MAX_FRAME_LEN};
use super::{tag, NackReason, ProtocolMessage, MAX_CHUNK_LEN};

const CHUNK_LAST_FLAG: u8 = 0x80;
const CHUNK_LEN_MASK: u8 = 0x07;

/// A received frame that does not decode to a protocol message.
///
/// Recoverable: the frame is dropped and the session keeps waiting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnknownMessage {
    #[error("Empty payload")]
    Empty,

    #[error("Unknown tag {0:#04x}")]
    Tag(u8),

    #[error("Truncated message (tag {tag:#04x}): need {expected} bytes, got {actual}")]
    Truncated {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Chunk length {0} exceeds {MAX_CHUNK_LEN}", MAX_CHUNK_LEN = MAX_CHUNK_LEN)]
    ChunkLength(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Chunk of {0} bytes does not fit one frame")]
    ChunkTooLong(usize),

    #[error(transparent)]
    Frame(#[from] PayloadTooLong),
}

/// Encode `message` into a frame addressed to `id`.
pub fn encode(message: &ProtocolMessage, id: u32) -> Result<Frame, EncodeError> {
    let mut buf = [0u8; MAX_FRAME_LEN];
    buf[0] = message.tag();

    let len = match message {
        ProtocolMessage::Ping
        | ProtocolMessage::AckPing
        | ProtocolMessage::EraseAck
        | ProtocolMessage::VerifyAck
        | ProtocolMessage::VerifyNack
        | ProtocolMessage::Reboot => 1,
        ProtocolMessage::EraseRequest { size_bytes } => {
            buf[1..5].copy_from_slice(&size_bytes.to_le_bytes());
            5
        }
        ProtocolMessage::VerifyRequest { crc32 } => {
            buf[1..5].copy_from_slice(&crc32.to_le_bytes());
            5
        }
        ProtocolMessage::DataAck { offset } => {
            buf[1..5].copy_from_slice(&offset.to_le_bytes());
            5
        }
        ProtocolMessage::DataNack { offset, reason } => {
            buf[1..5].copy_from_slice(&offset.to_le_bytes());
            buf[5] = u8::from(*reason);
            6
        }
        ProtocolMessage::DataChunk {
            offset,
            data,
            is_last,
        } => {
            if data.len() > MAX_CHUNK_LEN {
                return Err(EncodeError::ChunkTooLong(data.len()));
            }
            let mut ctrl = data.len() as u8;
            if *is_last {
                ctrl |= CHUNK_LAST_FLAG;
            }
            buf[1] = ctrl;
            buf[2..6].copy_from_slice(&offset.to_le_bytes());
            buf[6..6 + data.len()].copy_from_slice(data);
            6 + data.len()
        }
    };

    Ok(Frame::new(id, &buf[..len])?)
}

/// Decode a received frame.
///
/// Bytes past a message's layout are ignored so padded frames decode.
pub fn decode(frame: &Frame) -> Result<ProtocolMessage, UnknownMessage> {
    let payload = frame.payload();
    let tag = *payload.first().ok_or(UnknownMessage::Empty)?;

    let need = |expected: usize| {
        if payload.len() < expected {
            Err(UnknownMessage::Truncated {
                tag,
                expected,
                actual: payload.len(),
            })
        } else {
            Ok(())
        }
    };
    let u32_at = |at: usize| {
        u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
    };

    let message = match tag {
        tag::PING => ProtocolMessage::Ping,
        tag::ACK_PING => ProtocolMessage::AckPing,
        tag::ERASE_ACK => ProtocolMessage::EraseAck,
        tag::VERIFY_ACK => ProtocolMessage::VerifyAck,
        tag::VERIFY_NACK => ProtocolMessage::VerifyNack,
        tag::REBOOT => ProtocolMessage::Reboot,
        tag::ERASE_REQUEST => {
            need(5)?;
            ProtocolMessage::EraseRequest {
                size_bytes: u32_at(1),
            }
        }
        tag::VERIFY_REQUEST => {
            need(5)?;
            ProtocolMessage::VerifyRequest { crc32: u32_at(1) }
        }
        tag::DATA_ACK => {
            need(5)?;
            ProtocolMessage::DataAck { offset: u32_at(1) }
        }
        tag::DATA_NACK => {
            need(6)?;
            ProtocolMessage::DataNack {
                offset: u32_at(1),
                reason: NackReason::from(payload[5]),
            }
        }
        tag::DATA_CHUNK => {
            need(6)?;
            let ctrl = payload[1];
            let len = (ctrl & CHUNK_LEN_MASK) as usize;
            if len > MAX_CHUNK_LEN {
                return Err(UnknownMessage::ChunkLength(len));
            }
            need(6 + len)?;
            ProtocolMessage::DataChunk {
                offset: u32_at(2),
                data: Bytes::copy_from_slice(&payload[6..6 + len]),
                is_last: ctrl & CHUNK_LAST_FLAG != 0,
            }
        }
        other => return Err(UnknownMessage::Tag(other)),
    };

    Ok(message)
}
