//! Bootloader wire protocol
//!
//! Every message fits one classic CAN frame. Byte 0 of the payload is the
//! message tag; multi-byte fields are little-endian.
//!
//! ```text
//! tag   message         payload after tag
//! 0x01  Ping            -
//! 0x02  AckPing         -
//! 0x10  EraseRequest    size_bytes u32
//! 0x11  EraseAck        -
//! 0x20  DataChunk       ctrl u8 (bit7 last, bits0-2 len), offset u32, data[len]
//! 0x21  DataAck         offset u32
//! 0x22  DataNack        offset u32, reason u8
//! 0x30  VerifyRequest   crc32 u32
//! 0x31  VerifyAck       -
//! 0x32  VerifyNack      -
//! 0x40  Reboot          -
//! ```

mod codec;
mod frame;

pub use codec::{decode, encode, EncodeError, UnknownMessage};
pub use frame::{Frame, PayloadTooLong, MAX_FRAME_LEN};

use std::fmt;

use bytes::Bytes;

/// Data bytes carried by one `DataChunk` (tag + ctrl + offset leave two)
pub const MAX_CHUNK_LEN: usize = 2;

/// Message tag bytes
pub mod tag {
    pub const PING: u8 = 0x01;
    pub const ACK_PING: u8 = 0x02;
    pub const ERASE_REQUEST: u8 = 0x10;
    pub const ERASE_ACK: u8 = 0x11;
    pub const DATA_CHUNK: u8 = 0x20;
    pub const DATA_ACK: u8 = 0x21;
    pub const DATA_NACK: u8 = 0x22;
    pub const VERIFY_REQUEST: u8 = 0x30;
    pub const VERIFY_ACK: u8 = 0x31;
    pub const VERIFY_NACK: u8 = 0x32;
    pub const REBOOT: u8 = 0x40;
}

/// Why a board refused a data chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// Address outside the application region
    OutOfRange,
    /// Flash program operation failed
    WriteFailed,
    /// Target bytes were not erased
    NotErased,
    /// Chunk arrived out of order
    SequenceError,
    /// Unknown/reserved code
    Other(ReasonCode),
}

/// A reason code with no named [`NackReason`] variant.
///
/// Only built by `NackReason::from(u8)`, so a known code always decodes to
/// its named variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonCode(u8);

impl ReasonCode {
    pub fn code(self) -> u8 {
        self.0
    }
}

impl From<u8> for NackReason {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::OutOfRange,
            0x02 => Self::WriteFailed,
            0x03 => Self::NotErased,
            0x04 => Self::SequenceError,
            other => Self::Other(ReasonCode(other)),
        }
    }
}

impl From<NackReason> for u8 {
    fn from(reason: NackReason) -> Self {
        match reason {
            NackReason::OutOfRange => 0x01,
            NackReason::WriteFailed => 0x02,
            NackReason::NotErased => 0x03,
            NackReason::SequenceError => 0x04,
            NackReason::Other(code) => code.0,
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "address out of range"),
            Self::WriteFailed => write!(f, "flash write failed"),
            Self::NotErased => write!(f, "flash not erased"),
            Self::SequenceError => write!(f, "sequence error"),
            Self::Other(code) => write!(f, "reason {:#04x}", code.0),
        }
    }
}

/// A bootloader protocol message, host requests and board replies alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Ping,
    AckPing,
    EraseRequest {
        size_bytes: u32,
    },
    EraseAck,
    DataChunk {
        /// Absolute flash address of the first byte
        offset: u32,
        data: Bytes,
        is_last: bool,
    },
    DataAck {
        offset: u32,
    },
    DataNack {
        offset: u32,
        reason: NackReason,
    },
    VerifyRequest {
        crc32: u32,
    },
    VerifyAck,
    VerifyNack,
    Reboot,
}

impl ProtocolMessage {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Ping => tag::PING,
            Self::AckPing => tag::ACK_PING,
            Self::EraseRequest { .. } => tag::ERASE_REQUEST,
            Self::EraseAck => tag::ERASE_ACK,
            Self::DataChunk { .. } => tag::DATA_CHUNK,
            Self::DataAck { .. } => tag::DATA_ACK,
            Self::DataNack { .. } => tag::DATA_NACK,
            Self::VerifyRequest { .. } => tag::VERIFY_REQUEST,
            Self::VerifyAck => tag::VERIFY_ACK,
            Self::VerifyNack => tag::VERIFY_NACK,
            Self::Reboot => tag::REBOOT,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::AckPing => "AckPing",
            Self::EraseRequest { .. } => "EraseRequest",
            Self::EraseAck => "EraseAck",
            Self::DataChunk { .. } => "DataChunk",
            Self::DataAck { .. } => "DataAck",
            Self::DataNack { .. } => "DataNack",
            Self::VerifyRequest { .. } => "VerifyRequest",
            Self::VerifyAck => "VerifyAck",
            Self::VerifyNack => "VerifyNack",
            Self::Reboot => "Reboot",
        }
    }
}
