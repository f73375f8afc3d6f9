//! Classic CAN frame: identifier plus up to eight payload bytes

use std::fmt;

use thiserror::Error;

/// Maximum payload carried by one classic CAN frame
pub const MAX_FRAME_LEN: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Frame payload of {0} bytes exceeds the 8-byte limit")]
pub struct PayloadTooLong(pub usize);

/// One unit exchanged with the bus transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    id: u32,
    len: u8,
    data: [u8; MAX_FRAME_LEN],
}

impl Frame {
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, PayloadTooLong> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(PayloadTooLong(payload.len()));
        }
        let mut data = [0u8; MAX_FRAME_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            len: payload.len() as u8,
            data,
        })
    }

    /// Bus identifier (11-bit standard or 29-bit extended)
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#05x} [{}])", self.id, hex::encode(self.payload()))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#{}", self.id, hex::encode_upper(self.payload()))
    }
}
