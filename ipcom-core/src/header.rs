//! Fixed 12-byte frame header.
//!
//! ```text
//! magic:          [u8; 2]  "IC"
//! kind:           u8
//! reserved:       u8
//! sequence:       u16
//! payload_length: u16      (sealed bytes)
//! checksum:       u32      (of sealed bytes)
//! ```

use crate::error::IpcomError;
use crate::message::FrameKind;

pub const MAGIC: [u8; 2] = *b"IC";
pub const HEADER_LENGTH: usize = 12;

pub type FrameHeaderBytes = [u8; HEADER_LENGTH];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    kind: FrameKind,
    sequence: u16,
    payload_length: u16,
    checksum: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, sequence: u16, payload_length: u16, checksum: u32) -> Self {
        Self {
            kind,
            sequence,
            payload_length,
            checksum,
        }
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut header: FrameHeaderBytes = [0; HEADER_LENGTH];
        header[0..2].copy_from_slice(&MAGIC);
        header[2] = self.kind as u8;
        header[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        header[6..8].copy_from_slice(&self.payload_length.to_le_bytes());
        header[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        header
    }

    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, IpcomError> {
        if bytes[0..2] != MAGIC {
            return Err(IpcomError::InvalidMagic);
        }
        Ok(Self {
            kind: FrameKind::try_from(bytes[2])?,
            sequence: u16::from_le_bytes([bytes[4], bytes[5]]),
            payload_length: u16::from_le_bytes([bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    /// Reads only the length field, without validating anything else.
    ///
    /// The decoder needs this to skip a frame whose kind is unknown.
    pub fn peek_payload_length(bytes: &FrameHeaderBytes) -> u16 {
        u16::from_le_bytes([bytes[6], bytes[7]])
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload_length(&self) -> u16 {
        self.payload_length
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}
