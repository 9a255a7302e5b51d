//! Payload protection seam.
//!
//! The vendor's real encryption and checksum scheme is a third-party
//! detail that may be swapped out; everything above the codec only sees
//! plaintext [`Frame`](crate::Frame)s. Implement [`FrameCipher`] to plug
//! in a different scheme.

use std::fmt;

use crate::error::IpcomError;
use crate::message::FrameKind;

pub trait FrameCipher: Send + Sync + fmt::Debug {
    /// Turn a plaintext payload into the bytes that go on the wire.
    fn seal(&self, kind: FrameKind, plain: &[u8]) -> Result<Vec<u8>, IpcomError>;

    /// Recover the plaintext from wire bytes. Must not panic on garbage.
    fn open(&self, kind: FrameKind, sealed: &[u8]) -> Result<Vec<u8>, IpcomError>;

    /// Integrity value stored in the header for the sealed bytes.
    fn checksum(&self, sealed: &[u8]) -> u32 {
        blake3_checksum(sealed)
    }
}

/// First four bytes of the blake3 digest, little-endian.
pub fn blake3_checksum(bytes: &[u8]) -> u32 {
    let digest = blake3::hash(bytes);
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// No encryption; integrity only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl FrameCipher for PassthroughCipher {
    fn seal(&self, _kind: FrameKind, plain: &[u8]) -> Result<Vec<u8>, IpcomError> {
        Ok(plain.to_vec())
    }

    fn open(&self, _kind: FrameKind, sealed: &[u8]) -> Result<Vec<u8>, IpcomError> {
        Ok(sealed.to_vec())
    }
}
