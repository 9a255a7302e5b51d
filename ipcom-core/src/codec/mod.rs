//! Length-delimited frame codec for `tokio_util` framed I/O.
//!
//! The decoder never fails the stream on a bad frame: each malformed unit
//! comes out as `Some(Err(..))` and the read position is left on the next
//! plausible frame boundary. Only I/O errors end the stream.

mod cipher;

pub use cipher::{FrameCipher, PassthroughCipher, blake3_checksum};

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::IpcomError;
use crate::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_LENGTH, MAGIC};

/// Result of decoding one unit off the wire.
pub type Decoded = Result<Frame, IpcomError>;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    cipher: Arc<dyn FrameCipher>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughCipher))
    }
}

impl FrameCodec {
    pub fn new(cipher: Arc<dyn FrameCipher>) -> Self {
        Self { cipher }
    }

    /// Encode a single frame into a standalone buffer.
    pub fn encode_frame(&mut self, frame: Frame) -> Result<Bytes, IpcomError> {
        let mut dst = BytesMut::new();
        self.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode at most one unit from `src`. `None` means more bytes are needed.
    pub fn decode_frame(&mut self, src: &mut BytesMut) -> Option<Decoded> {
        // `decode` only fails on I/O, which cannot happen on a buffer.
        self.decode(src).ok().flatten()
    }

    fn open_frame(&self, header_bytes: &FrameHeaderBytes, sealed: &[u8]) -> Decoded {
        let header = FrameHeader::from_bytes(header_bytes)?;
        let actual = self.cipher.checksum(sealed);
        if actual != header.checksum() {
            return Err(IpcomError::ChecksumMismatch {
                expected: header.checksum(),
                actual,
            });
        }
        let plain = self.cipher.open(header.kind(), sealed)?;
        Frame::new(header.kind(), header.sequence(), plain)
    }
}

/// Number of leading bytes to drop so that `src` starts at the next
/// possible magic sequence. Always at least one.
fn resync_offset(src: &[u8]) -> usize {
    if let Some(pos) = src[1..].windows(2).position(|w| w == MAGIC) {
        return pos + 1;
    }
    // A trailing first magic byte may be completed by the next read.
    if src.len() > 1 && src[src.len() - 1] == MAGIC[0] {
        src.len() - 1
    } else {
        src.len()
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = IpcomError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MAGIC.len() {
            return Ok(None);
        }
        if src[..MAGIC.len()] != MAGIC {
            let skip = resync_offset(src);
            src.advance(skip);
            return Ok(Some(Err(IpcomError::InvalidMagic)));
        }
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let mut header_bytes: FrameHeaderBytes = [0; HEADER_LENGTH];
        header_bytes.copy_from_slice(&src[..HEADER_LENGTH]);
        let payload_length = FrameHeader::peek_payload_length(&header_bytes) as usize;
        if payload_length > MAX_PAYLOAD_SIZE {
            // Treat the magic as a false positive and rescan after it.
            src.advance(MAGIC.len());
            return Ok(Some(Err(IpcomError::PayloadTooLarge {
                size: payload_length,
                max: MAX_PAYLOAD_SIZE,
            })));
        }

        let total = HEADER_LENGTH + payload_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let unit = src.split_to(total);
        Ok(Some(self.open_frame(&header_bytes, &unit[HEADER_LENGTH..])))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = IpcomError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let sealed = self.cipher.seal(item.kind(), item.payload())?;
        if sealed.len() > MAX_PAYLOAD_SIZE {
            return Err(IpcomError::PayloadTooLarge {
                size: sealed.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = FrameHeader::new(
            item.kind(),
            item.sequence(),
            sealed.len() as u16,
            self.cipher.checksum(&sealed),
        );
        dst.reserve(HEADER_LENGTH + sealed.len());
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&sealed);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
