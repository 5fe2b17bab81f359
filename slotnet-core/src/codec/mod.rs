//! Frame codecs.
//!
//! A codec turns one in-memory payload into one wire frame and back:
//!
//! ```text
//! +-----------------+-------------------------+-------------------+
//! | header          | encoded body            | footer (optional) |
//! | header_length() | <= frame_length() - ... | footer_length()   |
//! +-----------------+-------------------------+-------------------+
//! ```
//!
//! Codecs are sans-IO: `encode` appends to a write buffer, `decode` consumes
//! from the front of a read buffer. A codec instance belongs to one channel.
//! Encoding and decoding each keep their own scratch state, so the two sides
//! never need to coordinate, but neither side is reentrant.

mod checksum;
mod deflate;
mod length;

pub use checksum::ChecksumCodec;
pub use deflate::{max_compressed_length, max_uncompressed_length, DeflateCodec, DEFAULT_FRAME_LIMIT};
pub use length::LengthCodec;

use crate::error::{Result, SlotError};
use bytes::BytesMut;
use std::fmt;

/// Width of the big-endian length header shared by the bundled codecs.
pub const LENGTH_HEADER: usize = 4;

/// The header length field is an unsigned 31-bit value; the top bit is reserved.
pub(crate) const LENGTH_MASK: u32 = 0x7FFF_FFFF;

/// Capability surface every frame codec exposes to a channel.
pub trait MessageCodec: Send + fmt::Debug {
    /// Bytes taken by the frame header.
    fn header_length(&self) -> usize;

    /// Maximum payload bytes per message.
    fn body_length(&self) -> usize;

    /// Bytes taken by the frame footer (zero when there is none).
    fn footer_length(&self) -> usize;

    /// Maximum total wire bytes of one frame.
    fn frame_length(&self) -> usize;

    /// Worst-case wire bytes needed to encode `payload`.
    fn encoded_length(&self, payload: &[u8]) -> usize;

    /// A payload is valid when it is non-empty and fits the declared body length.
    fn is_valid_payload(&self, payload: &[u8]) -> bool {
        !payload.is_empty() && payload.len() <= self.body_length()
    }

    /// Same as [`is_valid_payload`](Self::is_valid_payload) but reports why.
    fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        if self.is_valid_payload(payload) {
            Ok(())
        } else {
            Err(SlotError::InvalidLength {
                length: payload.len(),
                min: 1,
                max: self.body_length(),
            })
        }
    }

    /// Append one complete frame for `payload` to `out`.
    fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()>;

    /// Whether `input` starts with a complete frame.
    ///
    /// Never consumes. Fails when the header declares a length outside the
    /// codec's bounds, which means the stream is corrupt or hostile.
    fn has_complete_frame(&self, input: &[u8]) -> Result<bool>;

    /// Encoded length declared by the header at the front of `input`, or
    /// `None` while fewer than `header_length()` bytes are available.
    fn decoded_length(&self, input: &[u8]) -> Option<usize>;

    /// Consume one complete frame from the front of `input` and append the
    /// decoded payload to `out`.
    fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<()>;

    /// Release codec-internal resources. Called once, when the channel closes.
    fn close(&mut self) {}
}

/// Selects the frame codec a channel builds for each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Length header + raw body
    Length,
    /// Length header + raw body + CRC-32C footer
    Checksum,
    /// Length header + deflate-compressed body
    #[default]
    Deflate,
}

impl CodecKind {
    /// Build a fresh codec instance for payloads of up to `message_length` bytes.
    pub fn build(self, message_length: usize) -> Result<Box<dyn MessageCodec>> {
        Ok(match self {
            Self::Length => Box::new(LengthCodec::new(message_length)?),
            Self::Checksum => Box::new(ChecksumCodec::new(message_length)?),
            Self::Deflate => Box::new(DeflateCodec::new(message_length)?),
        })
    }
}

/// Read the masked 31-bit length header at the front of `input`.
#[inline]
pub(crate) fn peek_length(input: &[u8]) -> Option<usize> {
    let header: [u8; LENGTH_HEADER] = input.get(..LENGTH_HEADER)?.try_into().ok()?;
    Some((u32::from_be_bytes(header) & LENGTH_MASK) as usize)
}

/// Check a declared length against `1..=max`.
#[inline]
pub(crate) fn check_declared(length: usize, max: usize) -> Result<()> {
    if length < 1 || length > max {
        return Err(SlotError::InvalidLength { length, min: 1, max });
    }
    Ok(())
}
