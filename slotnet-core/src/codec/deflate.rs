//! Compressing codec.
//!
//! Wire format: `[u32 BE compressed length][zlib stream]`, no footer.
//!
//! The worst case for zlib is 6 bytes of fixed overhead (2 header bytes plus
//! the Adler-32 trailer) and 5 bytes per 16 KiB stored block. The maximum body
//! length is derived from the transport limit through the inverse of that
//! bound, so `frame_length()` never exceeds the limit. The default limit is
//! 65,499 bytes, one UDP datagram.
//!
//! The deflate backend is not bound to zlib's block layout. When its output
//! for an incompressible message overruns the bound, the message is written
//! as a zlib stream of stored blocks of at most 16383 bytes instead, which
//! meets the bound exactly.

use super::{check_declared, peek_length, MessageCodec, LENGTH_HEADER, LENGTH_MASK};
use crate::error::{Result, SlotError};
use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::fmt;
use tracing::trace;

const ZLIB_BLOCK_LENGTH: usize = 0x3FFF; // 16383
const ZLIB_FIXED_OVERHEAD: usize = 6;
const ZLIB_BLOCK_OVERHEAD: usize = 5;
/// CMF/FLG pair for a 32 KiB window with no preset dictionary, level 0.
const ZLIB_STORED_HEADER: [u8; 2] = [0x78, 0x01];

/// Wire limit for one frame when none is given.
pub const DEFAULT_FRAME_LIMIT: usize = 65_499;

/// Upper bound of deflated output for `length` input bytes.
#[inline]
pub const fn max_compressed_length(length: usize) -> usize {
    let blocks = length / ZLIB_BLOCK_LENGTH + 1;
    length + ZLIB_FIXED_OVERHEAD + blocks * ZLIB_BLOCK_OVERHEAD
}

/// Largest input whose deflated bound fits in `length` bytes.
#[inline]
pub const fn max_uncompressed_length(length: usize) -> usize {
    let blocks = length / ZLIB_BLOCK_LENGTH + 1;
    length.saturating_sub(ZLIB_FIXED_OVERHEAD + blocks * ZLIB_BLOCK_OVERHEAD)
}

/// Frame codec that deflates each message independently at the fastest level.
///
/// The compressor and decompressor are separate, so one thread may encode
/// while another decodes; two concurrent encoders are not supported.
pub struct DeflateCodec {
    body_length: usize,
    compressed_length: usize,
    frame_length: usize,
    deflater: Compress,
    inflater: Decompress,
    closed: bool,
}

impl DeflateCodec {
    /// Codec for bodies of up to `body_length` bytes under the default frame limit.
    pub fn new(body_length: usize) -> Result<Self> {
        Self::with_frame_limit(body_length, DEFAULT_FRAME_LIMIT)
    }

    /// Codec whose frames never exceed `frame_limit` wire bytes.
    pub fn with_frame_limit(body_length: usize, frame_limit: usize) -> Result<Self> {
        if frame_limit > LENGTH_MASK as usize {
            return Err(SlotError::config(format!(
                "frame limit {frame_limit} exceeds the 31-bit length header"
            )));
        }
        let max_body = Self::max_body_length(frame_limit);
        if body_length < 1 || body_length > max_body {
            return Err(SlotError::config(format!(
                "body length {body_length} outside 1..={max_body} for a {frame_limit} byte frame"
            )));
        }
        let compressed_length = max_compressed_length(body_length);
        Ok(Self {
            body_length,
            compressed_length,
            frame_length: LENGTH_HEADER + compressed_length,
            deflater: Compress::new(Compression::fast(), true),
            inflater: Decompress::new(true),
            closed: false,
        })
    }

    /// Largest body length whose worst-case frame fits in `frame_limit` bytes.
    #[must_use]
    pub const fn max_body_length(frame_limit: usize) -> usize {
        max_uncompressed_length(frame_limit.saturating_sub(LENGTH_HEADER))
    }

    /// Upper bound of the compressed section of a frame.
    #[must_use]
    pub const fn compressed_length(&self) -> usize {
        self.compressed_length
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SlotError::Closed);
        }
        Ok(())
    }
}

impl MessageCodec for DeflateCodec {
    fn header_length(&self) -> usize {
        LENGTH_HEADER
    }

    fn body_length(&self) -> usize {
        self.body_length
    }

    fn footer_length(&self) -> usize {
        0
    }

    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn encoded_length(&self, payload: &[u8]) -> usize {
        LENGTH_HEADER + max_compressed_length(payload.len())
    }

    fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        self.ensure_open()?;
        self.validate_payload(payload)?;

        let start = out.len();
        let body = start + LENGTH_HEADER;
        out.resize(body + self.compressed_length, 0);

        self.deflater.reset();
        let status = self
            .deflater
            .compress(payload, &mut out[body..], FlushCompress::Finish);
        let deflated = self.deflater.total_out() as usize;

        let deflated = match status {
            Ok(Status::StreamEnd) if (1..=self.compressed_length).contains(&deflated) => {
                out.truncate(body + deflated);
                deflated
            }
            Ok(status) => {
                out.truncate(body);
                store(payload, out);
                let stored = out.len() - body;
                trace!(?status, overran = deflated, stored, "[DEFLATE] Fell back to stored blocks");
                if stored > self.compressed_length {
                    out.truncate(start);
                    return Err(SlotError::bug(format!(
                        "stored stream of {stored} bytes exceeds the {} byte bound",
                        self.compressed_length
                    )));
                }
                stored
            }
            Err(e) => {
                out.truncate(start);
                return Err(SlotError::bug(format!("deflate failed: {e}")));
            }
        };

        out[start..body].copy_from_slice(&(deflated as u32).to_be_bytes());
        trace!(inflated = payload.len(), deflated, "[DEFLATE] Encoded frame");
        Ok(())
    }

    fn has_complete_frame(&self, input: &[u8]) -> Result<bool> {
        let Some(length) = peek_length(input) else {
            return Ok(false);
        };
        check_declared(length, self.compressed_length)?;
        Ok(input.len() >= LENGTH_HEADER + length)
    }

    fn decoded_length(&self, input: &[u8]) -> Option<usize> {
        peek_length(input)
    }

    fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<()> {
        self.ensure_open()?;
        if !self.has_complete_frame(&input[..])? {
            return Err(SlotError::encoding("incomplete frame"));
        }
        let deflated = (input.get_u32() & LENGTH_MASK) as usize;
        let frame = input.split_to(deflated);

        let start = out.len();
        // One spare byte tells an over-long body apart from an exact fit.
        out.resize(start + self.body_length + 1, 0);

        self.inflater.reset(true);
        let status = self
            .inflater
            .decompress(&frame, &mut out[start..], FlushDecompress::Finish);
        let consumed = self.inflater.total_in() as usize;
        let inflated = self.inflater.total_out() as usize;
        out.truncate(start + inflated);

        let result = match status {
            Err(e) => Err(SlotError::encoding(format!("inflate failed: {e}"))),
            Ok(Status::StreamEnd) => {
                if consumed != deflated {
                    Err(SlotError::encoding(format!(
                        "{} trailing bytes after the compressed stream",
                        deflated - consumed
                    )))
                } else {
                    check_declared(inflated, self.body_length)
                }
            }
            Ok(_) if inflated > self.body_length => Err(SlotError::InvalidLength {
                length: inflated,
                min: 1,
                max: self.body_length,
            }),
            Ok(_) => Err(SlotError::encoding("truncated compressed stream")),
        };
        if result.is_err() {
            out.truncate(start);
        }
        result
    }

    fn close(&mut self) {
        // flate2 frees its streams on drop; closing only fences further use.
        self.closed = true;
    }
}

/// Append `payload` to `out` as a zlib stream of uncompressed blocks.
fn store(payload: &[u8], out: &mut BytesMut) {
    out.reserve(max_compressed_length(payload.len()));
    out.put_slice(&ZLIB_STORED_HEADER);
    let mut blocks = payload.chunks(ZLIB_BLOCK_LENGTH).peekable();
    while let Some(block) = blocks.next() {
        let last = blocks.peek().is_none();
        let length = block.len() as u16;
        // BFINAL in bit 0, BTYPE 00; the rest of the byte is padding.
        out.put_u8(u8::from(last));
        out.put_u16_le(length);
        out.put_u16_le(!length);
        out.put_slice(block);
    }
    out.put_u32(adler2::adler32_slice(payload));
}

impl fmt::Debug for DeflateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeflateCodec({}:{})", LENGTH_HEADER, self.body_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn encode(codec: &mut DeflateCodec, payload: &[u8]) -> BytesMut {
        let mut wire = BytesMut::new();
        codec.encode(payload, &mut wire).unwrap();
        wire
    }

    fn random_payload(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn repeated_byte_payload_round_trips() {
        let mut codec = DeflateCodec::new(1024).unwrap();
        let payload = vec![0xABu8; 1024];
        let mut wire = encode(&mut codec, &payload);
        assert!(wire.len() < payload.len(), "repetitive data should shrink");

        let mut out = BytesMut::new();
        codec.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], &payload[..]);
        assert!(wire.is_empty());
    }

    #[test]
    fn max_body_follows_the_overhead_bound() {
        let max = DeflateCodec::max_body_length(DEFAULT_FRAME_LIMIT);
        assert_eq!(max, 65_469);
        assert_eq!(LENGTH_HEADER + max_compressed_length(max), DEFAULT_FRAME_LIMIT);

        let codec = DeflateCodec::new(max).unwrap();
        assert_eq!(codec.frame_length(), DEFAULT_FRAME_LIMIT);
        assert!(DeflateCodec::new(max + 1).is_err());
        assert!(DeflateCodec::new(0).is_err());
    }

    #[test]
    fn custom_frame_limit() {
        let max = DeflateCodec::max_body_length(1500);
        assert!(DeflateCodec::with_frame_limit(max, 1500).unwrap().frame_length() <= 1500);
        assert!(DeflateCodec::with_frame_limit(max + 1, 1500).is_err());
        assert!(DeflateCodec::with_frame_limit(1, usize::MAX).is_err());
    }

    #[test]
    fn incompressible_payload_stays_within_frame_length() {
        let mut codec = DeflateCodec::new(4096).unwrap();
        for (seed, len) in [(1, 1), (2, 100), (3, 4096)] {
            let payload = random_payload(len, seed);
            let mut wire = encode(&mut codec, &payload);
            assert!(wire.len() <= codec.encoded_length(&payload));
            assert!(wire.len() <= codec.frame_length());

            let mut out = BytesMut::new();
            codec.decode(&mut wire, &mut out).unwrap();
            assert_eq!(&out[..], &payload[..]);
        }
    }

    #[test]
    fn incompressible_payloads_fit_at_block_boundaries() {
        let max = DeflateCodec::max_body_length(DEFAULT_FRAME_LIMIT);
        let mut codec = DeflateCodec::new(max).unwrap();
        let lengths = [
            16_383, 16_384, 32_766, 32_767, 32_787, 49_149, 49_150, 60_000, max - 1, max,
        ];
        for (seed, len) in lengths.into_iter().enumerate() {
            let payload = random_payload(len, seed as u64 + 10);
            let mut wire = encode(&mut codec, &payload);
            assert!(wire.len() <= codec.encoded_length(&payload), "{len} overran its bound");
            assert!(wire.len() <= DEFAULT_FRAME_LIMIT, "{len} overran the frame limit");
            assert!(codec.has_complete_frame(&wire).unwrap());

            let mut out = BytesMut::new();
            codec.decode(&mut wire, &mut out).unwrap();
            assert_eq!(&out[..], &payload[..], "{len} did not round trip");
            assert!(wire.is_empty());
        }
    }

    #[test]
    fn stored_stream_meets_the_bound_and_inflates() {
        for len in [1, 100, 16_383, 16_384, 32_767, 49_149, 65_469] {
            let payload = random_payload(len, len as u64);
            let mut stored = BytesMut::new();
            store(&payload, &mut stored);
            assert!(stored.len() <= max_compressed_length(len), "{len}");

            let mut inflater = Decompress::new(true);
            let mut out = vec![0u8; len + 1];
            let status = inflater
                .decompress(&stored, &mut out, FlushDecompress::Finish)
                .unwrap();
            assert_eq!(status, Status::StreamEnd);
            assert_eq!(inflater.total_in() as usize, stored.len());
            assert_eq!(&out[..inflater.total_out() as usize], &payload[..]);
        }
    }

    #[test]
    fn header_declares_the_compressed_length() {
        let mut codec = DeflateCodec::new(256).unwrap();
        let wire = encode(&mut codec, b"hello hello hello hello");
        assert_eq!(codec.decoded_length(&wire), Some(wire.len() - LENGTH_HEADER));
        assert!(!codec.has_complete_frame(&wire[..LENGTH_HEADER - 1]).unwrap());
        assert!(!codec.has_complete_frame(&wire[..wire.len() - 1]).unwrap());
        assert!(codec.has_complete_frame(&wire).unwrap());
    }

    #[test]
    fn hostile_length_fields_are_rejected() {
        let codec = DeflateCodec::new(256).unwrap();
        let too_long = (codec.compressed_length() as u32 + 1).to_be_bytes();
        assert!(matches!(
            codec.has_complete_frame(&too_long),
            Err(SlotError::InvalidLength { .. })
        ));
        assert!(codec.has_complete_frame(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn corrupted_body_never_decodes() {
        let mut codec = DeflateCodec::new(512).unwrap();
        let payload: Vec<u8> = (0..512u32).map(|i| (i % 7) as u8).collect();
        let clean = encode(&mut codec, &payload);
        for at in LENGTH_HEADER..clean.len() {
            let mut wire = clean.clone();
            wire[at] ^= 0x5A;
            let mut out = BytesMut::new();
            let result = codec.decode(&mut wire, &mut out);
            assert!(result.is_err(), "corruption at byte {at} decoded");
            assert!(out.is_empty());
        }
    }

    #[test]
    fn consecutive_frames_use_fresh_streams() {
        let mut codec = DeflateCodec::new(64).unwrap();
        let mut wire = BytesMut::new();
        codec.encode(b"first message", &mut wire).unwrap();
        codec.encode(b"second message", &mut wire).unwrap();

        let mut out = BytesMut::new();
        codec.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], b"first message");
        out.clear();
        codec.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], b"second message");
    }

    #[test]
    fn closed_codec_refuses_work() {
        let mut codec = DeflateCodec::new(64).unwrap();
        codec.close();
        let mut wire = BytesMut::new();
        assert!(matches!(codec.encode(b"x", &mut wire), Err(SlotError::Closed)));
    }
}
