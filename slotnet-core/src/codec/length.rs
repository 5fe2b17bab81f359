use super::{check_declared, peek_length, MessageCodec, LENGTH_HEADER, LENGTH_MASK};
use crate::error::{Result, SlotError};
use bytes::{Buf, BufMut, BytesMut};

/// Plain length-prefixed frames: `[u32 BE length][body]`.
#[derive(Debug)]
pub struct LengthCodec {
    body_length: usize,
}

impl LengthCodec {
    /// Largest body whose frame still fits the 31-bit header field.
    pub const MAX_BODY_LENGTH: usize = LENGTH_MASK as usize - LENGTH_HEADER;

    pub fn new(body_length: usize) -> Result<Self> {
        if body_length < 1 || body_length > Self::MAX_BODY_LENGTH {
            return Err(SlotError::config(format!(
                "body length {body_length} outside 1..={}",
                Self::MAX_BODY_LENGTH
            )));
        }
        Ok(Self { body_length })
    }
}

impl MessageCodec for LengthCodec {
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
        LENGTH_HEADER + self.body_length
    }

    fn encoded_length(&self, payload: &[u8]) -> usize {
        LENGTH_HEADER + payload.len()
    }

    fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        self.validate_payload(payload)?;
        out.reserve(LENGTH_HEADER + payload.len());
        out.put_u32(payload.len() as u32);
        out.extend_from_slice(payload);
        Ok(())
    }

    fn has_complete_frame(&self, input: &[u8]) -> Result<bool> {
        let Some(length) = peek_length(input) else {
            return Ok(false);
        };
        check_declared(length, self.body_length)?;
        Ok(input.len() >= LENGTH_HEADER + length)
    }

    fn decoded_length(&self, input: &[u8]) -> Option<usize> {
        peek_length(input)
    }

    fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<()> {
        if !self.has_complete_frame(&input[..])? {
            return Err(SlotError::encoding("incomplete frame"));
        }
        let length = (input.get_u32() & LENGTH_MASK) as usize;
        out.extend_from_slice(&input[..length]);
        input.advance(length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let mut codec = LengthCodec::new(16).unwrap();
        let mut wire = BytesMut::new();
        codec.encode(b"abc", &mut wire).unwrap();
        assert_eq!(&wire[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(codec.frame_length(), 20);
    }

    #[test]
    fn partial_frames_are_not_complete() {
        let mut codec = LengthCodec::new(16).unwrap();
        let mut wire = BytesMut::new();
        codec.encode(b"hello", &mut wire).unwrap();
        for cut in 0..wire.len() {
            assert!(!codec.has_complete_frame(&wire[..cut]).unwrap());
        }
        assert!(codec.has_complete_frame(&wire).unwrap());
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut codec = LengthCodec::new(16).unwrap();
        let mut wire = BytesMut::new();
        codec.encode(b"one", &mut wire).unwrap();
        codec.encode(b"two!", &mut wire).unwrap();

        let mut out = BytesMut::new();
        codec.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], b"one");
        assert_eq!(codec.decoded_length(&wire), Some(4));

        out.clear();
        codec.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], b"two!");
        assert!(wire.is_empty());
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        let mut codec = LengthCodec::new(4).unwrap();
        let mut wire = BytesMut::new();
        assert!(codec.encode(b"", &mut wire).is_err());
        assert!(codec.encode(b"12345", &mut wire).is_err());
        assert!(wire.is_empty());

        assert!(matches!(
            codec.has_complete_frame(&[0, 0, 0, 5]),
            Err(SlotError::InvalidLength { length: 5, .. })
        ));
        assert!(codec.has_complete_frame(&[0, 0, 0, 0]).is_err());
        assert!(LengthCodec::new(0).is_err());
    }
}
