use super::{check_declared, peek_length, MessageCodec, LENGTH_HEADER, LENGTH_MASK};
use crate::error::{Result, SlotError};
use bytes::{Buf, BufMut, BytesMut};

const CRC_FOOTER: usize = 4;

/// Length-prefixed frames with a CRC-32C footer over the body:
/// `[u32 BE length][body][u32 BE crc32c(body)]`.
#[derive(Debug)]
pub struct ChecksumCodec {
    body_length: usize,
}

impl ChecksumCodec {
    pub const MAX_BODY_LENGTH: usize = LENGTH_MASK as usize - LENGTH_HEADER - CRC_FOOTER;

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

impl MessageCodec for ChecksumCodec {
    fn header_length(&self) -> usize {
        LENGTH_HEADER
    }

    fn body_length(&self) -> usize {
        self.body_length
    }

    fn footer_length(&self) -> usize {
        CRC_FOOTER
    }

    fn frame_length(&self) -> usize {
        LENGTH_HEADER + self.body_length + CRC_FOOTER
    }

    fn encoded_length(&self, payload: &[u8]) -> usize {
        LENGTH_HEADER + payload.len() + CRC_FOOTER
    }

    fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        self.validate_payload(payload)?;
        out.reserve(self.encoded_length(payload));
        out.put_u32(payload.len() as u32);
        out.extend_from_slice(payload);
        out.put_u32(crc32c::crc32c(payload));
        Ok(())
    }

    fn has_complete_frame(&self, input: &[u8]) -> Result<bool> {
        let Some(length) = peek_length(input) else {
            return Ok(false);
        };
        check_declared(length, self.body_length)?;
        Ok(input.len() >= LENGTH_HEADER + length + CRC_FOOTER)
    }

    fn decoded_length(&self, input: &[u8]) -> Option<usize> {
        peek_length(input)
    }

    fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<()> {
        if !self.has_complete_frame(&input[..])? {
            return Err(SlotError::encoding("incomplete frame"));
        }
        let length = (input.get_u32() & LENGTH_MASK) as usize;
        let body = input.split_to(length);
        let expected = input.get_u32();
        let actual = crc32c::crc32c(&body);
        if actual != expected {
            return Err(SlotError::encoding(format!(
                "checksum mismatch: {actual:#010x} != {expected:#010x}"
            )));
        }
        out.extend_from_slice(&body);
        Ok(())
    }
}
