use crate::error::{Error, Result};

use super::{check_body_bounds, Codec};

/// 2-byte big-endian length prefix, no footer. Body length is capped at
/// 65525 so a frame still fits a maximum UDP payload (65527) once the
/// header is added.
pub const MAX_UDP_BODY: usize = 65525;

#[derive(Clone, Debug)]
pub struct ShortHeaderCodec {
    max_body: usize,
}

impl ShortHeaderCodec {
    pub fn new(max_body: usize) -> ShortHeaderCodec {
        assert!(max_body <= u16::MAX as usize, "short header length prefix cannot address more than u16::MAX bytes");
        ShortHeaderCodec { max_body }
    }

    pub fn udp_safe() -> ShortHeaderCodec {
        ShortHeaderCodec::new(MAX_UDP_BODY)
    }
}

impl Codec for ShortHeaderCodec {
    fn header_len(&self) -> usize {
        2
    }

    fn footer_len(&self) -> usize {
        0
    }

    fn encoded_len(&self, body: &[u8]) -> usize {
        2 + body.len()
    }

    fn is_valid(&self, body: &[u8]) -> Result<()> {
        check_body_bounds(body, self.max_body)
    }

    fn put(&mut self, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.is_valid(body)?;
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        Ok(())
    }

    fn has_next(&self, buf: &[u8]) -> bool {
        self.decoded_len(buf).map(|len| buf.len() >= len).unwrap_or(false)
    }

    fn decoded_len(&self, buf: &[u8]) -> Option<usize> {
        if buf.len() < 2 {
            return None;
        }
        let body_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        Some(2 + body_len)
    }

    fn get(&mut self, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
        let frame_len = self
            .decoded_len(buf)
            .expect("get() called without a complete frame; caller must check has_next() first");
        assert!(buf.len() >= frame_len, "buffer underflow after has_next() returned true");

        let body_len = frame_len - 2;
        if body_len > self.max_body {
            return Err(Error::invalid_length(format!(
                "declared body length {} exceeds configured max {}",
                body_len, self.max_body
            )));
        }

        let body = buf[2..frame_len].to_vec();
        buf.drain(..frame_len);
        Ok(body)
    }

    fn try_clone(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }

    fn max_udp_payload(&self) -> Option<usize> {
        Some(self.max_body.min(MAX_UDP_BODY))
    }
}
