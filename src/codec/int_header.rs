use crate::error::{Error, Result};

use super::{check_body_bounds, Codec};

/// Largest body length a 4-byte prefix can address while leaving headroom
/// for codecs that wrap this one (checksum, compression) to add their own
/// footer.
pub const MAX_BODY: usize = (i32::MAX as usize) - 5;

/// 4-byte big-endian length prefix, no footer.
pub const MAX_UDP_BODY: usize = 65531;

#[derive(Clone, Debug)]
pub struct IntHeaderCodec {
    max_body: usize,
}

impl IntHeaderCodec {
    pub fn new(max_body: usize) -> IntHeaderCodec {
        assert!(max_body <= MAX_BODY, "int header length prefix cannot address this many bytes");
        IntHeaderCodec { max_body }
    }

    pub fn udp_safe() -> IntHeaderCodec {
        IntHeaderCodec::new(MAX_UDP_BODY)
    }
}

impl Codec for IntHeaderCodec {
    fn header_len(&self) -> usize {
        4
    }

    fn footer_len(&self) -> usize {
        0
    }

    fn encoded_len(&self, body: &[u8]) -> usize {
        4 + body.len()
    }

    fn is_valid(&self, body: &[u8]) -> Result<()> {
        check_body_bounds(body, self.max_body)
    }

    fn put(&mut self, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.is_valid(body)?;
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        Ok(())
    }

    fn has_next(&self, buf: &[u8]) -> bool {
        self.decoded_len(buf).map(|len| buf.len() >= len).unwrap_or(false)
    }

    fn decoded_len(&self, buf: &[u8]) -> Option<usize> {
        if buf.len() < 4 {
            return None;
        }
        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        Some(4 + body_len)
    }

    fn get(&mut self, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
        let frame_len = self
            .decoded_len(buf)
            .expect("get() called without a complete frame; caller must check has_next() first");
        assert!(buf.len() >= frame_len, "buffer underflow after has_next() returned true");

        let body_len = frame_len - 4;
        if body_len > self.max_body {
            return Err(Error::invalid_length(format!(
                "declared body length {} exceeds configured max {}",
                body_len, self.max_body
            )));
        }

        let body = buf[4..frame_len].to_vec();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut codec = IntHeaderCodec::new(1 << 20);
        let mut buf = Vec::new();
        let body = vec![9u8; 70_000];
        codec.put(&body, &mut buf).unwrap();
        assert_eq!(buf.len(), codec.encoded_len(&body));

        assert!(codec.has_next(&buf));
        assert_eq!(codec.get(&mut buf).unwrap(), body);
    }

    #[test]
    fn declared_length_over_max_is_rejected() {
        let mut codec = IntHeaderCodec::new(16);
        // Craft a header that claims more bytes than `max_body` allows.
        let mut buf = vec![0u8, 0, 0, 64];
        buf.extend(std::iter::repeat(0u8).take(64));
        assert!(codec.has_next(&buf));
        assert!(codec.get(&mut buf).is_err());
    }
}
