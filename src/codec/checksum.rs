use adler::Adler32;
use twox_hash::XxHash32;
use std::hash::Hasher;

use crate::error::{Error, Result};

use super::int_header::IntHeaderCodec;
use super::Codec;

/// Digest algorithm appended as a 4-byte footer over the body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Digest {
    Crc32,
    Adler32,
    XxHash,
}

impl Digest {
    fn compute(self, body: &[u8]) -> u32 {
        match self {
            Digest::Crc32 => crc32fast::hash(body),
            Digest::Adler32 => {
                let mut hasher = Adler32::new();
                hasher.write_slice(body);
                hasher.checksum()
            }
            Digest::XxHash => {
                let mut hasher = XxHash32::with_seed(0);
                hasher.write(body);
                hasher.finish() as u32
            }
        }
    }
}

/// Wraps `IntHeaderCodec`, appending a 4-byte digest over the body. Rejects
/// mismatched checksums with `InvalidEncoding`.
#[derive(Clone)]
pub struct ChecksumCodec {
    inner: IntHeaderCodec,
    digest: Digest,
}

impl ChecksumCodec {
    pub fn new(max_body: usize, digest: Digest) -> ChecksumCodec {
        // The inner int-header frame carries body + 4-byte digest.
        ChecksumCodec {
            inner: IntHeaderCodec::new(max_body + 4),
            digest,
        }
    }
}

impl Codec for ChecksumCodec {
    fn header_len(&self) -> usize {
        self.inner.header_len()
    }

    fn footer_len(&self) -> usize {
        4
    }

    fn encoded_len(&self, body: &[u8]) -> usize {
        self.inner.header_len() + body.len() + 4
    }

    fn is_valid(&self, body: &[u8]) -> Result<()> {
        self.inner.is_valid(body)
    }

    fn put(&mut self, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.is_valid(body)?;
        let digest = self.digest.compute(body);

        let mut payload = Vec::with_capacity(body.len() + 4);
        payload.extend_from_slice(body);
        payload.extend_from_slice(&digest.to_be_bytes());

        self.inner.put(&payload, out)
    }

    fn has_next(&self, buf: &[u8]) -> bool {
        self.inner.has_next(buf)
    }

    fn decoded_len(&self, buf: &[u8]) -> Option<usize> {
        self.inner.decoded_len(buf)
    }

    fn get(&mut self, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
        let payload = self.inner.get(buf)?;
        if payload.len() < 4 {
            return Err(Error::invalid_encoding("frame too short to carry a checksum"));
        }

        let split = payload.len() - 4;
        let (body, footer) = payload.split_at(split);
        let expected = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let actual = self.digest.compute(body);

        if expected != actual {
            return Err(Error::invalid_encoding(format!(
                "checksum mismatch: expected {:#x}, computed {:#x}",
                expected, actual
            )));
        }

        Ok(body.to_vec())
    }

    fn try_clone(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_crc32() {
        let mut codec = ChecksumCodec::new(1024, Digest::Crc32);
        let mut buf = Vec::new();
        codec.put(b"hello world", &mut buf).unwrap();
        assert_eq!(codec.get(&mut buf).unwrap(), b"hello world");
    }

    #[test]
    fn round_trip_adler32() {
        let mut codec = ChecksumCodec::new(1024, Digest::Adler32);
        let mut buf = Vec::new();
        codec.put(b"hello world", &mut buf).unwrap();
        assert_eq!(codec.get(&mut buf).unwrap(), b"hello world");
    }

    #[test]
    fn round_trip_xxhash() {
        let mut codec = ChecksumCodec::new(1024, Digest::XxHash);
        let mut buf = Vec::new();
        codec.put(b"hello world", &mut buf).unwrap();
        assert_eq!(codec.get(&mut buf).unwrap(), b"hello world");
    }

    #[test]
    fn bit_flip_is_rejected() {
        let mut codec = ChecksumCodec::new(1024, Digest::Crc32);
        let mut buf = Vec::new();
        codec.put(b"hello world", &mut buf).unwrap();

        // Flip one bit inside the body (after the 4-byte header).
        buf[5] ^= 0x01;

        assert!(matches!(codec.get(&mut buf), Err(Error::InvalidEncoding(_))));
    }
}
