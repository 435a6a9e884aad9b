use std::io::Write;

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::error::{Error, Result};

use super::int_header::IntHeaderCodec;
use super::Codec;

/// UDP-safe body cap for the deflate variant.
pub const DEFLATE_MAX_UDP_BODY: usize = 65499;
/// UDP-safe body cap for the LZ4 variant.
pub const LZ4_MAX_UDP_BODY: usize = 65252;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Deflate,
    Lz4,
}

/// Wraps `IntHeaderCodec`; the body is compressed before the length prefix
/// is written on encode, and decompressed after the frame is sliced off on
/// decode. `max_body` bounds the *uncompressed* size, matching what the
/// application actually sent.
#[derive(Clone)]
pub struct CompressionCodec {
    inner: IntHeaderCodec,
    algorithm: Algorithm,
    max_body: usize,
}

impl CompressionCodec {
    pub fn new(max_body: usize, algorithm: Algorithm) -> CompressionCodec {
        // The compressed payload can in principle exceed the uncompressed
        // size (incompressible input plus framing overhead); give the inner
        // int-header codec enough headroom rather than cap it identically.
        CompressionCodec {
            inner: IntHeaderCodec::new(max_body + max_body / 8 + 64),
            algorithm,
            max_body,
        }
    }

    fn compress(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            Algorithm::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(body)
                    .map_err(|e| Error::invalid_encoding(format!("deflate compress failed: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| Error::invalid_encoding(format!("deflate compress failed: {e}")))
            }
            Algorithm::Lz4 => Ok(lz4_flex::block::compress_prepend_size(body)),
        }
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            Algorithm::Deflate => {
                let mut decoder = DeflateDecoder::new(Vec::new());
                decoder
                    .write_all(payload)
                    .map_err(|e| Error::invalid_encoding(format!("deflate decompress failed: {e}")))?;
                decoder
                    .finish()
                    .map_err(|e| Error::invalid_encoding(format!("deflate decompress failed: {e}")))
            }
            Algorithm::Lz4 => lz4_flex::block::decompress_size_prepended(payload)
                .map_err(|e| Error::invalid_encoding(format!("lz4 decompress failed: {e}"))),
        }
    }
}

impl Codec for CompressionCodec {
    fn header_len(&self) -> usize {
        self.inner.header_len()
    }

    fn footer_len(&self) -> usize {
        0
    }

    fn encoded_len(&self, body: &[u8]) -> usize {
        // Only knowable after compressing; callers needing an exact answer
        // should compress first. This upper-bounds it for capacity planning.
        self.inner.header_len() + body.len()
    }

    fn is_valid(&self, body: &[u8]) -> Result<()> {
        super::check_body_bounds(body, self.max_body)
    }

    fn put(&mut self, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.is_valid(body)?;
        let compressed = self.compress(body)?;
        self.inner.put(&compressed, out)
    }

    fn has_next(&self, buf: &[u8]) -> bool {
        self.inner.has_next(buf)
    }

    fn decoded_len(&self, buf: &[u8]) -> Option<usize> {
        self.inner.decoded_len(buf)
    }

    fn get(&mut self, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
        let compressed = self.inner.get(buf)?;
        let body = self.decompress(&compressed)?;

        if body.len() > self.max_body {
            return Err(Error::invalid_length(format!(
                "decompressed body of {} bytes exceeds max {}",
                body.len(),
                self.max_body
            )));
        }

        Ok(body)
    }

    fn try_clone(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }

    fn max_udp_payload(&self) -> Option<usize> {
        Some(match self.algorithm {
            Algorithm::Deflate => DEFLATE_MAX_UDP_BODY,
            Algorithm::Lz4 => LZ4_MAX_UDP_BODY,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_deflate() {
        let mut codec = CompressionCodec::new(1 << 16, Algorithm::Deflate);
        let mut buf = Vec::new();
        let body = vec![b'a'; 4096];
        codec.put(&body, &mut buf).unwrap();
        assert!(codec.has_next(&buf));
        assert_eq!(codec.get(&mut buf).unwrap(), body);
        // Highly repetitive input should compress well below its raw size.
        assert!(buf.len() < body.len());
    }

    #[test]
    fn round_trip_lz4() {
        let mut codec = CompressionCodec::new(1 << 16, Algorithm::Lz4);
        let mut buf = Vec::new();
        let body = vec![b'z'; 4096];
        codec.put(&body, &mut buf).unwrap();
        assert!(codec.has_next(&buf));
        assert_eq!(codec.get(&mut buf).unwrap(), body);
    }

    #[test]
    fn round_trip_incompressible() {
        let mut codec = CompressionCodec::new(1 << 16, Algorithm::Deflate);
        let mut buf = Vec::new();
        let body: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        codec.put(&body, &mut buf).unwrap();
        assert_eq!(codec.get(&mut buf).unwrap(), body);
    }
}
