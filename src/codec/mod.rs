//! Pluggable message framing: `[header][body][footer]`.
//!
//! A `Codec` owns per-direction scratch state sufficient to encode or decode
//! one message at a time. Two concurrent encodes (or two concurrent decodes)
//! on the same instance are not allowed; encode and decode may run on
//! different threads concurrently. `Codec::try_clone` produces an
//! independent instance per channel per direction so each direction gets its
//! own scratch state.

use crate::error::{Error, Result};

pub mod checksum;
pub mod compression;
pub mod int_header;
pub mod short_header;

/// Framer/parser contract. `buf` in `has_next`/`decoded_len`/`get` is the
/// processor's accumulated `in_buf`: bytes read from the wire but not yet
/// consumed. `get` must only be called after `has_next` returned `true` for
/// the same buffer contents — calling it otherwise on an underflowing buffer
/// is a precondition violation, and this
/// trait's implementations panic rather than fail silently, so a codec bug
/// surfaces immediately instead of corrupting the message stream.
pub trait Codec: Send {
    /// Length of the frame header in bytes.
    fn header_len(&self) -> usize;

    /// Length of the frame footer in bytes (0 unless the codec appends a
    /// checksum).
    fn footer_len(&self) -> usize;

    /// Total bytes `put` will write for a body of this size, including
    /// header and footer.
    fn encoded_len(&self, body: &[u8]) -> usize;

    /// Rejects empty and oversize bodies with `InvalidLength` before any
    /// encoding work begins.
    fn is_valid(&self, body: &[u8]) -> Result<()>;

    /// Encodes `body` as one complete frame, appended to `out`.
    fn put(&mut self, body: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Non-destructive: peeks at the header (and, where relevant, the
    /// footer) without consuming any of `buf`. Returns `true` only if a
    /// complete frame is present.
    fn has_next(&self, buf: &[u8]) -> bool;

    /// Total length of the next complete frame in `buf`, once its header has
    /// been parsed. `None` if the header itself has not fully arrived yet.
    fn decoded_len(&self, buf: &[u8]) -> Option<usize>;

    /// Consumes one complete frame from the front of `buf` (draining it) and
    /// returns the decoded body. Panics if `buf` does not hold a complete
    /// frame; callers must check `has_next` first.
    fn get(&mut self, buf: &mut Vec<u8>) -> Result<Vec<u8>>;

    /// Produces an independent instance with the same configuration but no
    /// shared scratch state, so each channel direction gets its own codec.
    fn try_clone(&self) -> Box<dyn Codec>;

    /// The largest body this codec can encode into a single UDP datagram, if
    /// it is meaningful to use this codec over UDP at all.
    fn max_udp_payload(&self) -> Option<usize> {
        None
    }
}

pub(crate) fn check_body_bounds(body: &[u8], max: usize) -> Result<()> {
    if body.is_empty() {
        return Err(Error::invalid_length("body must not be empty"));
    }
    if body.len() > max {
        return Err(Error::invalid_length(format!(
            "body of {} bytes exceeds max {}",
            body.len(),
            max
        )));
    }
    Ok(())
}
