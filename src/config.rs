use std::sync::Arc;

use crate::codec::checksum::{ChecksumCodec, Digest};
use crate::codec::compression::{Algorithm, CompressionCodec};
use crate::codec::int_header::IntHeaderCodec;
use crate::codec::Codec;
use crate::pool::SelectorPool;
use crate::ratelimit::{Bucket, Limiter, NullLimiter, Unit};

/// Where a queue slot's backing allocation comes from. There is no real
/// off-heap distinction available through safe `std::net`; "direct" means
/// the slot's `Vec<u8>` is pre-sized to `body_length` and never touched by
/// the allocator again for the life of the slot, which is what the option
/// buys in practice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Direct,
    Heap,
}

impl Default for BufferKind {
    fn default() -> BufferKind {
        BufferKind::Direct
    }
}

/// Which `Backend` implementation backs a channel's message buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Ring,
    Blocking,
}

impl Default for QueueKind {
    fn default() -> QueueKind {
        QueueKind::Ring
    }
}

/// Whether accepted connections share one input buffer (fan-in) or each
/// gets its own.
#[derive(Clone)]
pub enum InputFanIn {
    PerChannel,
    Shared(Arc<crate::buffer::MessageBuffer<Vec<u8>>>),
}

impl Default for InputFanIn {
    fn default() -> InputFanIn {
        InputFanIn::PerChannel
    }
}

fn make_codec(body_length: usize) -> Box<dyn Codec> {
    Box::new(IntHeaderCodec::new(body_length))
}

/// Immutable, fully-resolved channel configuration produced by
/// `ChannelBuilder::build`.
pub struct ChannelConfig {
    pub pool: Arc<SelectorPool>,
    pub buffer_capacity: usize,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub buffer_kind: BufferKind,
    pub queue_kind: QueueKind,
    pub input_fan_in: InputFanIn,
    codec_factory: Arc<dyn Fn() -> Box<dyn Codec> + Send + Sync>,
    limiter_factory: Arc<dyn Fn() -> Box<dyn Limiter> + Send + Sync>,
    pub tls_context: Option<Arc<crate::processor::tls::TlsContext>>,
}

impl ChannelConfig {
    pub fn new_codec(&self) -> Box<dyn Codec> {
        (self.codec_factory)()
    }

    pub fn new_limiter(&self) -> Box<dyn Limiter> {
        (self.limiter_factory)()
    }

    pub fn make_slot(&self) -> Vec<u8> {
        match self.buffer_kind {
            BufferKind::Direct => Vec::with_capacity(self.receive_buffer_size.min(65536)),
            BufferKind::Heap => Vec::new(),
        }
    }

    /// Applies `sendBufferSize`/`receiveBufferSize` to a freshly connected
    /// or accepted stream socket. Stream channels only, per spec.
    pub fn apply_socket_buffer_sizes(&self, stream: &crate::net::tcp::TcpStream) {
        if let Err(e) = stream.set_send_buffer_size(self.send_buffer_size) {
            log::warn!("failed to set SO_SNDBUF to {}: {e}", self.send_buffer_size);
        }
        if let Err(e) = stream.set_recv_buffer_size(self.receive_buffer_size) {
            log::warn!("failed to set SO_RCVBUF to {}: {e}", self.receive_buffer_size);
        }
    }
}

/// Builder for `ChannelConfig`, implementing every option the channel
/// builder supports. `pool` is the only required field.
pub struct ChannelBuilder {
    pool: Arc<SelectorPool>,
    buffer_capacity: usize,
    send_buffer_size: usize,
    receive_buffer_size: usize,
    buffer_kind: BufferKind,
    queue_kind: QueueKind,
    input_fan_in: InputFanIn,
    codec_factory: Arc<dyn Fn() -> Box<dyn Codec> + Send + Sync>,
    limiter_factory: Arc<dyn Fn() -> Box<dyn Limiter> + Send + Sync>,
    tls_context: Option<Arc<crate::processor::tls::TlsContext>>,
}

impl ChannelBuilder {
    pub fn new(pool: Arc<SelectorPool>) -> ChannelBuilder {
        ChannelBuilder {
            pool,
            buffer_capacity: 256,
            send_buffer_size: 65535,
            receive_buffer_size: 65535,
            buffer_kind: BufferKind::default(),
            queue_kind: QueueKind::default(),
            input_fan_in: InputFanIn::default(),
            codec_factory: Arc::new(|| make_codec(65535)),
            limiter_factory: Arc::new(|| Box::new(NullLimiter)),
            tls_context: None,
        }
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn use_direct_buffer(mut self) -> Self {
        self.buffer_kind = BufferKind::Direct;
        self
    }

    pub fn use_heap_buffer(mut self) -> Self {
        self.buffer_kind = BufferKind::Heap;
        self
    }

    pub fn use_ring_buffer(mut self) -> Self {
        self.queue_kind = QueueKind::Ring;
        self
    }

    pub fn use_blocking_queue(mut self) -> Self {
        self.queue_kind = QueueKind::Blocking;
        self
    }

    pub fn use_single_input_buffer(mut self, shared: Arc<crate::buffer::MessageBuffer<Vec<u8>>>) -> Self {
        self.input_fan_in = InputFanIn::Shared(shared);
        self
    }

    pub fn use_multiple_input_buffers(mut self) -> Self {
        self.input_fan_in = InputFanIn::PerChannel;
        self
    }

    pub fn message_codec(mut self, factory: impl Fn() -> Box<dyn Codec> + Send + Sync + 'static) -> Self {
        self.codec_factory = Arc::new(factory);
        self
    }

    /// Shorthand for the default int-header codec with the given body
    /// length cap.
    pub fn message_length(mut self, body_length: usize) -> Self {
        self.codec_factory = Arc::new(move || make_codec(body_length));
        self
    }

    pub fn checksum_codec(mut self, body_length: usize, digest: Digest) -> Self {
        self.codec_factory = Arc::new(move || Box::new(ChecksumCodec::new(body_length, digest)));
        self
    }

    pub fn compression_codec(mut self, body_length: usize, algorithm: Algorithm) -> Self {
        self.codec_factory = Arc::new(move || Box::new(CompressionCodec::new(body_length, algorithm)));
        self
    }

    pub fn rate_limiter(mut self, factory: impl Fn() -> Box<dyn Limiter> + Send + Sync + 'static) -> Self {
        self.limiter_factory = Arc::new(factory);
        self
    }

    /// Shorthand for a token-bucket limiter at the given rate.
    pub fn rate_limit(mut self, value: f64, unit: Unit) -> Self {
        self.limiter_factory = Arc::new(move || Box::new(Bucket::new(value, unit)));
        self
    }

    pub fn tls_context(mut self, context: Arc<crate::processor::tls::TlsContext>) -> Self {
        self.tls_context = Some(context);
        self
    }

    pub fn build(self) -> ChannelConfig {
        ChannelConfig {
            pool: self.pool,
            buffer_capacity: self.buffer_capacity,
            send_buffer_size: self.send_buffer_size,
            receive_buffer_size: self.receive_buffer_size,
            buffer_kind: self.buffer_kind,
            queue_kind: self.queue_kind,
            input_fan_in: self.input_fan_in,
            codec_factory: self.codec_factory,
            limiter_factory: self.limiter_factory,
            tls_context: self.tls_context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let pool = SelectorPool::open("config-test", 1).unwrap();
        let config = ChannelBuilder::new(pool).build();
        assert_eq!(config.buffer_capacity, 256);
        assert_eq!(config.send_buffer_size, 65535);
        assert_eq!(config.receive_buffer_size, 65535);
        assert_eq!(config.buffer_kind, BufferKind::Direct);
        assert_eq!(config.queue_kind, QueueKind::Ring);
    }

    #[test]
    fn message_length_shorthand_builds_int_header_codec() {
        let pool = SelectorPool::open("config-test-2", 1).unwrap();
        let config = ChannelBuilder::new(pool).message_length(1024).build();
        let mut codec = config.new_codec();
        let mut buf = Vec::new();
        codec.put(b"hi", &mut buf).unwrap();
        assert!(codec.has_next(&buf));
    }
}
