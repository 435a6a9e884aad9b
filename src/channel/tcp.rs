use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use crate::buffer::MessageBuffer;
use crate::config::{ChannelConfig, InputFanIn, QueueKind};
use crate::future;
use crate::net::tcp::TcpStream;
use crate::processor::tcp::TcpProcessor;

use super::{AcceptListener, ChannelHandle, ChannelState};

fn new_buffer(config: &ChannelConfig) -> Arc<MessageBuffer<Vec<u8>>> {
    let capacity = config.buffer_capacity;
    match config.queue_kind {
        QueueKind::Ring => Arc::new(MessageBuffer::ring(capacity, || config.make_slot())),
        QueueKind::Blocking => Arc::new(MessageBuffer::blocking(capacity, || config.make_slot())),
    }
}

fn input_buffer(config: &ChannelConfig) -> Arc<MessageBuffer<Vec<u8>>> {
    match &config.input_fan_in {
        InputFanIn::PerChannel => new_buffer(config),
        InputFanIn::Shared(shared) => shared.clone(),
    }
}

/// Connects to `addr` and returns a channel whose `connect_future`
/// completes as soon as the processor is registered with the pool (the
/// underlying OS connect is performed synchronously by `TcpStream::connect`
/// before that, matching the non-blocking-socket-after-connect shape the
/// rest of this crate's `net` layer already uses).
pub fn connect(config: &ChannelConfig, addr: impl ToSocketAddrs) -> io::Result<ChannelHandle> {
    let stream = TcpStream::connect(addr)?;
    wrap(config, stream, true)
}

fn wrap(config: &ChannelConfig, stream: TcpStream, initiate: bool) -> io::Result<ChannelHandle> {
    config.apply_socket_buffer_sizes(&stream);

    let input = input_buffer(config);
    let output = new_buffer(config);

    let (close_promise, close_future) = future::promise();
    let processor = TcpProcessor::new(
        stream,
        config.pool.next(),
        config.new_codec(),
        input.clone(),
        output.clone(),
        config.new_limiter(),
        close_promise,
    );
    processor.register()?;
    if initiate {
        processor.prime_write();
    }

    let (connect_promise, connect_future) = future::promise();
    connect_promise.success();

    let close_fn: Arc<dyn Fn() + Send + Sync> = {
        let processor = processor.clone();
        Arc::new(move || processor.close())
    };

    let handle = ChannelHandle::new(input, output, connect_future, close_future, close_fn, ChannelState::Active);
    Ok(handle)
}

/// Binds a TCP server socket. `on_accept` fires once per accepted
/// connection with the remote address and a fully active channel handle.
pub fn bind(config: Arc<ChannelConfig>, addr: impl ToSocketAddrs, on_accept: Arc<dyn AcceptListener>) -> io::Result<crate::acceptor::ServerHandle> {
    let pool = config.pool.clone();
    crate::acceptor::bind(&pool, addr, move |stream, remote| match wrap(&config, stream, false) {
        Ok(channel) => on_accept.connection_accepted(remote, channel),
        Err(e) => log::warn!("failed to wire accepted tcp connection: {e}"),
    })
}
