use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use crate::buffer::MessageBuffer;
use crate::config::{ChannelConfig, InputFanIn, QueueKind};
use crate::error::Error;
use crate::future;
use crate::net::tcp::TcpStream;
use crate::processor::tls::{TlsContext, TlsProcessor};

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

fn tls_context(config: &ChannelConfig) -> io::Result<Arc<TlsContext>> {
    config
        .tls_context
        .clone()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "channel config carries no tls context"))
}

/// Connects to `addr` and drives the TLS handshake as part of channel setup.
/// `connect_future` completes once the handshake plumbing is registered with
/// the pool; the handshake itself is primed once right after registration
/// (the client side initiates, so nothing else would ever send
/// `ClientHello`) and then continues opportunistically on readable/writable
/// events, same as for an accepted connection.
pub fn connect(config: &ChannelConfig, addr: impl ToSocketAddrs) -> io::Result<ChannelHandle> {
    let context = tls_context(config)?;
    let stream = TcpStream::connect(addr)?;
    wrap(config, &context, stream, true)
}

fn wrap(config: &ChannelConfig, context: &TlsContext, stream: TcpStream, initiate: bool) -> io::Result<ChannelHandle> {
    config.apply_socket_buffer_sizes(&stream);

    let input = input_buffer(config);
    let output = new_buffer(config);

    let (close_promise, close_future) = future::promise();
    let processor = TlsProcessor::new(
        stream,
        config.pool.next(),
        context,
        config.new_codec(),
        input.clone(),
        output.clone(),
        config.new_limiter(),
        close_promise,
    )
    .map_err(|e| io::Error::from(Error::from(e)))?;
    processor.register()?;
    if initiate {
        processor.prime_handshake();
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

/// Binds a TLS server socket. Each accepted TCP connection gets its own
/// fresh `rustls::ServerConnection` from `config`'s `TlsContext`.
pub fn bind(config: Arc<ChannelConfig>, addr: impl ToSocketAddrs, on_accept: Arc<dyn AcceptListener>) -> io::Result<crate::acceptor::ServerHandle> {
    let context = tls_context(&config)?;
    let pool = config.pool.clone();
    crate::acceptor::bind(&pool, addr, move |stream, remote| match wrap(&config, &context, stream, false) {
        Ok(channel) => on_accept.connection_accepted(remote, channel),
        Err(e) => log::warn!("failed to wire accepted tls connection: {e}"),
    })
}
