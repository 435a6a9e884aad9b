use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use crate::buffer::MessageBuffer;
use crate::config::{ChannelConfig, InputFanIn, QueueKind};
use crate::future;
use crate::net::udp::UdpSocket;
use crate::processor::udp::UdpProcessor;

use super::{ChannelHandle, ChannelState};

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

fn wrap(config: &ChannelConfig, socket: UdpSocket) -> io::Result<ChannelHandle> {
    let input = input_buffer(config);
    let output = new_buffer(config);

    let (close_promise, close_future) = future::promise();
    let processor = UdpProcessor::new(
        socket,
        config.pool.next(),
        config.new_codec(),
        input.clone(),
        output.clone(),
        config.new_limiter(),
        close_promise,
    );
    processor.register()?;

    let (connect_promise, connect_future) = future::promise();
    connect_promise.success();

    let close_fn: Arc<dyn Fn() + Send + Sync> = {
        let processor = processor.clone();
        Arc::new(move || processor.close())
    };

    let handle = ChannelHandle::new(input, output, connect_future, close_future, close_fn, ChannelState::Active);
    Ok(handle)
}

/// Binds a local UDP socket and targets it at `remote` via `connect(2)`
/// filtering: one socket per channel, no accept loop. `UdpProcessor` reads and writes
/// through `recv`/`send` rather than `recv_from`/`send_to`, so every UDP
/// channel is inherently a single fixed peer — there is no unconnected,
/// multi-peer counterpart to `channel::tcp::bind`'s accept loop.
pub fn connect(config: &ChannelConfig, local: impl ToSocketAddrs, remote: impl ToSocketAddrs) -> io::Result<ChannelHandle> {
    let socket = UdpSocket::bind(local)?;
    socket.connect(remote)?;
    wrap(config, socket)
}
