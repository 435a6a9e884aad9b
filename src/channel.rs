//! Application-facing channel handles: `connect`/`bind` plus the buffer and
//! lifecycle surface. A `Channel` exclusively owns its
//! socket and processor; the application only ever touches the input and
//! output `MessageBuffer` handles and the lifecycle futures.
//!
//! Construction is split by transport (`channel::tcp`, `channel::tls`,
//! `channel::udp`) because each wires a different `Processor` behind the
//! same handle shape.

use std::sync::{Arc, Mutex};

use crate::buffer::MessageBuffer;
use crate::future::SharedFuture;

pub mod tcp;
pub mod tls;
pub mod udp;

/// *created → opened → registered → (connected | bound) → active →
/// shutting-down → closed*. `closed` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Opened,
    Registered,
    Connected,
    Bound,
    Active,
    ShuttingDown,
    Closed,
}

/// One endpoint: the owned socket and processor live behind `close_fn`; the
/// application holds this handle's buffer references until close
/// completes. Cloning shares the same underlying channel (all clones close
/// together).
#[derive(Clone)]
pub struct ChannelHandle {
    input: Arc<MessageBuffer<Vec<u8>>>,
    output: Arc<MessageBuffer<Vec<u8>>>,
    connect_future: SharedFuture,
    close_future: SharedFuture,
    close_fn: Arc<dyn Fn() + Send + Sync>,
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelHandle {
    pub(crate) fn new(
        input: Arc<MessageBuffer<Vec<u8>>>,
        output: Arc<MessageBuffer<Vec<u8>>>,
        connect_future: SharedFuture,
        close_future: SharedFuture,
        close_fn: Arc<dyn Fn() + Send + Sync>,
        initial_state: ChannelState,
    ) -> ChannelHandle {
        ChannelHandle {
            input,
            output,
            connect_future,
            close_future,
            close_fn,
            state: Arc::new(Mutex::new(initial_state)),
        }
    }

    /// The consumer handle the application reads decoded messages from.
    pub fn input_buffer(&self) -> Arc<MessageBuffer<Vec<u8>>> {
        self.input.clone()
    }

    /// The producer handle the application publishes messages to.
    pub fn output_buffer(&self) -> Arc<MessageBuffer<Vec<u8>>> {
        self.output.clone()
    }

    /// Completes once the channel has connected (client side) or the
    /// listener is bound (server side).
    pub fn connect_future(&self) -> SharedFuture {
        self.connect_future.clone()
    }

    /// Alias for `connect_future()` on the server side, for callers that
    /// prefer a `bind_future` name on the listening side.
    pub fn bind_future(&self) -> SharedFuture {
        self.connect_future.clone()
    }

    pub fn close_future(&self) -> SharedFuture {
        self.close_future.clone()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Initiates shutdown. Idempotent: a second call observes the
    /// already-completed (or completing) close future and does nothing
    /// further.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ChannelState::ShuttingDown || *state == ChannelState::Closed {
            return;
        }
        *state = ChannelState::ShuttingDown;
        drop(state);
        (self.close_fn)();
    }
}

/// Fired once per accepted connection on a server channel.
pub trait AcceptListener: Send + Sync {
    fn connection_accepted(&self, remote: std::net::SocketAddr, channel: ChannelHandle);
}

/// Fired once a channel's close future completes, successfully or not.
pub trait CloseListener: Send + Sync {
    fn channel_closed(&self, cause: Option<Arc<crate::error::Error>>);
}

/// Registers `listener` to run (inline, on whichever thread completes the
/// close future — never the event-loop thread, since `close_future`'s
/// `on_complete` callback only runs settle-time logic, not socket I/O) when
/// `channel` closes.
pub fn on_close(channel: &ChannelHandle, listener: Arc<dyn CloseListener>) {
    channel.close_future().on_complete(move |result| {
        listener.channel_closed(result.err());
    });
}
