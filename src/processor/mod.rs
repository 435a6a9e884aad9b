//! Per-channel processor state: owned codec, owned rate-limit bucket,
//! references to the channel's input/output buffers, and a writable
//! interest mirror. Every method here runs exclusively on the channel's
//! owning selector thread.

use crate::epoll::Ready;
use crate::pool::Handler;

pub mod tcp;
pub mod tls;
pub mod udp;

/// The `pool::Handler` specialization every processor implements. Readable
/// means "drain the socket into the input queue until `WouldBlock`";
/// writable means "drain the output queue onto the socket until `WouldBlock`
/// or the queue empties".
pub trait Processor: Send + Sync {
    fn on_readable(&self);
    fn on_writable(&self);

    /// A peer hangup or socket error. Default treats it the same as a
    /// readable event so a processor notices EOF on its next read.
    fn on_error(&self) {
        self.on_readable();
    }

    fn initial_interest(&self) -> Ready {
        Ready::readable()
    }
}

impl<P: Processor> Handler for P {
    fn on_ready(&self, readiness: Ready) {
        if readiness.is_error() || readiness.is_hup() {
            self.on_error();
            return;
        }
        if readiness.is_readable() {
            self.on_readable();
        }
        if readiness.is_writable() {
            self.on_writable();
        }
    }
}
