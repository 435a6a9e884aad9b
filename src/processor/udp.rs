use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::buffer::MessageBuffer;
use crate::codec::Codec;
use crate::epoll::{EpollOpt, Ready, Token};
use crate::future::Promise;
use crate::net::udp::UdpSocket;
use crate::pool::SelectorThread;
use crate::ratelimit::{Admission, Limiter};

use super::Processor;

/// Datagram-oriented counterpart to `TcpProcessor`: one decode per readable
/// event, one encode per writable event, no cross-event buffering.
pub struct UdpProcessor {
    socket: UdpSocket,
    thread: Arc<SelectorThread>,
    token: Mutex<Option<Token>>,
    self_weak: Mutex<Weak<UdpProcessor>>,

    codec: Mutex<Box<dyn Codec>>,
    input: Arc<MessageBuffer<Vec<u8>>>,
    output: Arc<MessageBuffer<Vec<u8>>>,
    limiter: Mutex<Box<dyn Limiter>>,

    writable_interest: AtomicBool,
    dropped_datagrams: AtomicU64,
    closing: AtomicBool,
    close: Promise,
}

const MAX_DATAGRAM: usize = 65535;

impl UdpProcessor {
    pub fn new(
        socket: UdpSocket,
        thread: Arc<SelectorThread>,
        codec: Box<dyn Codec>,
        input: Arc<MessageBuffer<Vec<u8>>>,
        output: Arc<MessageBuffer<Vec<u8>>>,
        limiter: Box<dyn Limiter>,
        close: Promise,
    ) -> Arc<UdpProcessor> {
        let processor = Arc::new(UdpProcessor {
            socket,
            thread,
            token: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
            codec: Mutex::new(codec),
            input,
            output,
            limiter: Mutex::new(limiter),
            writable_interest: AtomicBool::new(false),
            dropped_datagrams: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            close,
        });

        *processor.self_weak.lock().unwrap() = Arc::downgrade(&processor);

        let wakeup = processor.clone();
        processor.output.attach_consumer_wakeup(Arc::new(move || wakeup.on_output_ready()));

        processor
    }

    pub fn register(self: &Arc<Self>) -> std::io::Result<Token> {
        let handler: Arc<dyn crate::pool::Handler> = self.clone();
        let token = self.thread.register(&self.socket, Ready::readable(), EpollOpt::edge(), handler)?;
        *self.token.lock().unwrap() = Some(token);
        Ok(token)
    }

    /// Count of datagrams dropped because a frame didn't parse in one pass
    /// or the input queue had no free slot.
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped_datagrams.load(Ordering::Relaxed)
    }

    /// Deregisters the socket and completes `close_future`. A second call
    /// observes `closing` already set and is a no-op.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.token.lock().unwrap().take() {
            let _ = self.thread.deregister(&self.socket, token);
        }
        self.close.success();
    }

    fn set_writable_interest(&self, want: bool) {
        if self.writable_interest.swap(want, Ordering::SeqCst) == want {
            return;
        }
        let token = match *self.token.lock().unwrap() {
            Some(t) => t,
            None => return,
        };
        let interest = if want { Ready::readable() | Ready::writable() } else { Ready::readable() };
        if let Err(e) = self.thread.reregister(&self.socket, token, interest, EpollOpt::edge()) {
            warn!("failed to reregister udp channel interest: {e}");
        }
    }

    /// Fired when the output queue transitions empty -> non-empty. Runs on
    /// whichever application thread published the datagram, so the actual
    /// interest toggle is deferred to the owning thread via the task queue.
    fn on_output_ready(&self) {
        let weak = self.self_weak.lock().unwrap().clone();
        let _ = self.thread.submit(Box::new(move |_| {
            if let Some(processor) = weak.upgrade() {
                processor.set_writable_interest(true);
            }
        }));
    }
}

impl Processor for UdpProcessor {
    fn on_readable(&self) {
        let mut datagram = vec![0u8; MAX_DATAGRAM];
        let n = match self.socket.recv(&mut datagram) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("udp recv failed: {e}");
                return;
            }
        };
        datagram.truncate(n);

        let mut codec = self.codec.lock().unwrap();
        if !codec.has_next(&datagram) {
            debug!("dropping undecodable datagram of {n} bytes");
            self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let body = match codec.get(&mut datagram) {
            Ok(body) => body,
            Err(e) => {
                debug!("dropping datagram that failed to decode: {e}");
                self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        drop(codec);

        match self.input.try_claim() {
            Some(mut slot) => {
                slot.clear();
                slot.extend_from_slice(&body);
                slot.publish();
            }
            None => {
                debug!("dropping datagram: input queue full");
                self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_writable(&self) {
        let slot = match self.output.try_next() {
            Some(slot) => slot,
            None => {
                self.set_writable_interest(false);
                return;
            }
        };

        if let Admission::Wait(_) = self.limiter.lock().unwrap().acquire(slot.len() as u64) {
            // No per-datagram timer wheel; the next writable event retries.
            // The slot stays claimed by nobody — release it back so it
            // isn't leaked, and let the sender re-publish on the next pass.
            slot.release();
            return;
        }

        let mut out = Vec::new();
        let encode_result = self.codec.lock().unwrap().put(&slot, &mut out);
        slot.release();

        if let Err(e) = encode_result {
            warn!("udp encode failed: {e}");
            return;
        }

        match self.socket.send(&out) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.set_writable_interest(true);
            }
            Err(e) => warn!("udp send failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageBuffer;
    use crate::codec::int_header::IntHeaderCodec;
    use crate::net::udp::UdpSocket;
    use crate::pool::SelectorPool;
    use crate::ratelimit::NullLimiter;

    #[test]
    fn exchanges_one_datagram() {
        let pool = SelectorPool::open("udp-processor-test", 1).unwrap();

        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_socket.connect(server_addr).unwrap();
        let client_addr = client_socket.local_addr().unwrap();
        server_socket.connect(client_addr).unwrap();

        let server_input = Arc::new(MessageBuffer::ring(4, Vec::new));
        let server_output = Arc::new(MessageBuffer::ring(4, Vec::new));
        let (close_promise, close_future) = crate::future::promise();
        let server = UdpProcessor::new(
            server_socket,
            pool.next(),
            Box::new(IntHeaderCodec::new(1024)),
            server_input.clone(),
            server_output,
            Box::new(NullLimiter),
            close_promise,
        );
        server.register().unwrap();

        let client_input = Arc::new(MessageBuffer::ring(4, Vec::new));
        let client_output = Arc::new(MessageBuffer::ring(4, Vec::new));
        let (client_close_promise, _client_close_future) = crate::future::promise();
        let client = UdpProcessor::new(
            client_socket,
            pool.next(),
            Box::new(IntHeaderCodec::new(1024)),
            client_input,
            client_output.clone(),
            Box::new(NullLimiter),
            client_close_promise,
        );
        client.register().unwrap();

        {
            let mut slot = client_output.claim();
            slot.extend_from_slice(b"ping");
            slot.publish();
        }
        client.on_writable();

        std::thread::sleep(std::time::Duration::from_millis(50));
        server.on_readable();

        let received = server_input.next();
        assert_eq!(&received[..], b"ping");
        received.release();

        assert_eq!(server.dropped_datagrams(), 0);

        server.close();
        assert!(close_future.wait().is_ok());
        server.close();

        pool.close();
    }
}
