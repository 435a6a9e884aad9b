use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::buffer::MessageBuffer;
use crate::codec::Codec;
use crate::epoll::{EpollOpt, Ready, Token};
use crate::error::Error;
use crate::future::Promise;
use crate::net::tcp::TcpStream;
use crate::pool::SelectorThread;
use crate::ratelimit::{Admission, Limiter};

use super::Processor;

/// Owns one TCP socket's framing and queue plumbing. Reused by the TLS
/// processor for its underlying wire I/O (rustls sits between this and the
/// codec there); a bare TCP channel talks the codec directly.
pub struct TcpProcessor {
    stream: TcpStream,
    thread: Arc<SelectorThread>,
    token: Mutex<Option<Token>>,
    self_weak: Mutex<Weak<TcpProcessor>>,

    in_buf: Mutex<Vec<u8>>,
    out_buf: Mutex<Vec<u8>>,
    decode_codec: Mutex<Box<dyn Codec>>,
    encode_codec: Mutex<Box<dyn Codec>>,

    input: Arc<MessageBuffer<Vec<u8>>>,
    output: Arc<MessageBuffer<Vec<u8>>>,
    limiter: Mutex<Box<dyn Limiter>>,

    writable_interest: AtomicBool,
    read_backoff: AtomicBool,
    closing: AtomicBool,
    close: Promise,
}

impl TcpProcessor {
    pub fn new(
        stream: TcpStream,
        thread: Arc<SelectorThread>,
        codec: Box<dyn Codec>,
        input: Arc<MessageBuffer<Vec<u8>>>,
        output: Arc<MessageBuffer<Vec<u8>>>,
        limiter: Box<dyn Limiter>,
        close: Promise,
    ) -> Arc<TcpProcessor> {
        let processor = Arc::new(TcpProcessor {
            stream,
            thread,
            token: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
            in_buf: Mutex::new(Vec::new()),
            out_buf: Mutex::new(Vec::new()),
            decode_codec: Mutex::new(codec.try_clone()),
            encode_codec: Mutex::new(codec),
            input,
            output,
            limiter: Mutex::new(limiter),
            writable_interest: AtomicBool::new(false),
            read_backoff: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close,
        });

        *processor.self_weak.lock().unwrap() = Arc::downgrade(&processor);

        let wakeup = processor.clone();
        processor.output.attach_consumer_wakeup(Arc::new(move || wakeup.on_output_ready()));
        let wakeup = processor.clone();
        processor.input.attach_producer_wakeup(Arc::new(move || wakeup.on_input_drained()));

        processor
    }

    pub fn register(self: &Arc<Self>) -> std::io::Result<Token> {
        let handler: Arc<dyn crate::pool::Handler> = self.clone();
        let token = self.thread.register(&self.stream, Ready::readable(), EpollOpt::edge(), handler)?;
        *self.token.lock().unwrap() = Some(token);
        Ok(token)
    }

    /// Kicks off the first write attempt on the owning thread once
    /// registered. The connect path needs this: a message queued by the
    /// application before the first readable event has nothing else to
    /// trigger its send, since `register` only arms read interest.
    pub fn prime_write(self: &Arc<Self>) {
        self.submit_on_owning_thread(|p| p.on_writable());
    }

    fn fail(&self, cause: Error) {
        warn!("tcp channel closing: {cause}");
        self.closing.store(true, Ordering::SeqCst);
        self.close.fail(cause);
        self.shutdown();
    }

    /// Initiates shutdown: cancels the selection key, closes the socket,
    /// and completes `close_future` successfully. A second call observes
    /// `closing` already set and is a no-op.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown();
        self.close.success();
    }

    fn shutdown(&self) {
        if let Some(token) = self.token.lock().unwrap().take() {
            let _ = self.thread.deregister(&self.stream, token);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn current_interest(&self) -> Ready {
        let mut interest = Ready::empty();
        if !self.read_backoff.load(Ordering::SeqCst) {
            interest = interest | Ready::readable();
        }
        if self.writable_interest.load(Ordering::SeqCst) {
            interest = interest | Ready::writable();
        }
        interest
    }

    fn apply_interest(&self) {
        let token = match *self.token.lock().unwrap() {
            Some(t) => t,
            None => return,
        };
        if let Err(e) = self.thread.reregister(&self.stream, token, self.current_interest(), EpollOpt::edge()) {
            warn!("failed to reregister tcp channel interest: {e}");
        }
    }

    fn set_writable_interest(&self, want: bool) {
        if self.writable_interest.swap(want, Ordering::SeqCst) != want {
            self.apply_interest();
        }
    }

    fn set_read_backoff(&self, backoff: bool) {
        if self.read_backoff.swap(backoff, Ordering::SeqCst) != backoff {
            self.apply_interest();
        }
    }

    /// Submits a task to this processor's owning thread so it, and only it,
    /// ever mutates the selection key's interest bits — called from queue
    /// wakeup callbacks, which fire on whichever thread publishes/releases a
    /// slot, never the owning event-loop thread itself.
    fn submit_on_owning_thread(&self, f: impl FnOnce(&TcpProcessor) + Send + 'static) {
        let weak = self.self_weak.lock().unwrap().clone();
        let _ = self.thread.submit(Box::new(move |_| {
            if let Some(processor) = weak.upgrade() {
                f(&processor);
            }
        }));
    }

    /// Fired when the output queue transitions empty -> non-empty: the
    /// event loop may have disabled write interest while there was nothing
    /// to send. Runs on whichever application thread published the message,
    /// so the actual interest toggle is deferred to the owning thread.
    fn on_output_ready(&self) {
        self.submit_on_owning_thread(|p| p.set_writable_interest(true));
    }

    /// Fired when the input queue transitions full -> non-full: resume
    /// reading if the processor previously backed off. Runs on whichever
    /// application thread released the slot.
    fn on_input_drained(&self) {
        self.submit_on_owning_thread(|p| p.set_read_backoff(false));
    }

    /// Schedules a retry of `on_writable` after a rate-limit wait. There is
    /// no timer wheel on the event loop; a short-lived helper thread sleeps
    /// and then resubmits onto the owning selector thread, which is the
    /// only thread allowed to touch this processor's buffers.
    fn schedule_rate_limit_retry(&self, wait: Duration) {
        let weak = self.self_weak.lock().unwrap().clone();
        let thread = self.thread.clone();
        std::thread::spawn(move || {
            std::thread::sleep(wait);
            let _ = thread.submit(Box::new(move |_| {
                if let Some(processor) = weak.upgrade() {
                    processor.on_writable();
                }
            }));
        });
    }
}

impl Processor for TcpProcessor {
    fn on_readable(&self) {
        loop {
            let mut chunk = [0u8; 8192];
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    debug!("tcp channel saw eof");
                    if !self.closing.swap(true, Ordering::SeqCst) {
                        self.close.success();
                        self.shutdown();
                    }
                    return;
                }
                Ok(n) => {
                    self.in_buf.lock().unwrap().extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        }

        loop {
            let mut decode_codec = self.decode_codec.lock().unwrap();
            let mut in_buf = self.in_buf.lock().unwrap();
            if !decode_codec.has_next(&in_buf) {
                return;
            }
            drop(in_buf);
            drop(decode_codec);

            // Claim the destination slot before consuming the frame from
            // `in_buf`: if the queue is full, leave the undecoded bytes in
            // place and back off reading rather than decode a frame we have
            // nowhere to put and would otherwise have to drop.
            let mut slot = match self.input.try_claim() {
                Some(slot) => slot,
                None => {
                    self.set_read_backoff(true);
                    return;
                }
            };

            let mut decode_codec = self.decode_codec.lock().unwrap();
            let mut in_buf = self.in_buf.lock().unwrap();
            let body = match decode_codec.get(&mut in_buf) {
                Ok(body) => body,
                Err(e) => {
                    drop(in_buf);
                    drop(decode_codec);
                    drop(slot);
                    self.fail(e);
                    return;
                }
            };
            drop(in_buf);
            drop(decode_codec);

            slot.clear();
            slot.extend_from_slice(&body);
            slot.publish();
        }
    }

    fn on_writable(&self) {
        loop {
            {
                let mut out_buf = self.out_buf.lock().unwrap();
                if out_buf.is_empty() {
                    match self.output.try_next() {
                        Some(slot) => {
                            let encode_result = self.encode_codec.lock().unwrap().put(&slot, &mut out_buf);
                            slot.release();
                            if let Err(e) = encode_result {
                                drop(out_buf);
                                self.fail(e);
                                return;
                            }
                        }
                        None => {
                            drop(out_buf);
                            self.set_writable_interest(false);
                            return;
                        }
                    }
                }
            }

            let pending_len = self.out_buf.lock().unwrap().len() as u64;
            if let Admission::Wait(wait) = self.limiter.lock().unwrap().acquire(pending_len) {
                self.schedule_rate_limit_retry(wait);
                return;
            }

            let mut out_buf = self.out_buf.lock().unwrap();
            match (&self.stream).write(&out_buf) {
                Ok(0) => return,
                Ok(n) => {
                    out_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.set_writable_interest(true);
                    return;
                }
                Err(e) => {
                    drop(out_buf);
                    self.fail(e.into());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageBuffer;
    use crate::codec::int_header::IntHeaderCodec;
    use crate::net::tcp::{TcpListener, TcpStream};
    use crate::pool::SelectorPool;
    use crate::ratelimit::NullLimiter;
    use std::time::Duration as StdDuration;

    #[test]
    fn echoes_a_frame_end_to_end() {
        let pool = SelectorPool::open("tcp-processor-test", 1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_stream = TcpStream::connect(addr).unwrap();
        std::thread::sleep(StdDuration::from_millis(20));
        let (server_stream, _) = listener.accept().unwrap();

        let server_input = Arc::new(MessageBuffer::ring(4, Vec::new));
        let server_output = Arc::new(MessageBuffer::ring(4, Vec::new));
        let (close_promise, _close_future) = crate::future::promise();
        let server = TcpProcessor::new(
            server_stream,
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
        let (close_promise, _close_future) = crate::future::promise();
        let client = TcpProcessor::new(
            client_stream,
            pool.next(),
            Box::new(IntHeaderCodec::new(1024)),
            client_input,
            client_output.clone(),
            Box::new(NullLimiter),
            close_promise,
        );
        client.register().unwrap();

        {
            let mut slot = client_output.claim();
            slot.extend_from_slice(b"hello world");
            slot.publish();
        }
        client.on_writable();

        std::thread::sleep(StdDuration::from_millis(50));
        server.on_readable();

        let received = server_input.next();
        assert_eq!(&received[..], b"hello world");
        received.release();

        pool.close();
    }

    /// Publishes through the real event loop instead of calling
    /// `on_writable`/`on_readable` by hand: the only way to catch a queue
    /// wakeup wired to the wrong edge.
    #[test]
    fn publishing_to_output_queue_wakes_the_event_loop() {
        let pool = SelectorPool::open("tcp-wakeup-test", 2).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_stream = TcpStream::connect(addr).unwrap();
        std::thread::sleep(StdDuration::from_millis(20));
        let (server_stream, _) = listener.accept().unwrap();

        let server_input = Arc::new(MessageBuffer::ring(4, Vec::new));
        let server_output = Arc::new(MessageBuffer::ring(4, Vec::new));
        let (close_promise, _close_future) = crate::future::promise();
        let server = TcpProcessor::new(
            server_stream,
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
        let (close_promise, _close_future) = crate::future::promise();
        let client = TcpProcessor::new(
            client_stream,
            pool.next(),
            Box::new(IntHeaderCodec::new(1024)),
            client_input,
            client_output.clone(),
            Box::new(NullLimiter),
            close_promise,
        );
        client.register().unwrap();

        {
            let mut slot = client_output.claim();
            slot.extend_from_slice(b"wakeup path");
            slot.publish();
        }
        // No client.on_writable() call: the consumer wakeup on the output
        // queue, routed through the owning selector thread, must be what
        // flushes this.

        let received = server_input.next();
        assert_eq!(&received[..], b"wakeup path");
        received.release();

        pool.close();
    }
}
