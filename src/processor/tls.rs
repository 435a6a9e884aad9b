//! TLS Channel Processor: the same outer contract as `TcpProcessor`, with a
//! `rustls` engine interposed between the socket and the codec. Four
//! buffers instead of two: `app_out` (plaintext pending encrypt), `net_out`
//! (ciphertext pending write), `net_in` (ciphertext pending decrypt),
//! `app_in` (plaintext pending frame-parse) — the codec only ever sees
//! `app_in`/`app_out`.
//!
//! rustls folds the classic TLS engine states (`NEED_UNWRAP`,
//! `NEED_WRAP`, `NEED_TASK`, `FINISHED`, `NOT_HANDSHAKING`) into two
//! predicates, `wants_read()`/`wants_write()`, plus `is_handshaking()`;
//! there is no separate delegated-task step to run off the event-loop
//! thread because `process_new_packets` already runs handshake crypto
//! synchronously. `HandshakeExecutor` exists anyway so a caller who plugs
//! in a slow custom certificate verifier has somewhere to move that cost
//! off the selector thread.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::buffer::MessageBuffer;
use crate::codec::Codec;
use crate::epoll::{EpollOpt, Ready, Token};
use crate::error::Error;
use crate::future::Promise;
use crate::net::tcp::TcpStream;
use crate::pool::SelectorThread;
use crate::ratelimit::{Admission, Limiter};

use super::Processor;

/// Shared engine configuration a channel builder hands to every TLS
/// channel it creates; one `TlsContext` is typically reused across many
/// channels (all connections to/from the same service share one cert
/// chain / trust root).
pub enum TlsContext {
    Server(Arc<ServerConfig>),
    Client(Arc<ClientConfig>, ServerName<'static>),
}

impl TlsContext {
    pub fn server(config: Arc<ServerConfig>) -> TlsContext {
        TlsContext::Server(config)
    }

    /// `server_name` is the SNI / certificate hostname the client will
    /// validate the peer's certificate against.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<TlsContext, rustls::pki_types::InvalidDnsNameError> {
        let name = ServerName::try_from(server_name.to_string())?;
        Ok(TlsContext::Client(config, name))
    }

    fn new_session(&self) -> Result<Session, rustls::Error> {
        match self {
            TlsContext::Server(config) => Ok(Session::Server(ServerConnection::new(config.clone())?)),
            TlsContext::Client(config, name) => {
                Ok(Session::Client(ClientConnection::new(config.clone(), name.clone())?))
            }
        }
    }
}

/// Runs the synchronous handshake step (`process_new_packets`). Default
/// implementation runs inline on the event-loop thread, matching what
/// `rustls` actually requires; the seam exists so a caller with an
/// expensive verifier (OCSP lookups, a custom `ClientCertVerifier`) can
/// swap in an implementation that hands the call to a worker pool and
/// resumes the channel via `SelectorThread::submit` when it returns.
pub trait HandshakeExecutor: Send + Sync {
    fn drive(&self, session: &mut Session) -> Result<(), rustls::Error>;
}

#[derive(Default)]
pub struct InlineHandshakeExecutor;

impl HandshakeExecutor for InlineHandshakeExecutor {
    fn drive(&self, session: &mut Session) -> Result<(), rustls::Error> {
        session.process_new_packets().map(|_| ())
    }
}

/// Either side of a `rustls` connection. Both `ClientConnection` and
/// `ServerConnection` deref to `rustls::ConnectionCommon`, so every method
/// below is a one-line dispatch to whichever concrete type this channel
/// holds.
pub enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Session {
    fn is_handshaking(&self) -> bool {
        match self {
            Session::Client(c) => c.is_handshaking(),
            Session::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Session::Client(c) => c.wants_read(),
            Session::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Session::Client(c) => c.wants_write(),
            Session::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Session::Client(c) => c.read_tls(rd),
            Session::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Session::Client(c) => c.write_tls(wr),
            Session::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Session::Client(c) => c.process_new_packets(),
            Session::Server(c) => c.process_new_packets(),
        }
    }

    fn read_plaintext(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Session::Client(c) => c.reader().read_to_end(out),
            Session::Server(c) => c.reader().read_to_end(out),
        }
        .or_else(|e| if e.kind() == io::ErrorKind::UnexpectedEof { Ok(0) } else { Err(e) })
    }

    fn write_plaintext(&mut self, body: &[u8]) -> io::Result<()> {
        match self {
            Session::Client(c) => c.writer().write_all(body),
            Session::Server(c) => c.writer().write_all(body),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Session::Client(c) => c.send_close_notify(),
            Session::Server(c) => c.send_close_notify(),
        }
    }
}

/// Owns one TLS socket's handshake and framing plumbing.
pub struct TlsProcessor {
    stream: TcpStream,
    thread: Arc<SelectorThread>,
    token: Mutex<Option<Token>>,
    self_weak: Mutex<Weak<TlsProcessor>>,

    session: Mutex<Session>,
    handshake: Arc<dyn HandshakeExecutor>,

    net_in: Mutex<Vec<u8>>,
    net_out: Mutex<Vec<u8>>,
    app_in: Mutex<Vec<u8>>,

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

impl TlsProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        thread: Arc<SelectorThread>,
        context: &TlsContext,
        codec: Box<dyn Codec>,
        input: Arc<MessageBuffer<Vec<u8>>>,
        output: Arc<MessageBuffer<Vec<u8>>>,
        limiter: Box<dyn Limiter>,
        close: Promise,
    ) -> Result<Arc<TlsProcessor>, rustls::Error> {
        let session = context.new_session()?;

        let processor = Arc::new(TlsProcessor {
            stream,
            thread,
            token: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
            session: Mutex::new(session),
            handshake: Arc::new(InlineHandshakeExecutor),
            net_in: Mutex::new(Vec::new()),
            net_out: Mutex::new(Vec::new()),
            app_in: Mutex::new(Vec::new()),
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

        Ok(processor)
    }

    /// Swaps the default inline handshake executor for one that offloads
    /// `process_new_packets` to a worker pool.
    pub fn set_handshake_executor(&mut self, executor: Arc<dyn HandshakeExecutor>) {
        self.handshake = executor;
    }

    pub fn register(self: &Arc<Self>) -> io::Result<Token> {
        let handler: Arc<dyn crate::pool::Handler> = self.clone();
        let token = self.thread.register(&self.stream, Ready::readable(), EpollOpt::edge(), handler)?;
        *self.token.lock().unwrap() = Some(token);
        Ok(token)
    }

    /// Kicks off the handshake on the owning thread once registered. The
    /// client side must send `ClientHello` without waiting for a readable
    /// event; the server side only ever reacts to one, so this is a no-op
    /// in practice when called there but harmless either way.
    pub fn prime_handshake(self: &Arc<Self>) {
        self.submit_on_owning_thread(|p| {
            if let Err(e) = p.drive_engine() {
                p.fail(e);
            }
        });
    }

    fn fail(&self, cause: Error) {
        warn!("tls channel closing: {cause}");
        self.closing.store(true, Ordering::SeqCst);
        self.close.fail(cause);
        self.shutdown();
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
            warn!("failed to reregister tls channel interest: {e}");
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
    fn submit_on_owning_thread(&self, f: impl FnOnce(&TlsProcessor) + Send + 'static) {
        let weak = self.self_weak.lock().unwrap().clone();
        let _ = self.thread.submit(Box::new(move |_| {
            if let Some(processor) = weak.upgrade() {
                f(&processor);
            }
        }));
    }

    /// Fired when the output queue transitions empty -> non-empty. Runs on
    /// whichever application thread published the message, so the actual
    /// interest toggle is deferred to the owning thread.
    fn on_output_ready(&self) {
        self.submit_on_owning_thread(|p| p.set_writable_interest(true));
    }

    /// Fired when the input queue transitions full -> non-full. Runs on
    /// whichever application thread released the slot.
    fn on_input_drained(&self) {
        self.submit_on_owning_thread(|p| p.set_read_backoff(false));
    }

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

    /// Pumps ciphertext from `net_out` onto the socket. Returns `false` if
    /// the socket would block with bytes still pending (write interest is
    /// left on in that case).
    fn flush_net_out(&self) -> io::Result<bool> {
        loop {
            let mut net_out = self.net_out.lock().unwrap();
            if net_out.is_empty() {
                return Ok(true);
            }
            match (&self.stream).write(&net_out) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    net_out.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the handshake/rekey drive loop: alternately wrap outgoing and
    /// unwrap incoming TLS records until the
    /// engine stops asking for either. Safe to call at any point, including
    /// mid-stream for a rekey, since it is a no-op once `is_handshaking()`
    /// is false and there is nothing buffered to wrap/unwrap.
    fn drive_engine(&self) -> Result<(), Error> {
        loop {
            let mut progressed = false;

            let wants_write = { self.session.lock().unwrap().wants_write() };
            if wants_write {
                let mut session = self.session.lock().unwrap();
                let mut net_out = self.net_out.lock().unwrap();
                let wrote = session.write_tls(&mut *net_out).map_err(io_to_error)?;
                if wrote > 0 {
                    progressed = true;
                }
            }

            if !self.flush_net_out().map_err(Error::from)? {
                self.set_writable_interest(true);
                break;
            }

            let wants_read = { self.session.lock().unwrap().wants_read() };
            if wants_read {
                let mut net_in = self.net_in.lock().unwrap();
                if net_in.is_empty() {
                    break;
                }
                let mut session = self.session.lock().unwrap();
                let consumed = session.read_tls(&mut &net_in[..]).map_err(io_to_error)?;
                net_in.drain(..consumed);
                drop(net_in);

                self.handshake.drive(&mut session).map_err(Error::from)?;
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        let mut app_in = self.app_in.lock().unwrap();
        let mut session = self.session.lock().unwrap();
        session.read_plaintext(&mut app_in).map_err(Error::from)?;

        Ok(())
    }

    fn decode_ready_frames(&self) {
        loop {
            let mut decode_codec = self.decode_codec.lock().unwrap();
            let mut app_in = self.app_in.lock().unwrap();
            if !decode_codec.has_next(&app_in) {
                return;
            }
            drop(app_in);
            drop(decode_codec);

            // Claim before consuming, same as the TCP processor: a full
            // input queue must leave the frame sitting in `app_in` rather
            // than decode it and have nowhere to publish it.
            let mut slot = match self.input.try_claim() {
                Some(slot) => slot,
                None => {
                    self.set_read_backoff(true);
                    return;
                }
            };

            let mut decode_codec = self.decode_codec.lock().unwrap();
            let mut app_in = self.app_in.lock().unwrap();
            let body = match decode_codec.get(&mut app_in) {
                Ok(body) => body,
                Err(e) => {
                    drop(app_in);
                    drop(decode_codec);
                    drop(slot);
                    self.fail(e);
                    return;
                }
            };
            drop(app_in);
            drop(decode_codec);

            slot.clear();
            slot.extend_from_slice(&body);
            slot.publish();
        }
    }

    /// Initiates a clean TLS shutdown: sends `close_notify`, drives one
    /// final wrap, and marks the channel closing. The peer's own
    /// `close_notify` is accepted opportunistically on the next readable
    /// event; if it never arrives the socket is released after `shutdown()`
    /// is called directly rather than blocking the event loop on it.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.lock().unwrap().send_close_notify();
        if let Err(e) = self.drive_engine() {
            debug!("error driving close-notify: {e}");
        }
        self.shutdown();
        self.close.success();
    }
}

fn io_to_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl Processor for TlsProcessor {
    fn on_readable(&self) {
        loop {
            let mut chunk = [0u8; 8192];
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    debug!("tls channel saw eof");
                    if !self.closing.swap(true, Ordering::SeqCst) {
                        self.close.success();
                        self.shutdown();
                    }
                    return;
                }
                Ok(n) => {
                    self.net_in.lock().unwrap().extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        }

        if let Err(e) = self.drive_engine() {
            self.fail(e);
            return;
        }

        self.decode_ready_frames();
    }

    fn on_writable(&self) {
        if self.session.lock().unwrap().is_handshaking() {
            if let Err(e) = self.drive_engine() {
                self.fail(e);
            }
            return;
        }

        loop {
            let slot = match self.output.try_next() {
                Some(slot) => slot,
                None => {
                    self.set_writable_interest(false);
                    return;
                }
            };

            if let Admission::Wait(wait) = self.limiter.lock().unwrap().acquire(slot.len() as u64) {
                slot.release();
                self.schedule_rate_limit_retry(wait);
                return;
            }

            let mut plaintext = Vec::new();
            let encode_result = self.encode_codec.lock().unwrap().put(&slot, &mut plaintext);
            slot.release();

            let plaintext = match encode_result {
                Ok(()) => plaintext,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };

            let mut session = self.session.lock().unwrap();
            if let Err(e) = session.write_plaintext(&plaintext) {
                drop(session);
                self.fail(e.into());
                return;
            }
            drop(session);

            if let Err(e) = self.drive_engine() {
                self.fail(e);
                return;
            }

            if !self.flush_net_out().unwrap_or(false) {
                self.set_writable_interest(true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::int_header::IntHeaderCodec;
    use crate::net::tcp::{TcpListener, TcpStream};
    use crate::pool::SelectorPool;
    use crate::ratelimit::NullLimiter;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use std::time::Duration as StdDuration;

    fn test_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (Arc::new(server_config), Arc::new(client_config))
    }

    #[test]
    fn handshake_then_exchange_then_clean_close() {
        let (server_cfg, client_cfg) = test_configs();
        let server_ctx = TlsContext::server(server_cfg);
        let client_ctx = TlsContext::client(client_cfg, "localhost").unwrap();

        let pool = SelectorPool::open("tls-processor-test", 1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_stream = TcpStream::connect(addr).unwrap();
        std::thread::sleep(StdDuration::from_millis(20));
        let (server_stream, _) = listener.accept().unwrap();

        let server_input = Arc::new(MessageBuffer::ring(4, Vec::new));
        let server_output = Arc::new(MessageBuffer::ring(4, Vec::new));
        let (server_close_p, server_close_f) = crate::future::promise();
        let server = TlsProcessor::new(
            server_stream,
            pool.next(),
            &server_ctx,
            Box::new(IntHeaderCodec::new(1024)),
            server_input.clone(),
            server_output,
            Box::new(NullLimiter),
            server_close_p,
        )
        .unwrap();
        server.register().unwrap();

        let client_input = Arc::new(MessageBuffer::ring(4, Vec::new));
        let client_output = Arc::new(MessageBuffer::ring(4, Vec::new));
        let (client_close_p, client_close_f) = crate::future::promise();
        let client = TlsProcessor::new(
            client_stream,
            pool.next(),
            &client_ctx,
            Box::new(IntHeaderCodec::new(1024)),
            client_input,
            client_output.clone(),
            Box::new(NullLimiter),
            client_close_p,
        )
        .unwrap();
        client.register().unwrap();

        // Drive the handshake by hand: client wrap, server unwrap+wrap,
        // client unwrap+wrap, server unwrap, back and forth until both
        // sides report not-handshaking, without depending on the selector
        // pool's timing.
        for _ in 0..6 {
            client.on_writable();
            std::thread::sleep(StdDuration::from_millis(10));
            server.on_readable();
            std::thread::sleep(StdDuration::from_millis(10));
            client.on_readable();
        }

        {
            let mut slot = client_output.claim();
            slot.extend_from_slice(b"hello world");
            slot.publish();
        }
        client.on_writable();
        std::thread::sleep(StdDuration::from_millis(20));
        server.on_readable();

        let received = server_input.next();
        assert_eq!(&received[..], b"hello world");
        received.release();

        client.close();
        std::thread::sleep(StdDuration::from_millis(20));
        server.on_readable();

        assert!(client_close_f.wait().is_ok());
        assert!(server_close_f.wait().is_ok());

        pool.close();
    }
}
