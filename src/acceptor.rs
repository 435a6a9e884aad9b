//! Server Acceptor: binds a listening socket, registers it
//! for accept events on one event-loop thread, and for each accepted
//! connection builds a fresh provider (input/output queues), a fresh
//! processor with a cloned codec and a per-channel rate limiter, and hands
//! the channel to the pool's `next()` executor for registration.
//!
//! Generic over what "build a processor for this accepted stream" means so
//! `channel::tcp::bind` and `channel::tls::bind` can share the accept loop
//! while only the accepted-connection inner wiring differs.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::epoll::{EpollOpt, Ready, Token};
use crate::future::{self, SharedFuture};
use crate::net::tcp::{TcpListener, TcpStream};
use crate::pool::{Handler, SelectorThread};

pub struct ServerHandle {
    close_future: SharedFuture,
    close_fn: Arc<dyn Fn() + Send + Sync>,
}

impl ServerHandle {
    pub fn close(&self) {
        (self.close_fn)();
    }

    pub fn close_future(&self) -> SharedFuture {
        self.close_future.clone()
    }
}

struct AcceptorProcessor<F> {
    listener: TcpListener,
    thread: Arc<SelectorThread>,
    token: Mutex<Option<Token>>,
    on_accept: F,
    closed: AtomicBool,
}

impl<F> Handler for AcceptorProcessor<F>
where
    F: Fn(TcpStream, SocketAddr) + Send + Sync,
{
    fn on_ready(&self, readiness: Ready) {
        if !readiness.is_readable() {
            return;
        }
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.listener.accept() {
                Ok((stream, addr)) => (self.on_accept)(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("server acceptor stopped accepting: {e}");
                    return;
                }
            }
        }
    }
}

/// Binds `addr`, registers it on the pool's next thread, and invokes
/// `on_accept(stream, remote_addr)` for every accepted connection — from
/// that owning thread, so `on_accept` may freely register the new
/// connection's own processor on another pool thread without racing this
/// listener's selection key.
pub fn bind<F>(pool: &Arc<crate::pool::SelectorPool>, addr: impl std::net::ToSocketAddrs, on_accept: F) -> io::Result<ServerHandle>
where
    F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr)?;
    let thread = pool.next();

    let acceptor = Arc::new(AcceptorProcessor {
        listener,
        thread: thread.clone(),
        token: Mutex::new(None),
        on_accept,
        closed: AtomicBool::new(false),
    });

    let handler: Arc<dyn Handler> = acceptor.clone();
    let token = thread.register(&acceptor.listener, Ready::readable(), EpollOpt::edge(), handler)?;
    *acceptor.token.lock().unwrap() = Some(token);

    let (close_promise, close_future) = future::promise();
    let close_fn: Arc<dyn Fn() + Send + Sync> = {
        let acceptor = acceptor.clone();
        let thread = thread.clone();
        Arc::new(move || {
            if acceptor.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let acceptor = acceptor.clone();
            let promise = close_promise.clone();
            let _ = thread.submit(Box::new(move |_| {
                if let Some(token) = acceptor.token.lock().unwrap().take() {
                    let _ = acceptor.thread.deregister(&acceptor.listener, token);
                }
                debug!("server acceptor closed");
                promise.success();
            }));
        })
    };

    Ok(ServerHandle { close_future, close_fn })
}
