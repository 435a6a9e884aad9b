use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use slab::Slab;

use crate::epoll::{Epoll, EpollOpt, Events, Ready, Source, Token};
use crate::error::Error;
use crate::future::{self, Promise, SharedFuture};
use crate::waker::Waker;

/// Invoked on the owning thread whenever a registered source's readiness
/// changes. Implementations must not block and must not panic across this
/// boundary for longer than it takes to fail their own channel — a panic is
/// caught and logged so one misbehaving channel never brings its thread
/// down (`on_ready` throwing terminates that channel, never the loop).
pub trait Handler: Send + Sync {
    fn on_ready(&self, readiness: Ready);
}

/// A task submitted to run on the owning thread, with exclusive access to
/// that thread's registrar (so it may add/modify/delete selection keys
/// without racing the readiness loop).
pub type Task = Box<dyn FnOnce(&SelectorThread) + Send>;

struct Registration {
    handler: Arc<dyn Handler>,
}

/// One OS thread, one `Epoll`, one task queue. Every channel registered on
/// a thread is bound to it for the channel's entire life: all socket I/O,
/// selection-key mutation, and buffer wakeups for that channel run here and
/// only here.
pub struct SelectorThread {
    epoll: Epoll,
    registrations: Mutex<Slab<Registration>>,
    tasks: Mutex<VecDeque<Task>>,
    waker: Waker,
    waker_token: Token,
    shutdown: AtomicBool,
}

const WAKER_TOKEN: Token = Token(usize::MAX);

impl SelectorThread {
    fn new() -> io::Result<SelectorThread> {
        let epoll = Epoll::new()?;
        let waker = Waker::new()?;
        epoll.add(&waker, WAKER_TOKEN, Ready::readable(), EpollOpt::edge())?;

        Ok(SelectorThread {
            epoll,
            registrations: Mutex::new(Slab::new()),
            tasks: Mutex::new(VecDeque::new()),
            waker,
            waker_token: WAKER_TOKEN,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Registers `source` for `interest`, returning the token the caller
    /// must present to `reregister`/`deregister` and must stamp into every
    /// event raised against this source.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &S,
        interest: Ready,
        opts: EpollOpt,
        handler: Arc<dyn Handler>,
    ) -> io::Result<Token> {
        let mut registrations = self.registrations.lock().unwrap();
        let entry = registrations.vacant_entry();
        let token = Token(entry.key());
        entry.insert(Registration { handler });
        drop(registrations);

        if let Err(e) = self.epoll.add(source, token, interest, opts) {
            self.registrations.lock().unwrap().remove(token.0);
            return Err(e);
        }
        Ok(token)
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &S,
        token: Token,
        interest: Ready,
        opts: EpollOpt,
    ) -> io::Result<()> {
        self.epoll.modify(source, token, interest, opts)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &S, token: Token) -> io::Result<()> {
        self.epoll.delete(source)?;
        self.registrations.lock().unwrap().remove(token.0);
        Ok(())
    }

    /// Enqueues `task` to run on this thread and wakes the selector loop so
    /// it runs promptly even if every registered source is idle.
    pub fn submit(&self, task: Task) -> io::Result<()> {
        self.tasks.lock().unwrap().push_back(task);
        self.waker.wakeup()
    }

    fn drain_tasks(&self) {
        loop {
            let task = self.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => task(self),
                None => return,
            }
        }
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wakeup();
    }

    fn run(&self) {
        let mut events = Events::with_capacity(1024);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match self.epoll.wait(&mut events, Some(Duration::from_millis(500))) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("selector thread wait failed, exiting: {e}");
                    return;
                }
            }

            for event in events.iter() {
                if event.token() == self.waker_token {
                    let _ = self.waker.finish();
                    self.drain_tasks();
                    continue;
                }

                let handler = self
                    .registrations
                    .lock()
                    .unwrap()
                    .get(event.token().0)
                    .map(|r| r.handler.clone());

                let Some(handler) = handler else {
                    continue;
                };

                let readiness = event.readiness();
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_ready(readiness)));
                if result.is_err() {
                    error!("channel handler panicked handling {readiness:?}; channel is left to its own close path");
                }
            }
        }
    }
}

/// Owns a fixed number of event-loop threads and hands out registrations
/// round-robin. `close_future()` completes once every thread has exited.
pub struct SelectorPool {
    name: String,
    threads: Vec<Arc<SelectorThread>>,
    cursor: AtomicUsize,
    close_future: SharedFuture,
}

impl SelectorPool {
    pub fn open(name: impl Into<String>, size: usize) -> io::Result<Arc<SelectorPool>> {
        let name = name.into();
        assert!(size > 0, "a selector pool needs at least one thread");

        let mut threads = Vec::with_capacity(size);
        for _ in 0..size {
            threads.push(Arc::new(SelectorThread::new()?));
        }

        let mut join_futures = Vec::with_capacity(size);
        let mut handles: Vec<(Promise, JoinHandle<()>)> = Vec::with_capacity(size);

        for (idx, thread) in threads.iter().cloned().enumerate() {
            let (promise, future) = future::promise();
            join_futures.push(future);
            let thread_name = format!("{name}-{idx}");
            let promise_for_thread = promise.clone();
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    debug!("selector thread {thread_name} starting");
                    thread.run();
                    debug!("selector thread {thread_name} exiting");
                    promise_for_thread.success();
                })?;
            handles.push((promise, handle));
        }

        // Detach the join handles into a supervisor so `close()` can submit
        // shutdown tasks without the caller blocking on thread exit. A
        // panicked thread never reaches its own `promise.success()` above,
        // so the supervisor fails that thread's promise here with the
        // panic payload, which fails the pool's merged `close_future`.
        thread::spawn(move || {
            for (promise, handle) in handles {
                let thread_name = handle.thread().name().unwrap_or("selector-thread").to_string();
                if let Err(e) = handle.join() {
                    let panic_msg = panic_message(&e);
                    warn!("selector thread {thread_name} panicked: {panic_msg}");
                    promise.fail(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("selector thread {thread_name} panicked: {panic_msg}"),
                    )));
                }
            }
        });

        Ok(Arc::new(SelectorPool {
            name,
            threads,
            cursor: AtomicUsize::new(0),
            close_future: future::merge(join_futures),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Round-robins new channel registrations across the pool's threads.
    pub fn next(&self) -> Arc<SelectorThread> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[idx].clone()
    }

    /// Requests every thread to exit after finishing its current poll
    /// iteration. Returns immediately; await `close_future()` for
    /// completion.
    pub fn close(&self) {
        for thread in &self.threads {
            thread.request_shutdown();
        }
    }

    pub fn close_future(&self) -> SharedFuture {
        self.close_future.clone()
    }
}

/// Extracts a human-readable message from a `JoinHandle::join` error, which
/// is whatever value the panic payload carried (`&str` and `String` cover
/// every `panic!`/`unwrap`/`expect` call site in practice).
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    #[test]
    fn round_robins_across_threads() {
        let pool = SelectorPool::open("test-pool", 3).unwrap();
        let a = pool.next();
        let b = pool.next();
        let c = pool.next();
        let d = pool.next();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(Arc::ptr_eq(&a, &d));
        pool.close();
    }

    #[test]
    fn submitted_task_runs_on_owning_thread() {
        let pool = SelectorPool::open("task-pool", 1).unwrap();
        let thread = pool.next();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();

        thread
            .submit(Box::new(move |_| {
                counter2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        thread::sleep(StdDuration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.close();
    }

    #[test]
    fn close_future_completes_after_shutdown() {
        let pool = SelectorPool::open("close-pool", 2).unwrap();
        let close_future = pool.close_future();
        pool.close();
        assert!(close_future.wait().is_ok());
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let str_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*str_payload), "boom");

        let string_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("also boom"));
        assert_eq!(panic_message(&*string_payload), "also boom");
    }

    /// Exercises the supervisor's promise-per-handle pairing directly: a
    /// thread that panics before calling `success()` must leave its paired
    /// promise failed, the same wiring `SelectorPool::open`'s supervisor
    /// uses, so `close_future()` never hangs on a crashed selector thread.
    #[test]
    fn panicked_thread_fails_its_paired_promise() {
        let (promise, join_future) = future::promise();
        let handle = thread::Builder::new()
            .spawn(|| panic!("simulated selector thread crash"))
            .unwrap();

        if let Err(e) = handle.join() {
            promise.fail(Error::Io(io::Error::new(io::ErrorKind::Other, panic_message(&*e))));
        } else {
            promise.success();
        }

        assert!(join_future.wait().is_err());
    }
}
