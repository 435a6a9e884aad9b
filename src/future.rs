use std::sync::{Arc, Condvar, Mutex};

use crate::error::Error;

#[derive(Clone)]
enum State {
    Pending,
    Success,
    Failure(Arc<Error>),
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
    listeners: Mutex<Vec<Box<dyn FnOnce(Result<(), Arc<Error>>) + Send>>>,
}

/// A one-shot completion handle for a lifecycle event (connect, bind,
/// close). `complete`/`fail` may each be called exactly once; subsequent
/// calls are no-ops, matching "a closed channel fulfills its close future
/// exactly once" for every future kind, not just close.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

/// The read side of a `Promise`. Cheap to clone; every clone observes the
/// same completion.
#[derive(Clone)]
pub struct SharedFuture {
    inner: Arc<Inner>,
}

pub fn promise() -> (Promise, SharedFuture) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending),
        condvar: Condvar::new(),
        listeners: Mutex::new(Vec::new()),
    });
    (
        Promise { inner: inner.clone() },
        SharedFuture { inner },
    )
}

impl Promise {
    fn settle(&self, result: Result<(), Arc<Error>>) {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, State::Pending) {
            return;
        }
        *state = match &result {
            Ok(()) => State::Success,
            Err(e) => State::Failure(e.clone()),
        };
        drop(state);
        self.inner.condvar.notify_all();

        let listeners = std::mem::take(&mut *self.inner.listeners.lock().unwrap());
        for listener in listeners {
            listener(result.clone());
        }
    }

    pub fn success(&self) {
        self.settle(Ok(()));
    }

    pub fn fail(&self, cause: Error) {
        self.settle(Err(Arc::new(cause)));
    }
}

impl SharedFuture {
    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), State::Pending)
    }

    /// Blocks the calling thread until the future completes. Never called
    /// from an event-loop thread; only application code awaiting a result.
    pub fn wait(&self) -> Result<(), Arc<Error>> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &*state {
                State::Pending => state = self.inner.condvar.wait(state).unwrap(),
                State::Success => return Ok(()),
                State::Failure(e) => return Err(e.clone()),
            }
        }
    }

    /// Registers a callback to run once, synchronously, from whichever
    /// thread completes the future (or immediately, inline, if it already
    /// has). Used by the pool to chain a close future onto a connect
    /// future's failure path without blocking the caller.
    pub fn on_complete(&self, listener: impl FnOnce(Result<(), Arc<Error>>) + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        match &*state {
            State::Pending => self.inner.listeners.lock().unwrap().push(Box::new(listener)),
            State::Success => {
                drop(state);
                listener(Ok(()));
            }
            State::Failure(e) => {
                let cause = e.clone();
                drop(state);
                listener(Err(cause));
            }
        }
    }
}

struct MergeState {
    remaining: usize,
    failed: bool,
}

/// Builds a future that succeeds once every child has succeeded, and fails
/// on the first child failure — "implementations may use a counter plus a
/// single stored cause".
pub fn merge(children: Vec<SharedFuture>) -> SharedFuture {
    let (promise, future) = promise();

    if children.is_empty() {
        promise.success();
        return future;
    }

    let state = Arc::new(Mutex::new(MergeState {
        remaining: children.len(),
        failed: false,
    }));

    for child in children {
        let state = state.clone();
        let promise = promise.clone();
        child.on_complete(move |result| {
            let mut guard = state.lock().unwrap();
            if let Err(cause) = &result {
                if !guard.failed {
                    guard.failed = true;
                    drop(guard);
                    promise.fail((**cause).clone_for_merge());
                    return;
                }
                return;
            }

            guard.remaining -= 1;
            let done = guard.remaining == 0 && !guard.failed;
            drop(guard);
            if done {
                promise.success();
            }
        });
    }

    future
}

trait CloneForMerge {
    fn clone_for_merge(&self) -> Error;
}

impl CloneForMerge for Error {
    fn clone_for_merge(&self) -> Error {
        match self {
            Error::InvalidLength(s) => Error::InvalidLength(s.clone()),
            Error::InvalidEncoding(s) => Error::InvalidEncoding(s.clone()),
            Error::Tls(e) => Error::InvalidEncoding(format!("tls error: {e}")),
            Error::Io(e) => Error::InvalidEncoding(format!("io error: {e}")),
            Error::Closed => Error::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_observed_by_wait() {
        let (p, f) = promise();
        p.success();
        assert!(f.wait().is_ok());
    }

    #[test]
    fn failure_carries_cause() {
        let (p, f) = promise();
        p.fail(Error::Closed);
        match f.wait() {
            Err(e) => assert!(matches!(*e, Error::Closed)),
            Ok(()) => panic!("expected failure"),
        }
    }

    #[test]
    fn second_completion_is_a_no_op() {
        let (p, f) = promise();
        p.success();
        p.fail(Error::Closed);
        assert!(f.wait().is_ok());
    }

    #[test]
    fn merging_future_succeeds_when_all_children_succeed() {
        let (p1, f1) = promise();
        let (p2, f2) = promise();
        let merged = merge(vec![f1, f2]);

        p1.success();
        p2.success();

        assert!(merged.wait().is_ok());
    }

    #[test]
    fn merging_future_fails_on_first_child_failure() {
        let (p1, f1) = promise();
        let (p2, f2) = promise();
        let merged = merge(vec![f1, f2]);

        p1.fail(Error::Closed);
        p2.success();

        assert!(merged.wait().is_err());
    }

    #[test]
    fn merging_future_with_no_children_succeeds_immediately() {
        let merged = merge(vec![]);
        assert!(merged.is_done());
        assert!(merged.wait().is_ok());
    }
}
