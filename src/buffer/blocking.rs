use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::{Backend, WakeupFn};

struct Slots<T> {
    /// Indices of slots not currently owned by either side.
    free: VecDeque<usize>,
    /// Indices published by the producer, awaiting the consumer.
    ready: VecDeque<usize>,
}

/// Mutex+Condvar bounded queue, the same interface as `Ring` implemented
/// with blocking primitives instead of atomics, generalized from
/// move-in/move-out values to claim-before-fill slot indices.
pub struct Blocking<T> {
    storage: Box<[UnsafeCell<T>]>,
    state: Mutex<Slots<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    producer_wakeup: Mutex<Option<WakeupFn>>,
    consumer_wakeup: Mutex<Option<WakeupFn>>,
}

unsafe impl<T: Send> Send for Blocking<T> {}
unsafe impl<T: Send> Sync for Blocking<T> {}

impl<T> Blocking<T> {
    pub fn new(capacity: usize, make_slot: impl Fn() -> T) -> Blocking<T> {
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(make_slot()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Blocking {
            storage,
            state: Mutex::new(Slots {
                free: (0..capacity).collect(),
                ready: VecDeque::new(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            producer_wakeup: Mutex::new(None),
            consumer_wakeup: Mutex::new(None),
        }
    }

    fn fire(callback: &Mutex<Option<WakeupFn>>) {
        if let Some(cb) = callback.lock().unwrap().as_ref() {
            cb();
        }
    }
}

impl<T: Send> Backend<T> for Blocking<T> {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    fn is_full(&self) -> bool {
        self.state.lock().unwrap().free.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().ready.is_empty()
    }

    fn try_claim(&self) -> Option<usize> {
        self.state.lock().unwrap().free.pop_front()
    }

    fn claim(&self) -> usize {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(idx) = guard.free.pop_front() {
                return idx;
            }
            guard = self.not_full.wait(guard).unwrap();
        }
    }

    fn publish(&self, idx: usize) {
        self.state.lock().unwrap().ready.push_back(idx);
        self.not_empty.notify_one();
        Self::fire(&self.consumer_wakeup);
    }

    fn try_acquire(&self) -> Option<usize> {
        self.state.lock().unwrap().ready.pop_front()
    }

    fn acquire(&self) -> usize {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(idx) = guard.ready.pop_front() {
                return idx;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    fn release(&self, idx: usize) {
        self.state.lock().unwrap().free.push_back(idx);
        self.not_full.notify_one();
        Self::fire(&self.producer_wakeup);
    }

    unsafe fn slot(&self, idx: usize) -> &T {
        &*self.storage[idx].get()
    }

    unsafe fn slot_mut(&self, idx: usize) -> &mut T {
        &mut *self.storage[idx].get()
    }

    fn attach_producer_wakeup(&self, callback: WakeupFn) {
        *self.producer_wakeup.lock().unwrap() = Some(callback);
    }

    fn attach_consumer_wakeup(&self, callback: WakeupFn) {
        *self.consumer_wakeup.lock().unwrap() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn claim_publish_acquire_release_round_trip() {
        let queue: Blocking<Vec<u8>> = Blocking::new(4, Vec::new);
        let backend: &dyn Backend<Vec<u8>> = &queue;

        let idx = backend.claim();
        unsafe { backend.slot_mut(idx).extend_from_slice(b"hello") };
        backend.publish(idx);

        assert!(!backend.is_empty());
        let idx = backend.acquire();
        assert_eq!(unsafe { backend.slot(idx) }, b"hello");
        backend.release(idx);

        assert!(backend.is_empty());
    }

    #[test]
    fn consumer_blocks_until_publish() {
        let queue = Arc::new(Blocking::<u64>::new(2, || 0));
        let queue2 = queue.clone();

        let handle = thread::spawn(move || queue2.acquire());

        thread::sleep(Duration::from_millis(20));
        let idx = queue.claim();
        unsafe { *queue.slot_mut(idx) = 42 };
        queue.publish(idx);

        let idx = handle.join().unwrap();
        assert_eq!(unsafe { *queue.slot(idx) }, 42);
    }

    #[test]
    fn producer_blocks_when_full() {
        let queue = Arc::new(Blocking::<u64>::new(1, || 0));
        let idx = queue.claim();
        queue.publish(idx);
        assert!(queue.is_full());

        let queue2 = queue.clone();
        let handle = thread::spawn(move || queue2.claim());

        thread::sleep(Duration::from_millis(20));
        let idx = queue.acquire();
        queue.release(idx);

        handle.join().unwrap();
    }
}
