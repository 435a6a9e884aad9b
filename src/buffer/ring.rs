use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use super::{Backend, WakeupFn};

struct Slot<T> {
    /// See the 1024cores bounded queue: a slot at ring position `p` reads
    /// `sequence == p` when free for the producer to claim, `p + 1` once
    /// published for the consumer, and `p + capacity` once released back to
    /// the producer for the slot's next lap around the ring.
    sequence: AtomicUsize,
    value: UnsafeCell<T>,
}

/// Lock-free bounded SPSC ring. Single producer, single consumer: `claim`
/// is only ever called from one thread, `acquire` from (at most) one other,
/// so the classic bounded-MPMC CAS loop collapses to a plain load/store —
/// there is never a second thread racing to claim the same `enqueue_pos`.
pub struct Ring<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
    gate: Mutex<()>,
    not_full: Condvar,
    not_empty: Condvar,
    producer_wakeup: Mutex<Option<WakeupFn>>,
    consumer_wakeup: Mutex<Option<WakeupFn>>,
}

const SPIN_ITERS: u32 = 64;

impl<T> Ring<T> {
    pub fn new(capacity: usize, make_slot: impl Fn() -> T) -> Ring<T> {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");

        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(make_slot()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ring {
            slots,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
            gate: Mutex::new(()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            producer_wakeup: Mutex::new(None),
            consumer_wakeup: Mutex::new(None),
        }
    }

    fn notify_consumer(&self) {
        let _guard = self.gate.lock().unwrap();
        self.not_empty.notify_one();
        drop(_guard);
        if let Some(cb) = self.consumer_wakeup.lock().unwrap().as_ref() {
            cb();
        }
    }

    fn notify_producer(&self) {
        let _guard = self.gate.lock().unwrap();
        self.not_full.notify_one();
        drop(_guard);
        if let Some(cb) = self.producer_wakeup.lock().unwrap().as_ref() {
            cb();
        }
    }
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T: Send> Backend<T> for Ring<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn len(&self) -> usize {
        let enq = self.enqueue_pos.load(Ordering::Relaxed);
        let deq = self.dequeue_pos.load(Ordering::Relaxed);
        enq.saturating_sub(deq)
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_claim(&self) -> Option<usize> {
        let pos = self.enqueue_pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        if slot.sequence.load(Ordering::Acquire) != pos {
            return None;
        }
        self.enqueue_pos.store(pos.wrapping_add(1), Ordering::Relaxed);
        Some(pos & self.mask)
    }

    fn claim(&self) -> usize {
        loop {
            for _ in 0..SPIN_ITERS {
                if let Some(idx) = self.try_claim() {
                    return idx;
                }
                std::hint::spin_loop();
            }

            let guard = self.gate.lock().unwrap();
            if let Some(idx) = self.try_claim() {
                return idx;
            }
            let _unused = self.not_full.wait(guard).unwrap();
        }
    }

    fn publish(&self, idx: usize) {
        let pos = self.enqueue_pos.load(Ordering::Relaxed).wrapping_sub(1);
        debug_assert_eq!(pos & self.mask, idx);
        self.slots[idx].sequence.store(pos.wrapping_add(1), Ordering::Release);
        self.notify_consumer();
    }

    fn try_acquire(&self) -> Option<usize> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        if slot.sequence.load(Ordering::Acquire) != pos.wrapping_add(1) {
            return None;
        }
        self.dequeue_pos.store(pos.wrapping_add(1), Ordering::Relaxed);
        Some(pos & self.mask)
    }

    fn acquire(&self) -> usize {
        loop {
            for _ in 0..SPIN_ITERS {
                if let Some(idx) = self.try_acquire() {
                    return idx;
                }
                std::hint::spin_loop();
            }

            let guard = self.gate.lock().unwrap();
            if let Some(idx) = self.try_acquire() {
                return idx;
            }
            let _unused = self.not_empty.wait(guard).unwrap();
        }
    }

    fn release(&self, idx: usize) {
        let pos = self.dequeue_pos.load(Ordering::Relaxed).wrapping_sub(1);
        debug_assert_eq!(pos & self.mask, idx);
        self.slots[idx].sequence.store(pos.wrapping_add(self.capacity()), Ordering::Release);
        self.notify_producer();
    }

    unsafe fn slot(&self, idx: usize) -> &T {
        &*self.slots[idx].value.get()
    }

    unsafe fn slot_mut(&self, idx: usize) -> &mut T {
        &mut *self.slots[idx].value.get()
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

    #[test]
    fn claim_publish_acquire_release_round_trip() {
        let ring: Ring<Vec<u8>> = Ring::new(4, Vec::new);
        let backend: &dyn Backend<Vec<u8>> = &ring;

        let idx = backend.claim();
        unsafe { backend.slot_mut(idx).extend_from_slice(b"hello") };
        backend.publish(idx);

        let idx = backend.acquire();
        assert_eq!(unsafe { backend.slot(idx) }, b"hello");
        backend.release(idx);

        assert!(backend.is_empty());
    }

    #[test]
    fn blocks_producer_when_full_and_wakes_on_release() {
        let ring = Arc::new(Ring::<u64>::new(2, || 0));

        for _ in 0..2 {
            let idx = ring.claim();
            ring.publish(idx);
        }
        assert!(ring.is_full());

        let ring2 = ring.clone();
        let handle = thread::spawn(move || {
            // Would block forever without the release below.
            let idx = ring2.claim();
            ring2.publish(idx);
        });

        thread::sleep(std::time::Duration::from_millis(20));
        let idx = ring.acquire();
        ring.release(idx);

        handle.join().unwrap();
    }

    #[test]
    fn never_loses_or_reorders_values() {
        let ring: Ring<u64> = Ring::new(8, || 0);
        let backend: &dyn Backend<u64> = &ring;

        for i in 0..100u64 {
            let idx = backend.claim();
            unsafe { *backend.slot_mut(idx) = i };
            backend.publish(idx);

            let idx = backend.acquire();
            assert_eq!(unsafe { *backend.slot(idx) }, i);
            backend.release(idx);
        }
    }
}
