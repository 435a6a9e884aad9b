//! Message buffers: a bounded queue with a claim/fill/publish producer side
//! and an acquire/read/release consumer side. Slots are reusable in place —
//! the payload is never reallocated on the steady-state path.
//!
//! Two interchangeable backends (`ring::Ring`, `blocking::Blocking`) share
//! one low-level `Backend` trait; `MessageBuffer` picks between them at
//! construction time per `config::BufferKind` and exposes the same safe,
//! typed handles regardless of which backend is underneath.

pub mod blocking;
pub mod ring;

use std::sync::Arc;

/// Callback fired on a full↔non-full or empty↔non-empty edge, letting a
/// processor toggle read/write selection interest without polling the queue.
pub type WakeupFn = Arc<dyn Fn() + Send + Sync>;

/// Low-level slot-indexed contract both backends implement. Index-based
/// rather than value-based so the slot's backing allocation is reused
/// across publish/release cycles instead of moving owned values in and out.
///
/// # Safety
/// `slot`/`slot_mut` may only be called with an index returned by the
/// matching `acquire`/`claim` call that has not yet been `release`d/
/// `publish`ed, and only from the thread holding that claim — violating
/// either rule is a data race.
pub trait Backend<T>: Send + Sync {
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
    fn is_full(&self) -> bool;
    fn is_empty(&self) -> bool;

    /// Reserves the next slot for the producer, blocking (spin-then-park)
    /// while the ring is full.
    fn claim(&self) -> usize;
    fn try_claim(&self) -> Option<usize>;
    /// Makes a previously claimed slot visible to the consumer.
    fn publish(&self, idx: usize);

    /// Reserves the next published slot for the consumer, blocking
    /// (spin-then-park) while the ring is empty.
    fn acquire(&self) -> usize;
    fn try_acquire(&self) -> Option<usize>;
    /// Returns a previously acquired slot to the producer for re-claim.
    fn release(&self, idx: usize);

    unsafe fn slot(&self, idx: usize) -> &T;
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, idx: usize) -> &mut T;

    fn attach_producer_wakeup(&self, callback: WakeupFn);
    fn attach_consumer_wakeup(&self, callback: WakeupFn);
}

/// A claimed producer slot: exclusive write access until `publish` is
/// called, consuming the guard.
pub struct Claim<'a, T> {
    backend: &'a dyn Backend<T>,
    idx: usize,
}

impl<'a, T> Claim<'a, T> {
    pub fn publish(self) {
        self.backend.publish(self.idx);
    }
}

impl<'a, T> std::ops::Deref for Claim<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.backend.slot(self.idx) }
    }
}

impl<'a, T> std::ops::DerefMut for Claim<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.backend.slot_mut(self.idx) }
    }
}

/// An acquired consumer slot: read access until `release` is called,
/// consuming the guard and returning the slot for re-claim.
pub struct Acquired<'a, T> {
    backend: &'a dyn Backend<T>,
    idx: usize,
}

impl<'a, T> Acquired<'a, T> {
    pub fn release(self) {
        self.backend.release(self.idx);
    }
}

impl<'a, T> std::ops::Deref for Acquired<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.backend.slot(self.idx) }
    }
}

/// Which backend a channel's buffers use. Both implementations obey the
/// same invariants (total publish ordering, no loss/duplication/reorder);
/// the choice is purely a lock-free-vs-mutex performance tradeoff.
pub struct MessageBuffer<T> {
    backend: Box<dyn Backend<T>>,
}

impl<T: Send> MessageBuffer<T> {
    pub fn ring(capacity: usize, make_slot: impl Fn() -> T) -> MessageBuffer<T> {
        MessageBuffer {
            backend: Box::new(ring::Ring::new(capacity, make_slot)),
        }
    }

    pub fn blocking(capacity: usize, make_slot: impl Fn() -> T) -> MessageBuffer<T> {
        MessageBuffer {
            backend: Box::new(blocking::Blocking::new(capacity, make_slot)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.backend.capacity()
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.backend.is_full()
    }

    pub fn claim(&self) -> Claim<'_, T> {
        let idx = self.backend.claim();
        Claim { backend: self.backend.as_ref(), idx }
    }

    pub fn try_claim(&self) -> Option<Claim<'_, T>> {
        self.backend.try_claim().map(|idx| Claim { backend: self.backend.as_ref(), idx })
    }

    pub fn next(&self) -> Acquired<'_, T> {
        let idx = self.backend.acquire();
        Acquired { backend: self.backend.as_ref(), idx }
    }

    pub fn try_next(&self) -> Option<Acquired<'_, T>> {
        self.backend.try_acquire().map(|idx| Acquired { backend: self.backend.as_ref(), idx })
    }

    pub fn attach_producer_wakeup(&self, callback: WakeupFn) {
        self.backend.attach_producer_wakeup(callback);
    }

    pub fn attach_consumer_wakeup(&self, callback: WakeupFn) {
        self.backend.attach_consumer_wakeup(callback);
    }
}
