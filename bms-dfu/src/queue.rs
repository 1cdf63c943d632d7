//! Bounded single producer, single consumer queue.
//!
//! The receive pump owns the [`Producer`], the command executor the
//! [`Consumer`]. Both halves take `&mut self`, so there is exactly one thread
//! on either side.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Creates a queue with `N` slots, one of which always stays empty.
///
/// `N` must be a power of two, this is checked at compile time.
pub fn channel<T, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let ring = Arc::new(Ring::new());
    (Producer { ring: ring.clone() }, Consumer { ring })
}

struct Ring<T, const N: usize> {
    /// Next slot the producer writes.
    head: AtomicUsize,
    /// Next slot the consumer reads.
    tail: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots between tail and head are only touched by the consumer, all others
// only by the producer. Ownership of a slot moves with the release store of
// the index that covers it.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    const MASK: usize = {
        assert!(N >= 2 && N.is_power_of_two(), "capacity must be a power of two");
        N - 1
    };

    fn new() -> Self {
        let _ = Self::MASK;
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots: (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
        }
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let mut tail = *self.tail.get_mut();
        while tail != head {
            // SAFETY: slots in tail..head hold initialized items.
            unsafe { self.slots[tail].get_mut().assume_init_drop() };
            tail = (tail + 1) & Self::MASK;
        }
    }
}

pub struct Producer<T, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T, const N: usize> Producer<T, N> {
    /// Appends `item`, handing it back if the queue is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let next = (head + 1) & Ring::<T, N>::MASK;
        if next == ring.tail.load(Ordering::Acquire) {
            return Err(item);
        }

        // SAFETY: the slot at head is not visible to the consumer until the
        // store below.
        unsafe { (*ring.slots[head].get()).write(item) };
        ring.head.store(next, Ordering::Release);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        N - 1
    }
}

pub struct Consumer<T, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T, const N: usize> Consumer<T, N> {
    /// Removes the oldest item, never blocks.
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        if tail == ring.head.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the acquire load above makes the producer's write visible
        // and the slot is not reused until tail moves past it.
        let item = unsafe { (*ring.slots[tail].get()).assume_init_read() };
        ring.tail.store((tail + 1) & Ring::<T, N>::MASK, Ordering::Release);
        Some(item)
    }

    /// Waits up to `timeout` for an item, sleeping `poll` between attempts.
    pub fn pop_timeout(&mut self, timeout: Duration, poll: Duration) -> Option<T> {
        self.pop_until(Instant::now() + timeout, poll)
    }

    pub fn pop_until(&mut self, deadline: Instant, poll: Duration) -> Option<T> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.tail.load(Ordering::Relaxed) == self.ring.head.load(Ordering::Acquire)
    }
}
