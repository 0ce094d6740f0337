//! Bounded MPMC FIFO of move-only objects.
//!
//! [`ObjectQueue`] backs the thread pool's priority queues. Producers claim
//! a slot by CAS on the tail counter, consumers by CAS on the head counter;
//! each slot carries a sequence stamp that tells both sides whether the
//! slot is ready for them. Values are moved in and moved out; a slot holds
//! no live value between a move-out and the next move-in.
//!
//! The queue itself never blocks and never wakes anybody. Waking consumers
//! is the job of the pool's [`SpinSemaphore`](crate::SpinSemaphore), which
//! the pool layer posts to after a successful move-in.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Error returned by [`ProducerAccess::try_move_in`] when the queue is at
/// capacity. Carries the rejected value back to the caller.
#[derive(Error)]
#[error("object queue is full")]
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    /// Consumes the error, returning the value that did not fit.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

struct Slot<T> {
    /// Sequence stamp. `seq == pos` means the slot is free for the producer
    /// claiming ticket `pos`; `seq == pos + 1` means it holds the value for
    /// the consumer claiming ticket `pos`.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// Capacity is rounded up to the next power of two. All operations are
/// non-blocking: a full queue reports [`QueueFull`], an empty queue reports
/// `None`.
pub struct ObjectQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    /// Producer ticket counter; monotonically increasing.
    tail: AtomicUsize,
    /// Consumer ticket counter; monotonically increasing.
    head: AtomicUsize,
}

// SAFETY: Values are handed over between threads through the slot protocol;
// only `T: Send` is required.
unsafe impl<T: Send> Send for ObjectQueue<T> {}
unsafe impl<T: Send> Sync for ObjectQueue<T> {}

impl<T> ObjectQueue<T> {
    /// Creates a queue able to hold at least `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "object queue capacity must be non-zero");
        let n = capacity.next_power_of_two();
        let slots = (0..n)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: n - 1,
            tail: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
        }
    }

    /// Number of values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current number of queued values.
    ///
    /// Racy by nature; the result is advisory under concurrent access.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    /// Returns `true` when no values are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the producer view of this queue.
    pub fn producer_access(&self) -> ProducerAccess<'_, T> {
        ProducerAccess { queue: self }
    }

    /// Returns the consumer view of this queue.
    pub fn consumer_access(&self) -> ConsumerAccess<'_, T> {
        ConsumerAccess { queue: self }
    }

    /// Replaces the backing storage with one of the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not empty; resizing a queue with live values
    /// in it is a caller bug.
    pub fn reallocate(&mut self, capacity: usize) {
        assert!(self.is_empty(), "reallocate() on a non-empty object queue");
        *self = Self::with_capacity(capacity);
    }

    fn push(&self, value: T) -> Result<usize, QueueFull<T>> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[tail & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as isize - tail as isize;
            if dif == 0 {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: The ticket CAS gives this thread exclusive
                        // ownership of the slot until the seq store below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(tail + 1, Ordering::Release);
                        let head = self.head.load(Ordering::Relaxed);
                        return Ok((tail + 1).saturating_sub(head));
                    }
                    Err(current) => tail = current,
                }
            } else if dif < 0 {
                // The slot still holds a value from one lap ago: full.
                return Err(QueueFull(value));
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as isize - (head + 1) as isize;
            if dif == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: The ticket CAS gives this thread exclusive
                        // ownership of the slot; the producer's Release store
                        // of seq made the value visible.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq.store(head + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => head = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for ObjectQueue<T> {
    fn drop(&mut self) {
        // Destruct any values still queued.
        while self.pop().is_some() {}
    }
}

/// Producer view of an [`ObjectQueue`].
pub struct ProducerAccess<'a, T> {
    queue: &'a ObjectQueue<T>,
}

impl<T> ProducerAccess<'_, T> {
    /// Current fill of the queue (advisory under concurrency).
    pub fn length(&self) -> usize {
        self.queue.len()
    }

    /// Moves `value` into the queue.
    ///
    /// Returns the new queue length on success.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] carrying `value` back when the queue is at
    /// capacity.
    pub fn try_move_in(&self, value: T) -> Result<usize, QueueFull<T>> {
        self.queue.push(value)
    }
}

/// Consumer view of an [`ObjectQueue`].
pub struct ConsumerAccess<'a, T> {
    queue: &'a ObjectQueue<T>,
}

impl<T> ConsumerAccess<'_, T> {
    /// Current fill of the queue (advisory under concurrency).
    pub fn length(&self) -> usize {
        self.queue.len()
    }

    /// Moves the oldest value out of the queue, or `None` when empty.
    pub fn try_move_out(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Pops and drops every queued value.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}
