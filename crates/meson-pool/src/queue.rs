//! Priority queues of pool work items.

use std::fmt;
use std::sync::Arc;

use meson_sync::{ConsumerAccess, ObjectQueue, ProducerAccess, SpinSemaphore};

/// A unit of pool work.
///
/// Returning `true` asks the worker to re-enqueue the item on the queue it
/// was popped from; `false` completes it.
pub type WorkItem = Box<dyn FnMut() -> bool + Send>;

/// Identifies a queue within its [`ThreadPool`](crate::ThreadPool).
///
/// Handles are ordered by creation; a lower handle is a higher priority.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueHandle(pub(crate) usize);

impl QueueHandle {
    /// The position of this queue in the pool's priority order (0 = highest).
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueHandle({})", self.0)
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One priority level of a thread pool.
///
/// Wraps the MPMC ring with the queue's reserved-thread count and a handle
/// on the pool's wake-up semaphore.
pub struct TaskQueue {
    ring: ObjectQueue<WorkItem>,
    reserved: usize,
    sem: Arc<SpinSemaphore>,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize, reserved: usize, sem: Arc<SpinSemaphore>) -> Self {
        Self {
            ring: ObjectQueue::with_capacity(capacity),
            reserved,
            sem,
        }
    }

    /// Producer view of the backing ring.
    pub fn producer_access(&self) -> ProducerAccess<'_, WorkItem> {
        self.ring.producer_access()
    }

    /// Consumer view of the backing ring.
    pub fn consumer_access(&self) -> ConsumerAccess<'_, WorkItem> {
        self.ring.consumer_access()
    }

    /// Wakes one worker to service this queue.
    ///
    /// Call after a successful
    /// [`try_move_in`](meson_sync::ProducerAccess::try_move_in).
    pub fn notify_one(&self) {
        self.sem.post(1);
    }

    /// Wakes up to `n` workers after a burst insert.
    pub fn notify(&self, n: u32) {
        self.sem.post(n);
    }

    /// Number of items the queue can hold.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Current number of queued items (advisory).
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of pool workers reserved for this priority and higher.
    pub fn reserved(&self) -> usize {
        self.reserved
    }
}
