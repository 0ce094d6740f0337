//! FIFO mutex whose waiters are tasks, not threads.
//!
//! A task that fails to acquire the [`TaskMutex`] is appended to the waiter
//! list and must `wait(bit)`; `unlock()` transfers ownership to the head
//! waiter and wakes it with `signal(bit)`. No OS thread ever blocks here.
//!
//! Waiter nodes live in a [`NodePool`]: a chunk-grown slab with sharded
//! free stacks, so the steady-state lock/unlock path performs no heap
//! allocation even under a backlog of hundreds of thousands of waiters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::task::Task;

const SHARDS: usize = 8;
/// Shard slabs grow by this many nodes at a time.
const CHUNK: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct NodeRef {
    shard: u8,
    index: u32,
}

pub(crate) struct Waiter {
    pub(crate) task: Arc<Task>,
    pub(crate) mask: u16,
}

struct Node {
    waiter: Option<Waiter>,
    next: Option<NodeRef>,
}

#[derive(Default)]
struct Shard {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

/// Sharded slab of waiter nodes.
pub(crate) struct NodePool {
    shards: [Mutex<Shard>; SHARDS],
    next_shard: AtomicUsize,
}

impl NodePool {
    pub(crate) fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(Shard::default())),
            next_shard: AtomicUsize::new(0),
        }
    }

    pub(crate) fn alloc(&self, waiter: Waiter) -> NodeRef {
        let shard_index = self.next_shard.fetch_add(1, Ordering::Relaxed) % SHARDS;
        let mut shard = self.shards[shard_index].lock().unwrap();
        let index = match shard.free.pop() {
            Some(index) => index,
            None => {
                // Grow the slab by a chunk; hand out the first new node and
                // stack the rest as free.
                let base = shard.nodes.len();
                shard.nodes.reserve(CHUNK);
                for _ in 0..CHUNK {
                    shard.nodes.push(Node {
                        waiter: None,
                        next: None,
                    });
                }
                for i in (base + 1..base + CHUNK).rev() {
                    shard.free.push(i as u32);
                }
                base as u32
            }
        };
        let node = &mut shard.nodes[index as usize];
        node.waiter = Some(waiter);
        node.next = None;
        NodeRef {
            shard: shard_index as u8,
            index,
        }
    }

    /// Takes the node's waiter and successor, returning the slot to the
    /// free stack.
    pub(crate) fn take(&self, node: NodeRef) -> (Waiter, Option<NodeRef>) {
        let mut shard = self.shards[usize::from(node.shard)].lock().unwrap();
        let slot = &mut shard.nodes[node.index as usize];
        let waiter = slot.waiter.take().expect("taking an empty waiter node");
        let next = slot.next.take();
        shard.free.push(node.index);
        (waiter, next)
    }

    pub(crate) fn set_next(&self, node: NodeRef, next: Option<NodeRef>) {
        let mut shard = self.shards[usize::from(node.shard)].lock().unwrap();
        shard.nodes[node.index as usize].next = next;
    }

    /// Nodes currently allocated and not freed. Zero when no task waits.
    pub(crate) fn outstanding(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.lock().unwrap();
                shard.nodes.len() - shard.free.len()
            })
            .sum()
    }
}

struct MutexState {
    locked: bool,
    head: Option<NodeRef>,
    tail: Option<NodeRef>,
}

/// A FIFO mutex for tasks.
///
/// `lock()` either acquires or enqueues the calling task; `unlock()` hands
/// the mutex to the longest-waiting task and signals it. At most one task
/// is inside the critical section at a time.
pub struct TaskMutex {
    state: Mutex<MutexState>,
    pool: NodePool,
}

impl TaskMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MutexState {
                locked: false,
                head: None,
                tail: None,
            }),
            pool: NodePool::new(),
        }
    }

    /// Attempts to acquire the mutex for `task`.
    ///
    /// Returns `true` on acquisition. On `false` the task has been
    /// appended to the waiter list and must call `wait(mask)` before
    /// returning from its step; the unlocking task will `signal(mask)` it
    /// when ownership transfers.
    pub fn lock(&self, task: &Arc<Task>, mask: u16) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                trace!(task = task.name(), "task mutex acquired");
                return true;
            }
        }
        // Contended: enqueue. The node is allocated outside the state lock
        // to keep the critical section minimal, so recheck after relocking.
        let node = self.pool.alloc(Waiter {
            task: Arc::clone(task),
            mask,
        });
        let mut state = self.state.lock().unwrap();
        if !state.locked {
            state.locked = true;
            drop(state);
            let _ = self.pool.take(node);
            trace!(task = task.name(), "task mutex acquired on retry");
            return true;
        }
        match state.tail {
            None => state.head = Some(node),
            Some(tail) => self.pool.set_next(tail, Some(node)),
        }
        state.tail = Some(node);
        trace!(task = task.name(), "task mutex contended; queued");
        false
    }

    /// Releases the mutex.
    ///
    /// If tasks are waiting, ownership transfers to the head waiter
    /// (the mutex never becomes observable as unlocked) and that task is
    /// signalled on the bit it passed to [`lock`](Self::lock).
    pub fn unlock(&self) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.locked, "unlock() of an unlocked task mutex");
            match state.head {
                None => {
                    state.locked = false;
                    state.tail = None;
                    return;
                }
                Some(head) => {
                    let (waiter, next) = self.pool.take(head);
                    state.head = next;
                    if next.is_none() {
                        state.tail = None;
                    }
                    // locked stays true: ownership transfers.
                    waiter
                }
            }
        };
        trace!(task = waiter.task.name(), "task mutex handed over");
        waiter.task.signal(waiter.mask);
    }

    /// Returns `true` while some task owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Number of queued waiter nodes; zero when nobody waits.
    pub fn waiter_nodes(&self) -> usize {
        self.pool.outstanding()
    }
}

impl Default for TaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_slots() {
        let pool = NodePool::new();
        let task = crate::TaskBuilder::new("t", |_, _| {}).build();
        let refs: Vec<NodeRef> = (0..10)
            .map(|i| {
                pool.alloc(Waiter {
                    task: Arc::clone(&task),
                    mask: i,
                })
            })
            .collect();
        assert_eq!(pool.outstanding(), 10);
        for r in refs {
            let _ = pool.take(r);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn pool_links_nodes() {
        let pool = NodePool::new();
        let task = crate::TaskBuilder::new("t", |_, _| {}).build();
        let a = pool.alloc(Waiter {
            task: Arc::clone(&task),
            mask: 1,
        });
        let b = pool.alloc(Waiter {
            task: Arc::clone(&task),
            mask: 2,
        });
        pool.set_next(a, Some(b));
        let (first, next) = pool.take(a);
        assert_eq!(first.mask, 1);
        assert_eq!(next, Some(b));
        let (second, next) = pool.take(b);
        assert_eq!(second.mask, 2);
        assert_eq!(next, None);
    }

    #[test]
    fn uncontended_lock_unlock() {
        let mutex = TaskMutex::new();
        let task = crate::TaskBuilder::new("t", |_, _| {}).build();
        assert!(mutex.lock(&task, 1));
        assert!(mutex.is_locked());
        mutex.unlock();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.waiter_nodes(), 0);
    }

    #[test]
    fn contended_lock_queues_fifo() {
        let mutex = TaskMutex::new();
        let owner = crate::TaskBuilder::new("owner", |_, _| {}).build();
        let first = crate::TaskBuilder::new("first", |_, _| {}).build();
        let second = crate::TaskBuilder::new("second", |_, _| {}).build();

        assert!(mutex.lock(&owner, 1));
        assert!(!mutex.lock(&first, 1));
        assert!(!mutex.lock(&second, 1));
        assert_eq!(mutex.waiter_nodes(), 2);

        // Handover keeps the mutex locked and drains in FIFO order.
        mutex.unlock();
        assert!(mutex.is_locked());
        assert_eq!(mutex.waiter_nodes(), 1);
        mutex.unlock();
        assert!(mutex.is_locked());
        assert_eq!(mutex.waiter_nodes(), 0);
        mutex.unlock();
        assert!(!mutex.is_locked());
    }
}
