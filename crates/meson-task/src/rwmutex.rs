//! Reader-writer variant of the task mutex.
//!
//! Any number of reading tasks XOR one writing task. Writers queue in FIFO
//! order and block new readers while queued; a reader may upgrade to a
//! writer with [`rd2wrlock`](TaskRwMutex::rd2wrlock), which fails for the
//! second of two concurrent upgraders (granting both would deadlock — each
//! would wait for the other's read lock). The failed upgrader keeps its
//! read lock and is expected to abort or back out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

use crate::task::Task;

/// A read-to-write upgrade lost the race to another upgrader.
///
/// Granting the second upgrade would deadlock: each upgrader waits for the
/// other reader to leave. The caller still holds its read lock; aborting
/// the task (after `rdunlock`) is the usual response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("concurrent read-to-write upgrade would deadlock")]
pub struct UpgradeDeadlock;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Access {
    Read,
    Write,
}

struct RwWaiter {
    task: Arc<Task>,
    mask: u16,
    access: Access,
}

struct RwState {
    writer: bool,
    readers: usize,
    /// A reader waiting to become the writer; blocks all other grants.
    upgrader: Option<(Arc<Task>, u16)>,
    queue: VecDeque<RwWaiter>,
}

/// Reader-writer mutex whose waiters are tasks.
pub struct TaskRwMutex {
    state: Mutex<RwState>,
}

impl TaskRwMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RwState {
                writer: false,
                readers: 0,
                upgrader: None,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Attempts to acquire a read lock for `task`.
    ///
    /// Returns `true` on acquisition; on `false` the task is queued and
    /// must `wait(mask)`. New readers queue behind waiting writers.
    pub fn rdlock(&self, task: &Arc<Task>, mask: u16) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.writer && state.upgrader.is_none() && state.queue.is_empty() {
            state.readers += 1;
            return true;
        }
        state.queue.push_back(RwWaiter {
            task: Arc::clone(task),
            mask,
            access: Access::Read,
        });
        trace!(task = task.name(), "rwmutex read contended; queued");
        false
    }

    /// Attempts to acquire the write lock for `task`.
    ///
    /// Returns `true` on acquisition; on `false` the task is queued and
    /// must `wait(mask)`.
    pub fn wrlock(&self, task: &Arc<Task>, mask: u16) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.writer
            && state.readers == 0
            && state.upgrader.is_none()
            && state.queue.is_empty()
        {
            state.writer = true;
            return true;
        }
        state.queue.push_back(RwWaiter {
            task: Arc::clone(task),
            mask,
            access: Access::Write,
        });
        trace!(task = task.name(), "rwmutex write contended; queued");
        false
    }

    /// Upgrades `task`'s read lock to the write lock.
    ///
    /// Returns `Ok(true)` when the upgrade was granted immediately (the
    /// caller was the only reader). Returns `Ok(false)` when the caller
    /// must `wait(mask)` until the remaining readers leave; it is woken
    /// holding the write lock.
    ///
    /// # Errors
    ///
    /// [`UpgradeDeadlock`] when another upgrade is already pending; the
    /// caller keeps its read lock.
    pub fn rd2wrlock(&self, task: &Arc<Task>, mask: u16) -> Result<bool, UpgradeDeadlock> {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.writer && state.readers > 0, "upgrade without a read lock");
        if state.upgrader.is_some() {
            return Err(UpgradeDeadlock);
        }
        if state.readers == 1 {
            state.readers = 0;
            state.writer = true;
            return Ok(true);
        }
        state.upgrader = Some((Arc::clone(task), mask));
        trace!(task = task.name(), "rwmutex upgrade pending");
        Ok(false)
    }

    /// Downgrades the write lock to a read lock (never blocks), then
    /// admits any readers queued at the front.
    pub fn wr2rdlock(&self) {
        let woken = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.writer, "downgrade without the write lock");
            state.writer = false;
            state.readers = 1;
            Self::grant(&mut state)
        };
        Self::signal_all(woken);
    }

    /// Releases a read lock.
    pub fn rdunlock(&self) {
        let woken = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.readers > 0, "rdunlock() without a read lock");
            state.readers -= 1;
            Self::grant(&mut state)
        };
        Self::signal_all(woken);
    }

    /// Releases the write lock.
    pub fn wrunlock(&self) {
        let woken = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.writer, "wrunlock() without the write lock");
            state.writer = false;
            Self::grant(&mut state)
        };
        Self::signal_all(woken);
    }

    /// Grants the lock to whoever is eligible. Returns the tasks to signal
    /// once the state lock is released.
    fn grant(state: &mut RwState) -> Vec<(Arc<Task>, u16)> {
        let mut woken = Vec::new();
        if state.writer {
            return woken;
        }
        // A pending upgrade beats the queue: it already holds a read lock
        // and only waits for the other readers to leave.
        if state.upgrader.is_some() {
            if state.readers == 1 {
                let (task, mask) = state.upgrader.take().expect("checked above");
                state.readers = 0;
                state.writer = true;
                woken.push((task, mask));
            }
            return woken;
        }
        if state.readers == 0 {
            if let Some(front) = state.queue.front() {
                if front.access == Access::Write {
                    let waiter = state.queue.pop_front().expect("checked above");
                    state.writer = true;
                    woken.push((waiter.task, waiter.mask));
                    return woken;
                }
            }
        }
        // Admit every reader at the front of the queue.
        while matches!(state.queue.front(), Some(w) if w.access == Access::Read) {
            let waiter = state.queue.pop_front().expect("checked above");
            state.readers += 1;
            woken.push((waiter.task, waiter.mask));
        }
        woken
    }

    fn signal_all(woken: Vec<(Arc<Task>, u16)>) {
        for (task, mask) in woken {
            trace!(task = task.name(), "rwmutex handed over");
            task.signal(mask);
        }
    }
}

impl Default for TaskRwMutex {
    fn default() -> Self {
        Self::new()
    }
}
