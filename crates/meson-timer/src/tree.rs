//! Tournament tree over the per-interval timer queues.
//!
//! `cache[i]` holds a copy of queue `i`'s head expiration (or the
//! [`Timestamp::NONE`] sentinel when that queue is empty). The tree's
//! internal nodes each hold the interval index winning (expiring sooner)
//! among their two children, so `tree[1]` — the root — names the interval
//! whose head is the globally earliest deadline.
//!
//! With tree size P = next_pow2(I), the leaves of the tree are the P cache
//! slots; node `(i + P) >> 1` is the parent above cache slot `i`.

use crate::intervals::{IntervalIndex, MAX_INTERVALS, Timestamp};
use crate::queue::{Cancel, TimerQueue};

/// References a running timer: which interval queue it is in and its
/// sequence number there. Used to cancel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle {
    interval: IntervalIndex,
    sequence: u64,
}

impl TimerHandle {
    /// The interval queue this handle points into.
    pub fn interval(self) -> IntervalIndex {
        self.interval
    }

    /// The sequence number within the interval queue.
    pub fn sequence(self) -> u64 {
        self.sequence
    }
}

/// All running timers, organized per interval with a tournament tree over
/// the queue heads.
///
/// Push and cancel are O(log I) tree updates plus O(1) queue work;
/// [`pop_next`](Self::pop_next) always yields the timer with the minimum
/// expiration (FIFO within equal expirations of one interval).
pub struct RunningTimers<T> {
    /// Internal nodes; index 0 unused, root at 1. Values are interval
    /// indexes (`u8`, hence the [`MAX_INTERVALS`] cap).
    tree: Box<[u8]>,
    /// Head expiration per interval slot, padded to tree size with NONE.
    cache: Box<[Timestamp]>,
    queues: Box<[TimerQueue<T>]>,
}

const fn parent_of(index: usize) -> usize {
    index >> 1
}

const fn sibling_of(index: usize) -> usize {
    index ^ 1
}

const fn left_child_of(index: usize) -> usize {
    index << 1
}

impl<T> RunningTimers<T> {
    /// Creates the structure for `interval_count` distinct intervals.
    ///
    /// # Panics
    ///
    /// Panics if `interval_count` is zero or exceeds [`MAX_INTERVALS`].
    pub fn new(interval_count: usize) -> Self {
        assert!(
            interval_count > 0 && interval_count <= MAX_INTERVALS,
            "interval count out of range"
        );
        let tree_size = interval_count.next_power_of_two().max(2);
        let mut tree = vec![0u8; tree_size].into_boxed_slice();
        let cache = vec![Timestamp::NONE; tree_size].into_boxed_slice();
        let queues = (0..interval_count)
            .map(|_| TimerQueue::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // Leaf parents pair (0,1), (2,3), ...; pick the even sibling, then
        // propagate the winners up. With an all-NONE cache any choice is a
        // valid winner.
        for interval in 0..tree_size {
            tree[Self::leaf_parent(interval, tree_size)] = (interval & !1) as u8;
        }
        for index in (1..tree_size / 2).rev() {
            tree[index] = tree[left_child_of(index)];
        }
        Self {
            tree,
            cache,
            queues,
        }
    }

    fn tree_size(&self) -> usize {
        self.tree.len()
    }

    fn leaf_parent(interval: usize, tree_size: usize) -> usize {
        (interval + tree_size) >> 1
    }

    /// Number of distinct intervals.
    pub fn interval_count(&self) -> usize {
        self.queues.len()
    }

    /// Total number of live (non-cancelled) timers.
    pub fn len(&self) -> usize {
        self.queues.iter().map(TimerQueue::len).sum()
    }

    /// Returns `true` when no live timers are running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of tombstoned entries still buried in the queues.
    pub fn cancelled_in_queue(&self) -> usize {
        self.queues.iter().map(TimerQueue::cancelled_in_queue).sum()
    }

    /// The earliest deadline over all running timers, or
    /// [`Timestamp::NONE`] when none are running.
    pub fn next_expiration(&self) -> Timestamp {
        self.cache[usize::from(self.tree[1])]
    }

    /// Returns `true` when `handle` names the next timer to expire.
    pub fn is_current(&self, handle: TimerHandle) -> bool {
        usize::from(self.tree[1]) == handle.interval.index()
            && self.queues[handle.interval.index()].is_current(handle.sequence)
    }

    /// Adds a timer expiring at `expiration` to the given interval queue.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is out of range for this table — starting a
    /// timer on an unknown interval is a programmer error.
    pub fn push(&mut self, interval: IntervalIndex, expiration: Timestamp, value: T) -> TimerHandle {
        assert!(
            interval.index() < self.queues.len(),
            "interval index out of range"
        );
        let queue = &mut self.queues[interval.index()];
        let was_empty = queue.is_empty();
        let sequence = queue.push(expiration, value);
        if was_empty {
            self.decrease_cache(interval.index(), expiration);
        }
        #[cfg(debug_assertions)]
        self.sanity_check();
        TimerHandle { interval, sequence }
    }

    /// Removes and returns the timer with the earliest expiration, along
    /// with the handle it was running under.
    pub fn pop_next(&mut self) -> Option<(Timestamp, T, TimerHandle)> {
        let interval = usize::from(self.tree[1]);
        if self.cache[interval].is_none() {
            return None;
        }
        let queue = &mut self.queues[interval];
        let (sequence, expiration, value) =
            queue.pop().expect("cache said the queue has a head");
        let next = queue.next_expiration();
        self.increase_cache(interval, next);
        #[cfg(debug_assertions)]
        self.sanity_check();
        Some((
            expiration,
            value,
            TimerHandle {
                interval: IntervalIndex(interval as u8),
                sequence,
            },
        ))
    }

    /// Cancels the timer named by `handle`.
    ///
    /// Returns `true` when the timer was still queued (and is now gone);
    /// `false` when it had already expired or been cancelled. Idempotent.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let interval = handle.interval.index();
        let removed = match self.queues[interval].cancel(handle.sequence) {
            Cancel::NotFound => false,
            Cancel::Removed { head_changed } => {
                if head_changed {
                    let next = self.queues[interval].next_expiration();
                    self.increase_cache(interval, next);
                }
                true
            }
        };
        #[cfg(debug_assertions)]
        self.sanity_check();
        removed
    }

    /// Records that interval `interval`'s head expiration dropped to `tp`
    /// (a push into a previously empty queue) and re-bubbles the winners.
    fn decrease_cache(&mut self, interval: usize, tp: Timestamp) {
        debug_assert!(tp <= self.cache[interval]);
        self.cache[interval] = tp;
        // The new value can only win: overwrite parents with this interval
        // until a parent already beats it.
        let mut parent = Self::leaf_parent(interval, self.tree_size());
        while tp <= self.cache[usize::from(self.tree[parent])] {
            self.tree[parent] = interval as u8;
            if parent == 1 {
                break;
            }
            parent = parent_of(parent);
        }
    }

    /// Records that interval `interval`'s head expiration rose to `tp`
    /// (a pop or head cancellation) and re-bubbles the winners.
    fn increase_cache(&mut self, interval: usize, tp: Timestamp) {
        debug_assert!(tp >= self.cache[interval]);
        self.cache[interval] = tp;

        let mut tp = tp;
        let mut parent = Self::leaf_parent(interval, self.tree_size());
        let mut winner = interval;
        let mut sibling = winner ^ 1;
        loop {
            let sibling_tp = self.cache[sibling];
            if tp > sibling_tp {
                if usize::from(self.tree[parent]) == sibling {
                    // The sibling already won here; nothing above changes.
                    break;
                }
                tp = sibling_tp;
                winner = sibling;
            }
            self.tree[parent] = winner as u8;
            if parent == 1 {
                break;
            }
            sibling = usize::from(self.tree[sibling_of(parent)]);
            parent = parent_of(parent);
        }
    }

    /// Verifies the cache and tree invariants. O(I); debug builds run it
    /// after every mutation.
    pub fn sanity_check(&self) {
        let tree_size = self.tree_size();
        // Cache entries mirror the queue heads; padding slots stay NONE.
        for interval in 0..tree_size {
            match self.queues.get(interval) {
                Some(queue) => assert_eq!(self.cache[interval], queue.next_expiration()),
                None => assert!(self.cache[interval].is_none()),
            }
        }
        // Each leaf parent holds the winning member of its pair.
        for interval in (0..tree_size).step_by(2) {
            let node = Self::leaf_parent(interval, tree_size);
            let winner = usize::from(self.tree[node]);
            assert_eq!(winner & !1, interval);
            assert!(self.cache[winner ^ 1] >= self.cache[winner]);
        }
        // Each internal node holds the winner of its two children.
        for node in (2..tree_size).rev() {
            let parent = parent_of(node);
            let this = usize::from(self.tree[node]);
            let sibling = usize::from(self.tree[sibling_of(node)]);
            let chosen = usize::from(self.tree[parent]);
            assert!(chosen == this || chosen == sibling);
            let other = this + sibling - chosen;
            assert!(self.cache[chosen] <= self.cache[other]);
        }
    }
}
