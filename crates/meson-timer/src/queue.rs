//! Per-interval FIFO of running timers.

use std::collections::VecDeque;

use crate::intervals::Timestamp;

/// Result of [`TimerQueue::cancel`].
#[derive(Debug, PartialEq, Eq)]
pub enum Cancel {
    /// The sequence does not name a live entry (already popped or already
    /// cancelled); cancellation is idempotent.
    NotFound,
    /// The entry was tombstoned. `head_changed` is `true` when it was the
    /// queue head, in which case the caller must refresh its cached
    /// expiration from [`TimerQueue::next_expiration`].
    Removed {
        /// Whether the cancelled entry was the queue head.
        head_changed: bool,
    },
}

/// FIFO of timers sharing one interval.
///
/// Timers of equal interval expire in start order, so the queue is always
/// sorted by expiration and push is O(1). Cancelled entries are tombstoned
/// in place; the queue maintains the invariant that its head is either a
/// live timer or the queue is empty.
///
/// Entries are addressed by a monotonically increasing sequence number;
/// `sequence_offset` is the sequence of the current head.
pub struct TimerQueue<T> {
    entries: VecDeque<Option<(Timestamp, T)>>,
    sequence_offset: u64,
    /// Tombstones currently buried in `entries` (never the head).
    cancelled: usize,
    #[cfg(debug_assertions)]
    last_pushed: Timestamp,
}

impl<T> TimerQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            sequence_offset: 0,
            cancelled: 0,
            #[cfg(debug_assertions)]
            last_pushed: Timestamp::from_nanos(0),
        }
    }

    /// Appends a timer, returning its sequence number.
    pub fn push(&mut self, expiration: Timestamp, value: T) -> u64 {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                expiration >= self.last_pushed,
                "same-interval timers must expire in start order"
            );
            self.last_pushed = expiration;
        }
        let sequence = self.sequence_offset + self.entries.len() as u64;
        self.entries.push_back(Some((expiration, value)));
        sequence
    }

    /// Pops the head timer, returning its sequence number as well.
    /// `None` when the queue is empty.
    pub fn pop(&mut self) -> Option<(u64, Timestamp, T)> {
        let head = self.entries.pop_front()?;
        let sequence = self.sequence_offset;
        self.sequence_offset += 1;
        let (expiration, value) = head.expect("timer queue head must be live");
        self.drop_leading_tombstones();
        Some((sequence, expiration, value))
    }

    /// Tombstones the entry with the given sequence number.
    pub fn cancel(&mut self, sequence: u64) -> Cancel {
        let Some(index) = sequence.checked_sub(self.sequence_offset) else {
            return Cancel::NotFound;
        };
        let Ok(index) = usize::try_from(index) else {
            return Cancel::NotFound;
        };
        let Some(slot) = self.entries.get_mut(index) else {
            return Cancel::NotFound;
        };
        if slot.take().is_none() {
            return Cancel::NotFound;
        }
        self.cancelled += 1;
        let head_changed = index == 0;
        if head_changed {
            self.drop_leading_tombstones();
        }
        Cancel::Removed { head_changed }
    }

    /// Expiration of the head timer, or [`Timestamp::NONE`] when empty.
    pub fn next_expiration(&self) -> Timestamp {
        match self.entries.front() {
            Some(Some((expiration, _))) => *expiration,
            Some(None) => unreachable!("timer queue head must be live"),
            None => Timestamp::NONE,
        }
    }

    /// Returns `true` when `sequence` names the current head.
    pub fn is_current(&self, sequence: u64) -> bool {
        !self.entries.is_empty() && sequence == self.sequence_offset
    }

    /// Returns `true` when no entries (live or tombstoned) remain.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live timers in the queue.
    pub fn len(&self) -> usize {
        self.entries.len() - self.cancelled
    }

    /// Number of tombstoned entries still buried in the queue.
    pub fn cancelled_in_queue(&self) -> usize {
        self.cancelled
    }

    /// Sequence number of the current head.
    pub fn sequence_offset(&self) -> u64 {
        self.sequence_offset
    }

    fn drop_leading_tombstones(&mut self) {
        while let Some(None) = self.entries.front() {
            self.entries.pop_front();
            self.sequence_offset += 1;
            self.cancelled -= 1;
        }
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
