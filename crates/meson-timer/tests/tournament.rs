//! Randomized interleave over the tournament tree, checked against a
//! multiset model.
//!
//! Pushes, pops and cancellations are interleaved over the full default
//! interval table with a deterministic xorshift64 sequence and a fake
//! monotonic clock. Every pop must return the minimum live expiration, and
//! the final live count must balance pushes against pops and removals.

use std::collections::BTreeMap;

use meson_timer::{DEFAULT_INTERVALS, IntervalIndex, RunningTimers, TimerHandle, Timestamp};

const OPS: usize = 200_000;

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        // xorshift64; seed must be non-zero.
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Multiset of live expirations.
#[derive(Default)]
struct Model {
    live: BTreeMap<Timestamp, usize>,
    count: usize,
}

impl Model {
    fn insert(&mut self, tp: Timestamp) {
        *self.live.entry(tp).or_insert(0) += 1;
        self.count += 1;
    }

    fn remove(&mut self, tp: Timestamp) {
        let slot = self.live.get_mut(&tp).expect("expiration must be live");
        *slot -= 1;
        if *slot == 0 {
            self.live.remove(&tp);
        }
        self.count -= 1;
    }

    fn min(&self) -> Option<Timestamp> {
        self.live.keys().next().copied()
    }
}

#[test]
fn interleaved_pushes_pops_and_cancels_stay_ordered() {
    let interval_count = DEFAULT_INTERVALS.len();
    let mut timers = RunningTimers::new(interval_count);
    let mut model = Model::default();
    let mut rng = XorShift(0x2545_F491_4F6C_DD1D);

    let mut now = Timestamp::from_nanos(0);
    let mut pending_cancels: Vec<(TimerHandle, Timestamp)> = Vec::new();

    let mut push_count = 0usize;
    let mut pop_count = 0usize;
    let mut cancel_removed = 0usize;

    for op in 0..OPS {
        // The fake clock only moves forward, which keeps every per-interval
        // queue ordered by construction.
        now = now.advanced_by(std::time::Duration::from_nanos(rng.next() % 50_000));

        match rng.next() % 10 {
            // Pushes dominate so the structure grows busy.
            0..=5 => {
                let interval = (rng.next() % interval_count as u64) as u8;
                let expiration = now.advanced_by(DEFAULT_INTERVALS[usize::from(interval)]);
                let handle = timers.push(IntervalIndex(interval), expiration, op);
                model.insert(expiration);
                push_count += 1;
                // Half of the pushes become cancellation candidates.
                if rng.next() % 2 == 0 {
                    pending_cancels.push((handle, expiration));
                }
            }
            6 | 7 => {
                if let Some((expiration, _value, _handle)) = timers.pop_next() {
                    assert_eq!(
                        Some(expiration),
                        model.min(),
                        "pop_next must return the minimum live expiration"
                    );
                    model.remove(expiration);
                    pop_count += 1;
                }
            }
            _ => {
                if let Some((handle, expiration)) = pending_cancels.pop() {
                    // The handle may point at an already-popped timer;
                    // cancel reports whether it actually removed one.
                    if timers.cancel(handle) {
                        model.remove(expiration);
                        cancel_removed += 1;
                    }
                }
            }
        }

        if op % 8192 == 0 {
            assert_eq!(timers.len(), model.count);
            timers.sanity_check();
        }
    }

    assert_eq!(
        timers.len(),
        push_count - pop_count - cancel_removed,
        "live count must balance pushes against pops and removals"
    );
    assert_eq!(timers.len(), model.count);

    // Drain: the remaining timers must come out in nondecreasing order.
    let mut last = Timestamp::from_nanos(0);
    while let Some((expiration, _, _)) = timers.pop_next() {
        assert_eq!(Some(expiration), model.min());
        assert!(expiration >= last);
        last = expiration;
        model.remove(expiration);
    }
    assert!(timers.is_empty());
    assert_eq!(model.count, 0);
    assert_eq!(timers.cancelled_in_queue(), 0, "no tombstone may survive the drain");
}
