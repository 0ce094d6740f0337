//! Interval table and monotonic timestamps.

use std::fmt;
use std::time::Duration;

/// Index into a timer service's interval table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct IntervalIndex(pub u8);

impl IntervalIndex {
    /// The raw table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for IntervalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval[{}]", self.0)
    }
}

/// Largest supported interval table.
pub const MAX_INTERVALS: usize = 64;

/// The default interval table: 39 durations from 100 µs to 10 s.
///
/// A program tends to use only a handful of distinct timeouts, so the table
/// stays small even when millions of timers are live.
pub const DEFAULT_INTERVALS: [Duration; 39] = [
    Duration::from_micros(100),
    Duration::from_micros(150),
    Duration::from_micros(200),
    Duration::from_micros(250),
    Duration::from_micros(500),
    Duration::from_millis(1),
    Duration::from_millis(2),
    Duration::from_millis(3),
    Duration::from_millis(4),
    Duration::from_millis(5),
    Duration::from_millis(6),
    Duration::from_millis(8),
    Duration::from_millis(10),
    Duration::from_millis(12),
    Duration::from_millis(15),
    Duration::from_millis(20),
    Duration::from_millis(25),
    Duration::from_millis(30),
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(1200),
    Duration::from_millis(1500),
    Duration::from_millis(1800),
    Duration::from_millis(2000),
    Duration::from_millis(2200),
    Duration::from_millis(2500),
    Duration::from_millis(5000),
    Duration::from_millis(7000),
    Duration::from_secs(3),
    Duration::from_secs(4),
    Duration::from_secs(5),
    Duration::from_secs(6),
    Duration::from_secs(7),
    Duration::from_secs(8),
    Duration::from_secs(9),
    Duration::from_secs(10),
];

/// A monotonic time point, in nanoseconds since the timer service's epoch.
///
/// [`Timestamp::NONE`] is the sentinel for "no deadline" and orders after
/// every real time point, which is what the tournament-tree comparisons
/// rely on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The "no deadline" sentinel.
    pub const NONE: Timestamp = Timestamp(u64::MAX);

    /// A timestamp from raw nanoseconds since the epoch.
    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    /// Nanoseconds since the epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns `true` for the sentinel.
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// This timestamp advanced by `d`, saturating.
    pub fn advanced_by(self, d: Duration) -> Timestamp {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(nanos))
    }

    /// The duration from `earlier` to `self`; zero if `self` is not later.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("Timestamp(NONE)")
        } else {
            write!(f, "Timestamp({}ns)", self.0)
        }
    }
}
