//! Timer service for the meson runtime.
//!
//! Timers are grouped by their interval: because every timer of a given
//! interval expires `interval` after it was started, each per-interval
//! queue is automatically ordered by expiration time and supports O(1)
//! insertion. A tournament tree over the queue heads picks the globally
//! earliest deadline in O(log I), where I is the (small, fixed) number of
//! distinct intervals.
//!
//! A driver thread sleeps until the earliest deadline and, on waking,
//! reposts each expired timer's callback onto the thread-pool priority
//! queue chosen when the timer was started.

pub mod intervals;
pub mod queue;
pub mod service;
pub mod tree;

pub use intervals::{DEFAULT_INTERVALS, IntervalIndex, Timestamp};
pub use queue::{Cancel, TimerQueue};
pub use service::{Timer, TimerService};
pub use tree::{RunningTimers, TimerHandle};
