//! Worker thread pool draining priority queues.
//!
//! A [`ThreadPool`] owns N OS worker threads and an ordered list of
//! [`TaskQueue`]s (lower handle = higher priority), each backed by an MPMC
//! [`ObjectQueue`](meson_sync::ObjectQueue) of boxed callables. Producers
//! move work in and post one token per item on the pool's shared
//! [`SpinSemaphore`](meson_sync::SpinSemaphore); idle workers wait on that
//! semaphore and scan the queues from highest to lowest priority.
//!
//! A work item is a `FnMut() -> bool`: returning `true` re-enqueues the
//! item on the same queue (self-throttling repetition), `false` completes
//! it.

pub mod pool;
pub mod queue;

pub use pool::{Queues, ThreadPool};
pub use queue::{QueueHandle, TaskQueue, WorkItem};
