//! Synchronization primitives for the meson task runtime.
//!
//! This crate contains the leaf building blocks the rest of the runtime is
//! assembled from: a bounded MPMC [`ObjectQueue`] of move-only values, the
//! [`SpinSemaphore`] that thread-pool workers sleep on, and a [`Gate`]
//! barrier for tests and demo `main()`s.
//!
//! Everything here is host-testable with `cargo test`; nothing depends on
//! the higher runtime layers.

pub mod gate;
pub mod queue;
pub mod semaphore;

pub use gate::Gate;
pub use queue::{ConsumerAccess, ObjectQueue, ProducerAccess, QueueFull};
pub use semaphore::SpinSemaphore;
