//! Cooperative stateful-task scheduler for the meson runtime.
//!
//! The pieces, bottom up:
//!
//! * [`SubState`] — one atomic word per task holding its pending signals,
//!   wait masks, and lifecycle flags; every signal/wait transition is a
//!   CAS loop on it.
//! * [`Task`] / [`TaskBuilder`] — a user state machine stepped by the
//!   runtime until it finishes, aborts, or waits.
//! * [`Handler`] — who multiplexes a task: inline, an [`Engine`], or a
//!   thread-pool queue.
//! * [`Engine`] — a cooperatively driven task list (`mainloop()`).
//! * [`TaskMutex`] / [`TaskRwMutex`] — mutexes whose waiters are tasks;
//!   contended tasks `wait()` and are resumed by `signal()` instead of
//!   blocking a worker thread.
//! * [`Runtime`] — the context object owning pool, default queue, and
//!   timer service.

pub mod engine;
pub mod mutex;
pub mod runtime;
pub mod rwmutex;
pub mod substate;
pub mod task;
pub mod timer_task;

pub use engine::Engine;
pub use meson_pool::QueueHandle;
pub use mutex::TaskMutex;
pub use runtime::Runtime;
pub use rwmutex::{TaskRwMutex, UpgradeDeadlock};
pub use substate::{SignalEffect, Snapshot, StateFlags, SubState, WaitOutcome};
pub use task::{BaseState, Handler, Task, TaskBuilder};
pub use timer_task::timer_task;
