//! Cooperative single-threaded task list.
//!
//! An [`Engine`] owns the tasks that were started with
//! [`Handler::Engine`](crate::Handler::Engine). It does nothing on its own:
//! the application (or a thread it dedicates) calls
//! [`mainloop`](Engine::mainloop) periodically, and each call multiplexes
//! every runnable task once. Parked tasks stay in the list until they
//! complete; completed tasks are pruned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::task::{BaseState, Task};

/// A cooperatively driven FIFO list of tasks.
pub struct Engine {
    name: String,
    max_duration: Option<Duration>,
    tasks: Mutex<Vec<Arc<Task>>>,
    /// Counts `mainloop()` invocations; `yield_frames` gates on it.
    frame: AtomicU64,
}

impl Engine {
    /// Creates an engine with no per-call time limit.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name, None)
    }

    /// Creates an engine whose `mainloop()` stops iterating once
    /// `max_duration` of wall time has elapsed.
    pub fn with_max_duration(name: impl Into<String>, max_duration: Duration) -> Arc<Self> {
        Self::build(name, Some(max_duration))
    }

    fn build(name: impl Into<String>, max_duration: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            max_duration,
            tasks: Mutex::new(Vec::new()),
            frame: AtomicU64::new(0),
        })
    }

    /// The engine's name, for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of `mainloop()` invocations so far.
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Number of tasks currently owned by the engine.
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Returns `true` when the engine owns no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Adds a freshly started task.
    pub(crate) fn add(&self, task: Arc<Task>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Adds a task that yielded onto this engine, unless already owned.
    pub(crate) fn adopt(&self, task: Arc<Task>) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.iter().any(|t| Arc::ptr_eq(t, &task)) {
            tasks.push(task);
        }
    }

    /// Multiplexes every runnable task once, in FIFO order.
    ///
    /// Honors the engine's `max_duration`, leaving remaining tasks for the
    /// next call. Parked tasks are skipped (a signal flips them back to
    /// runnable); completed tasks and tasks that yielded away are pruned.
    pub fn mainloop(&self) {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = self.max_duration.map(|d| Instant::now() + d);
        let snapshot: Vec<Arc<Task>> = self.tasks.lock().unwrap().clone();
        trace!(engine = %self.name, frame, tasks = snapshot.len(), "mainloop");

        for task in snapshot {
            if !task.is_on_engine(self) {
                continue;
            }
            match task.base_state() {
                BaseState::Wait | BaseState::Killed => continue,
                _ => {}
            }
            if task.wake_frame() > frame {
                continue;
            }
            task.multiplex();
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    trace!(engine = %self.name, "mainloop hit max_duration");
                    break;
                }
            }
        }

        self.tasks
            .lock()
            .unwrap()
            .retain(|task| task.is_on_engine(self) && !matches!(task.base_state(), BaseState::Killed));
    }
}
