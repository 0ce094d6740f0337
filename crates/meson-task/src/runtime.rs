//! The runtime context: one object owning the shared services.
//!
//! Instead of process-wide singletons, everything a task needs at run time
//! — the thread pool, the default queue, the timer service — hangs off one
//! [`Runtime`] whose lifetime is bounded by `main()`.

use std::sync::{Arc, OnceLock};

use meson_pool::{QueueHandle, ThreadPool};
use meson_timer::TimerService;

/// Shared services for a family of tasks.
pub struct Runtime {
    pool: Arc<ThreadPool>,
    default_queue: QueueHandle,
    timers: OnceLock<Arc<TimerService>>,
}

impl Runtime {
    /// Creates a runtime with its own pool of `workers` threads and a
    /// default queue of the given capacity.
    pub fn new(workers: usize, default_queue_capacity: usize) -> Arc<Self> {
        let pool = Arc::new(ThreadPool::new(workers));
        let default_queue = pool.new_queue(default_queue_capacity);
        Self::with_pool(pool, default_queue)
    }

    /// Wraps an existing pool; `default_queue` must belong to it.
    pub fn with_pool(pool: Arc<ThreadPool>, default_queue: QueueHandle) -> Arc<Self> {
        Arc::new(Self {
            pool,
            default_queue,
            timers: OnceLock::new(),
        })
    }

    /// The thread pool.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// The queue tasks run on when no explicit queue is given.
    pub fn default_queue(&self) -> QueueHandle {
        self.default_queue
    }

    /// The timer service, started on first use. Its callbacks fire on the
    /// default queue unless a timer says otherwise.
    pub fn timers(&self) -> &Arc<TimerService> {
        self.timers
            .get_or_init(|| TimerService::new(Arc::clone(&self.pool), self.default_queue))
    }

    /// Adds a pool queue; see [`ThreadPool::new_queue`].
    pub fn new_queue(&self, capacity: usize) -> QueueHandle {
        self.pool.new_queue(capacity)
    }

    /// Adds a pool queue with reserved workers; see
    /// [`ThreadPool::new_queue_reserved`].
    pub fn new_queue_reserved(&self, capacity: usize, reserved: usize) -> QueueHandle {
        self.pool.new_queue_reserved(capacity, reserved)
    }
}
