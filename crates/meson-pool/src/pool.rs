//! The worker thread pool.

use std::ops::Index;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use meson_sync::SpinSemaphore;
use tracing::{debug, trace};

use crate::queue::{QueueHandle, TaskQueue, WorkItem};

/// State shared between the pool facade and its worker threads.
struct PoolShared {
    queues: RwLock<Vec<TaskQueue>>,
    sem: Arc<SpinSemaphore>,
    stop: AtomicBool,
    /// Workers currently executing an item (not merely awake).
    busy: AtomicUsize,
}

/// A fixed-capacity pool of worker threads draining priority queues.
///
/// Queues are scanned highest priority first. A queue created with a
/// reserved-thread count dedicates that many workers to its priority level
/// and above; those workers never draw from lower-priority queues.
///
/// Dropping the pool blocks until every queue is empty and all workers are
/// idle, then stops and joins the workers.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
}

impl ThreadPool {
    /// Creates a pool with `workers` worker threads (also the maximum).
    pub fn new(workers: usize) -> Self {
        Self::with_max(workers, workers)
    }

    /// Creates a pool with `workers` threads, growable to `max_workers`
    /// via [`set_workers`](Self::set_workers).
    ///
    /// # Panics
    ///
    /// Panics if `workers > max_workers`.
    pub fn with_max(workers: usize, max_workers: usize) -> Self {
        assert!(workers <= max_workers, "workers exceeds max_workers");
        let pool = Self {
            shared: Arc::new(PoolShared {
                queues: RwLock::new(Vec::new()),
                sem: Arc::new(SpinSemaphore::new(0)),
                stop: AtomicBool::new(false),
                busy: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            max_workers,
        };
        pool.set_workers(workers);
        pool
    }

    /// Number of running worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Grows the pool to `n` worker threads, capped at the maximum given at
    /// construction. Shrinking is not supported; a smaller `n` is a no-op.
    pub fn set_workers(&self, n: usize) {
        let n = n.min(self.max_workers);
        let mut workers = self.workers.lock().unwrap();
        while workers.len() < n {
            let index = workers.len();
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("meson-pool-{index}"))
                .spawn(move || worker_main(&shared, index))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
    }

    /// Appends a queue of the given capacity with no reserved workers.
    ///
    /// Queues must be created before work is submitted; the first queue is
    /// the highest priority.
    pub fn new_queue(&self, capacity: usize) -> QueueHandle {
        self.new_queue_reserved(capacity, 0)
    }

    /// Appends a queue of the given capacity that reserves `reserved` of
    /// the pool's workers for this priority level and above.
    ///
    /// The sum of all reserved counts should stay below the worker count,
    /// or lower-priority queues will starve.
    pub fn new_queue_reserved(&self, capacity: usize, reserved: usize) -> QueueHandle {
        let mut queues = self.shared.queues.write().unwrap();
        let handle = QueueHandle(queues.len());
        queues.push(TaskQueue::new(
            capacity,
            reserved,
            Arc::clone(&self.shared.sem),
        ));
        debug!(queue = %handle, capacity, reserved, "created pool queue");
        handle
    }

    /// Read access to the pool's queues, for producers.
    pub fn queues(&self) -> Queues<'_> {
        Queues {
            guard: self.shared.queues.read().unwrap(),
        }
    }

    /// Moves `work` into the queue identified by `handle` and wakes one
    /// worker. Spins (yielding) while the queue is full; use the queue's
    /// [`producer_access`](TaskQueue::producer_access) directly for a
    /// non-blocking submit.
    pub fn submit<F>(&self, handle: QueueHandle, work: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut item: WorkItem = Box::new(work);
        loop {
            item = {
                let queues = self.queues();
                let queue = &queues[handle];
                match queue.producer_access().try_move_in(item) {
                    Ok(_) => {
                        queue.notify_one();
                        return;
                    }
                    Err(full) => full.into_inner(),
                }
            };
            std::thread::yield_now();
        }
    }
}

impl Default for ThreadPool {
    /// A pool with one worker per available CPU.
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Block until every queue has drained and no worker is mid-item.
        loop {
            let drained = {
                let queues = self.shared.queues.read().unwrap();
                queues.iter().all(TaskQueue::is_empty)
            };
            if drained && self.shared.busy.load(Ordering::Acquire) == 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        self.shared.stop.store(true, Ordering::Release);
        let workers = self.workers.get_mut().unwrap();
        let count = workers.len();
        if count > 0 {
            self.shared.sem.post(u32::try_from(count).unwrap_or(u32::MAX));
        }
        debug!(workers = count, "stopping pool");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Read guard over the pool's queue list.
pub struct Queues<'a> {
    guard: RwLockReadGuard<'a, Vec<TaskQueue>>,
}

impl Queues<'_> {
    /// The queue identified by `handle`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` did not come from this pool.
    pub fn get(&self, handle: QueueHandle) -> &TaskQueue {
        &self.guard[handle.0]
    }

    /// Number of queues in the pool.
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    /// Returns `true` if the pool has no queues yet.
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

impl Index<QueueHandle> for Queues<'_> {
    type Output = TaskQueue;

    fn index(&self, handle: QueueHandle) -> &TaskQueue {
        self.get(handle)
    }
}

fn worker_main(shared: &PoolShared, index: usize) {
    trace!(worker = index, "pool worker started");
    loop {
        shared.sem.wait();
        if shared.stop.load(Ordering::Acquire) {
            trace!(worker = index, "pool worker stopping");
            return;
        }

        // Scan queues from highest to lowest priority. `floor` accumulates
        // the reserved counts of the queues already passed; a worker whose
        // index is below the floor is reserved for those higher priorities
        // and must not look further down.
        let mut item: Option<(usize, WorkItem)> = None;
        let mut work_below = false;
        {
            let queues = shared.queues.read().unwrap();
            let mut floor = 0;
            for (qi, queue) in queues.iter().enumerate() {
                if floor > index {
                    work_below = queues[qi..].iter().any(|q| !q.is_empty());
                    break;
                }
                if let Some(work) = queue.consumer_access().try_move_out() {
                    item = Some((qi, work));
                    break;
                }
                floor += queue.reserved();
            }
        }

        let Some((qi, mut work)) = item else {
            if work_below {
                // The token belonged to work this worker may not take.
                // Hand it back and step aside for an unreserved worker.
                shared.sem.post(1);
                std::thread::yield_now();
            }
            continue;
        };

        shared.busy.fetch_add(1, Ordering::AcqRel);
        trace!(worker = index, queue = qi, "executing work item");
        let mut again = work();
        while again {
            // Re-enqueue on the same queue; when the queue is full, run the
            // item inline instead (the pool never drops work).
            let back = {
                let queues = shared.queues.read().unwrap();
                let queue = &queues[qi];
                match queue.producer_access().try_move_in(work) {
                    Ok(_) => {
                        queue.notify_one();
                        None
                    }
                    Err(full) => Some(full.into_inner()),
                }
            };
            match back {
                None => break,
                Some(w) => {
                    work = w;
                    again = work();
                }
            }
        }
        shared.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn wait_for(pred: impl Fn() -> bool) {
        let start = Instant::now();
        while !pred() {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "timed out waiting for pool work"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn executes_submitted_work() {
        let pool = ThreadPool::new(2);
        let queue = pool.new_queue(16);
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            pool.submit(queue, move || {
                count.fetch_add(1, Ordering::SeqCst);
                false
            });
        }
        wait_for(|| count.load(Ordering::SeqCst) == 10);
    }

    #[test]
    fn requeueing_item_runs_again() {
        let pool = ThreadPool::new(1);
        let queue = pool.new_queue(4);
        let runs = Arc::new(AtomicU32::new(0));
        {
            let runs = Arc::clone(&runs);
            pool.submit(queue, move || runs.fetch_add(1, Ordering::SeqCst) + 1 < 5);
        }
        wait_for(|| runs.load(Ordering::SeqCst) == 5);
    }

    #[test]
    fn zero_workers_is_legal_but_idle() {
        let pool = ThreadPool::with_max(0, 1);
        let queue = pool.new_queue(4);
        let count = Arc::new(AtomicU32::new(0));
        {
            let count = Arc::clone(&count);
            let queues = pool.queues();
            queues[queue]
                .producer_access()
                .try_move_in(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                    false
                }))
                .unwrap();
            queues[queue].notify_one();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0, "no worker may run it yet");

        // Growing the pool gets the queued item executed.
        pool.set_workers(1);
        wait_for(|| count.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn single_worker_drains_high_priority_first() {
        let pool = ThreadPool::with_max(0, 1);
        let high = pool.new_queue(16);
        let low = pool.new_queue(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let queues = pool.queues();
            for tag in ["h1", "h2", "h3"] {
                let order = Arc::clone(&order);
                queues[high]
                    .producer_access()
                    .try_move_in(Box::new(move || {
                        order.lock().unwrap().push(tag);
                        false
                    }))
                    .unwrap();
            }
            for tag in ["l1", "l2"] {
                let order = Arc::clone(&order);
                queues[low]
                    .producer_access()
                    .try_move_in(Box::new(move || {
                        order.lock().unwrap().push(tag);
                        false
                    }))
                    .unwrap();
            }
            queues[high].notify(5);
        }

        pool.set_workers(1);
        wait_for(|| order.lock().unwrap().len() == 5);
        assert_eq!(*order.lock().unwrap(), ["h1", "h2", "h3", "l1", "l2"]);
    }

    #[test]
    fn reserved_worker_leaves_low_queue_to_others() {
        // Two workers; one is reserved for the high-priority queue. Work on
        // both queues must still complete.
        let pool = ThreadPool::new(2);
        let high = pool.new_queue_reserved(32, 1);
        let low = pool.new_queue(32);
        let count = Arc::new(AtomicU32::new(0));
        for i in 0..40 {
            let count = Arc::clone(&count);
            let queue = if i % 2 == 0 { high } else { low };
            pool.submit(queue, move || {
                count.fetch_add(1, Ordering::SeqCst);
                false
            });
        }
        wait_for(|| count.load(Ordering::SeqCst) == 40);
    }

    #[test]
    fn drop_blocks_until_drained() {
        let count = Arc::new(AtomicU32::new(0));
        {
            let pool = ThreadPool::new(3);
            let queue = pool.new_queue(128);
            for _ in 0..100 {
                let count = Arc::clone(&count);
                pool.submit(queue, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                    false
                });
            }
            // Dropping here must not lose any queued work.
        }
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }
}
