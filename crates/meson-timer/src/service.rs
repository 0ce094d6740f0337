//! The timer service: a driver thread over [`RunningTimers`].
//!
//! The driver sleeps until the earliest deadline, then pops every expired
//! timer and reposts its callback onto the thread-pool queue chosen when
//! the timer was started. Timer state transitions (start, cancel, expire)
//! all go through the service mutex; the callbacks themselves run on pool
//! workers, never on the driver thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use meson_pool::{QueueHandle, ThreadPool};
use tracing::{debug, trace};

use crate::intervals::{DEFAULT_INTERVALS, IntervalIndex, Timestamp};
use crate::tree::{RunningTimers, TimerHandle};

/// What the driver hands to a pool worker when a timer expires.
struct FiredTimer {
    inner: Arc<TimerInner>,
    queue: QueueHandle,
}

struct ServiceShared {
    pool: Arc<ThreadPool>,
    default_queue: QueueHandle,
    intervals: Vec<Duration>,
    epoch: Instant,
    timers: Mutex<RunningTimers<FiredTimer>>,
    cv: Condvar,
    stop: AtomicBool,
}

impl ServiceShared {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Owns the interval table, the running-timer structure, and the driver
/// thread. Dropping the service stops the driver; timers still queued are
/// discarded without firing.
pub struct TimerService {
    shared: Arc<ServiceShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Creates a service with the [`DEFAULT_INTERVALS`] table.
    ///
    /// Expired callbacks are posted to `default_queue` unless the timer was
    /// started with [`Timer::start_on`].
    pub fn new(pool: Arc<ThreadPool>, default_queue: QueueHandle) -> Arc<Self> {
        Self::with_intervals(pool, default_queue, DEFAULT_INTERVALS.to_vec())
    }

    /// Creates a service with a custom interval table.
    ///
    /// # Panics
    ///
    /// Panics if the table is empty, unsorted, or longer than
    /// [`MAX_INTERVALS`](crate::intervals::MAX_INTERVALS).
    pub fn with_intervals(
        pool: Arc<ThreadPool>,
        default_queue: QueueHandle,
        intervals: Vec<Duration>,
    ) -> Arc<Self> {
        assert!(
            intervals.windows(2).all(|pair| pair[0] <= pair[1]),
            "interval table must be ordered"
        );
        let shared = Arc::new(ServiceShared {
            pool,
            default_queue,
            timers: Mutex::new(RunningTimers::new(intervals.len())),
            intervals,
            epoch: Instant::now(),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let driver = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("meson-timer".into())
                .spawn(move || driver_main(&shared))
                .expect("failed to spawn timer driver")
        };
        Arc::new(Self {
            shared,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// The interval table this service was built with.
    pub fn intervals(&self) -> &[Duration] {
        &self.shared.intervals
    }

    /// Nanoseconds of monotonic time since the service started.
    pub fn now(&self) -> Timestamp {
        self.shared.now()
    }

    /// Number of timers currently running (started, not yet expired or
    /// cancelled).
    pub fn running(&self) -> usize {
        self.shared.timers.lock().unwrap().len()
    }

    fn start(
        &self,
        interval: IntervalIndex,
        queue: QueueHandle,
        inner: &Arc<TimerInner>,
    ) -> TimerHandle {
        let duration = self.shared.intervals[interval.index()];
        let mut timers = self.shared.timers.lock().unwrap();
        // Read the clock under the lock: pushes into one interval queue
        // must carry nondecreasing expirations.
        let expiration = self.shared.now().advanced_by(duration);
        let handle = timers.push(
            interval,
            expiration,
            FiredTimer {
                inner: Arc::clone(inner),
                queue,
            },
        );
        trace!(%interval, ?expiration, "timer started");
        self.shared.cv.notify_one();
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut timers = self.shared.timers.lock().unwrap();
        let removed = timers.cancel(handle);
        if removed {
            self.shared.cv.notify_one();
        }
        removed
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(driver) = self.driver.get_mut().unwrap().take() {
            let _ = driver.join();
        }
        debug!("timer service stopped");
    }
}

fn driver_main(shared: &ServiceShared) {
    let mut timers = shared.timers.lock().unwrap();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        let next = timers.next_expiration();
        if next.is_none() {
            timers = shared.cv.wait(timers).unwrap();
            continue;
        }
        let now = shared.now();
        if next > now {
            let (guard, _timed_out) = shared
                .cv
                .wait_timeout(timers, next.since(now))
                .unwrap();
            timers = guard;
            continue;
        }

        // Pop everything that has expired, then dispatch outside the lock.
        let mut fired = Vec::new();
        while !timers.next_expiration().is_none() && timers.next_expiration() <= now {
            let (_, timer, handle) = timers.pop_next().expect("non-sentinel root");
            trace!(interval = %handle.interval(), "timer expired");
            fired.push((timer, handle));
        }
        drop(timers);
        for (timer, handle) in fired {
            dispatch(shared, timer, handle);
        }
        timers = shared.timers.lock().unwrap();
    }
}

/// Hands one expired timer to its pool queue.
fn dispatch(shared: &ServiceShared, fired: FiredTimer, handle: TimerHandle) {
    {
        let mut state = fired.inner.state.lock().unwrap();
        state.expire_pending += 1;
        // Clear the handle unless the timer was already restarted.
        if state.handle == Some(handle) {
            state.handle = None;
        }
    }
    let inner = fired.inner;
    shared.pool.submit(fired.queue, move || {
        (inner.callback)();
        let mut state = inner.state.lock().unwrap();
        state.expire_pending -= 1;
        inner.cv.notify_all();
        false
    });
}

struct TimerState {
    handle: Option<TimerHandle>,
    /// Expirations popped by the driver whose callback has not finished.
    expire_pending: u32,
}

struct TimerInner {
    callback: Box<dyn Fn() + Send + Sync>,
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// A restartable one-shot timer.
///
/// `start()` schedules the callback one interval from now; `stop()`
/// cancels, returning whether the callback was still pending. Stopping may
/// race an in-flight expiration: the callback can run once concurrently
/// with (or after) a `stop()` that returned `false`.
pub struct Timer {
    service: Arc<TimerService>,
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Creates a stopped timer owning `callback`.
    pub fn new(service: &Arc<TimerService>, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            service: Arc::clone(service),
            inner: Arc::new(TimerInner {
                callback: Box::new(callback),
                state: Mutex::new(TimerState {
                    handle: None,
                    expire_pending: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Starts the timer; the callback fires on the service's default queue
    /// one `interval` from now.
    ///
    /// # Panics
    ///
    /// Panics if the timer is already running — call [`stop`](Self::stop)
    /// first.
    pub fn start(&self, interval: IntervalIndex) {
        self.start_on(interval, self.service.shared.default_queue);
    }

    /// Starts the timer with the callback posted to `queue` on expiry.
    ///
    /// # Panics
    ///
    /// Panics if the timer is already running — call [`stop`](Self::stop)
    /// first.
    pub fn start_on(&self, interval: IntervalIndex, queue: QueueHandle) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(state.handle.is_none(), "start() on a running timer");
        let handle = self.service.start(interval, queue, &self.inner);
        state.handle = Some(handle);
    }

    /// Stops the timer.
    ///
    /// Returns `true` when the timer was cancelled before expiring; `false`
    /// when it was not running, already expired, or its expiration is in
    /// flight. Idempotent.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.handle.take() {
            None => false,
            Some(handle) => self.service.cancel(handle),
        }
    }

    /// Returns `true` while the timer is started and not yet expired.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().handle.is_some()
    }

    /// Blocks until any in-flight expiration callback has finished.
    ///
    /// Call after a `stop()` that returned `false` when the callback must
    /// not outlive its captures.
    pub fn wait_for_possible_expire_to_finish(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.expire_pending > 0 {
            state = self.inner.cv.wait(state).unwrap();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
