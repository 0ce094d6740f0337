//! The timer-task adapter: tasks that wake on timer expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use meson_sync::Gate;
use meson_task::{Engine, Handler, Runtime, timer_task};
use meson_timer::IntervalIndex;

#[test]
fn timer_task_finishes_after_its_interval() {
    let runtime = Runtime::new(2, 32);
    // Default interval table: index 5 is one millisecond.
    let task = timer_task(IntervalIndex(5));

    let done = Arc::new(Gate::new());
    let started = Instant::now();
    {
        let done = Arc::clone(&done);
        task.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(success);
                done.open();
            },
        );
    }
    done.wait();
    assert!(task.success());
    assert!(
        started.elapsed() >= Duration::from_millis(1),
        "completed before the interval elapsed"
    );
}

#[test]
fn timer_task_runs_on_an_engine() {
    // The driver application shape: an engine mainloop polled from the
    // main thread while the timer fires through the pool.
    let runtime = Runtime::new(1, 32);
    let engine = Engine::new("main engine");
    let task = timer_task(IntervalIndex(6)); // 2 ms

    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        task.run_with_callback(
            &runtime,
            Handler::Engine(Arc::clone(&engine)),
            move |success| {
                assert!(success);
                finished.store(true, Ordering::SeqCst);
            },
        );
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while !finished.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timer task never finished");
        engine.mainloop();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(task.success());
}

#[test]
fn aborting_a_timer_task_cancels_its_timer() {
    let runtime = Runtime::new(1, 32);
    let task = timer_task(IntervalIndex(38)); // 10 s: will not expire here

    let reported = Arc::new(Gate::new());
    {
        let reported = Arc::clone(&reported);
        task.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(!success);
                reported.open();
            },
        );
    }

    // Let it start its timer and park.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !task.waiting() {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    assert_eq!(runtime.timers().running(), 1);

    task.abort();
    reported.wait();
    assert!(task.aborted());
    assert_eq!(runtime.timers().running(), 0, "the abort hook stops the timer");
}
