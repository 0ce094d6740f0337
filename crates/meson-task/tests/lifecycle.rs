//! Lifecycle coverage: handlers, yields, aborts, engine behavior.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meson_sync::Gate;
use meson_task::{Engine, Handler, Runtime, TaskBuilder, TaskRwMutex};

#[test]
fn immediate_task_runs_inline() {
    let runtime = Runtime::new(0, 4);
    let steps = Arc::new(AtomicU32::new(0));
    let task = {
        let steps = Arc::clone(&steps);
        TaskBuilder::new("inline", move |task, state| match state {
            0 => {
                steps.fetch_add(1, Ordering::SeqCst);
                task.set_state(1);
            }
            _ => task.finish(),
        })
        .build()
    };
    task.run(&runtime, Handler::Immediate);
    // No pool workers exist; everything already happened on this thread.
    assert!(task.success());
    assert_eq!(steps.load(Ordering::SeqCst), 1);
}

#[test]
fn signal_to_immediate_task_resumes_inline() {
    let runtime = Runtime::new(0, 4);
    let task = TaskBuilder::new("inline-wait", move |task, state| match state {
        0 => {
            task.set_state(1);
            task.wait(1);
        }
        _ => task.finish(),
    })
    .build();
    task.run(&runtime, Handler::Immediate);
    assert!(task.waiting());
    assert!(task.signal(1), "the signal must wake the parked task");
    assert!(task.success());
}

#[test]
fn engine_task_is_driven_by_mainloop() {
    let runtime = Runtime::new(0, 4);
    let engine = Engine::new("test");
    let task = TaskBuilder::new("engined", move |task, state| match state {
        0 => task.set_state(1),
        _ => task.finish(),
    })
    .build();
    task.run(&runtime, Handler::Engine(Arc::clone(&engine)));
    assert!(!task.finished(), "nothing happens before mainloop()");
    assert_eq!(engine.len(), 1);
    engine.mainloop();
    assert!(task.success());
    assert_eq!(engine.len(), 0, "completed tasks are pruned");
}

#[test]
fn yield_frames_skips_engine_frames() {
    let runtime = Runtime::new(0, 4);
    let engine = Engine::new("test");
    let steps = Arc::new(AtomicU32::new(0));
    let task = {
        let steps = Arc::clone(&steps);
        TaskBuilder::new("sleeper", move |task, state| match state {
            0 => {
                steps.fetch_add(1, Ordering::SeqCst);
                task.set_state(1);
                task.yield_frames(3);
            }
            _ => task.finish(),
        })
        .build()
    };
    task.run(&runtime, Handler::Engine(Arc::clone(&engine)));
    engine.mainloop(); // runs state 0, then sleeps 3 frames
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    engine.mainloop();
    engine.mainloop();
    assert!(!task.finished(), "still sleeping");
    engine.mainloop(); // frame 4 >= wake frame
    assert!(task.success());
}

#[test]
fn engine_max_duration_caps_one_mainloop_call() {
    let runtime = Runtime::new(0, 4);
    // Zero budget: the deadline check fires right after the first task.
    let engine = Engine::with_max_duration("capped", Duration::ZERO);
    let order = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|tag| {
            let order = Arc::clone(&order);
            TaskBuilder::new(tag, move |task, _| {
                order.lock().unwrap().push(tag);
                task.finish();
            })
            .build()
        })
        .collect();
    for task in &tasks {
        task.run(&runtime, Handler::Engine(Arc::clone(&engine)));
    }
    engine.mainloop();
    assert_eq!(*order.lock().unwrap(), ["a"], "budget exhausted after one task");
    engine.mainloop();
    engine.mainloop();
    assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
}

#[test]
fn yield_moves_task_from_engine_to_pool() {
    let runtime = Runtime::new(1, 16);
    let engine = Engine::new("test");
    let done = Arc::new(Gate::new());
    let queue = runtime.default_queue();
    let task = TaskBuilder::new("migrant", move |task, state| match state {
        0 => {
            task.set_state(1);
            task.yield_to(Handler::Queue(queue));
        }
        _ => task.finish(),
    })
    .build();
    {
        let done = Arc::clone(&done);
        task.run_with_callback(
            &runtime,
            Handler::Engine(Arc::clone(&engine)),
            move |success| {
                assert!(success);
                done.open();
            },
        );
    }
    engine.mainloop(); // state 0 runs here; the rest happens in the pool
    done.wait();
    assert!(task.success());
    engine.mainloop();
    assert_eq!(engine.len(), 0, "yielded-away task leaves the engine");
}

#[test]
fn bare_yield_requeues_on_the_same_queue() {
    let runtime = Runtime::new(1, 16);
    let done = Arc::new(Gate::new());
    let steps = Arc::new(AtomicU32::new(0));
    let task = {
        let steps = Arc::clone(&steps);
        TaskBuilder::new("yielder", move |task, state| match state {
            0..=3 => {
                steps.fetch_add(1, Ordering::SeqCst);
                task.set_state(state + 1);
                task.yield_next();
            }
            _ => task.finish(),
        })
        .build()
    };
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
    assert_eq!(steps.load(Ordering::SeqCst), 4);
}

#[test]
fn wait_until_requires_every_required_bit() {
    let runtime = Runtime::new(0, 4);
    let task = TaskBuilder::new("strict", move |task, state| match state {
        0 => {
            task.set_state(1);
            // Bits 1 and 2 are both mandatory; there is no OR bit.
            task.wait_until(0b11, 0b11);
        }
        _ => task.finish(),
    })
    .build();
    task.run(&runtime, Handler::Immediate);
    assert!(task.waiting());
    assert!(!task.signal(0b01), "one of two required bits must not wake");
    assert!(task.waiting());
    assert!(task.signal(0b10), "the second required bit completes the wait");
    assert!(task.success());
}

#[test]
fn abort_of_a_parked_task_reports_failure() {
    let runtime = Runtime::new(1, 16);
    let aborted = Arc::new(Gate::new());
    let hook_ran = Arc::new(AtomicBool::new(false));
    let task = {
        let hook_ran = Arc::clone(&hook_ran);
        TaskBuilder::new("doomed", move |task, _| {
            task.wait(1); // a signal that never comes
        })
        .on_abort(move |_| {
            hook_ran.store(true, Ordering::SeqCst);
        })
        .build()
    };
    {
        let aborted = Arc::clone(&aborted);
        task.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(!success, "aborted tasks report failure");
                aborted.open();
            },
        );
    }
    // Let it park, then abort it.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !task.waiting() {
        assert!(std::time::Instant::now() < deadline);
        std::thread::yield_now();
    }
    task.abort();
    aborted.wait();
    assert!(task.aborted());
    assert!(!task.success());
    assert!(hook_ran.load(Ordering::SeqCst), "abort hook must run");
}

#[test]
fn finish_hook_runs_on_success() {
    let runtime = Runtime::new(0, 4);
    let hook_ran = Arc::new(AtomicBool::new(false));
    let task = {
        let hook_ran = Arc::clone(&hook_ran);
        TaskBuilder::new("hooked", move |task, _| task.finish())
            .on_finish(move |_| {
                hook_ran.store(true, Ordering::SeqCst);
            })
            .build()
    };
    task.run(&runtime, Handler::Immediate);
    assert!(task.success());
    assert!(hook_ran.load(Ordering::SeqCst));
}

#[test]
fn rwmutex_hands_write_lock_to_waiting_task() {
    let runtime = Runtime::new(0, 4);
    let rw = Arc::new(TaskRwMutex::new());

    // Reader task holds the lock; a writer task queues behind it.
    let reader_release = Arc::new(AtomicBool::new(false));
    let reader = {
        let rw = Arc::clone(&rw);
        let release = Arc::clone(&reader_release);
        TaskBuilder::new("reader", move |task, state| match state {
            0 => {
                assert!(rw.rdlock(task, 1));
                task.set_state(1);
                task.wait(2); // parked until told to release
            }
            1 => {
                assert!(release.load(Ordering::SeqCst));
                rw.rdunlock();
                task.finish();
            }
            _ => unreachable!(),
        })
        .build()
    };
    let writer = {
        let rw = Arc::clone(&rw);
        TaskBuilder::new("writer", move |task, state| match state {
            0 => {
                task.set_state(1);
                if !rw.wrlock(task, 1) {
                    task.wait(1);
                }
            }
            1 => {
                rw.wrunlock();
                task.finish();
            }
            _ => unreachable!(),
        })
        .build()
    };

    reader.run(&runtime, Handler::Immediate);
    writer.run(&runtime, Handler::Immediate);
    assert!(reader.waiting());
    assert!(writer.waiting(), "writer queued behind the reader");

    reader_release.store(true, Ordering::SeqCst);
    reader.signal(2);
    // rdunlock granted the write lock and signalled the writer inline.
    assert!(reader.success());
    assert!(writer.success());
}
