//! Many pool tasks race on one task mutex; mutual exclusion and FIFO
//! handover must hold and no waiter node may leak.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use meson_sync::Gate;
use meson_task::{Handler, Runtime, TaskBuilder, TaskMutex};

const CALL_LOCK: u32 = 0;
const LOCKED: u32 = 1;
const CRITICAL: u32 = 2;
const DONE: u32 = 3;

const TASKS: u32 = 2_000;

fn state_name(state: u32) -> &'static str {
    match state {
        CALL_LOCK => "call_lock",
        LOCKED => "locked",
        CRITICAL => "critical_area",
        DONE => "done",
        _ => "?",
    }
}

#[test]
fn critical_section_never_holds_two_tasks() {
    let runtime = Runtime::new(4, 4096);
    let mutex = Arc::new(TaskMutex::new());
    let inside = Arc::new(AtomicI32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let all_done = Arc::new(Gate::new());

    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let inside = Arc::clone(&inside);
            TaskBuilder::new("mutex-stress", move |task, state| match state {
                CALL_LOCK => {
                    task.set_state(LOCKED);
                    if !mutex.lock(task, 1) {
                        task.wait(1);
                    }
                }
                LOCKED => {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    task.set_state(CRITICAL);
                }
                CRITICAL => {
                    assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                    mutex.unlock();
                    task.set_state(DONE);
                }
                DONE => task.finish(),
                _ => unreachable!(),
            })
            .state_names(state_name)
            .build()
        })
        .collect();

    for task in &tasks {
        let finished = Arc::clone(&finished);
        let all_done = Arc::clone(&all_done);
        task.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(success);
                if finished.fetch_add(1, Ordering::SeqCst) == TASKS - 1 {
                    all_done.open();
                }
            },
        );
    }

    all_done.wait();
    assert_eq!(finished.load(Ordering::SeqCst), TASKS);
    assert_eq!(inside.load(Ordering::SeqCst), 0);
    assert!(!mutex.is_locked());
    assert_eq!(mutex.waiter_nodes(), 0, "leaked waiter nodes");
    for task in &tasks {
        assert!(task.success());
    }
}
