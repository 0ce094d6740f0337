//! Stress the task mutex: many pool tasks funnel through one critical
//! section, each asserting it is alone inside.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use meson_sync::Gate;
use meson_task::{Handler, Runtime, TaskBuilder, TaskMutex};
use tracing::info;

const CALL_LOCK: u32 = 0;
const LOCKED: u32 = 1;
const CRITICAL: u32 = 2;
const DONE: u32 = 3;

fn state_name(state: u32) -> &'static str {
    match state {
        CALL_LOCK => "call_lock",
        LOCKED => "locked",
        CRITICAL => "critical_area",
        DONE => "done",
        _ => "?",
    }
}

#[derive(Parser)]
#[command(about = "Race tasks over a single task mutex")]
struct Args {
    /// Number of racing tasks.
    #[arg(short, long, default_value_t = 100_000)]
    tasks: u32,
    /// Pool worker threads.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
    /// Capacity of the pool queue (must hold all tasks comfortably).
    #[arg(short, long, default_value_t = 131_072)]
    queue_capacity: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let runtime = Runtime::new(args.workers, args.queue_capacity);
    let mutex = Arc::new(TaskMutex::new());
    let inside = Arc::new(AtomicI32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let test_finished = Arc::new(Gate::new());

    let tasks: Vec<_> = (0..args.tasks)
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

    info!(tasks = args.tasks, workers = args.workers, "starting");
    let started = Instant::now();
    let total = args.tasks;
    for task in &tasks {
        let finished = Arc::clone(&finished);
        let test_finished = Arc::clone(&test_finished);
        task.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(success, "a stress task was aborted");
                if finished.fetch_add(1, Ordering::SeqCst) == total - 1 {
                    test_finished.open();
                }
            },
        );
    }
    test_finished.wait();
    let elapsed = started.elapsed();

    anyhow::ensure!(inside.load(Ordering::SeqCst) == 0, "critical section not empty");
    anyhow::ensure!(!mutex.is_locked(), "mutex still locked");
    anyhow::ensure!(mutex.waiter_nodes() == 0, "leaked waiter nodes");
    println!(
        "{} tasks through one mutex in {:.3}s",
        args.tasks,
        elapsed.as_secs_f64()
    );
    Ok(())
}
