//! Fork/join Fibonacci: every task spawns two sub-tasks on the pool and
//! waits for both to signal the same condition bit.

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use clap::Parser;
use meson_sync::Gate;
use meson_task::{Handler, Runtime, Task, TaskBuilder};
use tracing::debug;

const START: u32 = 0;
const WAIT: u32 = 1;
const MATH: u32 = 2;
const DONE: u32 = 3;

fn state_name(state: u32) -> &'static str {
    match state {
        START => "start",
        WAIT => "wait",
        MATH => "math",
        DONE => "done",
        _ => "?",
    }
}

#[derive(Parser)]
#[command(about = "Compute a Fibonacci number with one task per addition")]
struct Args {
    /// Which Fibonacci number to compute.
    #[arg(short, long, default_value_t = 10)]
    number: u64,
    /// Pool worker threads.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

type Spawned = (Arc<Task>, Arc<OnceLock<u64>>);

fn fibonacci_task(index: u64) -> Spawned {
    let value = Arc::new(OnceLock::new());
    let result = Arc::clone(&value);
    let mut children: Option<(Spawned, Spawned)> = None;

    let task = TaskBuilder::new("fibonacci", move |task, state| match state {
        START => {
            if index < 2 {
                result.set(1).expect("value set once");
                task.set_state(DONE);
                return;
            }
            let largest = fibonacci_task(index - 1);
            let smallest = fibonacci_task(index - 2);
            let queue = task.runtime().default_queue();
            largest
                .0
                .run_as_child(&task.runtime(), Handler::Queue(queue), task, 1);
            smallest
                .0
                .run_as_child(&task.runtime(), Handler::Queue(queue), task, 1);
            children = Some((largest, smallest));
            task.set_state(WAIT);
        }
        WAIT => {
            let (largest, smallest) = children.as_ref().expect("children spawned");
            if !(largest.0.finished() && smallest.0.finished()) {
                task.wait(1);
                return;
            }
            task.set_state(MATH);
        }
        MATH => {
            let (largest, smallest) = children.take().expect("children spawned");
            let sum = largest.1.get().unwrap() + smallest.1.get().unwrap();
            debug!(index, sum, "computed");
            result.set(sum).expect("value set once");
            task.set_state(DONE);
        }
        DONE => task.finish(),
        _ => unreachable!(),
    })
    .state_names(state_name)
    .build();
    (task, value)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let runtime = Runtime::new(args.workers, 4096);
    let (root, value) = fibonacci_task(args.number);

    let done = Arc::new(Gate::new());
    {
        let done = Arc::clone(&done);
        root.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(success, "root task aborted");
                done.open();
            },
        );
    }
    done.wait();

    let result = value.get().copied().expect("root task computed a value");
    println!("{result}");
    Ok(())
}
