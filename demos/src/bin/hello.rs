//! Two tasks bump each other awake across the thread pool.
//!
//! `hello` parks until `bumper` signals it, then bumps `bumper` back and
//! finishes; an engine mainloop idles alongside, the way a real
//! application's driver thread would.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use meson_task::{Engine, Handler, Runtime, Task, TaskBuilder};
use tracing::info;

const START: u32 = 0;
const WAIT: u32 = 1;
const DONE: u32 = 2;

fn state_name(state: u32) -> &'static str {
    match state {
        START => "start",
        WAIT => "wait",
        DONE => "done",
        _ => "?",
    }
}

struct Half {
    bumped: Arc<AtomicBool>,
    peer: Arc<OnceLock<Arc<Task>>>,
    peer_bumped: Arc<AtomicBool>,
}

fn half_task(name: &'static str, bump_on: u32, half: Half) -> Arc<Task> {
    TaskBuilder::new(name, move |task, state| {
        if state == bump_on {
            let peer = half.peer.get().expect("peer installed");
            half.peer_bumped.store(true, Ordering::SeqCst);
            peer.signal(1);
            info!(from = task.name(), to = peer.name(), "bump");
        }
        match state {
            START => task.set_state(WAIT),
            WAIT => {
                if !half.bumped.load(Ordering::SeqCst) {
                    task.wait(1);
                    return;
                }
                task.set_state(DONE);
            }
            DONE => task.finish(),
            _ => unreachable!(),
        }
    })
    .state_names(state_name)
    .build()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = Runtime::new(2, 8);
    let high_priority = runtime.default_queue();
    // This demo has no engine work; max_duration makes mainloop() return
    // immediately when there is nothing to do.
    let engine = Engine::with_max_duration("main:engine", Duration::from_millis(10));

    let running = Arc::new(AtomicU32::new(2));
    let hello_bumped = Arc::new(AtomicBool::new(false));
    let bumper_bumped = Arc::new(AtomicBool::new(false));
    let hello_slot = Arc::new(OnceLock::new());
    let bumper_slot = Arc::new(OnceLock::new());

    // hello bumps back from its DONE state; bumper opens from START.
    let hello = half_task(
        "hello",
        DONE,
        Half {
            bumped: Arc::clone(&hello_bumped),
            peer: Arc::clone(&bumper_slot),
            peer_bumped: Arc::clone(&bumper_bumped),
        },
    );
    let bumper = half_task(
        "bumper",
        START,
        Half {
            bumped: Arc::clone(&bumper_bumped),
            peer: Arc::clone(&hello_slot),
            peer_bumped: Arc::clone(&hello_bumped),
        },
    );
    hello_slot.set(Arc::clone(&hello)).ok();
    bumper_slot.set(Arc::clone(&bumper)).ok();

    for task in [&hello, &bumper] {
        let running = Arc::clone(&running);
        task.run_with_callback(&runtime, Handler::Queue(high_priority), move |success| {
            assert!(success);
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while running.load(Ordering::SeqCst) > 0 && std::time::Instant::now() < deadline {
        engine.mainloop();
        std::thread::sleep(Duration::from_micros(100));
    }

    anyhow::ensure!(hello.success() && bumper.success(), "handshake did not complete");
    println!("Hello world!");
    Ok(())
}
