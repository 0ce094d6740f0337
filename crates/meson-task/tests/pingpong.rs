//! Signal ping-pong under real pool concurrency.
//!
//! Two tasks bounce a single condition bit back and forth thousands of
//! times across worker threads. Every wake-up races the peer's next
//! signal, so this exercises the remembered-signal (skip-wait) path and
//! the relaunch path of the multiplexer; a single lost wake-up deadlocks
//! the test.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use meson_sync::Gate;
use meson_task::{Handler, Runtime, Task, TaskBuilder};

const START: u32 = 0;
const RALLY: u32 = 1;

const ROUNDS: u32 = 10_000;

fn player(
    name: &'static str,
    opener: bool,
    peer: Arc<OnceLock<Arc<Task>>>,
    bumps_sent: Arc<AtomicU32>,
) -> Arc<Task> {
    let mut received = 0u32;
    TaskBuilder::new(name, move |task, state| {
        let peer = peer.get().expect("peer installed before run");
        match state {
            START => {
                task.set_state(RALLY);
                if opener {
                    bumps_sent.fetch_add(1, Ordering::Relaxed);
                    peer.signal(1);
                }
                task.wait(1);
            }
            RALLY => {
                // Each entry into this state corresponds to one received
                // bump (the bit is consumed by the wait that woke us).
                received += 1;
                if received == ROUNDS {
                    // The opener's final receive ends the rally; the other
                    // side still owes the opener its last reply.
                    if !opener {
                        bumps_sent.fetch_add(1, Ordering::Relaxed);
                        peer.signal(1);
                    }
                    task.finish();
                    return;
                }
                bumps_sent.fetch_add(1, Ordering::Relaxed);
                peer.signal(1);
                task.wait(1);
            }
            _ => unreachable!(),
        }
    })
    .build()
}

#[test]
fn ten_thousand_rounds_without_a_lost_wakeup() {
    let runtime = Runtime::new(2, 16);
    let a_slot = Arc::new(OnceLock::new());
    let b_slot = Arc::new(OnceLock::new());
    let bumps_sent = Arc::new(AtomicU32::new(0));

    let a = player("ping", true, Arc::clone(&b_slot), Arc::clone(&bumps_sent));
    let b = player("pong", false, Arc::clone(&a_slot), Arc::clone(&bumps_sent));
    a_slot.set(Arc::clone(&a)).ok().unwrap();
    b_slot.set(Arc::clone(&b)).ok().unwrap();

    let finished = Arc::new(AtomicU32::new(0));
    let all_done = Arc::new(Gate::new());
    for task in [&a, &b] {
        let finished = Arc::clone(&finished);
        let all_done = Arc::clone(&all_done);
        task.run_with_callback(
            &runtime,
            Handler::Queue(runtime.default_queue()),
            move |success| {
                assert!(success);
                if finished.fetch_add(1, Ordering::SeqCst) == 1 {
                    all_done.open();
                }
            },
        );
    }
    all_done.wait();

    assert!(a.success());
    assert!(b.success());
    // Strict alternation: both sides together sent exactly one bump per
    // received round.
    assert_eq!(bumps_sent.load(Ordering::SeqCst), 2 * ROUNDS);
}
