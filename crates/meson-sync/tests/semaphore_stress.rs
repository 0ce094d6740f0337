//! Semaphore stress: producer bursts against parked consumers.
//!
//! Four trigger threads post tokens two at a time while four sleeper
//! threads consume them one wait() at a time. Every token must wake exactly
//! one wait, and when everything has drained the state word must be exactly
//! zero again (no leaked waiter, wake or woke counts).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use meson_sync::SpinSemaphore;

const POST_AMOUNT: u32 = 2;
const SLEEPER_THREADS: usize = 4;
const TRIGGER_THREADS: usize = 4;
const TOTAL_WAITS: u64 = 120_000;
const WAITS_PER_SLEEPER: u64 = TOTAL_WAITS / SLEEPER_THREADS as u64;
const POSTS_PER_TRIGGER: u64 =
    TOTAL_WAITS / TRIGGER_THREADS as u64 / POST_AMOUNT as u64;

#[test]
fn producer_bursts_wake_every_consumer_exactly_once() {
    let sem = Arc::new(SpinSemaphore::new(0));
    let go = Arc::new(AtomicBool::new(false));
    let woken_up_count = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();

    for _ in 0..SLEEPER_THREADS {
        let sem = Arc::clone(&sem);
        let go = Arc::clone(&go);
        let woken_up_count = Arc::clone(&woken_up_count);
        handles.push(thread::spawn(move || {
            while !go.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            for _ in 0..WAITS_PER_SLEEPER {
                if let Err(word) = sem.fast_try_wait() {
                    sem.slow_wait(word);
                }
                woken_up_count.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for _ in 0..TRIGGER_THREADS {
        let sem = Arc::clone(&sem);
        let go = Arc::clone(&go);
        handles.push(thread::spawn(move || {
            while !go.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            for _ in 0..POSTS_PER_TRIGGER {
                // Throttle so consumers keep hitting the park path instead
                // of burning through a token backlog.
                while sem.tokens() > 8 {
                    std::hint::spin_loop();
                }
                sem.post(POST_AMOUNT);
            }
        }));
    }

    go.store(true, Ordering::Release);
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(woken_up_count.load(Ordering::SeqCst), TOTAL_WAITS);
    assert_eq!(
        sem.raw_word(),
        0,
        "tokens, spinner, wake and waiter counts must all drain to zero"
    );
}
