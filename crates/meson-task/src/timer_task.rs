//! A task that completes when a timer expires.
//!
//! [`timer_task`] builds the glue between the timer service and the task
//! world: the returned task starts a one-shot timer whose callback signals
//! it, parks until that signal, and finishes. Run it as a child to give
//! any parent a cancellable timeout bit; abort it to cancel the timer.

use std::sync::{Arc, Mutex};

use meson_timer::{IntervalIndex, Timer};

use crate::task::{Task, TaskBuilder};

const START: u32 = 0;
const EXPIRED: u32 = 1;

fn state_name(state: u32) -> &'static str {
    match state {
        START => "start",
        EXPIRED => "expired",
        _ => "?",
    }
}

/// Builds a task that finishes one `interval` after it starts running.
///
/// The timer fires on the runtime's default queue; the expiration signals
/// condition bit 1 on the task. Aborting the task stops the timer; an
/// expiration that was already in flight lands on a dead task's signal
/// bit, which is harmless (the callback holds only a weak reference).
pub fn timer_task(interval: IntervalIndex) -> Arc<Task> {
    let timer_slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&timer_slot);
    TaskBuilder::new("timer", move |task, state| match state {
        START => {
            let service = Arc::clone(task.runtime().timers());
            let weak = Arc::downgrade(task);
            let timer = Timer::new(&service, move || {
                if let Some(task) = weak.upgrade() {
                    task.signal(1);
                }
            });
            timer.start(interval);
            *slot.lock().unwrap() = Some(timer);
            task.set_state(EXPIRED);
            task.wait(1);
        }
        EXPIRED => task.finish(),
        _ => unreachable!(),
    })
    .state_names(state_name)
    .on_abort(move |_| {
        if let Some(timer) = timer_slot.lock().unwrap().take() {
            timer.stop();
        }
    })
    .build()
}
