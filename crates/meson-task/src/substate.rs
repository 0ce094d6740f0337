//! The per-task atomic sub-state word.
//!
//! One `AtomicU64` holds everything the signal/wait machinery needs:
//!
//! ```text
//! bits  0..16   signals    pending condition bits
//! bits 16..32   waiting    condition bits of the current wait, 0 = none
//! bits 32..48   required   subset of `waiting` that must all fire
//! bits 48..     flags      IDLE, EXECUTING, RELAUNCH, ABORTED, FINISHED
//! ```
//!
//! Every transition is a CAS loop. The rules (per condition bit):
//!
//! * `signal` on a task that is not idle remembers the bit (saturating) and
//!   reports `Remembered` — the next `wait` on that bit returns
//!   immediately, consuming it.
//! * `wait` with no satisfying pending bits stores the masks and parks the
//!   task (`IDLE`).
//! * `signal` that satisfies an idle task's wait clears `IDLE`, consumes
//!   the fired bits, and reports `Woken` — exactly one signaller wins.
//!
//! A wait is satisfied when all `required` bits are pending, or when any
//! waited bit outside `required` (an OR bit) is. On wake-up the required
//! subset is cleared in full, OR bits only where they fired; pending bits
//! outside the waited mask are kept for a later wait.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

const SIGNALS_SHIFT: u32 = 0;
const WAITING_SHIFT: u32 = 16;
const REQUIRED_SHIFT: u32 = 32;
const FLAGS_SHIFT: u32 = 48;
const FIELD: u64 = 0xffff;

bitflags! {
    /// Flag bits of the sub-state word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct StateFlags: u64 {
        /// The task has parked in a `wait()` and not been woken yet.
        const IDLE = 1 << 48;
        /// A thread is inside the task's multiplex loop.
        const EXECUTING = 1 << 49;
        /// A multiplex attempt found EXECUTING set; the executing thread
        /// must run one more cycle before releasing.
        const RELAUNCH = 1 << 50;
        /// `abort()` was requested.
        const ABORTED = 1 << 51;
        /// `finish()` was called.
        const FINISHED = 1 << 52;
    }
}

/// Decoded copy of the word, for assertions and debugging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Pending condition bits.
    pub signals: u16,
    /// Condition bits of the current wait (0 when not waiting).
    pub waiting: u16,
    /// AND-subset of `waiting`.
    pub required: u16,
    /// Flag bits.
    pub flags: StateFlags,
}

/// Effect of [`SubState::raise_signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalEffect {
    /// The signal satisfied a parked wait; the caller must reschedule the
    /// task. Exactly one signaller observes this per park.
    Woken,
    /// The bits were recorded for a later wait (or the task keeps waiting
    /// on other bits).
    Remembered,
}

/// Outcome of [`SubState::begin_wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Pending signals already satisfy the wait; the task keeps running.
    Runnable,
    /// The task parked; a satisfying signal will wake it.
    Parked,
}

fn signals(word: u64) -> u16 {
    ((word >> SIGNALS_SHIFT) & FIELD) as u16
}

fn waiting(word: u64) -> u16 {
    ((word >> WAITING_SHIFT) & FIELD) as u16
}

fn required(word: u64) -> u16 {
    ((word >> REQUIRED_SHIFT) & FIELD) as u16
}

fn compose(signals: u16, waiting: u16, required: u16, flags: u64) -> u64 {
    u64::from(signals) << SIGNALS_SHIFT
        | u64::from(waiting) << WAITING_SHIFT
        | u64::from(required) << REQUIRED_SHIFT
        | flags
}

fn flag_bits(word: u64) -> u64 {
    word >> FLAGS_SHIFT << FLAGS_SHIFT
}

/// Checks whether `pending` satisfies a wait on (`waiting`, `required`),
/// returning the bits to consume, or `None` when unsatisfied.
fn satisfied(pending: u16, waiting: u16, required: u16) -> Option<u16> {
    let or_bits = waiting & !required;
    let fired_or = pending & or_bits;
    let required_ok = required != 0 && pending & required == required;
    if required_ok || fired_or != 0 {
        let mut consumed = fired_or;
        if required_ok {
            consumed |= required;
        }
        Some(consumed)
    } else {
        None
    }
}

/// The atomic sub-state of one task.
pub struct SubState {
    word: AtomicU64,
}

impl SubState {
    /// A fresh word: no signals, no wait, no flags.
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Clears everything; only legal while the task is not running.
    pub fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Decodes the current word.
    pub fn snapshot(&self) -> Snapshot {
        let word = self.word.load(Ordering::Relaxed);
        Snapshot {
            signals: signals(word),
            waiting: waiting(word),
            required: required(word),
            flags: StateFlags::from_bits_truncate(word),
        }
    }

    fn contains(&self, flag: StateFlags) -> bool {
        self.word.load(Ordering::Relaxed) & flag.bits() != 0
    }

    /// Returns `true` while the task is parked in a wait.
    pub fn is_idle(&self) -> bool {
        self.contains(StateFlags::IDLE)
    }

    /// Returns `true` while a thread is inside the task's multiplex loop.
    pub fn is_executing(&self) -> bool {
        self.contains(StateFlags::EXECUTING)
    }

    /// Returns `true` once `abort()` has been requested.
    pub fn aborted(&self) -> bool {
        self.contains(StateFlags::ABORTED)
    }

    /// Returns `true` once `finish()` has been called.
    pub fn finished(&self) -> bool {
        self.contains(StateFlags::FINISHED)
    }

    /// Delivers `mask` to the task.
    pub fn raise_signal(&self, mask: u16) -> SignalEffect {
        debug_assert!(mask != 0, "signal() with an empty mask");
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let pending = signals(word) | mask;
            let new = if word & StateFlags::IDLE.bits() == 0 {
                // Not parked: remember the bits for the next wait.
                if signals(word) == pending {
                    return SignalEffect::Remembered; // saturated
                }
                compose(pending, waiting(word), required(word), flag_bits(word))
            } else {
                match satisfied(pending, waiting(word), required(word)) {
                    Some(consumed) => compose(
                        pending & !consumed,
                        0,
                        0,
                        flag_bits(word) & !StateFlags::IDLE.bits(),
                    ),
                    None => compose(pending, waiting(word), required(word), flag_bits(word)),
                }
            };
            let woken = word & StateFlags::IDLE.bits() != 0 && new & StateFlags::IDLE.bits() == 0;
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return if woken {
                        SignalEffect::Woken
                    } else {
                        SignalEffect::Remembered
                    };
                }
                Err(current) => word = current,
            }
        }
    }

    /// Starts a wait on `mask` with the given AND-subset.
    ///
    /// Must be called from inside the task's step function (the word has
    /// EXECUTING set). `required` must be a subset of `mask`.
    pub fn begin_wait(&self, mask: u16, required_mask: u16) -> WaitOutcome {
        debug_assert!(mask != 0, "wait() with an empty mask");
        debug_assert!(
            required_mask & !mask == 0,
            "required bits must be a subset of the waited mask"
        );
        debug_assert!(self.is_executing(), "wait() outside the step function");
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let pending = signals(word);
            let new = match satisfied(pending, mask, required_mask) {
                // Skip the wait: satisfying signals arrived up front.
                Some(consumed) => compose(
                    pending & !consumed,
                    0,
                    0,
                    flag_bits(word) & !StateFlags::IDLE.bits(),
                ),
                None => compose(
                    pending,
                    mask,
                    required_mask,
                    flag_bits(word) | StateFlags::IDLE.bits(),
                ),
            };
            let parked = new & StateFlags::IDLE.bits() != 0;
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return if parked {
                        WaitOutcome::Parked
                    } else {
                        WaitOutcome::Runnable
                    };
                }
                Err(current) => word = current,
            }
        }
    }

    /// Cancels a pending wait (the `set_state` rule). Returns `true` when
    /// the task was parked and is now runnable again.
    pub fn void_wait(&self) -> bool {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            if word & StateFlags::IDLE.bits() == 0 {
                return false;
            }
            let new = compose(
                signals(word),
                0,
                0,
                flag_bits(word) & !StateFlags::IDLE.bits(),
            );
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Claims the multiplex loop.
    ///
    /// Returns `true` when this thread now owns EXECUTING. Returns `false`
    /// when another thread does; RELAUNCH is recorded so that the owner
    /// runs one more cycle instead of parking the wake-up.
    pub fn enter_multiplex(&self) -> bool {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let new = if word & StateFlags::EXECUTING.bits() == 0 {
                word | StateFlags::EXECUTING.bits()
            } else {
                word | StateFlags::RELAUNCH.bits()
            };
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return word & StateFlags::EXECUTING.bits() == 0,
                Err(current) => word = current,
            }
        }
    }

    /// Releases the multiplex loop.
    ///
    /// Returns `true` when EXECUTING was released. Returns `false` when a
    /// RELAUNCH had been recorded: the flag is consumed, EXECUTING stays
    /// held, and the caller must run another cycle.
    pub fn finish_executing(&self) -> bool {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            debug_assert!(word & StateFlags::EXECUTING.bits() != 0);
            let relaunch = word & StateFlags::RELAUNCH.bits() != 0;
            let new = if relaunch {
                word & !StateFlags::RELAUNCH.bits()
            } else {
                word & !StateFlags::EXECUTING.bits()
            };
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return !relaunch,
                Err(current) => word = current,
            }
        }
    }

    /// Records an abort request. Returns `true` when the task was parked
    /// (and is now runnable so the abort can be processed).
    pub fn raise_abort(&self) -> bool {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let was_idle = word & StateFlags::IDLE.bits() != 0;
            let new = (word | StateFlags::ABORTED.bits()) & !StateFlags::IDLE.bits();
            let new = if was_idle {
                compose(signals(new), 0, 0, flag_bits(new))
            } else {
                new
            };
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return was_idle,
                Err(current) => word = current,
            }
        }
    }

    /// Records that `finish()` was called.
    pub fn mark_finished(&self) {
        self.word
            .fetch_or(StateFlags::FINISHED.bits(), Ordering::AcqRel);
    }
}

impl Default for SubState {
    fn default() -> Self {
        Self::new()
    }
}
