//! Counting semaphore with one user-space spinner.
//!
//! [`SpinSemaphore`] is the sleep/wake mechanism of the thread pool: every
//! `notify_one()` on a pool queue posts one token here, and idle workers
//! `wait()` for tokens. At most one waiting thread spins in user space (for
//! wake-up latency); all other waiters sleep in the kernel on a futex.
//!
//! The entire state lives in one 64-bit atomic word:
//!
//! ```text
//! bits  0..32   tokens        available tokens
//! bit   32      spinner       a thread is spinning in user space
//! bits 33..40   wake_pending  futex wakes issued, not yet received
//! bits 40..48   woke          threads woken, not yet holding a token
//! bits 48..64   nwaiters      threads inside slow_wait (spinner included)
//! ```
//!
//! `wake_pending` and `woke` exist to keep futex traffic down: a post never
//! wakes more sleepers than there are uncovered tokens, and a freshly woken
//! thread suppresses further wakes until it has either grabbed a token or
//! gone back to sleep. Both counters clamp at their field capacity; behavior
//! beyond the clamp is unspecified (pathological load only).
//!
//! Ordering: `post` publishes with Release on the token add; token
//! acquisition is an Acquire CAS. Wake-credit bookkeeping is Relaxed — the
//! futex syscall orders the sleep/wake handoff itself.

use std::sync::atomic::{AtomicU64, Ordering};

const TOKENS_MASK: u64 = 0xffff_ffff;
const SPINNER: u64 = 1 << 32;
const WAKE_SHIFT: u32 = 33;
const WAKE_ONE: u64 = 1 << WAKE_SHIFT;
const WAKE_MASK: u64 = 0x7f << WAKE_SHIFT;
const WAKE_MAX: u64 = 7;
const WOKE_SHIFT: u32 = 40;
const WOKE_ONE: u64 = 1 << WOKE_SHIFT;
const WOKE_MASK: u64 = 0xff << WOKE_SHIFT;
const WOKE_MAX: u64 = 255;
const NWAITERS_SHIFT: u32 = 48;
const ONE_WAITER: u64 = 1 << NWAITERS_SHIFT;

const fn tokens(word: u64) -> u64 {
    word & TOKENS_MASK
}

const fn wake_pending(word: u64) -> u64 {
    (word & WAKE_MASK) >> WAKE_SHIFT
}

const fn woke(word: u64) -> u64 {
    (word & WOKE_MASK) >> WOKE_SHIFT
}

const fn nwaiters(word: u64) -> u64 {
    word >> NWAITERS_SHIFT
}

const fn has_spinner(word: u64) -> bool {
    word & SPINNER != 0
}

/// A counting semaphore with a spin-then-futex wait path.
///
/// `post(n)` adds `n` tokens; each successful `wait()` consumes exactly one.
/// One waiter may spin in user space instead of sleeping; the spinner never
/// enters the kernel and, after taking its token, forwards any remaining
/// tokens to sleeping waiters.
pub struct SpinSemaphore {
    word: AtomicU64,
    #[cfg(not(target_os = "linux"))]
    parker: fallback::Parker,
}

impl SpinSemaphore {
    /// Creates a semaphore holding `initial` tokens.
    pub const fn new(initial: u32) -> Self {
        Self {
            word: AtomicU64::new(initial as u64),
            #[cfg(not(target_os = "linux"))]
            parker: fallback::Parker::new(),
        }
    }

    /// Number of currently available tokens.
    pub fn tokens(&self) -> u32 {
        tokens(self.word.load(Ordering::Relaxed)) as u32
    }

    /// The raw state word, for diagnostics and tests.
    pub fn raw_word(&self) -> u64 {
        self.word.load(Ordering::Relaxed)
    }

    /// Adds `n` tokens and wakes up to `n` sleeping waiters.
    ///
    /// If a spinner is present no futex wake is issued; the spinner will
    /// take a token and forward the rest.
    pub fn post(&self, n: u32) {
        debug_assert!(n > 0, "post() of zero tokens");
        self.word.fetch_add(n as u64, Ordering::Release);
        self.wake_sleepers();
    }

    /// Tries to take a token without ever waiting.
    pub fn try_wait(&self) -> bool {
        self.fast_try_wait().is_ok()
    }

    /// The fast acquisition path: CAS a token away if one is available.
    ///
    /// # Errors
    ///
    /// Returns the observed word when no token was available; pass it to
    /// [`slow_wait`](Self::slow_wait) to park.
    pub fn fast_try_wait(&self) -> Result<(), u64> {
        let mut word = self.word.load(Ordering::Relaxed);
        while tokens(word) > 0 {
            match self.word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => word = current,
            }
        }
        Err(word)
    }

    /// Takes a token, parking until one is available.
    pub fn wait(&self) {
        if let Err(word) = self.fast_try_wait() {
            self.slow_wait(word);
        }
    }

    /// The slow acquisition path, entered after
    /// [`fast_try_wait`](Self::fast_try_wait) observed zero tokens.
    ///
    /// The first arrival claims the spinner slot and busy-waits; everyone
    /// else registers as a waiter and sleeps on the futex word.
    pub fn slow_wait(&self, observed: u64) {
        let mut word = observed;
        loop {
            if tokens(word) > 0 {
                match self.word.compare_exchange_weak(
                    word,
                    word - 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(current) => {
                        word = current;
                        continue;
                    }
                }
            }
            if has_spinner(word) {
                // Register as a sleeper.
                match self.word.compare_exchange_weak(
                    word,
                    word + ONE_WAITER,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.sleep_until_token();
                        return;
                    }
                    Err(current) => word = current,
                }
            } else {
                // Claim the spin slot.
                match self.word.compare_exchange_weak(
                    word,
                    (word | SPINNER) + ONE_WAITER,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.spin_until_token();
                        return;
                    }
                    Err(current) => word = current,
                }
            }
        }
    }

    /// Spinner path: busy-wait for a token, never sleeping.
    ///
    /// On success the spinner slot is released in the same CAS that takes
    /// the token, and any tokens left over are forwarded to sleepers (posts
    /// made while a spinner exists skip the futex wake entirely).
    fn spin_until_token(&self) {
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if tokens(word) == 0 {
                std::hint::spin_loop();
                continue;
            }
            debug_assert!(has_spinner(word));
            let new = (word - 1 - ONE_WAITER) & !SPINNER;
            if self
                .word
                .compare_exchange_weak(word, new, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Delegated wake-up duty.
                self.wake_sleepers();
                return;
            }
        }
    }

    /// Sleeper path: futex-wait while the token count is zero.
    fn sleep_until_token(&self) {
        let mut have_credit = false;
        loop {
            let mut word = self.word.load(Ordering::Relaxed);
            while tokens(word) > 0 {
                let mut new = word - 1 - ONE_WAITER;
                if have_credit {
                    new -= WOKE_ONE;
                }
                match self.word.compare_exchange_weak(
                    word,
                    new,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(current) => word = current,
                }
            }
            // No token for us: drop any wake credit before going (back) to
            // sleep so posters resume waking other sleepers.
            if have_credit {
                self.word.fetch_sub(WOKE_ONE, Ordering::Relaxed);
                have_credit = false;
            }
            if self.futex_wait() {
                // A genuine wake: convert one pending wake into a woke
                // credit, suppressing redundant wakes while we retry. A
                // saturated credit field drops the credit (costing at worst
                // an extra wake) but the pending count must drain anyway.
                let mut w = self.word.load(Ordering::Relaxed);
                while wake_pending(w) > 0 {
                    let credit = woke(w) < WOKE_MAX;
                    let new = if credit {
                        w - WAKE_ONE + WOKE_ONE
                    } else {
                        w - WAKE_ONE
                    };
                    match self
                        .word
                        .compare_exchange_weak(w, new, Ordering::Relaxed, Ordering::Relaxed)
                    {
                        Ok(_) => {
                            have_credit = credit;
                            break;
                        }
                        Err(current) => w = current,
                    }
                }
            }
        }
    }

    /// Issues futex wakes for sleepers not yet covered by a token-carrying
    /// wake. No-op while a spinner exists (the spinner forwards tokens on
    /// its way out).
    fn wake_sleepers(&self) {
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if has_spinner(word) {
                return;
            }
            let sleepers = nwaiters(word);
            let uncovered = sleepers.saturating_sub(wake_pending(word) + woke(word));
            let budget = WAKE_MAX.saturating_sub(wake_pending(word));
            let to_wake = tokens(word).min(uncovered).min(budget);
            if to_wake == 0 {
                return;
            }
            if self
                .word
                .compare_exchange_weak(
                    word,
                    word + to_wake * WAKE_ONE,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let woken = self.futex_wake(to_wake as u32);
                if u64::from(woken) < to_wake {
                    // Some wakes hit nobody (a sleeper raced ahead on the
                    // EAGAIN path); return the unused credits.
                    self.word
                        .fetch_sub((to_wake - u64::from(woken)) * WAKE_ONE, Ordering::Relaxed);
                }
                return;
            }
        }
    }

    /// Pointer to the low 32 bits of the word (the token count), which is
    /// the futex cell.
    #[cfg(target_os = "linux")]
    fn futex_cell(&self) -> *mut u32 {
        let ptr = self.word.as_ptr().cast::<u32>();
        #[cfg(target_endian = "big")]
        let ptr = ptr.wrapping_add(1);
        ptr
    }

    /// Sleeps while the token count is zero. Returns `true` when woken by a
    /// futex wake, `false` on a spurious return (token already present, or
    /// an interrupting signal).
    #[cfg(target_os = "linux")]
    fn futex_wait(&self) -> bool {
        // SAFETY: futex_cell points into our own atomic word, which outlives
        // the call; FUTEX_WAIT compares against the expected value in-kernel.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex_cell(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                std::ptr::null::<libc::timespec>(),
            )
        };
        rc == 0
    }

    #[cfg(target_os = "linux")]
    fn futex_wake(&self, n: u32) -> u32 {
        // SAFETY: futex_cell points into our own atomic word.
        let rc = unsafe { libc::syscall(libc::SYS_futex, self.futex_cell(), libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG, n) };
        u32::try_from(rc.max(0)).unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn futex_wait(&self) -> bool {
        self.parker.wait(|| tokens(self.word.load(Ordering::Relaxed)) == 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn futex_wake(&self, n: u32) -> u32 {
        self.parker.wake(n)
    }
}

impl Default for SpinSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Mutex/condvar stand-in for the futex syscall on non-Linux hosts.
#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::sync::{Condvar, Mutex};

    pub(super) struct Parker {
        sleepers: Mutex<usize>,
        cv: Condvar,
    }

    impl Parker {
        pub(super) const fn new() -> Self {
            Self {
                sleepers: Mutex::new(0),
                cv: Condvar::new(),
            }
        }

        pub(super) fn wait(&self, still_empty: impl Fn() -> bool) -> bool {
            let mut sleepers = self.sleepers.lock().unwrap();
            if !still_empty() {
                return false;
            }
            *sleepers += 1;
            let mut guard = self.cv.wait(sleepers).unwrap();
            *guard -= 1;
            true
        }

        pub(super) fn wake(&self, n: u32) -> u32 {
            let sleepers = self.sleepers.lock().unwrap();
            let woken = (n as usize).min(*sleepers);
            for _ in 0..woken {
                self.cv.notify_one();
            }
            u32::try_from(woken).unwrap_or(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn try_wait_on_empty_fails() {
        let sem = SpinSemaphore::new(0);
        assert!(!sem.try_wait());
        assert_eq!(sem.raw_word(), 0);
    }

    #[test]
    fn post_then_try_wait() {
        let sem = SpinSemaphore::new(0);
        sem.post(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        assert_eq!(sem.raw_word(), 0);
    }

    #[test]
    fn initial_tokens_are_available() {
        let sem = SpinSemaphore::new(3);
        assert_eq!(sem.tokens(), 3);
        sem.wait();
        sem.wait();
        sem.wait();
        assert_eq!(sem.tokens(), 0);
    }

    #[test]
    fn fast_try_wait_reports_observed_word() {
        let sem = SpinSemaphore::new(0);
        let word = sem.fast_try_wait().unwrap_err();
        assert_eq!(tokens(word), 0);
    }

    #[test]
    fn post_before_wait_is_not_lost() {
        let sem = SpinSemaphore::new(0);
        sem.post(1);
        sem.wait(); // must not block
        assert_eq!(sem.raw_word(), 0);
    }

    #[test]
    fn wake_crosses_threads() {
        let sem = Arc::new(SpinSemaphore::new(0));
        let woken = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let sem = Arc::clone(&sem);
            let woken = Arc::clone(&woken);
            handles.push(std::thread::spawn(move || {
                sem.wait();
                woken.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Give the waiters time to park (one spinning, two sleeping).
        std::thread::sleep(std::time::Duration::from_millis(20));
        sem.post(3);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        assert_eq!(sem.raw_word(), 0, "all bookkeeping must drain to zero");
    }

    #[test]
    fn word_field_extractors() {
        let w = (5u64 << NWAITERS_SHIFT) | (2 << WOKE_SHIFT) | (3 << WAKE_SHIFT) | SPINNER | 7;
        assert_eq!(tokens(w), 7);
        assert!(has_spinner(w));
        assert_eq!(wake_pending(w), 3);
        assert_eq!(woke(w), 2);
        assert_eq!(nwaiters(w), 5);
    }
}
