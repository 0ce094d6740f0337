//! One-shot open/wait barrier.
//!
//! A [`Gate`] lets a thread (typically `main` in a demo or test) block until
//! some other part of the system declares completion. Opening is sticky:
//! every current and future `wait()` returns once `open()` has been called.

use std::sync::{Condvar, Mutex};

/// A sticky one-shot barrier.
pub struct Gate {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    /// Creates a closed gate.
    pub const fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        let mut opened = self.opened.lock().unwrap();
        *opened = true;
        self.cv.notify_all();
    }

    /// Blocks until the gate is opened.
    pub fn wait(&self) {
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            opened = self.cv.wait(opened).unwrap();
        }
    }

    /// Returns `true` if the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.opened.lock().unwrap()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_after_open_returns_immediately() {
        let gate = Gate::new();
        gate.open();
        gate.wait();
        assert!(gate.is_open());
    }

    #[test]
    fn open_releases_a_blocked_waiter() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        gate.open();
        waiter.join().unwrap();
    }

    #[test]
    fn starts_closed() {
        assert!(!Gate::new().is_open());
    }
}
