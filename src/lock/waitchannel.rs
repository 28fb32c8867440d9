//! Sleep/wakeup.
//!
//! The kernel this design comes from parks threads on a scheduler channel;
//! a hosted implementation models the same contract with a generation
//! counter under a host mutex plus a condition variable. `sleep` atomically
//! gives up the caller's lock and blocks; `wakeup` wakes every sleeper.
//! Sleepers must re-check their predicate after every wake.

use std::sync::{Condvar, Mutex};

use super::Waitable;

pub struct WaitChannel {
    /// Bumped by every `wakeup`. A sleeper records the value before
    /// releasing its lock; a missed-wakeup race is then impossible, since
    /// any wakeup after that point changes the counter.
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Atomically releases the lock behind `guard` and blocks until a
    /// `wakeup` arrives, then re-acquires the lock before returning.
    pub fn sleep<G: Waitable>(&self, guard: &mut G) {
        let mut generation = self.generation.lock().unwrap();
        let seen = *generation;
        // SAFETY: paired with `raw_acquire` below; the guard is not used
        // while the lock is released.
        unsafe { guard.raw_release() };
        while *generation == seen {
            generation = self.cond.wait(generation).unwrap();
        }
        drop(generation);
        // SAFETY: paired with the `raw_release` above.
        unsafe { guard.raw_acquire() };
    }

    /// Wakes up all sleepers on this channel.
    pub fn wakeup(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }
}
