//! Spin locks.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};

/// Mutual exclusion lock that busy-waits.
///
/// Critical sections under a spin lock must be short and must never
/// suspend: no disk I/O, no sleeping on a channel, no sleep-lock
/// contention.
pub struct RawSpinLock {
    name: &'static str,
    locked: AtomicBool,
}

/// Locks that busy-wait.
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub(super) const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSpinLock {
    fn acquire(&self) {
        // The `Acquire` exchange pairs with the `Release` store below, so
        // every store made inside one critical section is visible to loads
        // in the next.
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` named `name` protecting `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(RawSpinLock::new(name), data)
    }
}
