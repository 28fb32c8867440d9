//! Sleeping locks.

use super::{Guard, Lock, RawLock, SleepableLock};

/// Long-term lock that suspends contending threads.
///
/// Safe to hold across disk I/O; must not be acquired while holding an
/// unrelated spin lock, since acquisition can sleep.
pub struct RawSleepLock {
    /// Whether the lock is held, guarded by a little sleepable spin lock
    /// whose channel parks the contenders.
    locked: SleepableLock<bool>,
}

/// Locks that sleep instead of busy-waiting.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
/// Guards of `SleepLock<T>`.
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: SleepableLock::new(name, false),
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard {
            guard.sleep();
        }
        *guard = true;
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = false;
        guard.wakeup();
    }

    fn name(&self) -> &'static str {
        self.locked.lock.name()
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` named `name` protecting `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(RawSleepLock::new(name), data)
    }
}
