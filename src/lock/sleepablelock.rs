//! Sleepable locks.

use super::{Guard, Lock, RawLock, RawSpinLock, WaitChannel, Waitable};

/// A spin lock whose guard can sleep on, and wake, an attached channel.
pub struct RawSleepableLock {
    lock: RawSpinLock,
    waitchannel: WaitChannel,
}

/// Similar to `SpinLock`, but its guards can `sleep()`/`wakeup()`.
pub type SleepableLock<T> = Lock<RawSleepableLock, T>;
/// Guards of `SleepableLock<T>`.
pub type SleepableLockGuard<'s, T> = Guard<'s, RawSleepableLock, T>;

impl RawLock for RawSleepableLock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn name(&self) -> &'static str {
        self.lock.name()
    }
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` named `name` protecting `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(
            RawSleepableLock {
                lock: RawSpinLock::new(name),
                waitchannel: WaitChannel::new(),
            },
            data,
        )
    }
}

impl<T> Waitable for SleepableLockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.raw().lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.raw().lock.acquire();
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Releases the lock and blocks until the next `wakeup` on this lock's
    /// channel; the lock is held again when this returns. The caller must
    /// re-check its predicate.
    pub fn sleep(&mut self) {
        let channel = &self.raw().waitchannel;
        channel.sleep(self);
    }

    /// Wakes every thread sleeping on this lock's channel.
    pub fn wakeup(&self) {
        self.raw().waitchannel.wakeup();
    }

    /// Runs `f` with the lock released, then re-acquires it.
    ///
    /// The protected data must not be touched by `f`; whatever predicate
    /// justified dropping the lock (for the log: `committing` is set) is
    /// the caller's responsibility.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        // SAFETY: paired release/acquire, and `self` is not used between.
        unsafe { self.raw_release() };
        let r = f();
        // SAFETY: as above.
        unsafe { self.raw_acquire() };
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_waits_for_wakeup() {
        let flag = SleepableLock::new("flag", false);
        thread::scope(|s| {
            s.spawn(|| {
                let mut guard = flag.lock();
                while !*guard {
                    guard.sleep();
                }
            });
            s.spawn(|| {
                let mut guard = flag.lock();
                *guard = true;
                guard.wakeup();
            });
        });
        assert!(*flag.lock());
    }
}
