//! The lock module.
//!
//! Two families of locks cooperate in the file system. Spin locks guard
//! short critical sections over in-memory structures and are never held
//! across anything that may suspend the thread. Sleep locks guard long
//! operations (disk I/O on a buffer, loaded inode contents) and suspend
//! contending threads instead of burning a core.
//!
//! All of them share one generic `Lock`/`Guard` layering over a `RawLock`,
//! so a guard is the only way to reach the protected data and dropping it
//! is the only way to release the lock.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;
mod waitchannel;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use waitchannel::WaitChannel;

/// A primitive mutual exclusion mechanism: how to take and give back the
/// lock, without any notion of what it protects.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn name(&self) -> &'static str;
}

/// Lock guards that a `WaitChannel` can put to sleep.
pub trait Waitable {
    /// Releases the underlying raw lock without consuming the guard.
    ///
    /// # Safety
    ///
    /// `raw_release` and `raw_acquire` must be used as a pair, and the
    /// guard must not be used for anything else in between.
    unsafe fn raw_release(&mut self);

    /// Re-acquires the underlying raw lock.
    ///
    /// # Safety
    ///
    /// Must follow a matching `raw_release` on the same guard.
    unsafe fn raw_acquire(&mut self);
}

/// A value of type `T` protected by a raw lock `R`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes all access to `data`.
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub(super) const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns its guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a raw pointer to the protected data without locking.
    ///
    /// The caller must ensure that dereferencing the pointer does not race
    /// with a guard; the usual argument is that some other state proves no
    /// guard can currently exist.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns the protected data; `&mut self` proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<R: RawLock, T> fmt::Debug for Lock<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock {{ name: {:?}, .. }}", self.lock.name())
    }
}

/// Proof of lock ownership, and the only path to the protected data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    pub(super) fn raw(&self) -> &'s R {
        &self.lock.lock
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
