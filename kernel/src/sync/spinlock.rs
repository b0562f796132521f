//! Spinlock with owner tracking and exponential backoff.
//!
//! The kernel's per-object lock. Held sections are short and never block;
//! every blocking operation parks on a wait queue instead of spinning here.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// No thread owns this lock.
const NO_OWNER: u64 = u64::MAX;

/// A spinlock protecting data of type `T`.
///
/// Tracks the owning thread ID (the kernel thread on whose behalf the lock
/// was taken, or [`NO_OWNER`]) so invariant violations can name the holder.
pub struct Spinlock<T> {
    lock: AtomicBool,
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

/// RAII guard for a held [`Spinlock`].
///
/// Provides `Deref`/`DerefMut` access to the protected data and releases the
/// lock on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    /// Create a new unlocked spinlock wrapping the given data.
    pub const fn new(data: T) -> Self {
        Spinlock {
            lock: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Exponential PAUSE backoff: 1, 2, 4, ... 64 pauses per check.
            // Reduces cache-line bouncing under contention.
            let mut backoff: u32 = 1;
            while self.lock.load(Ordering::Relaxed) {
                for _ in 0..backoff {
                    core::hint::spin_loop();
                }
                if backoff < 64 {
                    backoff <<= 1;
                }
            }
        }
        SpinlockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` otherwise.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Check if this lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Record the thread on whose behalf the lock is held. Diagnostic only.
    #[inline]
    pub fn set_owner(&self, tid: u64) {
        self.owner.store(tid, Ordering::Relaxed);
    }

    /// The thread recorded by [`set_owner`](Spinlock::set_owner), if any.
    #[inline]
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            tid => Some(tid),
        }
    }
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.lock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_protects_data() {
        let lock = Spinlock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 41;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 41);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = Spinlock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_owner_tracking() {
        let lock = Spinlock::new(());
        let g = lock.lock();
        lock.set_owner(7);
        assert_eq!(lock.owner(), Some(7));
        drop(g);
        assert_eq!(lock.owner(), None);
    }
}
