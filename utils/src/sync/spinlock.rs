//! A minimal test-and-test-and-set spinlock for `no_std` contexts.
//!
//! This is intentionally tiny: the CORE only ever needs it for the rare
//! process-wide resource (eg. a GID/ASID pool shared across vCPUs by the
//! embedding hypervisor); per-vCPU state is never touched from more than
//! one thread (see the concurrency model).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Marker trait for types that are safe to guard with a [`SpinLock`].
///
/// There's nothing to implement; it exists so call sites read as
/// `static FOO: SpinLock<Bar> = ...` only for `Bar: SpinLockable`, matching
/// the rest of the pool-allocator types in this crate.
pub trait SpinLockable {}

/// A simple spinlock.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        SpinLockGuard { lock: self }
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 5);
            *guard = 10;
        }
        assert_eq!(*lock.lock(), 10);
    }
}
