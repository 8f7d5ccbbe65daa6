//! Busy-waiting locks for processor-based mutual exclusion.
//!
//! Spinlocks are owned by **processors**, not threads: acquiring one
//! disables interrupts on the current CPU and records the previous EFLAGS
//! image in the guard, so that dropping the guard restores the interrupt
//! flag along with releasing the lock. Holding a guard across any operation
//! that can suspend the current thread is a fatal programming error; the
//! scheduler would hand the CPU to a thread that may spin on the same lock
//! forever.
//!
//! Because the saved EFLAGS travels with the guard, guards must be dropped
//! in the reverse order of acquisition when nested, which Rust's drop order
//! enforces for stack-held guards.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::arch::{interrupts_disable, interrupts_restore, pause};

/// A spinlock protecting a value of type `T`.
///
/// `SpinLock<()>` is used where the lock guards structures linked through
/// raw pointers rather than owned data (queues, pool part lists).
pub struct SpinLock<T = ()> {
    taken: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock provides the exclusion required to hand out &mut T, and
// acquisition disables interrupts so interrupt-context code on the same CPU
// cannot observe a half-updated T either.
unsafe impl<T: Send> Sync for SpinLock<T> {}
// SAFETY: moving the lock moves the T it owns.
unsafe impl<T: Send> Send for SpinLock<T> {}

/// RAII guard for a held [`SpinLock`]. Releasing the lock and restoring the
/// saved interrupt flag both happen on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    eflags: u32,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock {
            taken: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// Interrupts are disabled for as long as the returned guard lives.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let eflags = interrupts_disable();
        while self
            .taken
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.taken.load(Ordering::Relaxed) {
                pause();
            }
        }
        SpinLockGuard { lock: self, eflags }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let eflags = interrupts_disable();
        if self
            .taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self, eflags })
        } else {
            interrupts_restore(eflags);
            None
        }
    }

    /// Re-acquires the lock using an EFLAGS image previously returned by
    /// [`SpinLockGuard::release_preserving`].
    ///
    /// Used by the spinlock-backed condition variable, which must restore
    /// the interrupt state of the *original* acquisition after waking up.
    pub fn lock_with_eflags(&self, eflags: u32) -> SpinLockGuard<'_, T> {
        while self
            .taken
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.taken.load(Ordering::Relaxed) {
                pause();
            }
        }
        SpinLockGuard { lock: self, eflags }
    }

    /// Whether the lock is currently held by some CPU.
    pub fn is_locked(&self) -> bool {
        self.taken.load(Ordering::Relaxed)
    }

    /// Bypasses the lock entirely.
    ///
    /// # Safety
    ///
    /// Only for the crash path: the caller must guarantee no other CPU or
    /// interrupt context will ever touch the data again (interrupts off,
    /// CPU about to halt).
    pub unsafe fn force_get(&self) -> &mut T {
        // SAFETY: exclusivity is the caller's contract.
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the lock but keeps interrupts disabled, returning the saved
    /// EFLAGS image for a later [`SpinLock::lock_with_eflags`].
    pub fn release_preserving(self) -> u32 {
        let eflags = self.eflags;
        self.lock.taken.store(false, Ordering::Release);
        core::mem::forget(self);
        eflags
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held, so no other CPU can
        // have a reference into the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, plus &mut self prevents aliasing through this
        // guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.taken.store(false, Ordering::Release);
        interrupts_restore(self.eflags);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(5u32);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(*lock.try_lock().expect("lock should be free again"), 5);
    }

    #[test]
    fn release_preserving_frees_the_lock() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        let eflags = guard.release_preserving();
        assert!(!lock.is_locked());
        let guard = lock.lock_with_eflags(eflags);
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn contended_increments_do_not_race() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().expect("worker thread should not panic");
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}
