//! Condition variables.
//!
//! Two flavours exist, distinguished by the lock they are associated with
//! at construction: [`CondVar`] pairs with a [`Mutex`], [`CondVarSpin`]
//! with a static [`SpinLock`]. Waiting releases the associated lock around
//! the suspension and re-acquires it before returning; for the spinlock
//! variant the saved interrupt state of the *original* acquisition is what
//! gets restored.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::arch::{interrupts_disable, interrupts_restore};
use crate::sched::{self, ThreadQueue, ThreadStatus};
use crate::sync::mutex::Mutex;
use crate::sync::spinlock::{SpinLock, SpinLockGuard};

/// A condition variable associated with a mutex.
pub struct CondVar {
    lock: Cell<Option<NonNull<Mutex>>>,
    wait_queue: ThreadQueue,
}

// SAFETY: the associated-lock cell is written at construction only; the
// queue carries its own lock.
unsafe impl Sync for CondVar {}
// SAFETY: as above.
unsafe impl Send for CondVar {}

impl CondVar {
    /// Creates a condition variable tied to `mutex`. Waiters must hold it;
    /// waiting releases it for the duration of the sleep.
    pub const fn new(mutex: &'static Mutex) -> Self {
        CondVar {
            lock: Cell::new(Some(unsafe {
                // SAFETY: a 'static reference is always a valid NonNull.
                NonNull::new_unchecked(mutex as *const Mutex as *mut Mutex)
            })),
            wait_queue: ThreadQueue::new(),
        }
    }

    /// Creates a free-standing condition variable with no associated lock
    /// (callers manage their own exclusion).
    pub const fn new_unlocked() -> Self {
        CondVar {
            lock: Cell::new(None),
            wait_queue: ThreadQueue::new(),
        }
    }

    fn mutex(&self) -> Option<&Mutex> {
        // SAFETY: the associated mutex is 'static by construction.
        self.lock.get().map(|m| unsafe { &*m.as_ptr() })
    }

    fn holds_lock(&self) -> bool {
        match self.mutex() {
            Some(m) => m.owner() == sched::current_thread(),
            None => true,
        }
    }

    /// Releases the associated mutex and blocks until signalled, then
    /// re-acquires it. Calling without holding the mutex is fatal.
    pub fn wait(&self) {
        let eflags = interrupts_disable();
        if !self.holds_lock() {
            crate::crash!("Attempt to wait on a condition variable with an unowned lock!");
        }

        let thread = sched::current_thread()
            .unwrap_or_else(|| crate::crash!("Condition wait with no current thread!"));

        {
            let _guard = self.wait_queue.lock.lock();
            // SAFETY: thread is the live current thread; queue lock held;
            // a running thread is on no queue.
            unsafe {
                thread.as_ref().status.set(ThreadStatus::Blocking);
                self.wait_queue.enqueue(thread);
            }
        }

        if let Some(m) = self.mutex() {
            m.release();
        }
        sched::yield_now();
        if let Some(m) = self.mutex() {
            m.acquire();
        }

        interrupts_restore(eflags);
    }

    /// Wakes the longest waiter, if any.
    pub fn signal(&self) {
        if !self.holds_lock() {
            crate::crash!("Attempt to signal a condition variable with an unowned lock!");
        }

        let _guard = self.wait_queue.lock.lock();
        // SAFETY: queue lock held.
        if let Some(t) = unsafe { self.wait_queue.dequeue() } {
            sched::thread_wake(t);
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        if !self.holds_lock() {
            crate::crash!("Attempt to signal a condition variable with an unowned lock!");
        }

        let _guard = self.wait_queue.lock.lock();
        // SAFETY: queue lock held.
        while let Some(t) = unsafe { self.wait_queue.dequeue() } {
            sched::thread_wake(t);
        }
    }
}

/// A condition variable associated with a spinlock.
pub struct CondVarSpin {
    lock: &'static SpinLock,
    wait_queue: ThreadQueue,
}

// SAFETY: the associated lock reference is immutable; the queue carries
// its own lock.
unsafe impl Sync for CondVarSpin {}
// SAFETY: as above.
unsafe impl Send for CondVarSpin {}

impl CondVarSpin {
    pub const fn new(lock: &'static SpinLock) -> Self {
        CondVarSpin {
            lock,
            wait_queue: ThreadQueue::new(),
        }
    }

    /// Parks the current thread, releasing `guard` (which must be for the
    /// associated spinlock) around the suspension. The returned guard
    /// restores the interrupt state saved by the original acquisition.
    pub fn wait(&self, guard: SpinLockGuard<'static, ()>) -> SpinLockGuard<'static, ()> {
        let thread = sched::current_thread()
            .unwrap_or_else(|| crate::crash!("Condition wait with no current thread!"));

        {
            let _wq = self.wait_queue.lock.lock();
            // SAFETY: thread is the live current thread; queue lock held;
            // a running thread is on no queue.
            unsafe {
                thread.as_ref().status.set(ThreadStatus::Blocking);
                self.wait_queue.enqueue(thread);
            }
        }

        let eflags = guard.release_preserving();
        sched::yield_now();
        self.lock.lock_with_eflags(eflags)
    }

    /// Wakes the longest waiter, if any.
    pub fn signal(&self) {
        let _guard = self.wait_queue.lock.lock();
        // SAFETY: queue lock held.
        if let Some(t) = unsafe { self.wait_queue.dequeue() } {
            sched::thread_wake(t);
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        let _guard = self.wait_queue.lock.lock();
        // SAFETY: queue lock held.
        while let Some(t) = unsafe { self.wait_queue.dequeue() } {
            sched::thread_wake(t);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testhost;
    use crate::sched::testhook;

    fn setup() -> std::sync::MutexGuard<'static, ()> {
        let guard = testhost::boot(&[]);
        testhook::ensure_init();
        testhook::set_current(Some(testhook::boot_thread()));
        guard
    }

    extern "C" fn noop_entry(_arg: usize) {}

    #[test]
    fn broadcast_wakes_every_waiter_signal_wakes_one() {
        let _g = setup();
        let cv = CondVar::new_unlocked();
        let p = sched::current_process().expect("kernel process must exist");

        let waiters: std::vec::Vec<_> = (0..3)
            .map(|i| sched::thread_create(p, noop_entry, i).expect("thread creation should succeed"))
            .collect();

        for &t in &waiters {
            crate::sched::queue::force_dequeue(t);
            testhook::set_current(Some(t));
            cv.wait();
        }
        testhook::set_current(Some(testhook::boot_thread()));

        cv.signal();
        // SAFETY: live threads.
        unsafe {
            assert_eq!(waiters[0].as_ref().status(), ThreadStatus::Ready);
            assert_eq!(waiters[1].as_ref().status(), ThreadStatus::Blocking);
        }

        cv.broadcast();
        // SAFETY: live threads.
        unsafe {
            assert_eq!(waiters[1].as_ref().status(), ThreadStatus::Ready);
            assert_eq!(waiters[2].as_ref().status(), ThreadStatus::Ready);
        }

        for t in waiters {
            sched::thread_destroy(t);
        }
    }

    #[test]
    #[should_panic(expected = "Attempt to wait on a condition variable with an unowned lock!")]
    fn waiting_without_the_mutex_is_fatal() {
        let _g = setup();
        static MUTEX: Mutex = Mutex::new();
        let cv = CondVar::new(&MUTEX);
        cv.wait();
    }

    #[test]
    fn spinlock_variant_round_trips_the_guard() {
        let _g = setup();
        static LOCK: SpinLock = SpinLock::new(());
        let cv = CondVarSpin::new(&LOCK);
        let p = sched::current_process().expect("kernel process must exist");

        let t = sched::thread_create(p, noop_entry, 0).expect("thread creation should succeed");
        crate::sched::queue::force_dequeue(t);
        testhook::set_current(Some(t));

        let guard = LOCK.lock();
        let guard = cv.wait(guard);
        assert!(LOCK.is_locked());
        drop(guard);
        assert!(!LOCK.is_locked());

        testhook::set_current(Some(testhook::boot_thread()));
        cv.signal();
        // SAFETY: live thread.
        assert_eq!(unsafe { t.as_ref() }.status(), ThreadStatus::Ready);
        sched::thread_destroy(t);
    }
}
