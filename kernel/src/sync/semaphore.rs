//! Counting semaphores with FIFO wakeup.
//!
//! The counter goes negative while threads are queued: a value of `-n`
//! means `n` waiters. `signal` therefore wakes exactly one waiter whenever
//! the pre-increment value was negative.

use core::cell::Cell;

use crate::arch::{interrupts_disable, interrupts_restore};
use crate::sched::{self, ThreadQueue, ThreadStatus};
use crate::sync::spinlock::SpinLock;

pub struct Semaphore {
    lock: SpinLock,
    value: Cell<i32>,
    wait_queue: ThreadQueue,
}

// SAFETY: value is only touched under `lock`.
unsafe impl Sync for Semaphore {}
// SAFETY: as above.
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub const fn new(value: i32) -> Self {
        Semaphore {
            lock: SpinLock::new(()),
            value: Cell::new(value),
            wait_queue: ThreadQueue::new(),
        }
    }

    /// The current counter (negative while threads wait).
    pub fn value(&self) -> i32 {
        let _guard = self.lock.lock();
        self.value.get()
    }

    /// Decrements the counter, blocking when it drops below zero.
    pub fn wait(&self) {
        let eflags = interrupts_disable();

        let guard = self.lock.lock();
        let old = self.value.get();
        self.value.set(old - 1);

        if old <= 0 {
            let thread = sched::current_thread()
                .unwrap_or_else(|| crate::crash!("Semaphore wait with no current thread!"));
            {
                let _wq = self.wait_queue.lock.lock();
                // SAFETY: thread is the live current thread; queue lock
                // held; a running thread is on no queue.
                unsafe {
                    thread.as_ref().status.set(ThreadStatus::Blocking);
                    self.wait_queue.enqueue(thread);
                }
            }
            drop(guard);
            sched::yield_now();
        } else {
            drop(guard);
        }

        interrupts_restore(eflags);
    }

    /// Decrements the counter only if that does not block.
    pub fn try_wait(&self) -> bool {
        let _guard = self.lock.lock();
        if self.value.get() > 0 {
            self.value.set(self.value.get() - 1);
            true
        } else {
            false
        }
    }

    /// Increments the counter, waking the longest waiter if any were
    /// queued.
    pub fn signal(&self) {
        let _guard = self.lock.lock();
        let old = self.value.get();
        self.value.set(old + 1);

        if old < 0 {
            let _wq = self.wait_queue.lock.lock();
            // SAFETY: queue lock held.
            if let Some(t) = unsafe { self.wait_queue.dequeue() } {
                sched::thread_wake(t);
            }
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
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
    fn try_wait_consumes_only_positive_counts() {
        let _g = setup();
        let s = Semaphore::new(2);
        assert!(s.try_wait());
        assert!(s.try_wait());
        assert!(!s.try_wait());
        assert_eq!(s.value(), 0);
        s.signal();
        assert_eq!(s.value(), 1);
        assert!(s.try_wait());
    }

    #[test]
    fn negative_counter_tracks_waiters_and_signal_wakes_fifo() {
        let _g = setup();
        let s = Semaphore::new(0);
        let p = sched::current_process().expect("kernel process must exist");

        let t1 = sched::thread_create(p, noop_entry, 0).expect("thread creation should succeed");
        let t2 = sched::thread_create(p, noop_entry, 0).expect("thread creation should succeed");

        for &t in &[t1, t2] {
            crate::sched::queue::force_dequeue(t);
            testhook::set_current(Some(t));
            s.wait();
            // SAFETY: live thread.
            assert_eq!(unsafe { t.as_ref() }.status(), ThreadStatus::Blocking);
        }
        assert_eq!(s.value(), -2);

        testhook::set_current(Some(testhook::boot_thread()));
        s.signal();
        // The longest waiter (t1) is runnable again; t2 still parked.
        // SAFETY: live threads.
        unsafe {
            assert_eq!(t1.as_ref().status(), ThreadStatus::Ready);
            assert_eq!(t2.as_ref().status(), ThreadStatus::Blocking);
        }
        assert_eq!(s.value(), -1);

        s.signal();
        // SAFETY: live thread.
        assert_eq!(unsafe { t2.as_ref() }.status(), ThreadStatus::Ready);
        assert_eq!(s.value(), 0);

        sched::thread_destroy(t1);
        sched::thread_destroy(t2);
    }
}
