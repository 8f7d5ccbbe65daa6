//! Kernel mutexes: thread-owned mutual exclusion with FIFO handoff.
//!
//! Contended acquirers park on a FIFO wait queue; release hands the mutex
//! straight to the queue head without passing through an unowned state, so
//! the queue order *is* the acquisition order.
//!
//! Mutexes are not re-entrant, and every thread must release the mutexes
//! it holds in reverse acquisition order: each thread keeps an intrusive
//! stack of held mutexes and releasing anything but the top is fatal, as
//! is re-acquiring a held mutex or releasing someone else's.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::arch::{interrupts_disable, interrupts_restore};
use crate::sched::{self, Thread, ThreadQueue, ThreadStatus};

pub struct Mutex {
    taken: AtomicU32,
    owner: Cell<Option<NonNull<Thread>>>,
    /// Next mutex down the owner's held-mutex stack.
    owner_next: Cell<Option<NonNull<Mutex>>>,
    wait_queue: ThreadQueue,
}

// SAFETY: owner/owner_next are only touched by the owning thread or under
// the wait-queue lock during handoff; taken is atomic.
unsafe impl Sync for Mutex {}
// SAFETY: as above.
unsafe impl Send for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            taken: AtomicU32::new(0),
            owner: Cell::new(None),
            owner_next: Cell::new(None),
            wait_queue: ThreadQueue::new(),
        }
    }

    /// The thread currently holding the mutex.
    pub fn owner(&self) -> Option<NonNull<Thread>> {
        self.owner.get()
    }

    fn acquire_fast(&self) -> bool {
        self.taken
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Records `thread` as the owner and pushes this mutex onto its
    /// held-mutex stack.
    fn take_ownership(&self, thread: NonNull<Thread>) {
        // SAFETY: thread is the live current (or woken) thread.
        let t_ref = unsafe { thread.as_ref() };
        self.owner.set(Some(thread));
        self.owner_next.set(t_ref.held_mutexes.get());
        t_ref.held_mutexes.set(Some(NonNull::from(self)));
    }

    /// Acquires the mutex, blocking (FIFO) while it is held elsewhere.
    /// Re-acquiring a mutex this thread already holds is fatal.
    pub fn acquire(&self) {
        let eflags = interrupts_disable();

        let thread = match sched::current_thread() {
            Some(t) => t,
            None => {
                // Pre-scheduler: single flow of control, no owner to track.
                while !self.acquire_fast() {
                    crate::arch::pause();
                }
                interrupts_restore(eflags);
                return;
            }
        };

        if self.owner.get() == Some(thread) {
            crate::crash!("Kernel mutex recursive locking detected!");
        }

        if self.acquire_fast() {
            self.take_ownership(thread);
        } else {
            let guard = self.wait_queue.lock.lock();
            // The holder may have released between the failed fast path
            // and taking the queue lock.
            if self.acquire_fast() {
                drop(guard);
                self.take_ownership(thread);
            } else {
                // SAFETY: thread is the live current thread; queue lock
                // held; a running thread is on no queue.
                unsafe {
                    thread.as_ref().status.set(ThreadStatus::Blocking);
                    self.wait_queue.enqueue(thread);
                }
                drop(guard);
                // Ownership is transferred to us by the releasing thread
                // before we are woken.
                sched::yield_now();
            }
        }

        interrupts_restore(eflags);
    }

    /// Acquires the mutex only if that needs no blocking.
    pub fn try_acquire(&self) -> bool {
        let thread = sched::current_thread();

        if thread.is_some() && self.owner.get() == thread {
            crate::crash!("Kernel mutex recursive locking detected!");
        }

        if !self.acquire_fast() {
            return false;
        }
        if let Some(t) = thread {
            self.take_ownership(t);
        }
        true
    }

    /// Releases the mutex, handing it to the longest-waiting thread if
    /// there is one. Releasing out of LIFO order, or a mutex this thread
    /// does not hold, is fatal.
    pub fn release(&self) {
        let thread = match sched::current_thread() {
            Some(t) => t,
            None => {
                // Pre-scheduler counterpart of the acquire special case.
                self.taken.store(0, Ordering::SeqCst);
                return;
            }
        };
        // SAFETY: the current thread is live.
        let t_ref = unsafe { thread.as_ref() };

        if self.owner.get() != Some(thread) {
            crate::crash!("Kernel mutex released by non-owner!");
        }
        if t_ref.held_mutexes.get() != Some(NonNull::from(self)) {
            crate::crash!("Kernel mutexes released in wrong order!");
        }

        t_ref.held_mutexes.set(self.owner_next.get());

        let guard = self.wait_queue.lock.lock();
        // SAFETY: queue lock held.
        match unsafe { self.wait_queue.dequeue() } {
            Some(next) => {
                // Direct handoff: the mutex never becomes observable as
                // free, so queue-jumping is impossible.
                self.take_ownership(next);
                sched::thread_wake(next);
            }
            None => {
                self.owner.set(None);
                self.owner_next.set(None);
                self.taken.store(0, Ordering::SeqCst);
            }
        }
        fence(Ordering::SeqCst);
        drop(guard);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
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

    fn spawn_threads(n: usize) -> std::vec::Vec<NonNull<Thread>> {
        let p = sched::current_process().expect("kernel process must exist");
        (0..n)
            .map(|i| sched::thread_create(p, noop_entry, i).expect("thread creation should succeed"))
            .collect()
    }

    #[test]
    fn uncontended_acquire_tracks_ownership() {
        let _g = setup();
        let m = Mutex::new();

        m.acquire();
        assert_eq!(m.owner(), sched::current_thread());
        m.release();
        assert_eq!(m.owner(), None);
        assert!(m.try_acquire());
        m.release();
    }

    #[test]
    fn contended_release_hands_off_in_fifo_order() {
        let _g = setup();
        let m = Mutex::new();
        let threads = spawn_threads(5);
        let holder = threads[0];

        // t0 takes the mutex...
        testhook::set_current(Some(holder));
        m.acquire();
        assert_eq!(m.owner(), Some(holder));

        // ...and t1..t4 pile up behind it, in order. (On the hosted build
        // yield_now returns immediately; what matters is the queue state
        // the blocked acquire leaves behind.)
        for &t in &threads[1..] {
            crate::sched::queue::force_dequeue(t);
            testhook::set_current(Some(t));
            m.acquire();
            // SAFETY: live thread.
            assert_eq!(unsafe { t.as_ref() }.status(), ThreadStatus::Blocking);
        }

        // Each release hands the mutex to the longest waiter.
        for i in 0..4 {
            testhook::set_current(Some(threads[i]));
            m.release();
            assert_eq!(m.owner(), Some(threads[i + 1]));
            // SAFETY: live thread; the new owner was woken.
            assert_eq!(
                unsafe { threads[i + 1].as_ref() }.status(),
                ThreadStatus::Ready
            );
        }

        testhook::set_current(Some(threads[4]));
        m.release();
        assert_eq!(m.owner(), None);

        testhook::set_current(Some(testhook::boot_thread()));
        for t in threads {
            sched::thread_destroy(t);
        }
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let _g = setup();
        let m = Mutex::new();
        let threads = spawn_threads(2);

        testhook::set_current(Some(threads[0]));
        m.acquire();

        testhook::set_current(Some(threads[1]));
        assert!(!m.try_acquire());

        testhook::set_current(Some(threads[0]));
        m.release();

        testhook::set_current(Some(testhook::boot_thread()));
        for t in threads {
            sched::thread_destroy(t);
        }
    }

    #[test]
    #[should_panic(expected = "Kernel mutex recursive locking detected!")]
    fn recursive_acquire_is_fatal() {
        let _g = setup();
        let m = Mutex::new();
        m.acquire();
        m.acquire();
    }

    #[test]
    #[should_panic(expected = "Kernel mutexes released in wrong order!")]
    fn wrong_order_release_is_fatal() {
        let _g = setup();
        let m1 = Mutex::new();
        let m2 = Mutex::new();
        m1.acquire();
        m2.acquire();
        m1.release();
    }

    #[test]
    #[should_panic(expected = "Kernel mutex released by non-owner!")]
    fn release_by_non_owner_is_fatal() {
        let _g = setup();
        let m = Mutex::new();
        let threads = spawn_threads(2);
        // The panic below leaks these records; keep them off the run
        // queue so later scheduling tests see a clean rotation.
        for &t in &threads {
            crate::sched::queue::force_dequeue(t);
        }

        testhook::set_current(Some(threads[0]));
        m.acquire();
        testhook::set_current(Some(threads[1]));
        m.release();
    }
}
