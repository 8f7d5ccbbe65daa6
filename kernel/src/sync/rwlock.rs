//! Reader/writer locks with writer preference.
//!
//! Readers are admitted only while the writer count is zero; a writer
//! request bumps that count immediately, which stops new readers, and the
//! writer runs once the readers already inside drain out. When a writer
//! finishes, a queued writer (if any) goes next; otherwise every queued
//! reader is admitted together.

use core::cell::Cell;

use crate::arch::{interrupts_disable, interrupts_restore};
use crate::sched::{self, ThreadQueue, ThreadStatus};
use crate::sync::spinlock::SpinLock;

pub struct RwLock {
    lock: SpinLock,
    readers: Cell<u32>,
    /// Writers waiting plus (at most one) writing.
    writers: Cell<u32>,
    read_queue: ThreadQueue,
    write_queue: ThreadQueue,
}

// SAFETY: the counters are only touched under `lock`.
unsafe impl Sync for RwLock {}
// SAFETY: as above.
unsafe impl Send for RwLock {}

impl RwLock {
    pub const fn new() -> Self {
        RwLock {
            lock: SpinLock::new(()),
            readers: Cell::new(0),
            writers: Cell::new(0),
            read_queue: ThreadQueue::new(),
            write_queue: ThreadQueue::new(),
        }
    }

    pub fn reader_count(&self) -> u32 {
        let _guard = self.lock.lock();
        self.readers.get()
    }

    pub fn writer_count(&self) -> u32 {
        let _guard = self.lock.lock();
        self.writers.get()
    }

    fn park(&self, queue: &ThreadQueue) {
        let thread = sched::current_thread()
            .unwrap_or_else(|| crate::crash!("rwlock wait with no current thread!"));
        let _wq = queue.lock.lock();
        // SAFETY: thread is the live current thread; queue lock held; a
        // running thread is on no queue.
        unsafe {
            thread.as_ref().status.set(ThreadStatus::Blocking);
            queue.enqueue(thread);
        }
    }

    /// Takes the lock for reading, blocking while any writer is waiting or
    /// active.
    pub fn acquire_read(&self) {
        let eflags = interrupts_disable();

        let guard = self.lock.lock();
        if self.writers.get() == 0 {
            self.readers.set(self.readers.get() + 1);
            drop(guard);
        } else {
            self.park(&self.read_queue);
            drop(guard);
            sched::yield_now();
        }

        interrupts_restore(eflags);
    }

    /// Takes the lock for writing, blocking until the readers inside have
    /// drained (new readers are already held off by the increment here).
    pub fn acquire_write(&self) {
        let eflags = interrupts_disable();

        let guard = self.lock.lock();
        self.writers.set(self.writers.get() + 1);

        if self.writers.get() == 1 && self.readers.get() == 0 {
            drop(guard);
        } else {
            self.park(&self.write_queue);
            drop(guard);
            sched::yield_now();
        }

        interrupts_restore(eflags);
    }

    /// Takes the lock for reading only if that needs no blocking.
    pub fn try_acquire_read(&self) -> bool {
        let _guard = self.lock.lock();
        if self.writers.get() == 0 {
            self.readers.set(self.readers.get() + 1);
            true
        } else {
            false
        }
    }

    /// Takes the lock for writing only if it can become the active writer
    /// immediately.
    pub fn try_acquire_write(&self) -> bool {
        let _guard = self.lock.lock();
        if self.writers.get() == 0 && self.readers.get() == 0 {
            self.writers.set(1);
            true
        } else {
            false
        }
    }

    /// Releases a read acquisition; the last reader out hands the lock to
    /// the longest-waiting writer.
    pub fn release_read(&self) {
        let _guard = self.lock.lock();

        assert!(self.readers.get() != 0, "rwlock read release without readers");
        self.readers.set(self.readers.get() - 1);

        if self.readers.get() == 0 && self.writers.get() != 0 {
            let _wq = self.write_queue.lock.lock();
            // SAFETY: queue lock held.
            if let Some(t) = unsafe { self.write_queue.dequeue() } {
                sched::thread_wake(t);
            }
        }
    }

    /// Releases a write acquisition: the next queued writer goes first;
    /// with no writers left, every queued reader is admitted at once.
    pub fn release_write(&self) {
        let _guard = self.lock.lock();

        assert!(self.readers.get() == 0, "rwlock write release with readers inside");
        assert!(self.writers.get() != 0, "rwlock write release without a writer");
        self.writers.set(self.writers.get() - 1);

        if self.writers.get() != 0 {
            let _wq = self.write_queue.lock.lock();
            // SAFETY: queue lock held.
            if let Some(t) = unsafe { self.write_queue.dequeue() } {
                sched::thread_wake(t);
            }
        } else {
            let _rq = self.read_queue.lock.lock();
            // SAFETY: queue lock held.
            unsafe {
                while let Some(t) = self.read_queue.dequeue() {
                    self.readers.set(self.readers.get() + 1);
                    sched::thread_wake(t);
                }
            }
        }
    }
}

impl Default for RwLock {
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

    #[test]
    fn readers_share_writers_exclude() {
        let _g = setup();
        let l = RwLock::new();

        l.acquire_read();
        l.acquire_read();
        assert_eq!(l.reader_count(), 2);
        assert!(!l.try_acquire_write());

        l.release_read();
        l.release_read();
        assert!(l.try_acquire_write());
        assert!(!l.try_acquire_read());
        l.release_write();
        assert!(l.try_acquire_read());
        l.release_read();
    }

    #[test]
    fn pending_writer_blocks_new_readers_then_readers_wake_together() {
        let _g = setup();
        let l = RwLock::new();
        let p = sched::current_process().expect("kernel process must exist");

        let writer = sched::thread_create(p, noop_entry, 0).expect("thread creation should succeed");
        let r1 = sched::thread_create(p, noop_entry, 0).expect("thread creation should succeed");
        let r2 = sched::thread_create(p, noop_entry, 0).expect("thread creation should succeed");
        for &t in &[writer, r1, r2] {
            crate::sched::queue::force_dequeue(t);
        }

        // The boot thread reads; a writer queues behind it.
        l.acquire_read();
        testhook::set_current(Some(writer));
        l.acquire_write();
        // SAFETY: live thread.
        assert_eq!(unsafe { writer.as_ref() }.status(), ThreadStatus::Blocking);

        // New readers now queue even though a reader is active.
        for &t in &[r1, r2] {
            testhook::set_current(Some(t));
            l.acquire_read();
            // SAFETY: live thread.
            assert_eq!(unsafe { t.as_ref() }.status(), ThreadStatus::Blocking);
        }

        // The live reader finishes: the writer gets the lock.
        testhook::set_current(Some(testhook::boot_thread()));
        l.release_read();
        // SAFETY: live thread.
        assert_eq!(unsafe { writer.as_ref() }.status(), ThreadStatus::Ready);
        assert_eq!(l.writer_count(), 1);

        // Writer done: both queued readers are admitted together.
        l.release_write();
        // SAFETY: live threads.
        unsafe {
            assert_eq!(r1.as_ref().status(), ThreadStatus::Ready);
            assert_eq!(r2.as_ref().status(), ThreadStatus::Ready);
        }
        assert_eq!(l.reader_count(), 2);

        l.release_read();
        l.release_read();

        for t in [writer, r1, r2] {
            sched::thread_destroy(t);
        }
    }
}
