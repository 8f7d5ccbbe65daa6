//! Synchronisation primitives.
//!
//! [`spinlock`] is the foundation: processor-owned, interrupts disabled
//! while held, never across a suspension point. Everything else is
//! thread-owned and built on the scheduler: [`mutex`] (FIFO handoff, LIFO
//! release discipline), [`semaphore`] (counting, FIFO), [`condvar`]
//! (mutex- or spinlock-associated) and [`rwlock`] (writer preference,
//! live readers finish).

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use condvar::{CondVar, CondVarSpin};
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
