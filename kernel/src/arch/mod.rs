//! Architecture support.
//!
//! Only 32-bit x86 is a real target. The module is compiled on hosted
//! targets as well so that the memory manager, scheduler and lock logic can
//! be exercised by the standard test harness; in that configuration every
//! privileged primitive degrades to an inert stub (see the individual
//! modules).

pub mod x86;

pub use x86::{interrupts_disable, interrupts_restore, pause, EFLAGS_IF};
