//! Sage Aasvogel kernel library.
//!
//! The crate compiles two ways: for the bare-metal 32-bit x86 target it is
//! the kernel proper, and for hosted targets it exposes the portable
//! layers (memory management, scheduler logic, synchronisation) to the
//! standard test harness with the hardware stubbed out. See
//! `mm::testhost` for how the tests simulate a machine.

#![no_std]

#[cfg(target_os = "none")]
extern crate alloc;

// Host target: link std so unit tests can use the standard library; the
// kernel's own heap only exists on bare metal.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod crash;
pub mod error;
pub mod klog;
pub mod ksym;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod unwind;

pub use error::{KernelError, KernelResult};
