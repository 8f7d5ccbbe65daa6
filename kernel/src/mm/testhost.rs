//! Hosted test support: a simulated machine for the memory manager.
//!
//! On the real target, physical frames are reached only through mappings;
//! on a hosted build there is no MMU to program, so this module provides a
//! leaked, page-aligned arena standing in for both halves of the world:
//!
//! * the lower half of the arena plays the role of the kernel virtual
//!   range: the early allocator, the reserved page-table window and the
//!   free virtual regions all live there, so pointers handed out by
//!   `global_alloc` dereference to real memory;
//! * the upper half plays the role of physical RAM: the boot memory map
//!   given to [`crate::mm::phys::init`] covers it, and [`frame_ptr`]
//!   translates a frame address into the arena byte that backs it.
//!
//! The pool boundaries (low / normal / high) are scaled into the arena so
//! every pool, the emergency reserve and the stack-chaining path all get
//! exercised by host tests.
//!
//! Everything here is compiled only on hosted targets.

extern crate std;

use std::sync::{Mutex, MutexGuard, Once};

use crate::bootinfo::{BootParams, MmapRegion};

use super::{PhysAddr, VirtAddr, FRAME_SIZE};

/// Total arena size. Half is "virtual", half is "physical".
const ARENA_LEN: usize = 16 * 1024 * 1024;
/// Offset of the simulated physical region within the arena.
const PHYS_START: usize = ARENA_LEN / 2;
/// Frames below this (but inside the physical region) form the low pool.
const LOW_FRAMES: usize = 128;
/// Frames at the top of the physical region form the high pool.
const HIGH_FRAMES: usize = 128;

static ARENA_INIT: Once = Once::new();
static mut ARENA_BASE: usize = 0;

/// Serializes every test that touches global memory-manager state.
static LOCK: Mutex<()> = Mutex::new(());

static BOOTED: Once = Once::new();

fn ensure_arena() {
    ARENA_INIT.call_once(|| {
        let layout = std::alloc::Layout::from_size_align(ARENA_LEN, FRAME_SIZE)
            .expect("arena layout must be valid");
        // SAFETY: layout is non-zero; the arena is intentionally leaked for
        // the lifetime of the test process.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "failed to allocate test arena");
        // SAFETY: ARENA_BASE is written exactly once, inside Once::call_once.
        unsafe {
            ARENA_BASE = ptr as usize;
        }
    });
}

/// Base of the arena; doubles as the hosted "kernel virtual base".
pub fn arena_base() -> VirtAddr {
    ensure_arena();
    // SAFETY: written once under ARENA_INIT before any read.
    unsafe { ARENA_BASE }
}

/// One past the end of the hosted kernel virtual range (the lower half).
pub fn arena_top() -> VirtAddr {
    arena_base() + PHYS_START
}

/// Translates a simulated physical frame address to the arena memory
/// backing it.
pub fn frame_ptr(frame: PhysAddr) -> *mut u8 {
    let offset = frame as usize;
    assert!(
        offset >= PHYS_START && offset < ARENA_LEN,
        "frame {frame:#x} outside the simulated physical region"
    );
    (arena_base() + offset) as *mut u8
}

/// Pool boundary: frames below this are the low pool.
pub fn pool_low_limit() -> PhysAddr {
    (PHYS_START + LOW_FRAMES * FRAME_SIZE) as PhysAddr
}

/// Pool boundary: frames at or above this are the high pool.
pub fn pool_high_limit() -> PhysAddr {
    (ARENA_LEN - HIGH_FRAMES * FRAME_SIZE) as PhysAddr
}

/// Takes the global test lock without booting.
pub fn lock() -> MutexGuard<'static, ()> {
    ensure_arena();
    match LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Boots the full memory-management stack over the simulated machine
/// (once per process) and returns the global test lock.
///
/// The first caller's command line wins; subsequent calls just serialize.
pub fn boot(cmdline: &'static [&'static str]) -> MutexGuard<'static, ()> {
    let guard = lock();
    BOOTED.call_once(|| {
        super::early::init_at(arena_base());

        let mmap = std::vec![MmapRegion {
            region_type: 1,
            start_address: PHYS_START as PhysAddr,
            end_address: ARENA_LEN as PhysAddr,
        }]
        .leak();

        let params = std::boxed::Box::leak(std::boxed::Box::new(BootParams::new(
            cmdline,
            &[],
            mmap,
            &[],
            0,
        )));

        super::init(params);
    });
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ptr_is_stable_and_in_arena() {
        let _g = lock();
        let p = frame_ptr(PHYS_START as PhysAddr + 0x1000);
        let q = frame_ptr(PHYS_START as PhysAddr + 0x1000);
        assert_eq!(p, q);
        assert!(p as usize >= arena_base());
        assert!((p as usize) < arena_base() + ARENA_LEN);
    }
}
