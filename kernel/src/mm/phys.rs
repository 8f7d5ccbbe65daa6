//! Physical frame allocator.
//!
//! All usable RAM is managed at frame granularity in three pools: low
//! (below 1 MiB, reserved for callers that need it), normal (below 4 GiB)
//! and high (at or above 4 GiB, only usable under PAE). Each pool is a
//! stack of free frame addresses, and the stacks live *inside the frames
//! they manage*: a stack frame holds one link to the previous stack frame
//! plus 511 slots. The top stack frame is kept mapped at a fixed kernel
//! virtual address; when it fills up, the frame being freed becomes the
//! new top and is swapped into that window, and when it drains, the
//! window swaps back to the previous stack frame and the emptied one is
//! itself handed out as a free frame.
//!
//! A small emergency reserve (128 frames of the normal range) is kept in
//! a flat array and only drawn from when the caller passes
//! [`FrameFlags::EMERG`].

use core::cell::UnsafeCell;
use core::ptr::{addr_of_mut, read_volatile, write_volatile};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::bootinfo::BootParams;
use crate::sync::spinlock::SpinLock;

use super::page::{self, PageFlags};
use super::{
    early, frame_align_up, kernel_virtual_base, PhysAddr, VirtAddr, FRAME_NULL, FRAME_SIZE,
};

bitflags::bitflags! {
    /// Flags controlling physical frame allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Retry (releasing the pool lock in between) until a frame is
        /// freed rather than failing. Even with this flag, callers must
        /// check for [`FRAME_NULL`].
        const WAIT    = 0x1;
        /// Draw from the emergency reserve when the pools are empty. Only
        /// for allocations whose failure would take the system down.
        const EMERG   = 0x2;
        /// Only return frames whose physical address fits in 32 bits.
        const BITS32  = 0x4;
        /// Only return frames below 1 MiB. Cannot be combined with
        /// `EMERG`; low frames are permanently reserved for this flag.
        const LOW_MEM = 0x8;
    }
}

/// Slots per stack frame: one frame minus the link field.
const STACK_CAP: usize = FRAME_SIZE / core::mem::size_of::<PhysAddr>() - 1;
const EMERG_CAP: usize = 128;

/// A frame-sized stack chunk: the link to the previous chunk plus the free
/// frame slots. Lives at a fixed virtual address whose physical backing
/// changes as the stack grows and shrinks, hence the volatile access
/// below.
#[repr(C, align(4096))]
struct StackFrame {
    next: PhysAddr,
    slots: [PhysAddr; STACK_CAP],
}

struct StackStorage(UnsafeCell<StackFrame>);

// SAFETY: the storage is only accessed under the allocator lock.
unsafe impl Sync for StackStorage {}

impl StackStorage {
    const fn new() -> Self {
        StackStorage(UnsafeCell::new(StackFrame {
            next: FRAME_NULL,
            slots: [FRAME_NULL; STACK_CAP],
        }))
    }
}

static LOW_STACK: StackStorage = StackStorage::new();
static NORMAL_STACK: StackStorage = StackStorage::new();
static HIGH_STACK: StackStorage = StackStorage::new();

/// Hosted builds have no MMU to swap the window's backing, so the current
/// backing frame is tracked explicitly; this sentinel means "the static
/// seed storage itself".
#[cfg(not(target_os = "none"))]
const SEED_BACKING: PhysAddr = 0x5eed_5eed_5eed_5eed;

struct StackCtl {
    top: usize,
    #[cfg(not(target_os = "none"))]
    backing: PhysAddr,
}

impl StackCtl {
    const fn new() -> Self {
        StackCtl {
            top: 0,
            #[cfg(not(target_os = "none"))]
            backing: SEED_BACKING,
        }
    }
}

struct PhysState {
    init_done: bool,
    high_enabled: bool,
    low: StackCtl,
    normal: StackCtl,
    high: StackCtl,
    emerg_top: usize,
    emerg: [PhysAddr; EMERG_CAP],
}

static STATE: SpinLock<PhysState> = SpinLock::new(PhysState {
    init_done: false,
    high_enabled: false,
    low: StackCtl::new(),
    normal: StackCtl::new(),
    high: StackCtl::new(),
    emerg_top: 0,
    emerg: [FRAME_NULL; EMERG_CAP],
});

static TOTAL_FRAMES: AtomicU32 = AtomicU32::new(0);
static FREE_FRAMES: AtomicU32 = AtomicU32::new(0);

/// Total frames of usable RAM this machine has (memory unusable in the
/// current paging mode excluded).
pub fn total_frames() -> u32 {
    TOTAL_FRAMES.load(Ordering::Relaxed)
}

/// Frames currently available for allocation.
pub fn free_frames() -> u32 {
    FREE_FRAMES.load(Ordering::Relaxed)
}

/// Frames below this boundary form the low pool.
#[cfg(target_os = "none")]
pub fn low_limit() -> PhysAddr {
    0x10_0000
}

/// Frames at or above this boundary form the high pool (PAE only).
#[cfg(target_os = "none")]
pub fn high_limit() -> PhysAddr {
    1 << 32
}

#[cfg(not(target_os = "none"))]
pub fn low_limit() -> PhysAddr {
    super::testhost::pool_low_limit()
}

#[cfg(not(target_os = "none"))]
pub fn high_limit() -> PhysAddr {
    super::testhost::pool_high_limit()
}

/// The kernel pointer through which a stack's current top chunk is read
/// and written.
#[cfg(target_os = "none")]
fn window(_ctl: &StackCtl, storage: &StackStorage) -> *mut StackFrame {
    storage.0.get()
}

#[cfg(not(target_os = "none"))]
fn window(ctl: &StackCtl, storage: &StackStorage) -> *mut StackFrame {
    if ctl.backing == SEED_BACKING {
        storage.0.get()
    } else {
        super::testhost::frame_ptr(ctl.backing) as *mut StackFrame
    }
}

/// The physical frame currently backing the stack window.
#[cfg(target_os = "none")]
fn current_backing(_ctl: &StackCtl, storage: &StackStorage) -> PhysAddr {
    match page::global_get_raw(storage.0.get() as VirtAddr) {
        Some((frame, _)) => frame,
        None => crate::crash!("Free frame stack broken!"),
    }
}

#[cfg(not(target_os = "none"))]
fn current_backing(ctl: &StackCtl, _storage: &StackStorage) -> PhysAddr {
    ctl.backing
}

/// Swaps the stack window onto `frame`, returning the previous backing.
#[cfg(target_os = "none")]
fn swap_backing(ctl: &mut StackCtl, storage: &StackStorage, frame: PhysAddr) -> PhysAddr {
    let old = current_backing(ctl, storage);
    if page::global_map_raw(
        storage.0.get() as VirtAddr,
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        true,
        frame,
    )
    .is_err()
    {
        crate::crash!("Free frame stack broken!");
    }
    old
}

#[cfg(not(target_os = "none"))]
fn swap_backing(ctl: &mut StackCtl, _storage: &StackStorage, frame: PhysAddr) -> PhysAddr {
    let old = ctl.backing;
    ctl.backing = frame;
    old
}

fn slot_ptr(win: *mut StackFrame, i: usize) -> *mut PhysAddr {
    // SAFETY: win points at a frame-sized stack chunk; i < STACK_CAP at
    // every call site.
    unsafe { addr_of_mut!((*win).slots).cast::<PhysAddr>().add(i) }
}

/// Pushes a frame onto one stack. When the top chunk is full the pushed
/// frame itself becomes the new top chunk.
fn push_stack(ctl: &mut StackCtl, storage: &StackStorage, frame: PhysAddr) {
    if ctl.top != STACK_CAP {
        // SAFETY: the window points at the live top chunk; volatile
        // because the backing can change behind the compiler's back.
        unsafe {
            write_volatile(slot_ptr(window(ctl, storage), ctl.top), frame);
        }
        ctl.top += 1;
    } else {
        let old = swap_backing(ctl, storage, frame);
        ctl.top = 0;
        // SAFETY: the window now points at the fresh chunk.
        unsafe {
            write_volatile(addr_of_mut!((*window(ctl, storage)).next), old);
        }
    }
}

/// Pops a frame. An emptied top chunk is unchained and itself returned as
/// the popped frame.
fn pop_stack(ctl: &mut StackCtl, storage: &StackStorage) -> PhysAddr {
    if ctl.top != 0 {
        ctl.top -= 1;
        // SAFETY: window points at the live top chunk; slot index valid.
        let frame = unsafe {
            let p = slot_ptr(window(ctl, storage), ctl.top);
            let f = read_volatile(p);
            write_volatile(p, FRAME_NULL);
            f
        };
        FREE_FRAMES.fetch_sub(1, Ordering::Relaxed);
        return frame;
    }

    // SAFETY: window points at the live top chunk.
    let next = unsafe { read_volatile(addr_of_mut!((*window(ctl, storage)).next)) };
    if next != FRAME_NULL {
        let reclaimed = current_backing(ctl, storage);
        swap_backing(ctl, storage, next);
        ctl.top = STACK_CAP;
        FREE_FRAMES.fetch_sub(1, Ordering::Relaxed);
        reclaimed
    } else {
        FRAME_NULL
    }
}

fn pop_emerg(state: &mut PhysState) -> PhysAddr {
    if state.emerg_top != 0 {
        state.emerg_top -= 1;
        let frame = state.emerg[state.emerg_top];
        state.emerg[state.emerg_top] = FRAME_NULL;
        FREE_FRAMES.fetch_sub(1, Ordering::Relaxed);
        frame
    } else {
        FRAME_NULL
    }
}

/// Classifies a frame into its pool and pushes it. Frees into the normal
/// range refill the emergency reserve first.
fn push_free(state: &mut PhysState, frame: PhysAddr) {
    FREE_FRAMES.fetch_add(1, Ordering::Relaxed);

    if frame >= high_limit() {
        assert!(state.high_enabled, "high frame freed without PAE");
        push_stack(&mut state.high, &HIGH_STACK, frame);
    } else if frame < low_limit() {
        push_stack(&mut state.low, &LOW_STACK, frame);
    } else if state.emerg_top != EMERG_CAP {
        state.emerg[state.emerg_top] = frame;
        state.emerg_top += 1;
    } else {
        push_stack(&mut state.normal, &NORMAL_STACK, frame);
    }
}

fn try_alloc(state: &mut PhysState, flags: FrameFlags) -> PhysAddr {
    if flags.contains(FrameFlags::LOW_MEM) {
        return pop_stack(&mut state.low, &LOW_STACK);
    }

    let mut frame = FRAME_NULL;
    if !flags.contains(FrameFlags::BITS32) && state.high_enabled {
        frame = pop_stack(&mut state.high, &HIGH_STACK);
    }
    if frame == FRAME_NULL {
        frame = pop_stack(&mut state.normal, &NORMAL_STACK);
    }
    if frame == FRAME_NULL && flags.contains(FrameFlags::EMERG) {
        frame = pop_emerg(state);
    }
    frame
}

/// Allocates one physical frame, or [`FRAME_NULL`] when no pool the flags
/// allow can satisfy the request.
pub fn alloc(flags: FrameFlags) -> PhysAddr {
    let mut state = STATE.lock();
    assert!(state.init_done);

    loop {
        let frame = try_alloc(&mut state, flags);
        if frame != FRAME_NULL || !flags.contains(FrameFlags::WAIT) {
            return frame;
        }
        // Wait for somebody to free a frame, without holding the lock.
        drop(state);
        crate::arch::pause();
        state = STATE.lock();
    }
}

/// Returns a frame to the pool chosen by its address.
pub fn free(frame: PhysAddr) {
    let mut state = STATE.lock();
    assert!(state.init_done);
    push_free(&mut state, frame);
}

/// Allocates up to `frames.len()` frames under a single lock acquisition.
/// Returns the number actually allocated; on partial success the caller
/// owns (and must free) that prefix.
pub fn alloc_many(frames: &mut [PhysAddr], flags: FrameFlags) -> usize {
    let mut state = STATE.lock();
    assert!(state.init_done);

    let mut i = 0;
    while i < frames.len() {
        let frame = try_alloc(&mut state, flags);
        if frame == FRAME_NULL {
            if flags.contains(FrameFlags::WAIT) {
                drop(state);
                crate::arch::pause();
                state = STATE.lock();
                continue;
            }
            break;
        }
        frames[i] = frame;
        i += 1;
    }
    i
}

/// Frees a batch of frames under a single lock acquisition.
pub fn free_many(frames: &[PhysAddr]) {
    let mut state = STATE.lock();
    assert!(state.init_done);
    for &frame in frames {
        push_free(&mut state, frame);
    }
}

/// Walks the boot memory map and promotes every usable frame that is not
/// already consumed by the kernel image, boot modules or early-boot
/// allocations into the free pools.
pub fn init(param: &BootParams) {
    let alloc_end = frame_align_up(early::next_alloc() - kernel_virtual_base()) as PhysAddr;

    let mut state = STATE.lock();
    assert!(!state.init_done);
    state.high_enabled = page::pae_enabled();

    let mut high_warn = false;
    for region in param.mmap_regions {
        // 64-bit alignment: physical addresses do not fit usize on the
        // 32-bit target once PAE memory is in play.
        let begin = (region.start_address + (FRAME_SIZE as u64 - 1)) & super::FRAME_MASK;
        let end = region.end_address & super::FRAME_MASK;
        if begin >= end {
            continue;
        }

        TOTAL_FRAMES.fetch_add(((end - begin) / FRAME_SIZE as u64) as u32, Ordering::Relaxed);

        if !region.is_usable() || end <= alloc_end {
            continue;
        }

        let mut addr = begin.max(alloc_end);
        while addr != end {
            if addr >= high_limit() && !state.high_enabled {
                if !high_warn {
                    log::warn!("Memory beyond 4GiB detected, but unusable since PAE is disabled");
                    high_warn = true;
                }
                TOTAL_FRAMES.fetch_sub(((end - addr) / FRAME_SIZE as u64) as u32, Ordering::Relaxed);
                break;
            }
            push_free(&mut state, addr);
            addr += FRAME_SIZE as u64;
        }
    }

    state.init_done = true;
    drop(state);

    log::info!(
        "Found {}KiB of memory, with {}KiB free",
        total_frames() * 4,
        free_frames() * 4
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testhost;
    use std::vec::Vec;

    #[test]
    fn single_alloc_free_round_trips_the_count() {
        let _g = testhost::boot(&[]);
        let before = free_frames();

        let frame = alloc(FrameFlags::empty());
        assert_ne!(frame, FRAME_NULL);
        assert_eq!(free_frames(), before - 1);

        free(frame);
        assert_eq!(free_frames(), before);
    }

    #[test]
    fn high_pool_is_preferred_and_bits32_avoids_it() {
        let _g = testhost::boot(&[]);

        let unconstrained = alloc(FrameFlags::empty());
        assert!(unconstrained >= high_limit(), "high pool should be drained first");

        let low32 = alloc(FrameFlags::BITS32);
        assert_ne!(low32, FRAME_NULL);
        assert!(low32 < high_limit());

        free(unconstrained);
        free(low32);
    }

    #[test]
    fn low_mem_pool_serves_only_low_frames() {
        let _g = testhost::boot(&[]);
        let frame = alloc(FrameFlags::LOW_MEM);
        assert_ne!(frame, FRAME_NULL);
        assert!(frame < low_limit());
        free(frame);
    }

    #[test]
    fn exhaustion_emergency_reserve_and_bulk_ops() {
        let _g = testhost::boot(&[]);
        let before = free_frames();

        // Drain every frame the default pools will give us. This pushes
        // the stack windows through several chained chunks.
        let mut held = Vec::new();
        loop {
            let f = alloc(FrameFlags::empty());
            if f == FRAME_NULL {
                break;
            }
            held.push(f);
        }
        assert!(held.len() > super::STACK_CAP, "chaining was not exercised");

        // Ordinary allocation now fails, the emergency reserve does not.
        assert_eq!(alloc(FrameFlags::empty()), FRAME_NULL);
        let emergency = alloc(FrameFlags::EMERG);
        assert_ne!(emergency, FRAME_NULL);
        free(emergency);

        free_many(&held);
        drop(held);

        // Bulk allocation stops at exhaustion and reports the partial
        // count.
        let mut buf = std::vec![FRAME_NULL; before as usize + 64];
        let got = alloc_many(&mut buf, FrameFlags::EMERG);
        assert!(got > 0 && got < buf.len());
        for &f in &buf[..got] {
            assert_ne!(f, FRAME_NULL);
        }
        free_many(&buf[..got]);

        assert_eq!(free_frames(), before);
    }
}
