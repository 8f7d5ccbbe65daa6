//! Early boot bump allocator.
//!
//! Before the frame allocator exists, permanent boot-time structures (boot
//! parameter copies, the kernel page directory pieces, the reserved page
//! tables) are carved off the physical memory directly following the kernel
//! image and any boot modules. Nothing allocated here is ever freed. Once
//! the permanent page structures exist the allocator is finalized and any
//! further call is a fatal error; the frame allocator then treats
//! everything below the final bump pointer as kernel-reserved.

use crate::sync::spinlock::SpinLock;

use super::{kernel_virtual_base, PhysAddr, VirtAddr};

struct EarlyState {
    init_done: bool,
    final_done: bool,
    next_alloc: VirtAddr,
}

static STATE: SpinLock<EarlyState> = SpinLock::new(EarlyState {
    init_done: false,
    final_done: false,
    next_alloc: 0,
});

#[cfg(target_os = "none")]
extern "C" {
    static _ld_kernel_end: u8;
}

/// Starts the bump allocator after the kernel image and all boot modules.
#[cfg(target_os = "none")]
pub fn init(mb: &'static crate::bootinfo::MultibootInfo) {
    use crate::bootinfo::{MultibootFlags, MultibootModuleEntry};

    // SAFETY: taking the address of a linker-script symbol.
    let mut min_alloc = unsafe { &_ld_kernel_end as *const u8 as VirtAddr };

    let flags = MultibootFlags::from_bits_truncate(mb.flags);
    if flags.contains(MultibootFlags::MODULES) {
        for i in 0..mb.mods_count as usize {
            let entry = (mb.mods_addr as usize
                + super::KERNEL_VIRTUAL_BASE
                + i * core::mem::size_of::<MultibootModuleEntry>())
                as *const MultibootModuleEntry;
            // SAFETY: the module list lives in mapped low boot memory.
            let end = unsafe { (*entry).mod_end } as usize + super::KERNEL_VIRTUAL_BASE;
            if end > min_alloc {
                min_alloc = end;
            }
        }
    }

    let mut state = STATE.lock();
    assert!(!state.init_done && !state.final_done);
    state.next_alloc = min_alloc;
    state.init_done = true;
}

/// Starts the bump allocator over an arbitrary virtual range. Used by the
/// hosted test harness, which places the "kernel image end" at the start of
/// its simulated physical arena.
#[cfg(not(target_os = "none"))]
pub fn init_at(start: VirtAddr) {
    let mut state = STATE.lock();
    state.next_alloc = start;
    state.init_done = true;
    state.final_done = false;
}

/// Allocates `size` bytes with the given power-of-two alignment, returning
/// the virtual address and the physical address backing it.
pub fn alloc(size: usize, align: usize) -> (VirtAddr, PhysAddr) {
    assert!(align.is_power_of_two());

    let mut state = STATE.lock();
    assert!(
        state.init_done && !state.final_done,
        "early allocation outside the boot window"
    );

    let addr = (state.next_alloc + align - 1) & !(align - 1);
    state.next_alloc = addr + size;

    (addr, (addr - kernel_virtual_base()) as PhysAddr)
}

/// Allocates `size` zeroed bytes; returns the virtual and physical
/// addresses.
pub fn alloc_zeroed(size: usize, align: usize) -> (VirtAddr, PhysAddr) {
    let (addr, phys) = alloc(size, align);
    // SAFETY: the range was just carved out of untouched boot memory.
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, size);
    }
    (addr, phys)
}

/// Allocates a zero-initialized slice of `count` elements.
pub fn alloc_slice<T>(count: usize) -> &'static mut [T] {
    let (addr, _) = alloc(count * core::mem::size_of::<T>(), core::mem::align_of::<T>());
    // SAFETY: the range was just carved out of untouched boot memory with
    // the right size and alignment, and is never handed out again. All-zero
    // bytes are a valid image for the T's stored here (plain data).
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, count * core::mem::size_of::<T>());
        core::slice::from_raw_parts_mut(addr as *mut T, count)
    }
}

/// The current bump pointer. After [`finalize`], this is the permanent
/// boundary between kernel-reserved and allocatable physical memory.
pub fn next_alloc() -> VirtAddr {
    STATE.lock().next_alloc
}

/// Moves the bump pointer forward. Only the page-table manager uses this,
/// when it claims backing for the reserved `global_tables` window during
/// boot (after [`finalize`] has closed ordinary early allocation).
pub(super) fn advance_to(addr: VirtAddr) {
    let mut state = STATE.lock();
    assert!(addr >= state.next_alloc);
    state.next_alloc = addr;
}

/// Closes the early allocator. Ordinary allocations past this point crash.
pub fn finalize() {
    let mut state = STATE.lock();
    assert!(state.init_done);
    state.final_done = true;
}

#[cfg(not(target_os = "none"))]
pub fn reset_for_test() {
    let mut state = STATE.lock();
    state.init_done = false;
    state.final_done = false;
    state.next_alloc = 0;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testhost;

    // The boot-time assertions in alloc() are exercised indirectly through
    // testhost::boot(); what is checked here is the bump arithmetic, which
    // is independent of where the bump pointer starts.
    #[test]
    fn bump_allocations_are_aligned_and_disjoint() {
        let _g = testhost::boot(&[]);
        let base = crate::mm::kernel_virtual_base();

        // Reopen the (already finalized) allocator over scratch space near
        // the top of the simulated virtual range; nothing else uses it.
        let scratch = crate::mm::kernel_virtual_top() - 64 * 1024;
        init_at(scratch);

        let (a, pa) = alloc(10, 4);
        let (b, pb) = alloc(1, 64);
        let (c, _) = alloc(16, 8);

        assert_eq!(a % 4, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
        assert!(c > b);
        assert_eq!(pa as usize, a - base);
        assert_eq!(pb as usize, b - base);

        finalize();
    }
}
