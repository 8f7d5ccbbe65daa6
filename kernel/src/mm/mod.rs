//! Memory management: early bump allocation, the physical frame allocator,
//! page-table maintenance, the kernel virtual-region allocator and the
//! object pools built on top.
//!
//! Initialization order matters and is wired up by [`init`]:
//!
//! 1. [`early`]: bump allocator over the memory following the kernel image
//! 2. [`page`]: kernel address space, permanent page tables, CR3 switch
//! 3. `page::init_reserved_tables`: pre-reserve the `global_tables` window
//! 4. [`phys`]: promote every surviving frame into the free pools
//! 5. [`virt`]: publish the free kernel virtual range
//! 6. [`pool`]: generic size-class pools (and with them the kernel heap)

pub mod early;
pub mod heap;
pub mod page;
pub mod page_legacy;
pub mod page_pae;
pub mod phys;
pub mod pool;
pub mod virt;

#[cfg(not(target_os = "none"))]
pub mod testhost;

use crate::bootinfo::BootParams;

/// A physical address. Wide enough for PAE addresses above 4 GiB.
pub type PhysAddr = u64;

/// A kernel virtual address.
pub type VirtAddr = usize;

/// Sentinel distinguishable from any real frame address.
///
/// This is deliberately **not** zero: physical frame 0 exists. Compare
/// explicitly against this value to test for "no frame".
pub const FRAME_NULL: PhysAddr = 0xdead_dead_dead_dead;

/// log2 of the frame size.
pub const FRAME_SHIFT: u32 = 12;

/// Size in bytes of a physical frame (and of a virtual page).
pub const FRAME_SIZE: usize = 1 << FRAME_SHIFT;

/// Mask selecting the offset-within-frame bits of any address.
pub const FRAME_OFFSET_MASK: usize = FRAME_SIZE - 1;

/// Mask selecting the frame part of a physical address.
pub const FRAME_MASK: PhysAddr = !(FRAME_OFFSET_MASK as PhysAddr);

/// First virtual address of the higher-half kernel mapping. Kernel mappings
/// at and above this address are shared structurally by every address
/// space.
#[cfg(target_os = "none")]
pub const KERNEL_VIRTUAL_BASE: VirtAddr = 0xC000_0000;

/// The kernel virtual base in the *normalised* 32-bit layout that index
/// extraction and the frame-indexed side tables work in (see
/// `page::norm`). Identical to [`KERNEL_VIRTUAL_BASE`] on the real target.
pub const KERNEL_VIRTUAL_BASE_NORM: u32 = 0xC000_0000;

/// Hosted builds simulate physical memory with an arena owned by
/// [`testhost`]; the "higher half" begins wherever that arena was placed.
#[cfg(not(target_os = "none"))]
pub fn kernel_virtual_base() -> VirtAddr {
    testhost::arena_base()
}

#[cfg(target_os = "none")]
#[inline]
pub fn kernel_virtual_base() -> VirtAddr {
    KERNEL_VIRTUAL_BASE
}

/// One-past-the-end of the managed kernel virtual range. On the real
/// machine this is the 4 GiB wrap-around (represented as 0).
#[cfg(target_os = "none")]
#[inline]
pub fn kernel_virtual_top() -> VirtAddr {
    0
}

#[cfg(not(target_os = "none"))]
pub fn kernel_virtual_top() -> VirtAddr {
    testhost::arena_top()
}

/// Rounds an address up to the next frame boundary.
#[inline]
pub const fn frame_align_up(addr: usize) -> usize {
    (addr + FRAME_SIZE - 1) & !FRAME_OFFSET_MASK
}

/// Rounds an address down to a frame boundary.
#[inline]
pub const fn frame_align_down(addr: usize) -> usize {
    addr & !FRAME_OFFSET_MASK
}

/// Brings up the whole memory-management stack. Called once from kernel
/// initialization, after the CPU probe and descriptor tables.
pub fn init(param: &BootParams) {
    page::init(param);
    page::init_reserved_tables();
    phys::init(param);
    virt::init(param);
    pool::init_generic();
    log::info!(
        "memory manager online: {} KiB usable, {} KiB free",
        phys::total_frames() * 4,
        phys::free_frames() * 4
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_alignment_helpers() {
        assert_eq!(frame_align_up(0), 0);
        assert_eq!(frame_align_up(1), FRAME_SIZE);
        assert_eq!(frame_align_up(FRAME_SIZE), FRAME_SIZE);
        assert_eq!(frame_align_down(FRAME_SIZE + 17), FRAME_SIZE);
        assert_eq!(FRAME_MASK & 0x1234_5678_9abc_def0, 0x1234_5678_9abc_d000);
    }

    #[test]
    fn frame_null_is_not_a_frame_boundary_zero() {
        assert_ne!(FRAME_NULL, 0);
        assert_ne!(FRAME_NULL & FRAME_MASK, 0);
    }
}
