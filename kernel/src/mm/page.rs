//! Address spaces and page-table maintenance.
//!
//! Two page-table formats exist: legacy 2-level (1024x1024, 32-bit
//! entries) and PAE 3-level (4x512x512, 64-bit entries). The format is
//! chosen once at boot and never leaks above this module: an
//! [`AddressSpace`] exposes the same operations either way.
//!
//! Every address space keeps, for each possible page-table slot, the
//! *virtual* address of that table, so walks never need a recursive
//! mapping. For the kernel address space the tables covering the high
//! half live in a reserved window of virtual pages (`global_tables`);
//! during boot that window is backed by the early bump allocator, and
//! afterwards new kernel tables take an emergency frame and are mapped
//! into their window slot on demand.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::arch::x86::mmu;
use crate::bootinfo::BootParams;
use crate::error::{KernelError, KernelResult};
use crate::sync::spinlock::SpinLock;

use super::phys::{self, FrameFlags};
use super::{
    frame_align_up, kernel_virtual_base, page_legacy, page_pae, virt, PhysAddr, VirtAddr,
    FRAME_SIZE, KERNEL_VIRTUAL_BASE_NORM,
};

bitflags::bitflags! {
    /// Page-table entry flags, in the PAE/long layout. The legacy format
    /// accepts the same values and masks off what it cannot express
    /// (NO_EXECUTE).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical-address bits of a PAE page-table entry.
pub const PAGE_PHYS_MASK_64: u64 = 0x7FFF_FFFF_FFFF_F000;
/// Physical-address bits of a legacy page-table entry.
pub const PAGE_PHYS_MASK_32: u32 = 0xFFFF_F000;

/// Format-specific top-level structure of an address space.
#[derive(Clone, Copy)]
pub(super) enum Tables {
    None,
    Pae(NonNull<page_pae::PaePdpt>),
    Legacy(NonNull<page_legacy::LegacyDir>),
}

/// An address space: a top-level paging structure plus the bookkeeping to
/// traverse and modify it. The embedded lock guards the whole structure;
/// all public operations take it.
pub struct AddressSpace {
    pub lock: SpinLock,
    root_phys: Cell<PhysAddr>,
    tables: Cell<Tables>,
}

// SAFETY: the interior cells are only accessed under `lock` (public
// operations) or during single-threaded boot (raw operations, documented at
// each call site).
unsafe impl Sync for AddressSpace {}
// SAFETY: as above; the raw pointers inside refer to kernel-owned memory.
unsafe impl Send for AddressSpace {}

static KERNEL_SPACE: AddressSpace = AddressSpace::empty();
static ACTIVE: AtomicPtr<AddressSpace> = AtomicPtr::new(core::ptr::null_mut());

static USE_PAE: AtomicBool = AtomicBool::new(false);
static USE_PGE: AtomicBool = AtomicBool::new(false);
/// Set once the reserved `global_tables` window is fully provisioned;
/// before that, kernel page tables are carved from the boot bump
/// allocator, afterwards from emergency frames.
static BOOT_TABLES_DONE: AtomicBool = AtomicBool::new(false);

static GLOBAL_TABLES: AtomicUsize = AtomicUsize::new(0);
static RESV_END: AtomicUsize = AtomicUsize::new(0);

/// The address space shared structurally by every other one above the
/// kernel virtual base.
pub fn kernel_space() -> &'static AddressSpace {
    &KERNEL_SPACE
}

pub fn pae_enabled() -> bool {
    USE_PAE.load(Ordering::Relaxed)
}

pub fn pge_enabled() -> bool {
    USE_PGE.load(Ordering::Relaxed)
}

pub(super) fn boot_tables_done() -> bool {
    BOOT_TABLES_DONE.load(Ordering::Relaxed)
}

/// Base of the reserved window holding kernel page tables.
pub(super) fn global_tables_base() -> VirtAddr {
    GLOBAL_TABLES.load(Ordering::Relaxed)
}

/// End of the permanently reserved kernel virtual region; the free
/// virtual-region allocator starts here.
pub fn reserved_end() -> VirtAddr {
    RESV_END.load(Ordering::Relaxed)
}

/// Normalises a virtual address into the target layout, where the kernel
/// half starts at 0xC0000000. On the real machine this is the identity;
/// hosted builds rebase arena addresses so that index extraction and the
/// frame-indexed side tables behave exactly as on the target.
#[inline]
pub(super) fn norm(va: VirtAddr) -> u32 {
    let base = kernel_virtual_base();
    if va >= base {
        (va - base) as u32 + KERNEL_VIRTUAL_BASE_NORM
    } else {
        va as u32
    }
}

impl AddressSpace {
    const fn empty() -> Self {
        AddressSpace {
            lock: SpinLock::new(()),
            root_phys: Cell::new(0),
            tables: Cell::new(Tables::None),
        }
    }

    /// Creates an address space with no paging structure; [`create`]
    /// populates it.
    ///
    /// [`create`]: AddressSpace::create
    pub const fn new() -> Self {
        Self::empty()
    }

    /// The physical address loaded into CR3 to activate this space.
    pub fn root_physical(&self) -> PhysAddr {
        self.root_phys.get()
    }

    pub(super) fn tables_ref(&self) -> Tables {
        self.tables.get()
    }

    pub(super) fn set_tables(&self, tables: Tables, root: PhysAddr) {
        self.tables.set(tables);
        self.root_phys.set(root);
    }

    /// Builds the paging structure. The kernel space shares the global
    /// tables; a user space clones the kernel's top-level entries and
    /// starts with an empty user half.
    pub fn create(&self, kernel: bool) -> KernelResult<()> {
        if pae_enabled() {
            page_pae::context_create(self, kernel)
        } else {
            page_legacy::context_create(self, kernel)
        }
    }

    /// Tears down a user address space, releasing every page table it
    /// created (the kernel-shared tables are untouched). Destroying the
    /// kernel address space is a fatal error.
    pub fn destroy(&self) {
        if pae_enabled() {
            page_pae::context_destroy(self);
        } else {
            page_legacy::context_destroy(self);
        }
    }

    /// Looks up the frame and flags mapped at `va`, or `None` when any
    /// level of the walk is absent or the leaf is not present.
    pub fn get(&self, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let _guard = self.lock.lock();
        self.get_raw(va)
    }

    /// Maps `frame` at `va`. Intermediate tables are allocated as needed;
    /// `NoMemory` is returned when that fails.
    pub fn map(
        &self,
        va: VirtAddr,
        frame: PhysAddr,
        flags: PageFlags,
        flush: bool,
    ) -> KernelResult<()> {
        let guard = self.lock.lock();
        self.set_raw(va, frame, flags | PageFlags::PRESENT)?;
        if flush {
            flush_one(va);
        }
        drop(guard);
        Ok(())
    }

    /// Clears the leaf entry for `va`.
    pub fn unmap(&self, va: VirtAddr, flush: bool) {
        let guard = self.lock.lock();
        self.clear_raw(va);
        if flush {
            flush_one(va);
        }
        drop(guard);
    }

    /// Makes this the active address space.
    pub fn switch(&self) {
        ACTIVE.store(self as *const _ as *mut _, Ordering::Relaxed);
        // SAFETY: root_phys was produced by create() and maps the kernel
        // half identically to every other space, so the executing code
        // stays mapped across the switch.
        unsafe {
            mmu::write_cr3(self.root_phys.get() as u32);
        }
    }

    pub(super) fn get_raw(&self, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        match self.tables.get() {
            Tables::Pae(t) => page_pae::get_entry(t, va),
            Tables::Legacy(t) => page_legacy::get_entry(t, va),
            Tables::None => None,
        }
    }

    pub(super) fn set_raw(
        &self,
        va: VirtAddr,
        frame: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        match self.tables.get() {
            Tables::Pae(t) => page_pae::set_entry(t, va, frame, flags),
            Tables::Legacy(t) => page_legacy::set_entry(t, va, frame, flags),
            Tables::None => Err(KernelError::Invalid),
        }
    }

    pub(super) fn clear_raw(&self, va: VirtAddr) {
        match self.tables.get() {
            Tables::Pae(t) => page_pae::clear_entry(t, va),
            Tables::Legacy(t) => page_legacy::clear_entry(t, va),
            Tables::None => {}
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Chooses the paging format, builds the kernel address space and switches
/// onto it.
pub fn init(param: &BootParams) {
    use crate::arch::x86::cpuid::{self, FeatureEdx};

    let pge = cpuid::supports_edx(FeatureEdx::PGE);
    USE_PGE.store(pge, Ordering::Relaxed);

    // The trampoline already chose the paging mode; read it back rather
    // than re-deriving it, so a CR4 the firmware fiddled with cannot
    // disagree with the structures we are about to build.
    #[cfg(target_os = "none")]
    let use_pae = mmu::read_cr4() & mmu::CR4_PAE != 0;
    #[cfg(not(target_os = "none"))]
    let use_pae = !param.cmdline_bool("no_pae") && cpuid::supports_edx(FeatureEdx::PAE);
    USE_PAE.store(use_pae, Ordering::Relaxed);

    if pge {
        // SAFETY: the CPU reports PGE; setting CR4.PGE only enables global
        // TLB entries.
        unsafe {
            mmu::write_cr4(mmu::read_cr4() | mmu::CR4_PGE);
        }
    }

    let (global_tables, resv_end) = if use_pae {
        page_pae::init(param, &KERNEL_SPACE)
    } else {
        page_legacy::init(param, &KERNEL_SPACE)
    };
    GLOBAL_TABLES.store(global_tables, Ordering::Relaxed);
    RESV_END.store(resv_end, Ordering::Relaxed);

    log::debug!(
        "paging: {} format, PGE {}, kernel tables at {:#x}..{:#x}",
        if use_pae { "PAE" } else { "legacy" },
        if pge { "on" } else { "off" },
        global_tables,
        resv_end
    );

    #[cfg(target_os = "none")]
    {
        map_kernel_image();
        KERNEL_SPACE.switch();
    }
    #[cfg(not(target_os = "none"))]
    ACTIVE.store(
        &KERNEL_SPACE as *const _ as *mut AddressSpace,
        Ordering::Relaxed,
    );
}

/// Provisions page tables for the whole reserved window so that the
/// post-boot path (which maps new kernel tables *into* that window) never
/// has to allocate the tables covering it.
pub fn init_reserved_tables() {
    if pae_enabled() {
        page_pae::reserve_tables(&KERNEL_SPACE);
    } else {
        page_legacy::reserve_tables(&KERNEL_SPACE);
    }
    BOOT_TABLES_DONE.store(true, Ordering::Relaxed);
}

/// Re-maps the kernel image in the permanent tables with per-section
/// protections: text read-only, rodata read-only and non-executable,
/// everything else writable and non-executable. All of it global.
#[cfg(target_os = "none")]
fn map_kernel_image() {
    extern "C" {
        static _ld_text_begin: u8;
        static _ld_text_end: u8;
        static _ld_rodata_begin: u8;
        static _ld_rodata_end: u8;
    }

    // SAFETY: linker-script symbols; only their addresses are used.
    let (text, text_end, rodata, rodata_end) = unsafe {
        (
            &_ld_text_begin as *const u8 as usize,
            &_ld_text_end as *const u8 as usize,
            &_ld_rodata_begin as *const u8 as usize,
            &_ld_rodata_end as *const u8 as usize,
        )
    };

    let image_end = frame_align_up(super::early::next_alloc());
    let mut va = super::KERNEL_VIRTUAL_BASE;
    while va < image_end {
        let phys = (va - super::KERNEL_VIRTUAL_BASE) as PhysAddr;
        let flags = if va >= text && va < text_end {
            PageFlags::GLOBAL
        } else if va >= rodata && va < rodata_end {
            PageFlags::GLOBAL | PageFlags::NO_EXECUTE
        } else {
            PageFlags::GLOBAL | PageFlags::NO_EXECUTE | PageFlags::WRITABLE
        };
        if KERNEL_SPACE
            .set_raw(va, phys, flags | PageFlags::PRESENT)
            .is_err()
        {
            crate::crash!("Cannot map kernel image!");
        }
        va += FRAME_SIZE;
    }
}

/// Kernel-space lookup (takes the kernel space lock).
pub fn global_get(va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    KERNEL_SPACE.get(va)
}

/// Kernel-space mapping (takes the kernel space lock).
pub fn global_map(va: VirtAddr, flags: PageFlags, flush: bool, frame: PhysAddr) -> KernelResult<()> {
    KERNEL_SPACE.map(va, frame, flags, flush)
}

/// Kernel-space unmapping (takes the kernel space lock).
pub fn global_unmap(va: VirtAddr, flush: bool) {
    KERNEL_SPACE.unmap(va, flush);
}

/// Lock-free kernel-space lookup for the frame allocator's stack windows.
///
/// The frame allocator calls this while holding its own spinlock; taking
/// the kernel space lock here would order phys -> page, while ordinary
/// mapping paths order page -> phys through table allocation. Interrupts
/// are already disabled by the caller's lock, and the entries touched
/// (the frame-stack window pages, whose covering tables are provisioned at
/// boot) are touched by no one else.
pub(super) fn global_get_raw(va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    KERNEL_SPACE.get_raw(va)
}

/// Lock-free kernel-space mapping; see [`global_get_raw`].
pub(super) fn global_map_raw(
    va: VirtAddr,
    flags: PageFlags,
    flush: bool,
    frame: PhysAddr,
) -> KernelResult<()> {
    KERNEL_SPACE.set_raw(va, frame, flags | PageFlags::PRESENT)?;
    if flush {
        flush_one(va);
    }
    Ok(())
}

/// Flushes the TLB entry for one page.
pub fn flush_one(va: VirtAddr) {
    if pge_enabled() {
        mmu::invlpg(va);
    } else {
        flush_all();
    }
}

/// Flushes the TLB entries for `num_pages` pages starting at `va`.
pub fn flush_region(va: VirtAddr, num_pages: usize) {
    for i in 0..num_pages {
        flush_one(va + i * FRAME_SIZE);
    }
}

/// Flushes the entire TLB, including global entries.
pub fn flush_all() {
    if pge_enabled() {
        // Toggling CR4.PGE drops every TLB entry, global ones included.
        let cr4 = mmu::read_cr4();
        // SAFETY: clearing and restoring PGE is the architectural way to
        // shoot down global entries; no other CR4 bit changes.
        unsafe {
            mmu::write_cr4(cr4 & !mmu::CR4_PGE);
            mmu::write_cr4(cr4);
        }
    } else {
        // SAFETY: reloading CR3 with its current value flushes the
        // non-global TLB without changing the active space.
        unsafe {
            mmu::write_cr3(mmu::read_cr3());
        }
    }
}

/// Reserves a virtual region, backs it with freshly allocated frames and
/// maps it into the kernel space. Returns `None` when either virtual space
/// or physical memory is exhausted; partial work is rolled back.
pub fn global_alloc(
    page_flags: PageFlags,
    alloc_flags: FrameFlags,
    num_pages: usize,
) -> Option<NonNull<u8>> {
    let va = virt::alloc(num_pages)?;

    for i in 0..num_pages {
        let page = va + i * FRAME_SIZE;
        let frame = phys::alloc(alloc_flags);
        if frame == super::FRAME_NULL {
            global_alloc_rollback(va, i, num_pages);
            return None;
        }
        if global_map(page, page_flags, false, frame).is_err() {
            phys::free(frame);
            global_alloc_rollback(va, i, num_pages);
            return None;
        }
    }

    flush_region(va, num_pages);
    NonNull::new(va as *mut u8)
}

fn global_alloc_rollback(va: VirtAddr, mapped: usize, num_pages: usize) {
    for j in 0..mapped {
        let page = va + j * FRAME_SIZE;
        if let Some((frame, _)) = global_get(page) {
            global_unmap(page, false);
            phys::free(frame);
        }
    }
    flush_region(va, mapped);
    virt::free(va, num_pages);
}

/// Releases a region obtained from [`global_alloc`]: unmaps every page,
/// frees the backing frames and returns the virtual region.
pub fn global_free(addr: NonNull<u8>, num_pages: usize) {
    let va = addr.as_ptr() as VirtAddr;

    for i in 0..num_pages {
        let page = va + i * FRAME_SIZE;
        match global_get(page) {
            Some((frame, _)) => {
                global_unmap(page, false);
                phys::free(frame);
            }
            None => crate::crash!("Attempt to free an unmapped global page!"),
        }
    }

    flush_region(va, num_pages);
    virt::free(va, num_pages);
}

/// Allows supervisor writes to read-only pages (used while patching
/// otherwise read-only kernel data).
pub fn disable_write_protect() {
    // SAFETY: clearing CR0.WP only affects supervisor write checks.
    unsafe {
        mmu::write_cr0(mmu::read_cr0() & !mmu::CR0_WP);
    }
}

/// Re-enables supervisor write protection.
pub fn enable_write_protect() {
    // SAFETY: setting CR0.WP restores supervisor write checks.
    unsafe {
        mmu::write_cr0(mmu::read_cr0() | mmu::CR0_WP);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testhost;

    #[test]
    fn norm_rebases_kernel_range_only() {
        let _g = testhost::boot(&[]);
        let base = kernel_virtual_base();
        assert_eq!(norm(base), KERNEL_VIRTUAL_BASE_NORM);
        assert_eq!(norm(base + 0x5000), KERNEL_VIRTUAL_BASE_NORM + 0x5000);
        assert_eq!(norm(0x1000), 0x1000);
    }

    #[test]
    fn map_get_round_trip_masks_unsupported_bits() {
        let _g = testhost::boot(&[]);
        let space = AddressSpace::new();
        space.create(false).expect("user space creation should succeed");

        let frame = phys::alloc(FrameFlags::empty());
        assert_ne!(frame, crate::mm::FRAME_NULL);

        let flags = PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE;
        space
            .map(0x40_0000, frame, flags, false)
            .expect("mapping a user page should succeed");

        let (got_frame, got_flags) = space.get(0x40_0000).expect("mapping should be visible");
        assert_eq!(got_frame, frame);
        assert!(got_flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER));
        // The synthetic host CPU supports NX, so PAE keeps the bit.
        assert!(got_flags.contains(PageFlags::NO_EXECUTE));

        space.unmap(0x40_0000, false);
        assert!(space.get(0x40_0000).is_none());

        space.destroy();
        phys::free(frame);
    }

    #[test]
    fn global_alloc_free_is_a_null_op_on_the_allocators() {
        let _g = testhost::boot(&[]);

        // Warm pass: lazily created kernel page tables stay allocated, so
        // they must exist before the round trip is measured.
        let warm = global_alloc(PageFlags::WRITABLE, FrameFlags::empty(), 3)
            .expect("warm-up allocation should succeed");
        global_free(warm, 3);
        let frames_before = phys::free_frames();

        let p = global_alloc(
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            FrameFlags::empty(),
            3,
        )
        .expect("three-page global allocation should succeed");

        // The memory must actually be usable.
        // SAFETY: p points at 3 freshly mapped pages.
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xA5, 3 * FRAME_SIZE);
            assert_eq!(*p.as_ptr().add(3 * FRAME_SIZE - 1), 0xA5);
        }

        assert!(phys::free_frames() < frames_before);
        global_free(p, 3);
        assert_eq!(phys::free_frames(), frames_before);
    }

    #[test]
    fn unmapped_lookup_is_absent() {
        let _g = testhost::boot(&[]);
        let space = AddressSpace::new();
        space.create(false).expect("user space creation should succeed");
        assert!(space.get(0x1234_5000).is_none());
        space.destroy();
    }
}
