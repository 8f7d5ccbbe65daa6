//! PAE (3-level) page-table format.
//!
//! The top level is a 4-entry page directory pointer table; entry 3 covers
//! the kernel half and is physically shared by every address space, which
//! is what keeps kernel mappings identical everywhere. Alongside the
//! CPU-visible entries, [`PaePdpt`] carries the virtual addresses of every
//! page directory and page table so walks never need the MMU.

use core::cell::Cell;
use core::ptr::{addr_of, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::x86::cpuid::{self, FeatureExtEdx};
use crate::arch::x86::msr;
use crate::bootinfo::BootParams;
use crate::error::{KernelError, KernelResult};

use super::page::{self, AddressSpace, PageFlags, Tables, PAGE_PHYS_MASK_64};
use super::phys::{self, FrameFlags};
use super::pool::SmallPool;
use super::{
    early, frame_align_up, virt, PhysAddr, VirtAddr, FRAME_NULL, FRAME_OFFSET_MASK, FRAME_SIZE,
    KERNEL_VIRTUAL_BASE_NORM,
};

pub const PDPT_SIZE: usize = 4;
pub const PD_SIZE: usize = 512;
pub const PT_SIZE: usize = 512;

/// Present bit of a PDPT entry (the only flag PDPT entries carry here).
const PDPTE_PRESENT: u64 = 1;

/// Number of page-table slots across the whole 4 GiB space.
const TABLE_SLOTS: usize = PDPT_SIZE * PD_SIZE;
/// First table slot of the kernel half.
const KERNEL_TABLE_BASE: usize = 3 * PD_SIZE;

/// A PAE page table: 512 64-bit entries.
#[repr(C, align(4096))]
pub struct PageTablePae {
    entries: [Cell<u64>; PT_SIZE],
}

/// A PAE page directory: 512 64-bit entries.
#[repr(C, align(4096))]
pub struct PageDirPae {
    entries: [Cell<u64>; PD_SIZE],
}

type TableVirt = [Cell<Option<NonNull<PageTablePae>>>; TABLE_SLOTS];

/// Top-level structure of a PAE address space. The first 32 bytes are the
/// CPU-visible PDPT (which is why the struct is 32-byte aligned and the
/// pool below allocates 32-bit-reachable frames); the rest is kernel
/// bookkeeping.
#[repr(C, align(32))]
pub struct PaePdpt {
    dir_phys: [Cell<u64>; PDPT_SIZE],
    dir_virt: [Cell<Option<NonNull<PageDirPae>>>; PDPT_SIZE],
    table_virt: Cell<Option<NonNull<TableVirt>>>,
    kernel: Cell<bool>,
}

// SAFETY: mutation of the cells is serialized by the owning address
// space's lock (or happens during single-threaded boot).
unsafe impl Sync for PaePdpt {}

impl PaePdpt {
    const fn empty() -> Self {
        PaePdpt {
            dir_phys: [const { Cell::new(0) }; PDPT_SIZE],
            dir_virt: [const { Cell::new(None) }; PDPT_SIZE],
            table_virt: Cell::new(None),
            kernel: Cell::new(false),
        }
    }
}

static PDPT_GLOBAL: PaePdpt = PaePdpt::empty();

static PDPT_POOL: SmallPool = SmallPool::new();

static USE_NX: AtomicBool = AtomicBool::new(false);

/// Number of kernel page tables instantiated from the boot bump allocator,
/// contiguous from table 0 of the kernel half.
static BOOT_NEXT_TABLE: AtomicUsize = AtomicUsize::new(0);

pub fn nx_enabled() -> bool {
    USE_NX.load(Ordering::Relaxed)
}

#[inline]
fn pdpte_index(va: VirtAddr) -> usize {
    (page::norm(va) >> 30) as usize
}

#[inline]
fn pde_index(va: VirtAddr) -> usize {
    ((page::norm(va) >> 21) & 0x1FF) as usize
}

#[inline]
fn table_index(va: VirtAddr) -> usize {
    (page::norm(va) >> 21) as usize
}

#[inline]
fn pte_index(va: VirtAddr) -> usize {
    ((page::norm(va) >> 12) & 0x1FF) as usize
}

fn table_virt(pdpt: NonNull<PaePdpt>) -> NonNull<TableVirt> {
    // SAFETY: pdpt points to a live PaePdpt; table_virt is always set
    // before the structure is attached to an address space.
    unsafe {
        pdpt.as_ref()
            .table_virt
            .get()
            .expect("address space has no page-table directory")
    }
}

fn table(pdpt: NonNull<PaePdpt>, va: VirtAddr) -> Option<NonNull<PageTablePae>> {
    // SAFETY: table_virt points at TABLE_SLOTS live cells; the index is
    // masked to 11 bits by construction.
    unsafe { table_virt(pdpt).as_ref()[table_index(va)].get() }
}

/// Initialises the PAE format: registers the PDPT pool, enables NX when
/// available and not vetoed, builds the global PDPT skeleton from the
/// early allocator and reserves the `global_tables` window. Returns
/// `(global_tables, resv_end)`.
pub(super) fn init(param: &BootParams, kspace: &AddressSpace) -> (VirtAddr, VirtAddr) {
    PDPT_POOL.init(
        "page_dir_ptr_tab pool",
        core::mem::size_of::<PaePdpt>() as u32,
        32,
        FrameFlags::BITS32,
    );

    let use_nx = !param.cmdline_bool("no_nx")
        && msr::is_supported()
        && cpuid::supports_ext_edx(FeatureExtEdx::NX);
    USE_NX.store(use_nx, Ordering::Relaxed);
    if use_nx {
        msr::write(msr::MSR_EFER, msr::read(msr::MSR_EFER) | msr::MSR_EFER_NX);
    }

    // Kernel-half page directory, CPU-visible through PDPT entry 3.
    let (dir_va, dir_phys) = early::alloc_zeroed(
        core::mem::size_of::<PageDirPae>(),
        core::mem::align_of::<PageDirPae>(),
    );
    PDPT_GLOBAL.dir_virt[3].set(NonNull::new(dir_va as *mut PageDirPae));
    PDPT_GLOBAL.dir_phys[3].set(dir_phys | PDPTE_PRESENT);

    let (tv_va, _) = early::alloc_zeroed(
        core::mem::size_of::<TableVirt>(),
        core::mem::align_of::<TableVirt>(),
    );
    PDPT_GLOBAL.table_virt.set(NonNull::new(tv_va as *mut TableVirt));
    PDPT_GLOBAL.kernel.set(true);

    // No further boot allocations: the reserved table window starts at the
    // first frame boundary past the early allocations.
    early::finalize();
    let global_tables = frame_align_up(early::next_alloc());
    let resv_end = global_tables + PD_SIZE * FRAME_SIZE;

    // The PDPT is a higher-half static; its physical address is the load
    // offset. (Hosted builds never load this into CR3.)
    let root = page::norm(addr_of!(PDPT_GLOBAL) as VirtAddr)
        .wrapping_sub(KERNEL_VIRTUAL_BASE_NORM) as PhysAddr;
    kspace.set_tables(Tables::Pae(NonNull::from(&PDPT_GLOBAL)), root);

    (global_tables, resv_end)
}

/// Makes sure page tables exist for every page of the reserved window, so
/// the post-boot path can map new kernel tables into their window slots
/// without allocating.
pub(super) fn reserve_tables(kspace: &AddressSpace) {
    let pdpt = match kspace.tables_ref() {
        Tables::Pae(p) => p,
        _ => crate::crash!("PAE table reservation without a PAE kernel space!"),
    };

    let mut va = page::global_tables_base();
    while va < page::reserved_end() {
        if table(pdpt, va).is_none() && ensure_table(pdpt, va).is_err() {
            crate::crash!("Cannot reserve kernel page tables!");
        }
        va += FRAME_SIZE;
    }
}

/// Reads the entry for `va`: the mapped frame and its flags, or `None`
/// when any level is absent or the leaf is not present.
pub(super) fn get_entry(pdpt: NonNull<PaePdpt>, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    let t = table(pdpt, va)?;
    // SAFETY: t is a registered, live page table; the index is masked.
    let entry = unsafe { t.as_ref().entries[pte_index(va)].get() };
    if entry == 0 {
        return None;
    }

    let flags = PageFlags::from_bits_retain(entry & !PAGE_PHYS_MASK_64);
    if !flags.contains(PageFlags::PRESENT) {
        return None;
    }
    Some((entry & PAGE_PHYS_MASK_64, flags))
}

/// Writes the entry for `va`. Flags the CPU cannot honour (NX without
/// EFER.NXE, GLOBAL without CR4.PGE) are masked off.
pub(super) fn set_entry(
    pdpt: NonNull<PaePdpt>,
    va: VirtAddr,
    frame: PhysAddr,
    flags: PageFlags,
) -> KernelResult<()> {
    let mut flags = flags;
    if !nx_enabled() {
        flags.remove(PageFlags::NO_EXECUTE);
    }
    if !page::pge_enabled() {
        flags.remove(PageFlags::GLOBAL);
    }

    let t = match table(pdpt, va) {
        Some(t) => t,
        None => ensure_table(pdpt, va)?,
    };
    // SAFETY: t is a registered, live page table; the index is masked.
    unsafe {
        t.as_ref().entries[pte_index(va)].set(frame | flags.bits());
    }
    Ok(())
}

/// Clears the leaf entry for `va` (no-op when no table covers it).
pub(super) fn clear_entry(pdpt: NonNull<PaePdpt>, va: VirtAddr) {
    if let Some(t) = table(pdpt, va) {
        // SAFETY: t is a registered, live page table; the index is masked.
        unsafe {
            t.as_ref().entries[pte_index(va)].set(0);
        }
    }
}

fn ensure_table(pdpt: NonNull<PaePdpt>, va: VirtAddr) -> KernelResult<NonNull<PageTablePae>> {
    // SAFETY: pdpt points to a live PaePdpt.
    let kernel = unsafe { pdpt.as_ref().kernel.get() };
    if kernel {
        alloc_table_global(pdpt, va)
    } else {
        alloc_table_user(pdpt, va)
    }
}

/// Creates a page table in a user address space: a fresh frame, mapped at
/// a fresh kernel virtual page so the kernel can write it.
fn alloc_table_user(pdpt: NonNull<PaePdpt>, va: VirtAddr) -> KernelResult<NonNull<PageTablePae>> {
    // SAFETY: pdpt is live; index masked to 2 bits.
    let dir = unsafe { pdpt.as_ref().dir_virt[pdpte_index(va)].get() }
        .unwrap_or_else(|| crate::crash!("Attempt to map a page into a reserved area!"));

    let frame = phys::alloc(FrameFlags::empty());
    if frame == FRAME_NULL {
        return Err(KernelError::NoMemory);
    }

    let pt_va = match virt::alloc(1) {
        Some(va) => va,
        None => {
            phys::free(frame);
            return Err(KernelError::NoMemory);
        }
    };

    if page::global_map(
        pt_va,
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        true,
        frame,
    )
    .is_err()
    {
        virt::free(pt_va, 1);
        phys::free(frame);
        return Err(KernelError::NoMemory);
    }

    // SAFETY: pt_va was just mapped writable and is exclusively ours.
    unsafe {
        core::ptr::write_bytes(pt_va as *mut u8, 0, FRAME_SIZE);
    }

    // SAFETY: dir is a live page directory; indices masked.
    unsafe {
        dir.as_ref().entries[pde_index(va)].set(
            frame | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits(),
        );
        let pt = NonNull::new_unchecked(pt_va as *mut PageTablePae);
        table_virt(pdpt).as_ref()[table_index(va)].set(Some(pt));
        Ok(pt)
    }
}

/// Creates a kernel page table. During boot the table is carved from the
/// bump allocator inside the reserved window (tables are instantiated
/// contiguously from slot 0); afterwards an emergency frame is mapped into
/// the table's window slot.
fn alloc_table_global(pdpt: NonNull<PaePdpt>, va: VirtAddr) -> KernelResult<NonNull<PageTablePae>> {
    let pdpte = pdpte_index(va);
    // SAFETY: pdpt is live; index masked to 2 bits.
    let dir = unsafe { pdpt.as_ref().dir_virt[pdpte].get() }
        .unwrap_or_else(|| crate::crash!("Attempt to map a page into a reserved area!"));

    let pde = pde_index(va);
    let idx = table_index(va);
    let window = page::global_tables_base() + pde * FRAME_SIZE;

    if page::boot_tables_done() {
        let frame = phys::alloc(FrameFlags::EMERG);
        if frame == FRAME_NULL {
            return Err(KernelError::NoMemory);
        }

        set_entry(
            pdpt,
            window,
            frame,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL | PageFlags::NO_EXECUTE,
        )?;
        page::flush_one(window);

        let mut pde_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if page::pge_enabled() {
            pde_flags |= PageFlags::GLOBAL;
        }

        let pt = table_window_ptr(window, frame);
        // SAFETY: the window slot was just mapped writable; dir is live.
        unsafe {
            core::ptr::write_bytes(pt.as_ptr() as *mut u8, 0, FRAME_SIZE);
            dir.as_ref().entries[pde].set(frame | pde_flags.bits());
            table_virt(pdpt).as_ref()[idx].set(Some(pt));
        }
        Ok(pt)
    } else {
        // Boot: back window slots [created..=pde] with the memory directly
        // under them and register them all, then self-map each so the
        // window stays readable once the permanent tables take over.
        let created = BOOT_NEXT_TABLE.load(Ordering::Relaxed);
        debug_assert!(pde >= created);

        for i in created..=pde {
            let tva = page::global_tables_base() + i * FRAME_SIZE;
            let phys = (page::norm(tva) - KERNEL_VIRTUAL_BASE_NORM) as PhysAddr;
            // SAFETY: tva lies in the reserved window, which the boot
            // mapping covers; nothing else uses it yet.
            unsafe {
                core::ptr::write_bytes(tva as *mut u8, 0, FRAME_SIZE);
                dir.as_ref().entries[i]
                    .set(phys | (PageFlags::PRESENT | PageFlags::WRITABLE).bits());
                table_virt(pdpt).as_ref()[KERNEL_TABLE_BASE + i]
                    .set(NonNull::new(tva as *mut PageTablePae));
            }
        }
        BOOT_NEXT_TABLE.store(pde + 1, Ordering::Relaxed);
        early::advance_to(page::global_tables_base() + (pde + 1) * FRAME_SIZE);

        for i in created..=pde {
            let tva = page::global_tables_base() + i * FRAME_SIZE;
            let phys = (page::norm(tva) - KERNEL_VIRTUAL_BASE_NORM) as PhysAddr;
            set_entry(
                pdpt,
                tva,
                phys,
                PageFlags::PRESENT
                    | PageFlags::WRITABLE
                    | PageFlags::GLOBAL
                    | PageFlags::NO_EXECUTE,
            )?;
        }

        // SAFETY: registered in the loop above.
        Ok(unsafe { table_virt(pdpt).as_ref()[idx].get().unwrap_unchecked() })
    }
}

/// The kernel pointer through which a freshly mapped table window is
/// written. On the target this is simply the window address; hosted builds
/// write the arena memory backing the frame instead (there is no MMU to
/// make the window alias it).
#[cfg(target_os = "none")]
fn table_window_ptr(window: VirtAddr, _frame: PhysAddr) -> NonNull<PageTablePae> {
    // SAFETY: window is a non-null reserved address.
    unsafe { NonNull::new_unchecked(window as *mut PageTablePae) }
}

#[cfg(not(target_os = "none"))]
fn table_window_ptr(_window: VirtAddr, frame: PhysAddr) -> NonNull<PageTablePae> {
    // SAFETY: frame_ptr returns a valid arena pointer for any pool frame.
    unsafe { NonNull::new_unchecked(super::testhost::frame_ptr(frame) as *mut PageTablePae) }
}

/// Kernel-space physical address (frame + in-page offset) of a mapped
/// kernel virtual address; used to publish pool-allocated structures to
/// the CPU.
fn kernel_phys_of(va: VirtAddr) -> Option<PhysAddr> {
    let (frame, _) = page::global_get(va & !FRAME_OFFSET_MASK)?;
    Some(frame + (va & FRAME_OFFSET_MASK) as PhysAddr)
}

/// Builds the paging structure for an address space.
pub(super) fn context_create(space: &AddressSpace, kernel: bool) -> KernelResult<()> {
    if kernel {
        let root = page::norm(addr_of!(PDPT_GLOBAL) as VirtAddr)
            .wrapping_sub(KERNEL_VIRTUAL_BASE_NORM) as PhysAddr;
        space.set_tables(Tables::Pae(NonNull::from(&PDPT_GLOBAL)), root);
        return Ok(());
    }

    let raw = PDPT_POOL.alloc(FrameFlags::empty()).ok_or(KernelError::NoMemory)?;
    let pdpt = raw.cast::<PaePdpt>();
    // SAFETY: the pool returned a fresh, correctly sized and aligned slot.
    unsafe {
        pdpt.as_ptr().write(PaePdpt::empty());
    }

    let root = match kernel_phys_of(pdpt.as_ptr() as VirtAddr) {
        Some(p) => p,
        None => crate::crash!("Pool memory is not mapped in the kernel space!"),
    };

    // User-half page directories (PDPT entries 0..3).
    for i in 0..PDPT_SIZE - 1 {
        let dir = match page::global_alloc(
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            FrameFlags::BITS32,
            1,
        ) {
            Some(d) => d,
            None => {
                context_create_unwind(pdpt, i);
                return Err(KernelError::NoMemory);
            }
        };
        // SAFETY: dir points at one freshly mapped page.
        unsafe {
            core::ptr::write_bytes(dir.as_ptr(), 0, FRAME_SIZE);
        }
        let dir_phys = kernel_phys_of(dir.as_ptr() as VirtAddr)
            .unwrap_or_else(|| crate::crash!("Pool memory is not mapped in the kernel space!"));
        // SAFETY: pdpt was just initialized above.
        unsafe {
            pdpt.as_ref().dir_virt[i].set(Some(dir.cast()));
            pdpt.as_ref().dir_phys[i].set(dir_phys | PDPTE_PRESENT);
        }
    }

    // The kernel half is shared physically; the virtual pointer stays
    // empty so user mappings can never be written through this space.
    // SAFETY: pdpt live as above.
    unsafe {
        pdpt.as_ref().dir_virt[3].set(None);
        pdpt.as_ref().dir_phys[3].set(PDPT_GLOBAL.dir_phys[3].get());
    }

    let tv_pages = core::mem::size_of::<TableVirt>().div_ceil(FRAME_SIZE);
    let tv = match page::global_alloc(
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        FrameFlags::empty(),
        tv_pages,
    ) {
        Some(tv) => tv,
        None => {
            context_create_unwind(pdpt, PDPT_SIZE - 1);
            return Err(KernelError::NoMemory);
        }
    };
    // SAFETY: tv points at tv_pages freshly mapped pages; zeroing makes
    // every table_virt cell None.
    unsafe {
        core::ptr::write_bytes(tv.as_ptr(), 0, tv_pages * FRAME_SIZE);
        pdpt.as_ref().table_virt.set(Some(tv.cast()));
        pdpt.as_ref().kernel.set(false);
    }

    space.set_tables(Tables::Pae(pdpt), root);
    Ok(())
}

fn context_create_unwind(pdpt: NonNull<PaePdpt>, dirs_created: usize) {
    for j in 0..dirs_created {
        // SAFETY: dir_virt[j] was set by the creation loop.
        if let Some(d) = unsafe { pdpt.as_ref().dir_virt[j].get() } {
            page::global_free(d.cast(), 1);
        }
    }
    PDPT_POOL.free(pdpt.cast());
}

/// Destroys a user address space, releasing every page table it created,
/// the page-table directory and the user-half page directories.
pub(super) fn context_destroy(space: &AddressSpace) {
    let pdpt = match space.tables_ref() {
        Tables::Pae(p) => p,
        _ => crate::crash!("Attempt to destroy a malformed page context!"),
    };
    // SAFETY: pdpt is live until the pool free below.
    let pdpt_ref = unsafe { pdpt.as_ref() };

    if pdpt_ref.kernel.get() {
        crate::crash!("Attempt to destroy kernel page context!");
    }

    let tv = table_virt(pdpt);
    for i in 0..TABLE_SLOTS {
        // SAFETY: tv holds TABLE_SLOTS cells, live until freed below.
        if let Some(pt) = unsafe { tv.as_ref()[i].get() } {
            page::global_free(pt.cast(), 1);
        }
    }

    let tv_pages = core::mem::size_of::<TableVirt>().div_ceil(FRAME_SIZE);
    page::global_free(tv.cast(), tv_pages);
    pdpt_ref.table_virt.set(None);

    for i in 0..PDPT_SIZE {
        if let Some(dir) = pdpt_ref.dir_virt[i].get() {
            page::global_free(dir.cast(), 1);
            pdpt_ref.dir_virt[i].set(None);
        }
        pdpt_ref.dir_phys[i].set(!PDPTE_PRESENT);
    }

    PDPT_POOL.free(pdpt.cast());
    space.set_tables(Tables::None, 0);
}
