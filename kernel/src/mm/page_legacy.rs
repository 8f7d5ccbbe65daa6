//! Legacy (2-level) page-table format: a 1024-entry page directory of
//! 1024-entry page tables, all 32-bit.
//!
//! Unlike PAE there is no shared third-level entry to make kernel mappings
//! structurally common, so every kernel page table is created eagerly at
//! boot and each user address space copies the kernel's 256 directory
//! entries once at creation; the copies stay valid forever because the set
//! of kernel tables never changes after boot.
//!
//! 32-bit entries cannot express NO_EXECUTE; the flag is silently masked.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::bootinfo::BootParams;
use crate::error::{KernelError, KernelResult};

use super::page::{self, AddressSpace, PageFlags, Tables, PAGE_PHYS_MASK_32};
use super::phys::{self, FrameFlags};
use super::pool::SmallPool;
use super::{
    early, frame_align_up, virt, PhysAddr, VirtAddr, FRAME_NULL, FRAME_OFFSET_MASK, FRAME_SIZE,
    KERNEL_VIRTUAL_BASE_NORM,
};

pub const DIR_SIZE: usize = 1024;
pub const PT_SIZE: usize = 1024;

/// Directory index of the first kernel-half table (0xC0000000 >> 22).
const KERNEL_TABLE_BASE: usize = 768;
/// Number of kernel-half page tables.
pub const KERNEL_TABLES: usize = DIR_SIZE - KERNEL_TABLE_BASE;

/// A legacy page table: 1024 32-bit entries.
#[repr(C, align(4096))]
pub struct PageTableLegacy {
    entries: [Cell<u32>; PT_SIZE],
}

/// A legacy page directory: 1024 32-bit entries.
#[repr(C, align(4096))]
pub struct PageDirLegacy {
    entries: [Cell<u32>; DIR_SIZE],
}

type TableVirt = [Cell<Option<NonNull<PageTableLegacy>>>; DIR_SIZE];

/// Bookkeeping for a legacy address space: the CPU sees only the page
/// directory (whose physical address goes into CR3); everything else lets
/// the kernel traverse without the MMU.
pub struct LegacyDir {
    dir_phys: Cell<PhysAddr>,
    dir_virt: Cell<Option<NonNull<PageDirLegacy>>>,
    table_virt: Cell<Option<NonNull<TableVirt>>>,
    kernel: Cell<bool>,
}

// SAFETY: cells are only mutated under the owning address space's lock or
// during single-threaded boot.
unsafe impl Sync for LegacyDir {}

impl LegacyDir {
    const fn empty() -> Self {
        LegacyDir {
            dir_phys: Cell::new(0),
            dir_virt: Cell::new(None),
            table_virt: Cell::new(None),
            kernel: Cell::new(false),
        }
    }
}

static DIR_GLOBAL: LegacyDir = LegacyDir::empty();

static DIR_POOL: SmallPool = SmallPool::new();

/// Kernel page tables instantiated so far during boot (contiguous from
/// table 0 of the kernel half).
static BOOT_NEXT_TABLE: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn dir_index(va: VirtAddr) -> usize {
    (page::norm(va) >> 22) as usize
}

#[inline]
fn pte_index(va: VirtAddr) -> usize {
    ((page::norm(va) >> 12) & 0x3FF) as usize
}

fn table_virt(dir: NonNull<LegacyDir>) -> NonNull<TableVirt> {
    // SAFETY: dir points to a live LegacyDir; table_virt is set before the
    // structure is attached to an address space.
    unsafe {
        dir.as_ref()
            .table_virt
            .get()
            .expect("address space has no page-table directory")
    }
}

fn table(dir: NonNull<LegacyDir>, va: VirtAddr) -> Option<NonNull<PageTableLegacy>> {
    // SAFETY: table_virt holds DIR_SIZE live cells; the index is masked to
    // 10 bits by construction.
    unsafe { table_virt(dir).as_ref()[dir_index(va)].get() }
}

/// Truncates the portable flags to what a 32-bit entry can express.
fn flags32(flags: PageFlags) -> u32 {
    let mut flags = flags;
    flags.remove(PageFlags::NO_EXECUTE);
    if !page::pge_enabled() {
        flags.remove(PageFlags::GLOBAL);
    }
    flags.bits() as u32
}

/// Initialises the legacy format and reserves the kernel-table window.
/// Returns `(global_tables, resv_end)`.
pub(super) fn init(_param: &BootParams, kspace: &AddressSpace) -> (VirtAddr, VirtAddr) {
    DIR_POOL.init(
        "page_dir pool",
        core::mem::size_of::<LegacyDir>() as u32,
        core::mem::align_of::<LegacyDir>() as u32,
        FrameFlags::empty(),
    );

    let (dir_va, dir_phys) = early::alloc_zeroed(
        core::mem::size_of::<PageDirLegacy>(),
        core::mem::align_of::<PageDirLegacy>(),
    );
    DIR_GLOBAL.dir_virt.set(NonNull::new(dir_va as *mut PageDirLegacy));
    DIR_GLOBAL.dir_phys.set(dir_phys);

    let (tv_va, _) = early::alloc_zeroed(
        core::mem::size_of::<TableVirt>(),
        core::mem::align_of::<TableVirt>(),
    );
    DIR_GLOBAL.table_virt.set(NonNull::new(tv_va as *mut TableVirt));
    DIR_GLOBAL.kernel.set(true);

    early::finalize();
    let global_tables = frame_align_up(early::next_alloc());
    let resv_end = global_tables + KERNEL_TABLES * FRAME_SIZE;

    kspace.set_tables(Tables::Legacy(NonNull::from(&DIR_GLOBAL)), dir_phys);

    (global_tables, resv_end)
}

/// Instantiates every kernel page table. After this the kernel half of the
/// directory is immutable, so user spaces can copy it once at creation.
pub(super) fn reserve_tables(kspace: &AddressSpace) {
    let dir = match kspace.tables_ref() {
        Tables::Legacy(d) => d,
        _ => crate::crash!("Legacy table reservation without a legacy kernel space!"),
    };
    create_boot_tables_through(dir, KERNEL_TABLES - 1);
}

pub(super) fn get_entry(dir: NonNull<LegacyDir>, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    let t = table(dir, va)?;
    // SAFETY: t is a registered, live page table; the index is masked.
    let entry = unsafe { t.as_ref().entries[pte_index(va)].get() };
    if entry == 0 {
        return None;
    }

    let flags = PageFlags::from_bits_retain((entry & !PAGE_PHYS_MASK_32) as u64);
    if !flags.contains(PageFlags::PRESENT) {
        return None;
    }
    Some(((entry & PAGE_PHYS_MASK_32) as PhysAddr, flags))
}

pub(super) fn set_entry(
    dir: NonNull<LegacyDir>,
    va: VirtAddr,
    frame: PhysAddr,
    flags: PageFlags,
) -> KernelResult<()> {
    debug_assert!(frame == 0 || frame < (1 << 32), "legacy entry cannot hold {frame:#x}");

    let t = match table(dir, va) {
        Some(t) => t,
        None => ensure_table(dir, va)?,
    };
    // SAFETY: t is a registered, live page table; the index is masked.
    unsafe {
        t.as_ref().entries[pte_index(va)].set(frame as u32 | flags32(flags));
    }
    Ok(())
}

pub(super) fn clear_entry(dir: NonNull<LegacyDir>, va: VirtAddr) {
    if let Some(t) = table(dir, va) {
        // SAFETY: t is a registered, live page table; the index is masked.
        unsafe {
            t.as_ref().entries[pte_index(va)].set(0);
        }
    }
}

fn ensure_table(dir: NonNull<LegacyDir>, va: VirtAddr) -> KernelResult<NonNull<PageTableLegacy>> {
    // SAFETY: dir points to a live LegacyDir.
    let kernel = unsafe { dir.as_ref().kernel.get() };
    if kernel {
        alloc_table_global(dir, va)
    } else {
        alloc_table_user(dir, va)
    }
}

/// Creates a page table in a user address space. The backing frame must be
/// 32-bit reachable because the directory entry is 32 bits wide.
fn alloc_table_user(dir: NonNull<LegacyDir>, va: VirtAddr) -> KernelResult<NonNull<PageTableLegacy>> {
    let idx = dir_index(va);
    if idx >= KERNEL_TABLE_BASE {
        crate::crash!("Attempt to map a page into a reserved area!");
    }
    // SAFETY: dir is live; dir_virt is set for user contexts.
    let pd = unsafe { dir.as_ref().dir_virt.get() }
        .unwrap_or_else(|| crate::crash!("Attempt to map a page into a reserved area!"));

    let frame = phys::alloc(FrameFlags::BITS32);
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

    // SAFETY: pd is a live page directory; indices masked.
    unsafe {
        pd.as_ref().entries[idx].set(
            frame as u32
                | flags32(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER),
        );
        let pt = NonNull::new_unchecked(pt_va as *mut PageTableLegacy);
        table_virt(dir).as_ref()[idx].set(Some(pt));
        Ok(pt)
    }
}

/// Kernel tables exist only during boot table creation; afterwards the
/// kernel half is complete by construction.
fn alloc_table_global(dir: NonNull<LegacyDir>, va: VirtAddr) -> KernelResult<NonNull<PageTableLegacy>> {
    let idx = dir_index(va);
    if idx < KERNEL_TABLE_BASE {
        crate::crash!("Attempt to map a page into a reserved area!");
    }
    if page::boot_tables_done() {
        crate::crash!("Kernel page table missing after boot reservation!");
    }

    create_boot_tables_through(dir, idx - KERNEL_TABLE_BASE);
    // SAFETY: registered by create_boot_tables_through.
    Ok(unsafe { table_virt(dir).as_ref()[idx].get().unwrap_unchecked() })
}

/// Instantiates kernel tables `[created..=last]` from the boot bump
/// allocator: each lives at its window slot, backed by the memory directly
/// under the window, registered first and then self-mapped.
fn create_boot_tables_through(dir: NonNull<LegacyDir>, last: usize) {
    // SAFETY: dir is live; the kernel directory is set during init.
    let pd = unsafe { dir.as_ref().dir_virt.get() }
        .unwrap_or_else(|| crate::crash!("Legacy kernel directory missing!"));

    let created = BOOT_NEXT_TABLE.load(Ordering::Relaxed);
    if last < created {
        return;
    }

    for i in created..=last {
        let tva = page::global_tables_base() + i * FRAME_SIZE;
        let phys = (page::norm(tva) - KERNEL_VIRTUAL_BASE_NORM) as PhysAddr;
        // SAFETY: tva lies in the reserved window, covered by the boot
        // mapping; nothing else uses it yet.
        unsafe {
            core::ptr::write_bytes(tva as *mut u8, 0, FRAME_SIZE);
            pd.as_ref().entries[KERNEL_TABLE_BASE + i].set(
                phys as u32 | flags32(PageFlags::PRESENT | PageFlags::WRITABLE),
            );
            table_virt(dir).as_ref()[KERNEL_TABLE_BASE + i]
                .set(NonNull::new(tva as *mut PageTableLegacy));
        }
    }
    BOOT_NEXT_TABLE.store(last + 1, Ordering::Relaxed);
    early::advance_to(page::global_tables_base() + (last + 1) * FRAME_SIZE);

    for i in created..=last {
        let tva = page::global_tables_base() + i * FRAME_SIZE;
        let phys = (page::norm(tva) - KERNEL_VIRTUAL_BASE_NORM) as PhysAddr;
        if set_entry(
            dir,
            tva,
            phys,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL,
        )
        .is_err()
        {
            crate::crash!("Cannot self-map kernel page tables!");
        }
    }
}

fn kernel_phys_of(va: VirtAddr) -> Option<PhysAddr> {
    let (frame, _) = page::global_get(va & !FRAME_OFFSET_MASK)?;
    Some(frame + (va & FRAME_OFFSET_MASK) as PhysAddr)
}

pub(super) fn context_create(space: &AddressSpace, kernel: bool) -> KernelResult<()> {
    if kernel {
        space.set_tables(
            Tables::Legacy(NonNull::from(&DIR_GLOBAL)),
            DIR_GLOBAL.dir_phys.get(),
        );
        return Ok(());
    }

    let raw = DIR_POOL.alloc(FrameFlags::empty()).ok_or(KernelError::NoMemory)?;
    let rec = raw.cast::<LegacyDir>();
    // SAFETY: the pool returned a fresh, correctly sized and aligned slot.
    unsafe {
        rec.as_ptr().write(LegacyDir::empty());
    }

    // The page directory itself: one 32-bit-reachable page (CR3 is 32
    // bits wide).
    let dir_page = match page::global_alloc(
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        FrameFlags::BITS32,
        1,
    ) {
        Some(d) => d,
        None => {
            DIR_POOL.free(rec.cast());
            return Err(KernelError::NoMemory);
        }
    };

    let tv_pages = core::mem::size_of::<TableVirt>().div_ceil(FRAME_SIZE);
    let tv = match page::global_alloc(
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        FrameFlags::empty(),
        tv_pages,
    ) {
        Some(tv) => tv,
        None => {
            page::global_free(dir_page, 1);
            DIR_POOL.free(rec.cast());
            return Err(KernelError::NoMemory);
        }
    };

    let root = kernel_phys_of(dir_page.as_ptr() as VirtAddr)
        .unwrap_or_else(|| crate::crash!("Pool memory is not mapped in the kernel space!"));

    let pd = dir_page.cast::<PageDirLegacy>();
    let kernel_pd = DIR_GLOBAL
        .dir_virt
        .get()
        .unwrap_or_else(|| crate::crash!("Legacy kernel directory missing!"));
    // SAFETY: pd points at a freshly mapped page; kernel_pd is live; the
    // user half is zeroed, the kernel half mirrors the (now immutable)
    // kernel directory.
    unsafe {
        core::ptr::write_bytes(tv.as_ptr(), 0, tv_pages * FRAME_SIZE);
        for i in 0..KERNEL_TABLE_BASE {
            pd.as_ref().entries[i].set(0);
        }
        for i in KERNEL_TABLE_BASE..DIR_SIZE {
            pd.as_ref().entries[i].set(kernel_pd.as_ref().entries[i].get());
        }
        rec.as_ref().dir_virt.set(Some(pd));
        rec.as_ref().dir_phys.set(root);
        rec.as_ref().table_virt.set(Some(tv.cast()));
        rec.as_ref().kernel.set(false);
    }

    space.set_tables(Tables::Legacy(rec), root);
    Ok(())
}

pub(super) fn context_destroy(space: &AddressSpace) {
    let rec = match space.tables_ref() {
        Tables::Legacy(d) => d,
        _ => crate::crash!("Attempt to destroy a malformed page context!"),
    };
    // SAFETY: rec is live until the pool free below.
    let rec_ref = unsafe { rec.as_ref() };

    if rec_ref.kernel.get() {
        crate::crash!("Attempt to destroy kernel page context!");
    }

    let tv = table_virt(rec);
    for i in 0..KERNEL_TABLE_BASE {
        // SAFETY: tv holds DIR_SIZE cells, live until freed below.
        if let Some(pt) = unsafe { tv.as_ref()[i].get() } {
            page::global_free(pt.cast(), 1);
        }
    }

    let tv_pages = core::mem::size_of::<TableVirt>().div_ceil(FRAME_SIZE);
    page::global_free(tv.cast(), tv_pages);
    rec_ref.table_virt.set(None);

    if let Some(pd) = rec_ref.dir_virt.get() {
        page::global_free(pd.cast(), 1);
        rec_ref.dir_virt.set(None);
    }
    rec_ref.dir_phys.set(0);

    DIR_POOL.free(rec.cast());
    space.set_tables(Tables::None, 0);
}
