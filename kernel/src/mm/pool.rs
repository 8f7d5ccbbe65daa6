//! Object pools and the generic kernel allocator.
//!
//! A [`SmallPool`] is a slab-style cache for fixed-size objects. Each pool
//! owns *parts*: page-multiple chunks obtained from `global_alloc`, each
//! carrying a header and an intrusive free-slot list in its unused cells.
//! Parts migrate between the empty, partial and full lists as objects come
//! and go; [`SmallPool::compact`] gives fully free parts back.
//!
//! The generic allocator dispatches small requests to five power-of-two
//! pools (16..256 bytes) and larger ones to whole page ranges. A side
//! table with one entry per kernel virtual frame records the origin of
//! every live allocation, so freeing needs no size argument and frees of
//! memory that was never allocated are caught. The side-table frames come
//! from the emergency reserve: the table is consulted and extended from
//! inside allocation paths, and must never re-enter the generic allocator
//! itself.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::sync::spinlock::SpinLock;

use super::page::{self, PageFlags};
use super::phys::FrameFlags;
use super::{VirtAddr, FRAME_SIZE, KERNEL_VIRTUAL_BASE_NORM};

/// Stored in place of an object while its slot is free.
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Header at the start of every pool part.
struct PoolPart {
    pool: *const SmallPool,
    next_part: Option<NonNull<PoolPart>>,
    num_free: u32,
    first_free: Option<NonNull<FreeSlot>>,
}

/// A fixed-size object pool.
pub struct SmallPool {
    lock: SpinLock,
    name: Cell<&'static str>,
    obj_size: Cell<u32>,
    frames_per_part: Cell<u32>,
    part_first_offset: Cell<u32>,
    frame_flags: Cell<FrameFlags>,
    num_total: Cell<u32>,
    num_free: Cell<u32>,
    parts_empty: Cell<Option<NonNull<PoolPart>>>,
    parts_partial: Cell<Option<NonNull<PoolPart>>>,
    parts_full: Cell<Option<NonNull<PoolPart>>>,
    next: Cell<Option<NonNull<SmallPool>>>,
}

// SAFETY: every cell except `next` is only touched under `lock`; `next` is
// only touched under the registry lock below.
unsafe impl Sync for SmallPool {}
// SAFETY: as above.
unsafe impl Send for SmallPool {}

struct PoolRegistry {
    head: Cell<Option<NonNull<SmallPool>>>,
}

// SAFETY: the head cell is only touched under POOL_LIST_LOCK.
unsafe impl Sync for PoolRegistry {}

static POOL_LIST_LOCK: SpinLock = SpinLock::new(());
static POOL_LIST: PoolRegistry = PoolRegistry {
    head: Cell::new(None),
};

impl SmallPool {
    /// Creates an uninitialised pool; [`init`](SmallPool::init) must run
    /// before first use.
    pub const fn new() -> Self {
        SmallPool {
            lock: SpinLock::new(()),
            name: Cell::new(""),
            obj_size: Cell::new(0),
            frames_per_part: Cell::new(1),
            part_first_offset: Cell::new(0),
            frame_flags: Cell::new(FrameFlags::empty()),
            num_total: Cell::new(0),
            num_free: Cell::new(0),
            parts_empty: Cell::new(None),
            parts_partial: Cell::new(None),
            parts_full: Cell::new(None),
            next: Cell::new(None),
        }
    }

    /// Sets up the pool for objects of `obj_size` bytes aligned to
    /// `obj_align` and registers it with the global pool list.
    /// `frame_flags` are OR'd into every backing-frame allocation.
    pub fn init(
        &'static self,
        name: &'static str,
        obj_size: u32,
        obj_align: u32,
        frame_flags: FrameFlags,
    ) {
        // A free slot record overlays every free cell.
        let mut size = obj_size.max(core::mem::size_of::<FreeSlot>() as u32);
        // Objects must align their successors too.
        size += size.wrapping_neg() & (obj_align - 1);

        self.name.set(name);
        self.obj_size.set(size);
        self.frames_per_part.set(1);
        self.part_first_offset
            .set((core::mem::size_of::<PoolPart>() as u32).wrapping_neg() & (obj_align - 1));
        self.frame_flags.set(frame_flags);
        self.num_total.set(0);
        self.num_free.set(0);

        let _guard = POOL_LIST_LOCK.lock();
        self.next.set(POOL_LIST.head.get());
        POOL_LIST.head.set(Some(NonNull::from(self)));
    }

    pub fn name(&self) -> &'static str {
        self.name.get()
    }

    pub fn free_count(&self) -> u32 {
        self.num_free.get()
    }

    pub fn total_count(&self) -> u32 {
        self.num_total.get()
    }

    fn slots_per_part(&self) -> u32 {
        (self.frames_per_part.get() * FRAME_SIZE as u32
            - core::mem::size_of::<PoolPart>() as u32
            - self.part_first_offset.get())
            / self.obj_size.get()
    }

    fn part_bytes(&self) -> usize {
        self.frames_per_part.get() as usize * FRAME_SIZE
    }

    fn first_slot_addr(&self, part: NonNull<PoolPart>) -> VirtAddr {
        part.as_ptr() as VirtAddr
            + core::mem::size_of::<PoolPart>()
            + self.part_first_offset.get() as usize
    }

    /// Grows the pool by one part. Called with the pool lock held; failure
    /// just leaves the pool as it was.
    fn part_alloc(&self, flags: FrameFlags) {
        let mem = match page::global_alloc(
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            flags | self.frame_flags.get(),
            self.frames_per_part.get() as usize,
        ) {
            Some(m) => m,
            None => return,
        };
        let part = mem.cast::<PoolPart>();

        // Record the owning pool for every backing frame so generic_free
        // can route objects back here.
        for i in 0..self.frames_per_part.get() as usize {
            let addr = mem.as_ptr() as VirtAddr + i * FRAME_SIZE;
            match get_mapping(addr, true) {
                Some(entry) => {
                    // SAFETY: entry points into a live mapping table.
                    unsafe {
                        entry.as_ref().set(PoolMapping::Small(NonNull::from(self)));
                    }
                }
                None => {
                    for j in 0..i {
                        let addr = mem.as_ptr() as VirtAddr + j * FRAME_SIZE;
                        if let Some(entry) = get_mapping(addr, false) {
                            // SAFETY: entry points into a live mapping table.
                            unsafe {
                                entry.as_ref().set(PoolMapping::None);
                            }
                        }
                    }
                    page::global_free(mem, self.frames_per_part.get() as usize);
                    return;
                }
            }
        }

        let slots = self.slots_per_part();
        // SAFETY: part points at the head of a freshly mapped part.
        unsafe {
            part.as_ptr().write(PoolPart {
                pool: self,
                next_part: self.parts_empty.get(),
                num_free: slots,
                first_free: None,
            });
        }
        self.parts_empty.set(Some(part));
        self.num_total.set(self.num_total.get() + slots);
        self.num_free.set(self.num_free.get() + slots);

        // Chain the free slots through the part.
        let first = self.first_slot_addr(part);
        let obj_size = self.obj_size.get() as usize;
        for i in 0..slots as usize {
            let slot = (first + i * obj_size) as *mut FreeSlot;
            // SAFETY: each slot lies inside the part, obj_size-aligned.
            unsafe {
                (*slot).next = if i + 1 < slots as usize {
                    Some(NonNull::new_unchecked((first + (i + 1) * obj_size) as *mut FreeSlot))
                } else {
                    None
                };
            }
        }
        // SAFETY: first is the address of the part's first slot.
        unsafe {
            (*part.as_ptr()).first_free = Some(NonNull::new_unchecked(first as *mut FreeSlot));
        }
    }

    /// Releases one fully free part from the empty list back to the page
    /// allocator. `prev` is its predecessor on that list.
    fn part_free(&self, part: NonNull<PoolPart>, prev: Option<NonNull<PoolPart>>) {
        // SAFETY: part heads a live part owned by this pool.
        let part_ref = unsafe { part.as_ref() };

        if part_ref.num_free != self.slots_per_part() {
            crate::crash!("Attempt to free a pool part which is not empty!");
        }

        for i in 0..self.frames_per_part.get() as usize {
            let addr = part.as_ptr() as VirtAddr + i * FRAME_SIZE;
            let entry = get_mapping(addr, false)
                .unwrap_or_else(|| crate::crash!("Pool part missing from the allocation map!"));
            // SAFETY: entry points into a live mapping table.
            unsafe {
                match entry.as_ref().get() {
                    PoolMapping::Small(p) if p.as_ptr() as *const _ == self as *const _ => {}
                    _ => crate::crash!("Pool part missing from the allocation map!"),
                }
                entry.as_ref().set(PoolMapping::None);
            }
        }

        match prev {
            // SAFETY: prev precedes part on the empty list.
            Some(p) => unsafe { (*p.as_ptr()).next_part = part_ref.next_part },
            None => self.parts_empty.set(part_ref.next_part),
        }

        self.num_total.set(self.num_total.get() - part_ref.num_free);
        self.num_free.set(self.num_free.get() - part_ref.num_free);

        page::global_free(part.cast(), self.frames_per_part.get() as usize);
    }

    /// Takes one object out of the pool, growing it when necessary.
    pub fn alloc(&self, flags: FrameFlags) -> Option<NonNull<u8>> {
        let guard = self.lock.lock();

        let slot = if let Some(part) = self.parts_partial.get() {
            // SAFETY: part heads a live part; mutation under the pool lock.
            let slot = unsafe {
                let p = part.as_ptr();
                (*p).num_free -= 1;
                let s = (*p).first_free.unwrap_unchecked();
                (*p).first_free = s.as_ref().next;

                if (*p).num_free == 0 {
                    self.parts_partial.set((*p).next_part);
                    (*p).next_part = self.parts_full.get();
                    self.parts_full.set(Some(part));
                }
                s
            };
            self.num_free.set(self.num_free.get() - 1);
            Some(slot)
        } else {
            if self.parts_empty.get().is_none() {
                self.part_alloc(flags);
            }

            self.parts_empty.get().map(|part| {
                // SAFETY: as above.
                let slot = unsafe {
                    let p = part.as_ptr();
                    (*p).num_free -= 1;
                    let s = (*p).first_free.unwrap_unchecked();
                    (*p).first_free = s.as_ref().next;

                    self.parts_empty.set((*p).next_part);
                    (*p).next_part = self.parts_partial.get();
                    self.parts_partial.set(Some(part));
                    s
                };
                self.num_free.set(self.num_free.get() - 1);
                slot
            })
        };

        drop(guard);

        slot.map(|s| {
            debug_fill(s.as_ptr().cast(), self.obj_size.get() as usize);
            s.cast()
        })
    }

    /// Returns an object to the pool. Freeing an object the pool does not
    /// own, a misaligned pointer, or an already free slot is fatal.
    pub fn free(&self, obj: NonNull<u8>) {
        let obj_addr = obj.as_ptr() as VirtAddr;
        let _guard = self.lock.lock();

        let (part, prev, was_full) = match self.find_part(self.parts_partial.get(), obj_addr) {
            Some((part, prev)) => (part, prev, false),
            None => match self.find_part(self.parts_full.get(), obj_addr) {
                Some((part, prev)) => (part, prev, true),
                None => crate::crash!("Attempt to free an object from a pool it isn't in!"),
            },
        };

        let first = self.first_slot_addr(part);
        if (obj_addr - first) % self.obj_size.get() as usize != 0 {
            crate::crash!("Attempt to free misaligned object from a pool!");
        }

        // SAFETY: part heads a live part; walk under the pool lock.
        unsafe {
            let mut s = (*part.as_ptr()).first_free;
            while let Some(cur) = s {
                if cur.as_ptr() as VirtAddr == obj_addr {
                    crate::crash!("Attempt to free an already freed object from a pool!");
                }
                s = cur.as_ref().next;
            }
        }

        debug_fill(obj.as_ptr(), self.obj_size.get() as usize);

        // SAFETY: the slot belongs to part; mutation under the pool lock.
        unsafe {
            let slot = obj.cast::<FreeSlot>();
            let p = part.as_ptr();
            (*slot.as_ptr()).next = (*p).first_free;
            (*p).first_free = Some(slot);
            (*p).num_free += 1;
            self.num_free.set(self.num_free.get() + 1);

            if was_full {
                // First free slot: the part leaves the full list.
                match prev {
                    Some(pp) => (*pp.as_ptr()).next_part = (*p).next_part,
                    None => self.parts_full.set((*p).next_part),
                }
                (*p).next_part = self.parts_partial.get();
                self.parts_partial.set(Some(part));
            } else if (*p).num_free == self.slots_per_part() {
                // Entirely free again: the part moves to the empty list.
                match prev {
                    Some(pp) => (*pp.as_ptr()).next_part = (*p).next_part,
                    None => self.parts_partial.set((*p).next_part),
                }
                (*p).next_part = self.parts_empty.get();
                self.parts_empty.set(Some(part));
            }
        }
    }

    fn find_part(
        &self,
        head: Option<NonNull<PoolPart>>,
        obj_addr: VirtAddr,
    ) -> Option<(NonNull<PoolPart>, Option<NonNull<PoolPart>>)> {
        let mut prev = None;
        let mut cur = head;
        while let Some(part) = cur {
            let base = part.as_ptr() as VirtAddr;
            if obj_addr >= base && obj_addr < base + self.part_bytes() {
                return Some((part, prev));
            }
            prev = Some(part);
            // SAFETY: part heads a live part; walk under the pool lock.
            cur = unsafe { (*part.as_ptr()).next_part };
        }
        None
    }

    /// Returns every fully free part to the page allocator.
    pub fn compact(&self) {
        let _guard = self.lock.lock();
        while let Some(part) = self.parts_empty.get() {
            self.part_free(part, None);
        }
    }
}

impl Default for SmallPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "pool_debug")]
fn debug_fill(mem: *mut u8, len: usize) {
    const PATTERN: [u8; 4] = [0xef, 0xbe, 0xad, 0xde];
    for i in 0..len {
        // SAFETY: the caller owns `len` bytes at `mem`.
        unsafe {
            mem.add(i).write(PATTERN[i % 4]);
        }
    }
}

#[cfg(not(feature = "pool_debug"))]
fn debug_fill(_mem: *mut u8, _len: usize) {}

/// Compacts every registered pool.
pub fn compact_all() {
    let _guard = POOL_LIST_LOCK.lock();
    let mut cur = POOL_LIST.head.get();
    while let Some(pool) = cur {
        // SAFETY: registered pools are 'static.
        let pool = unsafe { pool.as_ref() };
        pool.compact();
        cur = pool.next.get();
    }
}

// ---------------------------------------------------------------------------
// Generic allocator
// ---------------------------------------------------------------------------

/// What a kernel virtual frame currently backs.
#[derive(Clone, Copy)]
enum PoolMapping {
    None,
    /// Part of a fixed-size pool.
    Small(NonNull<SmallPool>),
    /// Part of a direct page-range allocation starting at
    /// `first_frame_address` and spanning `num_frames` frames.
    Frames {
        num_frames: u32,
        first_frame_address: VirtAddr,
    },
}

struct MapTable {
    entries: [Cell<PoolMapping>; ENTRIES_PER_TABLE],
}

/// Frames covered by the side table: the whole 1 GiB kernel virtual range.
const KERNEL_FRAMES: usize = 0x40000;
const ENTRIES_PER_TABLE: usize = FRAME_SIZE / core::mem::size_of::<Cell<PoolMapping>>();
const NUM_TABLES: usize = KERNEL_FRAMES.div_ceil(ENTRIES_PER_TABLE);

struct MappingTables([Cell<Option<NonNull<MapTable>>>; NUM_TABLES]);

// SAFETY: each table-pointer slot is written at most once (interrupts are
// disabled by the pool/page locks held on every extension path, and there
// is one CPU); entry cells are only written by the allocation owning the
// frame.
unsafe impl Sync for MappingTables {}

static MAPPING_TABLES: MappingTables =
    MappingTables([const { Cell::new(None) }; NUM_TABLES]);

/// Finds (optionally creating) the side-table entry for the kernel frame
/// containing `address`.
fn get_mapping(address: VirtAddr, create: bool) -> Option<NonNull<Cell<PoolMapping>>> {
    let frame_index = ((page::norm(address) - KERNEL_VIRTUAL_BASE_NORM) as usize) / FRAME_SIZE;
    let table = frame_index / ENTRIES_PER_TABLE;
    let slot = frame_index % ENTRIES_PER_TABLE;
    assert!(table < NUM_TABLES, "allocation map index outside the kernel space");

    if MAPPING_TABLES.0[table].get().is_none() && create {
        // Emergency frames: this path runs inside allocation paths and
        // must not recurse into the generic allocator.
        let mem = page::global_alloc(
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            FrameFlags::EMERG,
            1,
        )?;
        let t = mem.cast::<MapTable>();
        // SAFETY: t points at one freshly mapped page.
        unsafe {
            for e in &t.as_ref().entries {
                e.set(PoolMapping::None);
            }
        }
        MAPPING_TABLES.0[table].set(Some(t));
    }

    MAPPING_TABLES.0[table].get().map(|t| {
        // SAFETY: t points at a live mapping table; slot is in bounds.
        unsafe { NonNull::from(&t.as_ref().entries[slot]) }
    })
}

static POOL_GEN_16: SmallPool = SmallPool::new();
static POOL_GEN_32: SmallPool = SmallPool::new();
static POOL_GEN_64: SmallPool = SmallPool::new();
static POOL_GEN_128: SmallPool = SmallPool::new();
static POOL_GEN_256: SmallPool = SmallPool::new();

/// Alignment every generic pool guarantees.
pub const GENERIC_ALIGN: usize = 8;

/// Registers the generic size-class pools.
pub fn init_generic() {
    POOL_GEN_16.init("generic_16", 16, GENERIC_ALIGN as u32, FrameFlags::empty());
    POOL_GEN_32.init("generic_32", 32, GENERIC_ALIGN as u32, FrameFlags::empty());
    POOL_GEN_64.init("generic_64", 64, GENERIC_ALIGN as u32, FrameFlags::empty());
    POOL_GEN_128.init("generic_128", 128, GENERIC_ALIGN as u32, FrameFlags::empty());
    POOL_GEN_256.init("generic_256", 256, GENERIC_ALIGN as u32, FrameFlags::empty());
}

/// Allocates `size` bytes from the smallest sufficient size-class pool, or
/// from whole pages for anything above 256 bytes.
pub fn generic_alloc(size: usize, flags: FrameFlags) -> Option<NonNull<u8>> {
    match size {
        0..=16 => POOL_GEN_16.alloc(flags),
        17..=32 => POOL_GEN_32.alloc(flags),
        33..=64 => POOL_GEN_64.alloc(flags),
        65..=128 => POOL_GEN_128.alloc(flags),
        129..=256 => POOL_GEN_256.alloc(flags),
        _ => {
            let num_pages = size.div_ceil(FRAME_SIZE);
            let mem = page::global_alloc(
                PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
                flags,
                num_pages,
            )?;
            let address = mem.as_ptr() as VirtAddr;

            for i in 0..num_pages {
                match get_mapping(address + i * FRAME_SIZE, true) {
                    Some(entry) => {
                        // SAFETY: entry points into a live mapping table.
                        unsafe {
                            entry.as_ref().set(PoolMapping::Frames {
                                num_frames: num_pages as u32,
                                first_frame_address: address,
                            });
                        }
                    }
                    None => {
                        for j in 0..i {
                            if let Some(entry) = get_mapping(address + j * FRAME_SIZE, false) {
                                // SAFETY: entry points into a live mapping table.
                                unsafe {
                                    entry.as_ref().set(PoolMapping::None);
                                }
                            }
                        }
                        page::global_free(mem, num_pages);
                        return None;
                    }
                }
            }

            debug_fill(mem.as_ptr(), num_pages * FRAME_SIZE);
            Some(mem)
        }
    }
}

/// Frees memory obtained from [`generic_alloc`], routing it back by the
/// side-table record. A pointer with no record is fatal.
pub fn generic_free(obj: NonNull<u8>) {
    let addr = obj.as_ptr() as VirtAddr;
    assert!(
        page::norm(addr) >= KERNEL_VIRTUAL_BASE_NORM,
        "generic free of a non-kernel address"
    );

    let entry = get_mapping(addr, false)
        .unwrap_or_else(|| crate::crash!("Attempt to free an object which isn't in memory allocated to a pool!"));
    // SAFETY: entry points into a live mapping table.
    let mapping = unsafe { entry.as_ref().get() };

    match mapping {
        PoolMapping::None => {
            crate::crash!("Attempt to free an object which isn't in memory allocated to a pool!")
        }
        PoolMapping::Small(pool) => {
            // SAFETY: pools recorded in the map are 'static.
            unsafe { pool.as_ref() }.free(obj);
        }
        PoolMapping::Frames {
            num_frames,
            first_frame_address,
        } => {
            for i in 0..num_frames as usize {
                let entry = get_mapping(first_frame_address + i * FRAME_SIZE, false)
                    .unwrap_or_else(|| crate::crash!("Corrupt allocation map!"));
                // SAFETY: entry points into a live mapping table.
                unsafe {
                    match entry.as_ref().get() {
                        PoolMapping::Frames {
                            num_frames: n,
                            first_frame_address: a,
                        } if n == num_frames && a == first_frame_address => {}
                        _ => crate::crash!("Corrupt allocation map!"),
                    }
                    entry.as_ref().set(PoolMapping::None);
                }
            }
            // SAFETY: first_frame_address came from global_alloc.
            let mem = unsafe { NonNull::new_unchecked(first_frame_address as *mut u8) };
            page::global_free(mem, num_frames as usize);
        }
    }
}

/// Compacts the generic size-class pools.
pub fn generic_compact() {
    POOL_GEN_16.compact();
    POOL_GEN_32.compact();
    POOL_GEN_64.compact();
    POOL_GEN_128.compact();
    POOL_GEN_256.compact();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{phys, testhost};
    use std::vec::Vec;

    fn test_pool(obj_size: u32, obj_align: u32) -> &'static SmallPool {
        let pool: &'static SmallPool = std::boxed::Box::leak(std::boxed::Box::new(SmallPool::new()));
        pool.init("test pool", obj_size, obj_align, FrameFlags::empty());
        pool
    }

    #[test]
    fn pool_round_trip_restores_free_count() {
        let _g = testhost::boot(&[]);
        let pool = test_pool(24, 8);

        let a = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        let free_after_first = pool.free_count();
        let b = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), free_after_first - 1);

        pool.free(b);
        assert_eq!(pool.free_count(), free_after_first);
        pool.free(a);
        assert_eq!(pool.free_count(), pool.total_count());
    }

    #[test]
    fn pool_grows_past_one_part_and_compacts_back() {
        let _g = testhost::boot(&[]);
        let pool = test_pool(64, 8);

        // Warm pass: the side-table frames covering this pool's parts are
        // never returned, so create them before measuring.
        let warm = pool.alloc(FrameFlags::empty()).expect("warm-up alloc");
        pool.free(warm);
        pool.compact();
        let frames_before = phys::free_frames();

        // More objects than one part can hold.
        let mut objs = Vec::new();
        for _ in 0..150 {
            objs.push(pool.alloc(FrameFlags::empty()).expect("pool should grow on demand"));
        }
        assert!(pool.total_count() > pool.free_count());

        for o in objs.drain(..) {
            pool.free(o);
        }
        assert_eq!(pool.free_count(), pool.total_count());

        pool.compact();
        assert_eq!(pool.total_count(), 0);
        assert_eq!(phys::free_frames(), frames_before);
    }

    #[test]
    fn objects_respect_alignment() {
        let _g = testhost::boot(&[]);
        let pool = test_pool(20, 16);
        let a = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        let b = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert_eq!(b.as_ptr() as usize % 16, 0);
        pool.free(b);
        pool.free(a);
    }

    #[test]
    #[should_panic(expected = "already freed object")]
    fn double_free_is_fatal() {
        let _g = testhost::boot(&[]);
        let pool = test_pool(32, 8);
        let a = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        // Keep a second object live so the part stays on a list.
        let _b = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        pool.free(a);
        pool.free(a);
    }

    #[test]
    #[should_panic(expected = "from a pool it isn't in")]
    fn freeing_foreign_memory_is_fatal() {
        let _g = testhost::boot(&[]);
        let pool = test_pool(32, 8);
        let mut local = 0u64;
        pool.free(NonNull::from(&mut local).cast());
    }

    #[test]
    #[should_panic(expected = "misaligned object")]
    fn freeing_a_misaligned_pointer_is_fatal() {
        let _g = testhost::boot(&[]);
        let pool = test_pool(32, 8);
        let a = pool.alloc(FrameFlags::empty()).expect("pool allocation should succeed");
        // SAFETY: one byte into an owned 32-byte object.
        let inside = unsafe { NonNull::new_unchecked(a.as_ptr().add(1)) };
        pool.free(inside);
    }

    #[test]
    fn generic_dispatch_and_side_table() {
        let _g = testhost::boot(&[]);
        let frames_before = phys::free_frames();

        let small = generic_alloc(48, FrameFlags::empty()).expect("small generic alloc");
        let large = generic_alloc(3 * FRAME_SIZE + 17, FrameFlags::empty()).expect("large generic alloc");

        // The large path hands out whole mapped pages.
        // SAFETY: large spans four writable pages.
        unsafe {
            core::ptr::write_bytes(large.as_ptr(), 0x5a, 3 * FRAME_SIZE + 17);
        }

        generic_free(small);
        generic_free(large);
        generic_compact();
        assert_eq!(phys::free_frames(), frames_before);
    }

    #[test]
    #[should_panic(expected = "isn't in memory allocated to a pool")]
    fn generic_free_of_unallocated_memory_is_fatal() {
        let _g = testhost::boot(&[]);
        // A page-aligned kernel address nothing ever allocated: the middle
        // of the virtual half of the arena is fine as long as no test
        // allocated it, but the reserved table window is never handed out.
        let addr = page::reserved_end() - FRAME_SIZE;
        // SAFETY: pointer is only used as a lookup key.
        let p = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        generic_free(p);
    }
}
