//! Free kernel virtual-region allocator.
//!
//! Lends out page-granular regions of the kernel virtual range above the
//! permanently reserved area. The underlying bytes are *not* backed; the
//! caller maps them (`page::global_alloc` is the usual consumer).
//!
//! Free regions sit on two singly linked lists threaded through the same
//! records: one sorted ascending by address (for coalescing on free) and
//! one sorted descending by size (for best-fit allocation). The records
//! themselves live in frames paged in on demand: when the record pool runs
//! dry during a free, the allocator takes an emergency frame, maps it at
//! the first page of the very region being freed and carves it into fresh
//! records.

use core::ptr::NonNull;

use crate::sync::spinlock::SpinLock;

use super::page::{self, PageFlags};
use super::phys::{self, FrameFlags};
use super::{PhysAddr, VirtAddr, FRAME_NULL, FRAME_OFFSET_MASK, FRAME_SIZE};

/// A free region of kernel virtual pages: `[address, address + size_pages
/// * FRAME_SIZE)`. When a record is on the record free list instead,
/// `next_addr` doubles as the free-list link.
struct FreeRegion {
    address: VirtAddr,
    size_pages: usize,
    next_addr: Option<NonNull<FreeRegion>>,
    next_size: Option<NonNull<FreeRegion>>,
}

const RECORDS_PER_FRAME: usize = FRAME_SIZE / core::mem::size_of::<FreeRegion>();

struct VirtState {
    free_records: Option<NonNull<FreeRegion>>,
    first_addr: Option<NonNull<FreeRegion>>,
    first_size: Option<NonNull<FreeRegion>>,
}

// SAFETY: the raw pointers refer to kernel-owned record frames, only
// touched under the lock below.
unsafe impl Send for VirtState {}

static STATE: SpinLock<VirtState> = SpinLock::new(VirtState {
    free_records: None,
    first_addr: None,
    first_size: None,
});

/// Publishes the initially free virtual range: everything from the end of
/// the permanently reserved region up to the top of the kernel virtual
/// space, plus (on the target) the higher-half alias of the boot setup
/// section, which is not needed once the permanent tables are live.
pub fn init(_param: &crate::bootinfo::BootParams) {
    let start = page::reserved_end();
    let pages = super::kernel_virtual_top().wrapping_sub(start) / FRAME_SIZE;

    let mut state = STATE.lock();
    free_region(&mut state, start, pages);

    #[cfg(target_os = "none")]
    {
        extern "C" {
            static _ld_setup_begin: u8;
            static _ld_setup_end: u8;
        }
        // SAFETY: linker-script symbols; only their addresses are used.
        let (begin, end) = unsafe {
            (
                &_ld_setup_begin as *const u8 as usize,
                &_ld_setup_end as *const u8 as usize,
            )
        };
        free_region(
            &mut state,
            begin + super::KERNEL_VIRTUAL_BASE,
            (end - begin) / FRAME_SIZE,
        );
    }
}

/// Reserves `num_pages` contiguous virtual pages (best fit). The pages are
/// not backed by frames.
pub fn alloc(num_pages: usize) -> Option<VirtAddr> {
    if num_pages == 0 {
        return None;
    }
    let mut state = STATE.lock();
    alloc_region(&mut state, num_pages)
}

/// Returns `num_pages` virtual pages starting at `addr` to the free set,
/// coalescing with any adjacent free region.
pub fn free(addr: VirtAddr, num_pages: usize) {
    assert_eq!(addr & FRAME_OFFSET_MASK, 0, "misaligned virtual region");
    let mut state = STATE.lock();
    free_region(&mut state, addr, num_pages);
}

fn region(r: NonNull<FreeRegion>) -> &'static mut FreeRegion {
    // SAFETY: all records live in never-freed record frames; exclusive
    // access is provided by the STATE lock held by every caller.
    unsafe { &mut *r.as_ptr() }
}

/// End address (exclusive) of a region.
fn region_end(r: &FreeRegion) -> VirtAddr {
    r.address + r.size_pages * FRAME_SIZE
}

/// Carves a fresh frame of records, mapped at `addr` (the first page of
/// the region currently being freed). Failure here is fatal: without
/// records the allocator cannot represent free memory at all.
fn create_record_frame(state: &mut VirtState, addr: VirtAddr) {
    let frame: PhysAddr = phys::alloc(FrameFlags::EMERG);
    if frame == FRAME_NULL {
        crate::crash!("Cannot allocate space for free virtual regions!");
    }
    if page::global_map(
        addr,
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        true,
        frame,
    )
    .is_err()
    {
        crate::crash!("Cannot allocate space for free virtual regions!");
    }

    #[cfg(target_os = "none")]
    let mem = addr as *mut FreeRegion;
    #[cfg(not(target_os = "none"))]
    let mem = super::testhost::frame_ptr(frame) as *mut FreeRegion;

    for i in 0..RECORDS_PER_FRAME {
        // SAFETY: mem points at one exclusively owned, mapped frame with
        // room for RECORDS_PER_FRAME records.
        unsafe {
            let rec = mem.add(i);
            (*rec).next_addr = if i + 1 < RECORDS_PER_FRAME {
                Some(NonNull::new_unchecked(mem.add(i + 1)))
            } else {
                state.free_records
            };
        }
    }
    // SAFETY: mem is non-null (checked through the mapping above).
    state.free_records = Some(unsafe { NonNull::new_unchecked(mem) });
}

fn take_record(state: &mut VirtState) -> NonNull<FreeRegion> {
    let rec = state.free_records.expect("record pool exhausted");
    state.free_records = region(rec).next_addr;
    rec
}

fn release_record(state: &mut VirtState, rec: NonNull<FreeRegion>) {
    region(rec).next_addr = state.free_records;
    state.free_records = Some(rec);
}

/// Unlinks `r` from the address-ordered list.
fn remove_addr(state: &mut VirtState, r: NonNull<FreeRegion>) {
    if state.first_addr == Some(r) {
        state.first_addr = region(r).next_addr;
        return;
    }
    let mut cur = state.first_addr;
    while let Some(p) = cur {
        if region(p).next_addr == Some(r) {
            region(p).next_addr = region(r).next_addr;
            return;
        }
        cur = region(p).next_addr;
    }
}

/// Unlinks `r` from the size-ordered list.
fn remove_size(state: &mut VirtState, r: NonNull<FreeRegion>) {
    if state.first_size == Some(r) {
        state.first_size = region(r).next_size;
        return;
    }
    let mut cur = state.first_size;
    while let Some(p) = cur {
        if region(p).next_size == Some(r) {
            region(p).next_size = region(r).next_size;
            return;
        }
        cur = region(p).next_size;
    }
}

/// Inserts `r` into the size-ordered (descending) list.
fn insert_size(state: &mut VirtState, r: NonNull<FreeRegion>) {
    let size = region(r).size_pages;
    match state.first_size {
        Some(head) if region(head).size_pages > size => {
            let mut prev = head;
            while let Some(next) = region(prev).next_size {
                if region(next).size_pages <= size {
                    break;
                }
                prev = next;
            }
            region(r).next_size = region(prev).next_size;
            region(prev).next_size = Some(r);
        }
        _ => {
            region(r).next_size = state.first_size;
            state.first_size = Some(r);
        }
    }
}

/// Best-fit allocation: the smallest free region of at least `num_pages`.
/// Exact fits release their record; larger regions are shortened from the
/// low end.
fn alloc_region(state: &mut VirtState, num_pages: usize) -> Option<VirtAddr> {
    // The size list is descending, so the best fit is the *last* region
    // that is still large enough.
    let mut best: Option<NonNull<FreeRegion>> = None;
    let mut cur = state.first_size;
    while let Some(r) = cur {
        if region(r).size_pages < num_pages {
            break;
        }
        best = Some(r);
        cur = region(r).next_size;
    }

    let r = best?;
    let addr = region(r).address;

    remove_size(state, r);
    if region(r).size_pages == num_pages {
        remove_addr(state, r);
        release_record(state, r);
    } else {
        region(r).address += num_pages * FRAME_SIZE;
        region(r).size_pages -= num_pages;
        insert_size(state, r);
    }

    Some(addr)
}

fn free_region(state: &mut VirtState, mut addr: VirtAddr, mut num_pages: usize) {
    if num_pages == 0 {
        return;
    }

    // Find the last free region starting at or below the freed range.
    let mut prev: Option<NonNull<FreeRegion>> = None;
    let mut cur = state.first_addr;
    while let Some(r) = cur {
        if region(r).address > addr {
            break;
        }
        prev = Some(r);
        cur = region(r).next_addr;
    }

    if let Some(p) = prev {
        if addr < region_end(region(p)) {
            crate::crash!("Region freed when it is already free!");
        }
    }

    let end = addr + num_pages * FRAME_SIZE;

    if let Some(p) = prev.filter(|p| region_end(region(*p)) == addr) {
        // Extends the previous region; possibly bridges into the next.
        region(p).size_pages += num_pages;
        if let Some(n) = region(p).next_addr.filter(|n| region(*n).address == end) {
            region(p).size_pages += region(n).size_pages;
            remove_size(state, n);
            region(p).next_addr = region(n).next_addr;
            release_record(state, n);
        }
        remove_size(state, p);
        insert_size(state, p);
        return;
    }

    let next = match prev {
        Some(p) => region(p).next_addr,
        None => state.first_addr,
    };
    if let Some(n) = next.filter(|n| region(*n).address == end) {
        // Extends the following region backwards.
        region(n).address = addr;
        region(n).size_pages += num_pages;
        remove_size(state, n);
        insert_size(state, n);
        return;
    }

    // A standalone region: needs a record, which may consume the first
    // page of the range being freed.
    if state.free_records.is_none() {
        create_record_frame(state, addr);
        addr += FRAME_SIZE;
        num_pages -= 1;
        if num_pages == 0 {
            return;
        }
    }

    let rec = take_record(state);
    region(rec).address = addr;
    region(rec).size_pages = num_pages;
    match prev {
        Some(p) => {
            region(rec).next_addr = region(p).next_addr;
            region(p).next_addr = Some(rec);
        }
        None => {
            region(rec).next_addr = state.first_addr;
            state.first_addr = Some(rec);
        }
    }
    insert_size(state, rec);
}

/// Walks both lists and checks the structural invariants: the address list
/// is sorted, disjoint and non-adjacent (adjacency would mean a missed
/// coalesce), and the size list is a descending permutation of it.
#[cfg(not(target_os = "none"))]
pub fn check_consistency() -> (usize, usize) {
    use std::vec::Vec;

    let state = STATE.lock();

    let mut by_addr: Vec<(VirtAddr, usize)> = Vec::new();
    let mut cur = state.first_addr;
    while let Some(r) = cur {
        by_addr.push((region(r).address, region(r).size_pages));
        cur = region(r).next_addr;
    }
    for w in by_addr.windows(2) {
        let (a, a_pages) = w[0];
        let (b, _) = w[1];
        assert!(a + a_pages * FRAME_SIZE < b, "free regions adjacent or overlapping");
    }

    let mut by_size: Vec<(VirtAddr, usize)> = Vec::new();
    let mut cur = state.first_size;
    while let Some(r) = cur {
        by_size.push((region(r).address, region(r).size_pages));
        cur = region(r).next_size;
    }
    for w in by_size.windows(2) {
        assert!(w[0].1 >= w[1].1, "size list out of order");
    }

    let mut a = by_addr.clone();
    let mut s = by_size.clone();
    a.sort_unstable();
    s.sort_unstable();
    assert_eq!(a, s, "size list is not a permutation of the address list");

    let total = by_addr.iter().map(|(_, p)| p).sum();
    (by_addr.len(), total)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testhost;

    #[test]
    fn alloc_free_round_trip_preserves_state() {
        let _g = testhost::boot(&[]);
        let (regions_before, pages_before) = check_consistency();

        let a = alloc(5).expect("five-page region should be available");
        let b = alloc(1).expect("one-page region should be available");
        let c = alloc(12).expect("twelve-page region should be available");
        check_consistency();

        // Free out of order to exercise every coalescing branch.
        free(b, 1);
        free(a, 5);
        free(c, 12);

        let (regions_after, pages_after) = check_consistency();
        assert_eq!(regions_before, regions_after);
        assert_eq!(pages_before, pages_after);
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let _g = testhost::boot(&[]);
        let a = alloc(4).expect("allocation should succeed");
        let b = alloc(4).expect("allocation should succeed");
        let lo = a.min(b);
        let hi = a.max(b);
        assert!(lo + 4 * FRAME_SIZE <= hi);
        free(a, 4);
        free(b, 4);
        check_consistency();
    }

    #[test]
    fn interleaved_free_coalesces() {
        let _g = testhost::boot(&[]);
        let (regions_before, pages_before) = check_consistency();

        // Carve three back-to-back regions out of one area by allocating
        // them in one piece and freeing the halves separately.
        let base = alloc(6).expect("six-page region should be available");
        free(base, 2);
        check_consistency();
        free(base + 4 * FRAME_SIZE, 2);
        check_consistency();
        free(base + 2 * FRAME_SIZE, 2);

        let (regions_after, pages_after) = check_consistency();
        assert_eq!(regions_before, regions_after);
        assert_eq!(pages_before, pages_after);
    }

    #[test]
    #[should_panic(expected = "Region freed when it is already free!")]
    fn double_free_is_fatal() {
        let _g = testhost::boot(&[]);
        let a = alloc(2).expect("allocation should succeed");
        free(a, 2);
        free(a, 2);
    }
}
