//! End-to-end memory-management scenarios over the simulated machine,
//! booted with the default (PAE) paging format.

use aasvogel_kernel::mm::page::{self, AddressSpace, PageFlags};
use aasvogel_kernel::mm::phys::{self, FrameFlags};
use aasvogel_kernel::mm::{pool, testhost, virt, FRAME_NULL, FRAME_SIZE};

/// One allocate/free cycle so that lazily created structures (kernel page
/// tables for fresh virtual ranges, pool parts, side tables) exist before
/// a round-trip measurement starts.
fn warm_allocators() {
    let mut pages = Vec::new();
    for _ in 0..1000 {
        pages.push(
            page::global_alloc(
                PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
                FrameFlags::empty(),
                1,
            )
            .expect("warm-up allocation should succeed"),
        );
    }
    for p in pages {
        page::global_free(p, 1);
    }

    let small = pool::generic_alloc(64, FrameFlags::empty()).expect("warm-up pool alloc");
    let big = pool::generic_alloc(5 * FRAME_SIZE, FrameFlags::empty()).expect("warm-up page alloc");
    pool::generic_free(small);
    pool::generic_free(big);
}

#[test]
fn thousand_page_alloc_free_round_trip() {
    let _g = testhost::boot(&[]);
    warm_allocators();
    let frames_before = phys::free_frames();

    let mut pages = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let p = page::global_alloc(
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            FrameFlags::empty(),
            1,
        )
        .expect("single-page allocation should succeed with a fresh arena");
        // Touch the page: it must be real, distinct memory.
        // SAFETY: p points at one freshly mapped page.
        unsafe {
            p.as_ptr().cast::<usize>().write(pages.len());
        }
        pages.push(p);
    }

    for (i, p) in pages.iter().enumerate() {
        // SAFETY: still mapped until freed below.
        assert_eq!(unsafe { p.as_ptr().cast::<usize>().read() }, i);
    }

    for p in pages {
        page::global_free(p, 1);
    }

    assert_eq!(phys::free_frames(), frames_before);
    virt::check_consistency();
}

#[test]
fn pae_keeps_nx_and_global_flags() {
    let _g = testhost::boot(&[]);
    assert!(page::pae_enabled());
    assert!(page::pge_enabled());

    let space = AddressSpace::new();
    space.create(false).expect("user space creation should succeed");

    let frame = phys::alloc(FrameFlags::empty());
    assert_ne!(frame, FRAME_NULL);

    space
        .map(
            0x0080_0000,
            frame,
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE | PageFlags::GLOBAL,
            false,
        )
        .expect("mapping should succeed");

    let (got, flags) = space.get(0x0080_0000).expect("mapping should be visible");
    assert_eq!(got, frame);
    // The synthetic host CPU has NX and PGE, so both survive the walk.
    assert!(flags.contains(PageFlags::NO_EXECUTE));
    assert!(flags.contains(PageFlags::GLOBAL));

    space.unmap(0x0080_0000, false);
    space.destroy();
    phys::free(frame);
}

#[test]
fn user_space_lifecycle_returns_every_frame() {
    let _g = testhost::boot(&[]);

    // Warm the PDPT pool and side tables with a throwaway space.
    let warm = AddressSpace::new();
    warm.create(false).expect("user space creation should succeed");
    warm.destroy();
    let frames_before = phys::free_frames();

    let space = AddressSpace::new();
    space.create(false).expect("user space creation should succeed");

    // Map pages spread across several page tables to force table
    // allocation.
    let frame = phys::alloc(FrameFlags::empty());
    assert_ne!(frame, FRAME_NULL);
    for i in 0..4 {
        space
            .map(
                0x0040_0000 + i * 0x0400_0000,
                frame,
                PageFlags::WRITABLE,
                false,
            )
            .expect("mapping should succeed");
    }

    space.destroy();
    phys::free(frame);

    assert_eq!(phys::free_frames(), frames_before);
    virt::check_consistency();
}

#[test]
fn generic_allocator_round_trips_through_both_paths() {
    let _g = testhost::boot(&[]);

    // First pass warms the size-class parts and side tables; compacting
    // afterwards leaves no cached empty parts to skew the measurement.
    for size in [1usize, 16, 17, 64, 200, 256, 5 * FRAME_SIZE] {
        let p = pool::generic_alloc(size, FrameFlags::empty()).expect("warm-up alloc");
        pool::generic_free(p);
    }
    pool::generic_compact();
    let frames_before = phys::free_frames();

    let mut smalls = Vec::new();
    for size in [1usize, 16, 17, 64, 200, 256] {
        smalls.push(
            pool::generic_alloc(size, FrameFlags::empty())
                .unwrap_or_else(|| panic!("generic alloc of {size} bytes should succeed")),
        );
    }
    let big = pool::generic_alloc(5 * FRAME_SIZE, FrameFlags::empty())
        .expect("five-page generic alloc should succeed");

    for p in smalls {
        pool::generic_free(p);
    }
    pool::generic_free(big);
    pool::generic_compact();

    assert_eq!(phys::free_frames(), frames_before);
}
