//! The same machine booted with `no_pae`: the legacy 2-level page-table
//! format must be a complete, working peer of the PAE path.

use aasvogel_kernel::mm::page::{self, AddressSpace, PageFlags};
use aasvogel_kernel::mm::phys::{self, FrameFlags};
use aasvogel_kernel::mm::{testhost, virt, FRAME_NULL};

#[test]
fn legacy_format_masks_nx_and_walks_correctly() {
    let _g = testhost::boot(&["no_pae"]);
    assert!(!page::pae_enabled());

    let space = AddressSpace::new();
    space.create(false).expect("user space creation should succeed");

    let frame = phys::alloc(FrameFlags::empty());
    assert_ne!(frame, FRAME_NULL);

    space
        .map(
            0x0040_0000,
            frame,
            PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
            false,
        )
        .expect("mapping should succeed");

    let (got, flags) = space.get(0x0040_0000).expect("mapping should be visible");
    assert_eq!(got, frame);
    assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER));
    // A 32-bit entry has no NX bit; the flag must have been masked, not
    // smuggled into the address bits.
    assert!(!flags.contains(PageFlags::NO_EXECUTE));

    space.unmap(0x0040_0000, false);
    assert!(space.get(0x0040_0000).is_none());
    space.destroy();
    phys::free(frame);
}

#[test]
fn high_memory_is_unusable_without_pae() {
    let _g = testhost::boot(&["no_pae"]);

    // The boot memory map covers frames above the 4 GiB-equivalent
    // boundary, but with PAE off they must not be in any pool.
    let frame = phys::alloc(FrameFlags::empty());
    assert_ne!(frame, FRAME_NULL);
    assert!(frame < phys::high_limit());
    phys::free(frame);
}

#[test]
fn legacy_round_trips_preserve_allocator_state() {
    let _g = testhost::boot(&["no_pae"]);
    let frames_before = phys::free_frames();

    let mut pages = Vec::new();
    for _ in 0..50 {
        pages.push(
            page::global_alloc(
                PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
                FrameFlags::empty(),
                2,
            )
            .expect("two-page allocation should succeed"),
        );
    }
    for p in pages {
        page::global_free(p, 2);
    }

    assert_eq!(phys::free_frames(), frames_before);
    virt::check_consistency();
}
