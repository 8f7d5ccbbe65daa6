//! The kernel heap: `alloc`-facing shim over the generic pool allocator.
//!
//! On the target this backs `#[global_allocator]`, so kernel code may use
//! `alloc` containers; allocation failure surfaces as a null pointer and,
//! through the alloc error handler, a crash. Hosted builds use the system
//! allocator instead (see `lib.rs`).

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use super::phys::FrameFlags;
use super::pool;

pub struct KernelHeap;

// SAFETY: alloc/dealloc delegate to the generic pool allocator, which
// hands out exclusive, live regions of at least the requested size.
// Size-class pools guarantee GENERIC_ALIGN; stricter alignments are routed
// to the page path, whose results are page-aligned.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut size = layout.size().max(1);
        if layout.align() > pool::GENERIC_ALIGN {
            // Force the whole-page path; anything up to page alignment is
            // then satisfied for free.
            assert!(layout.align() <= super::FRAME_SIZE);
            size = size.max(257);
        }
        match pool::generic_alloc(size, FrameFlags::empty()) {
            Some(p) => p.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            pool::generic_free(p);
        }
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[global_allocator]
static KERNEL_HEAP: KernelHeap = KernelHeap;
