//! Kernel binary: the higher-half entry point and bring-up sequence.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use aasvogel_kernel::arch::x86::{self, cpuid, gdt, idt};
    use aasvogel_kernel::bootinfo::{BootParams, MultibootInfo};
    use aasvogel_kernel::mm::KERNEL_VIRTUAL_BASE;
    use aasvogel_kernel::{klog, ksym, mm, sched};

    use spin::Once;

    static BOOT_PARAMS: Once<BootParams> = Once::new();

    /// Entered from the trampoline stub with paging on and a boot stack.
    /// `mb_phys` is the physical address of the multiboot structure.
    #[no_mangle]
    pub extern "C" fn kernel_main(mb_phys: u32) -> ! {
        // SAFETY: the trampoline mapped low memory at the kernel base and
        // the bootloader guarantees a valid multiboot structure there.
        let mb: &'static MultibootInfo =
            unsafe { &*((mb_phys as usize + KERNEL_VIRTUAL_BASE) as *const MultibootInfo) };

        // CPU identity first: everything after may ask for feature bits.
        cpuid::init();
        gdt::init();
        idt::init();

        mm::early::init(mb);
        let params = BOOT_PARAMS.call_once(|| BootParams::from_multiboot(mb));
        klog::init(params);

        mm::init(params);
        ksym::init(params);

        sched::init();
        klog::start_background_thread();

        // SAFETY: descriptor tables, handlers and the timer are in place;
        // the kernel is ready to take interrupts.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }

        log::info!("Sage Aasvogel is up");

        // The boot thread has nothing else to do: it parks until an
        // interrupt hands the CPU to whoever has work.
        loop {
            x86::halt_until_interrupt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        aasvogel_kernel::crash::do_crash(
            format_args!("Rust panic: {}", info),
            "<panic>",
            0,
            "panic handler",
        )
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only means something on the bare-metal target;
    // hosted builds exist for the test suite, which lives in the library.
    eprintln!("aasvogel-kernel is a bare-metal binary; run the test suite instead");
}
