//! The kernel crash path.
//!
//! Every unrecoverable condition funnels into [`do_crash`] (usually via
//! the [`crash!`] macro, which captures the location): interrupts go off,
//! buffered log output is flushed, the console switches to the red crash
//! screen, the reason and a symbolised stack trace are printed to both the
//! console and the serial port, and the CPU halts.
//!
//! Hosted builds turn a crash into an ordinary panic carrying the same
//! message, which is what lets tests assert the fatal paths.

use core::fmt;

use crate::arch::x86::context::InterruptFrame;

/// Enters the crash path with a formatted reason.
#[macro_export]
macro_rules! crash {
    ($($arg:tt)*) => {
        $crate::crash::do_crash(format_args!($($arg)*), file!(), line!(), module_path!())
    };
}

/// Page-fault error code bits, as pushed by the CPU.
pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;
pub const PF_RESERVED: u32 = 1 << 3;
pub const PF_EXECUTE: u32 = 1 << 4;

/// Decodes a page-fault error code into the leading fragment of the crash
/// sentence (the faulting address is appended by the caller).
pub fn page_fault_description(err_code: u32) -> &'static str {
    if err_code & PF_RESERVED != 0 {
        "Reserved bits set in page at "
    } else if err_code & PF_PRESENT == 0 {
        if err_code & PF_EXECUTE != 0 {
            "Attempt to execute non-present memory at "
        } else if err_code & PF_WRITE != 0 {
            "Attempt to write non-present memory at "
        } else {
            "Attempt to read non-present memory at "
        }
    } else if err_code & PF_EXECUTE != 0 {
        "Attempt to execute non-executable memory at "
    } else if err_code & PF_WRITE != 0 {
        "Attempt to write to read-only memory at "
    } else {
        "Attempt to read protected memory at "
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod target {
    use super::*;
    use crate::arch::x86::{serial, vga};
    use crate::{ksym, unwind};

    const STACKTRACE_MAX_DEPTH: usize = 16;

    struct Sinks;

    impl fmt::Write for Sinks {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            vga::crash_write(s);
            serial::debug_write(s);
            Ok(())
        }
    }

    fn print_frame(eip: u32) {
        use fmt::Write;
        let mut out = Sinks;
        match ksym::lookup(eip, ksym::LookupFlags::RETURN_ADDRESS) {
            Some((name, offset)) => {
                let _ = writeln!(out, "  {}+0x{:x}", name, offset);
            }
            None => {
                let _ = writeln!(out, "  0x{:08x}", eip);
            }
        }
    }

    fn crash_banner(args: fmt::Arguments<'_>, file: &str, line: u32, module: &str) {
        use fmt::Write;

        // SAFETY: single crash path, interrupts already disabled.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
        crate::klog::flush();
        vga::crash_screen();

        let mut out = Sinks;
        let _ = writeln!(out, "Sage Aasvogel has crashed!");
        let _ = writeln!(out, "  {}", args);
        let _ = writeln!(out, "  Location: {} line {} ({})", file, line, module);
        let _ = writeln!(out, "\nStack Trace:");
    }

    pub fn do_crash(args: fmt::Arguments<'_>, file: &str, line: u32, module: &str) -> ! {
        crash_banner(args, file, line, module);
        unwind::unwind_here(1, STACKTRACE_MAX_DEPTH, print_frame);
        crate::arch::x86::hang();
    }

    pub fn do_crash_interrupt(
        args: fmt::Arguments<'_>,
        regs: &InterruptFrame,
    ) -> ! {
        crash_banner(args, "<interrupt>", 0, "interrupt context");
        unwind::unwind_from(regs.eip, regs.ebp, STACKTRACE_MAX_DEPTH, print_frame);
        crate::arch::x86::hang();
    }

    pub fn do_crash_page_fault(regs: &InterruptFrame, fault_address: u32) -> ! {
        use fmt::Write;

        // SAFETY: single crash path.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
        crate::klog::flush();
        vga::crash_screen();

        let mut out = Sinks;
        let _ = writeln!(out, "Sage Aasvogel has crashed!");
        let _ = write!(out, "  {}", page_fault_description(regs.err_code));
        match ksym::lookup(fault_address, ksym::LookupFlags::empty()) {
            Some((name, offset)) => {
                let _ = writeln!(out, "{}+0x{:x} [0x{:08x}]", name, offset, fault_address);
            }
            None => {
                let _ = writeln!(out, "0x{:08x}", fault_address);
            }
        }
        let _ = writeln!(out, "\nStack Trace:");
        unwind::unwind_from(regs.eip, regs.ebp, STACKTRACE_MAX_DEPTH, print_frame);
        crate::arch::x86::hang();
    }

    pub fn do_crash_unhandled_isr(regs: &InterruptFrame) -> ! {
        crash_banner(
            format_args!("Unexpected ISR: 0x{:x}", regs.int_no),
            "<interrupt>",
            0,
            "interrupt context",
        );
        unwind::unwind_from(regs.eip, regs.ebp, STACKTRACE_MAX_DEPTH, print_frame);
        crate::arch::x86::hang();
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use target::{do_crash, do_crash_interrupt, do_crash_page_fault, do_crash_unhandled_isr};

// Hosted builds: a crash is a panic with the same message text.

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn do_crash(args: fmt::Arguments<'_>, file: &str, line: u32, module: &str) -> ! {
    panic!("{} [{} line {} ({})]", args, file, line, module);
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn do_crash_interrupt(args: fmt::Arguments<'_>, _regs: &InterruptFrame) -> ! {
    panic!("{} [interrupt context]", args);
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn do_crash_page_fault(regs: &InterruptFrame, fault_address: u32) -> ! {
    panic!(
        "{}0x{:08x}",
        page_fault_description(regs.err_code),
        fault_address
    );
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn do_crash_unhandled_isr(regs: &InterruptFrame) -> ! {
    panic!("Unexpected ISR: 0x{:x}", regs.int_no);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn page_fault_sentences_match_the_error_bits() {
        assert_eq!(
            page_fault_description(PF_PRESENT | PF_WRITE),
            "Attempt to write to read-only memory at "
        );
        assert_eq!(
            page_fault_description(PF_PRESENT | PF_EXECUTE),
            "Attempt to execute non-executable memory at "
        );
        assert_eq!(
            page_fault_description(PF_PRESENT),
            "Attempt to read protected memory at "
        );
        assert_eq!(
            page_fault_description(0),
            "Attempt to read non-present memory at "
        );
        assert_eq!(
            page_fault_description(PF_WRITE),
            "Attempt to write non-present memory at "
        );
        assert_eq!(
            page_fault_description(PF_EXECUTE),
            "Attempt to execute non-present memory at "
        );
        // Reserved-bit faults win over everything else.
        assert_eq!(
            page_fault_description(PF_RESERVED | PF_PRESENT | PF_WRITE),
            "Reserved bits set in page at "
        );
    }

    #[test]
    #[should_panic(expected = "something has gone badly wrong")]
    fn crash_macro_reaches_the_panic_path() {
        crate::crash!("something has gone badly wrong: {}", 42);
    }
}
