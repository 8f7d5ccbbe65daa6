//! The kernel log.
//!
//! Eight severities (EMERG..DEBUG) feed two sinks, the VGA console and a
//! serial port, each with its own maximum level from the command line
//! (`klog_console_level=N`, `klog_serial_level=N`, `klog_serial_port=N`;
//! level 0 disables a sink). The `log` crate macros are the front end:
//! a [`log::Log`] implementation forwards records here, so ordinary
//! `log::info!`-style calls throughout the kernel land on the configured
//! sinks.
//!
//! Before the scheduler runs, records are written to the sinks
//! synchronously. Once [`start_background_thread`] has run, they are
//! buffered through the generic allocator and drained by a dedicated
//! thread parked on a semaphore, so logging from awkward contexts only
//! costs an allocation. [`flush`] drains synchronously and is what the
//! crash path calls.

// Level tables are only consulted on the real sinks
#![allow(dead_code)]

use core::cell::Cell;
use core::fmt::{self, Write};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::bootinfo::BootParams;
use crate::mm::phys::FrameFlags;
use crate::mm::pool;
use crate::sched::{self, Thread};
use crate::sync::semaphore::Semaphore;
use crate::sync::spinlock::SpinLock;

pub const LEVEL_DISABLE: u32 = 0;
pub const LEVEL_EMERG: u32 = 1;
pub const LEVEL_ALERT: u32 = 2;
pub const LEVEL_CRIT: u32 = 3;
pub const LEVEL_ERROR: u32 = 4;
pub const LEVEL_WARN: u32 = 5;
pub const LEVEL_NOTICE: u32 = 6;
pub const LEVEL_INFO: u32 = 7;
pub const LEVEL_DEBUG: u32 = 8;

static LEVEL_NAMES: [&str; 8] = [
    "EMERG", "ALERT", "CRIT", "ERROR", "WARN", "NOTICE", "INFO", "DEBUG",
];

/// ANSI colour for each level on colour-capable sinks.
static LEVEL_COLORS: [&str; 8] = ["91", "91", "91", "31", "93", "96", "36", "32"];
static DEFAULT_COLOR: &str = "37";

static CONSOLE_LEVEL: AtomicU32 = AtomicU32::new(LEVEL_INFO);
static SERIAL_LEVEL: AtomicU32 = AtomicU32::new(LEVEL_DISABLE);
static SERIAL_PORT: AtomicU32 = AtomicU32::new(0);

const MSG_MAX: usize = 120;

/// A buffered record awaiting the background thread.
struct KlogBuf {
    level: u32,
    next: Option<NonNull<KlogBuf>>,
    msg: heapless::String<MSG_MAX>,
}

struct BufList {
    head: Cell<Option<NonNull<KlogBuf>>>,
    tail: Cell<Option<NonNull<KlogBuf>>>,
}

// SAFETY: the list cells are only touched under BUF_LOCK.
unsafe impl Send for BufList {}

static BUF_LOCK: SpinLock<BufList> = SpinLock::new(BufList {
    head: Cell::new(None),
    tail: Cell::new(None),
});
static BUF_SEMAPHORE: Semaphore = Semaphore::new(0);
static FLUSH_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

/// Reads the sink configuration off the command line.
pub fn init(param: &BootParams) {
    CONSOLE_LEVEL.store(
        param.cmdline_int(
            "klog_console_level",
            LEVEL_DISABLE as i32,
            LEVEL_DEBUG as i32,
            LEVEL_INFO as i32,
        ) as u32,
        Ordering::Relaxed,
    );
    SERIAL_LEVEL.store(
        param.cmdline_int(
            "klog_serial_level",
            LEVEL_DISABLE as i32,
            LEVEL_DEBUG as i32,
            LEVEL_DISABLE as i32,
        ) as u32,
        Ordering::Relaxed,
    );
    SERIAL_PORT.store(
        param.cmdline_int("klog_serial_port", 0, 3, 0) as u32,
        Ordering::Relaxed,
    );

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let _ = log::set_logger(&KERNEL_LOG);
        log::set_max_level(log::LevelFilter::Debug);
        if SERIAL_LEVEL.load(Ordering::Relaxed) != LEVEL_DISABLE {
            crate::arch::x86::serial::port_init(SERIAL_PORT.load(Ordering::Relaxed) as usize);
        }
    }
}

fn write_to_sinks(level: u32, msg: &str) {
    let idx = (level.clamp(LEVEL_EMERG, LEVEL_DEBUG) - 1) as usize;

    if level <= CONSOLE_LEVEL.load(Ordering::Relaxed) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            crate::arch::x86::vga::console_write("[");
            crate::arch::x86::vga::console_write(LEVEL_NAMES[idx]);
            crate::arch::x86::vga::console_write("] ");
            crate::arch::x86::vga::console_write(msg);
            crate::arch::x86::vga::console_write("\n");
        }
    }

    if level <= SERIAL_LEVEL.load(Ordering::Relaxed) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            use crate::arch::x86::serial;
            let port = SERIAL_PORT.load(Ordering::Relaxed) as usize;
            serial::port_write(port, "\x1b[");
            serial::port_write(port, DEFAULT_COLOR);
            serial::port_write(port, "m[\x1b[");
            serial::port_write(port, LEVEL_COLORS[idx]);
            serial::port_write(port, "m");
            serial::port_write(port, LEVEL_NAMES[idx]);
            serial::port_write(port, "\x1b[");
            serial::port_write(port, DEFAULT_COLOR);
            serial::port_write(port, "m] ");
            serial::port_write(port, msg);
            serial::port_write(port, "\r\n");
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        let _ = (idx, msg);
    }
}

/// Emits one record at the given level.
pub fn klog(level: u32, args: fmt::Arguments<'_>) {
    let level = level.clamp(LEVEL_EMERG, LEVEL_DEBUG);
    if level > CONSOLE_LEVEL.load(Ordering::Relaxed)
        && level > SERIAL_LEVEL.load(Ordering::Relaxed)
    {
        return;
    }

    let mut msg: heapless::String<MSG_MAX> = heapless::String::new();
    // Overlong messages are truncated rather than dropped.
    let _ = msg.write_fmt(args);

    if FLUSH_THREAD.load(Ordering::Relaxed).is_null() {
        write_to_sinks(level, &msg);
        return;
    }

    // Buffered path: allocation failure degrades to a synchronous write.
    match pool::generic_alloc(core::mem::size_of::<KlogBuf>(), FrameFlags::empty()) {
        Some(raw) => {
            let buf = raw.cast::<KlogBuf>();
            // SAFETY: fresh generic allocation of the right size/alignment.
            unsafe {
                buf.as_ptr().write(KlogBuf {
                    level,
                    next: None,
                    msg,
                });
            }

            let list = BUF_LOCK.lock();
            match list.tail.get() {
                // SAFETY: list members are live buffered records.
                Some(tail) => unsafe { (*tail.as_ptr()).next = Some(buf) },
                None => list.head.set(Some(buf)),
            }
            list.tail.set(Some(buf));
            BUF_SEMAPHORE.signal();
            drop(list);
        }
        None => write_to_sinks(level, &msg),
    }
}

/// Synchronously drains every buffered record to the sinks.
pub fn flush() {
    if FLUSH_THREAD.load(Ordering::Relaxed).is_null() {
        return;
    }

    let list = BUF_LOCK.lock();
    while BUF_SEMAPHORE.try_wait() {}
    let mut cur = list.head.get();
    list.head.set(None);
    list.tail.set(None);
    drop(list);

    while let Some(buf) = cur {
        // SAFETY: drained records are live until freed below.
        let buf_ref = unsafe { buf.as_ref() };
        write_to_sinks(buf_ref.level, &buf_ref.msg);
        cur = buf_ref.next;
        pool::generic_free(buf.cast());
    }
}

extern "C" fn background_thread(_arg: usize) {
    loop {
        BUF_SEMAPHORE.wait();
        flush();
    }
}

/// Moves logging onto a dedicated kernel thread. Requires the scheduler.
pub fn start_background_thread() {
    let proc = sched::current_process()
        .unwrap_or_else(|| crate::crash!("klog background thread before the scheduler!"));
    let thread = match sched::thread_create(proc, background_thread, 0) {
        Ok(t) => t,
        Err(_) => crate::crash!("Failed to initialize klog background thread!"),
    };
    FLUSH_THREAD.store(thread.as_ptr(), Ordering::Relaxed);
    log::debug!("Kernel background logging thread started");
}

/// Bridges the `log` crate facade onto the klog sinks.
struct KernelLog;

#[allow(dead_code)]
static KERNEL_LOG: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        level_of(metadata.level())
            <= CONSOLE_LEVEL
                .load(Ordering::Relaxed)
                .max(SERIAL_LEVEL.load(Ordering::Relaxed))
    }

    fn log(&self, record: &log::Record<'_>) {
        klog(level_of(record.level()), *record.args());
    }

    fn flush(&self) {
        flush();
    }
}

fn level_of(level: log::Level) -> u32 {
    match level {
        log::Level::Error => LEVEL_ERROR,
        log::Level::Warn => LEVEL_WARN,
        log::Level::Info => LEVEL_INFO,
        log::Level::Debug | log::Level::Trace => LEVEL_DEBUG,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootinfo::BootParams;

    #[test]
    fn levels_come_from_the_command_line_with_clamping() {
        let params = BootParams::new(
            &["klog_console_level=3", "klog_serial_level=99", "klog_serial_port=2"],
            &[],
            &[],
            &[],
            0,
        );
        init(&params);
        assert_eq!(CONSOLE_LEVEL.load(Ordering::Relaxed), 3);
        // Out-of-range values fall back to the default (disabled).
        assert_eq!(SERIAL_LEVEL.load(Ordering::Relaxed), LEVEL_DISABLE);
        assert_eq!(SERIAL_PORT.load(Ordering::Relaxed), 2);

        // Restore defaults for other tests.
        init(&BootParams::new(&[], &[], &[], &[], 0));
    }

    #[test]
    fn log_facade_maps_onto_klog_levels() {
        assert_eq!(level_of(log::Level::Error), LEVEL_ERROR);
        assert_eq!(level_of(log::Level::Warn), LEVEL_WARN);
        assert_eq!(level_of(log::Level::Info), LEVEL_INFO);
        assert_eq!(level_of(log::Level::Debug), LEVEL_DEBUG);
        assert_eq!(level_of(log::Level::Trace), LEVEL_DEBUG);
    }
}
