//! Interrupt descriptor table and the dispatch spine.
//!
//! Vector layout: 0..32 processor exceptions, 0x20..0x30 the 16 remapped
//! PIC IRQs, 0x80..0xC0 the 64 "extended" software interrupts (DPL 3, so
//! user code can raise them, except the context-switch vector, which the
//! scheduler demotes to DPL 0).
//!
//! Every vector funnels through one assembly path that pushes the vector
//! number, an error-code placeholder where the CPU did not push one, and
//! a full register frame, then calls [`handle`] with a pointer to that
//! frame. Handlers mutate the frame in place; whatever is there on return
//! is what IRET resumes. That property is the whole context-switch
//! mechanism.

use super::context::InterruptFrame;
use super::pic;
use crate::sync::spinlock::SpinLock;

pub const NUM_ENTRIES: usize = 256;
pub const NUM_ISRS: usize = 32;
pub const IRQ_START: u8 = 0x20;
pub const NUM_IRQS: usize = 16;
pub const EXT_START: u8 = 0x80;
pub const NUM_EXT: usize = 64;

/// 32-bit interrupt gate, DPL 0.
pub const GATE_KERNEL: u8 = 0x8E;
/// 32-bit trap gate, DPL 3 (callable via INT from user mode).
pub const GATE_USER: u8 = 0xEF;

pub type InterruptHandler = fn(&mut InterruptFrame);

/// An IDT gate in its in-memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    offset_high: u16,
}

/// Encodes a gate for a handler at `offset` in segment `selector`.
pub const fn encode_gate(offset: u32, selector: u16, flags: u8) -> IdtEntry {
    IdtEntry {
        offset_low: (offset & 0xFFFF) as u16,
        selector,
        zero: 0,
        flags,
        offset_high: ((offset >> 16) & 0xFFFF) as u16,
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[repr(C, packed)]
struct IdtPointer {
    size: u16,
    base: u32,
}

/// The table the CPU walks. Mutations (gate installation, the scheduler
/// demoting its vector to DPL 0) go through the lock; the CPU reads the
/// memory asynchronously, which is fine because each 8-byte entry is
/// written before its vector can fire.
static IDT: SpinLock<[IdtEntry; NUM_ENTRIES]> =
    SpinLock::new([encode_gate(0, 0, 0); NUM_ENTRIES]);

struct HandlerTables {
    isr: [Option<InterruptHandler>; NUM_ISRS],
    irq: [Option<InterruptHandler>; NUM_IRQS],
    ext: [Option<InterruptHandler>; NUM_EXT],
    default_isr: InterruptHandler,
}

/// Registered handlers. The dispatcher copies the handler pointer out
/// under the lock and calls it after releasing, so handlers are free to
/// register other handlers.
static HANDLERS: SpinLock<HandlerTables> = SpinLock::new(HandlerTables {
    isr: [None; NUM_ISRS],
    irq: [None; NUM_IRQS],
    ext: [None; NUM_EXT],
    default_isr: default_isr_handler,
});

/// Any exception nobody claimed is a crash with a stack trace.
fn default_isr_handler(regs: &mut InterruptFrame) {
    crate::crash::do_crash_unhandled_isr(regs);
}

/// Page faults get their own crash path: the error code is decoded into a
/// sentence and the faulting address is named when the symbol table can.
fn page_fault_handler(regs: &mut InterruptFrame) {
    let fault_address = super::mmu::read_cr2();
    crate::crash::do_crash_page_fault(regs, fault_address);
}

/// Writes one IDT gate.
pub fn set_entry(n: usize, offset: u32, selector: u16, flags: u8) {
    assert!(n < NUM_ENTRIES);
    IDT.lock()[n] = encode_gate(offset, selector, flags);
}

pub fn register_isr_handler(n: usize, handler: InterruptHandler) {
    assert!(n < NUM_ISRS);
    HANDLERS.lock().isr[n] = Some(handler);
}

pub fn register_default_isr_handler(handler: InterruptHandler) {
    HANDLERS.lock().default_isr = handler;
}

pub fn register_irq_handler(n: usize, handler: InterruptHandler) {
    assert!(n < NUM_IRQS);
    HANDLERS.lock().irq[n] = Some(handler);
}

/// Unmasks (or masks) an IRQ line. Enabling an IRQ nobody handles is a
/// programming error.
pub fn set_irq_enabled(n: usize, enabled: bool) {
    assert!(n < NUM_IRQS);
    let registered = HANDLERS.lock().irq[n].is_some();
    assert!(registered || !enabled, "unmasking an IRQ with no handler");
    pic::set_masked(n as u8, !enabled);
}

/// Overrides the gate flags of an extended vector (the scheduler uses this
/// to pull the context-switch vector down to DPL 0).
pub fn set_ext_handler_flags(n: usize, flags: u8) {
    assert!(n < NUM_EXT);
    IDT.lock()[EXT_START as usize + n].flags = flags;
}

pub fn register_ext_handler(n: usize, handler: InterruptHandler) {
    assert!(n < NUM_EXT);
    HANDLERS.lock().ext[n] = Some(handler);
}

/// IRQ pre-handling: filters spurious IRQ 7 / IRQ 15 by consulting the
/// in-service register. A spurious IRQ 15 still needs an EOI to the
/// master, which saw a real cascade interrupt.
fn irq_begin(regs: &InterruptFrame) -> bool {
    let irq = (regs.int_no - IRQ_START as u32) as u8;

    if irq == 7 && pic::read_isr() & (1 << 7) == 0 {
        false
    } else if irq == 15 && pic::read_isr() & (1 << 15) == 0 {
        pic::eoi_master();
        false
    } else {
        true
    }
}

fn irq_end(regs: &InterruptFrame) {
    let irq = (regs.int_no - IRQ_START as u32) as u8;
    if irq > 7 {
        pic::eoi_slave();
    }
    pic::eoi_master();
}

/// The single dispatch point every vector lands on.
pub fn handle(regs: &mut InterruptFrame) {
    let vec = regs.int_no;

    if (vec as usize) < NUM_ISRS {
        let handler = {
            let handlers = HANDLERS.lock();
            handlers.isr[vec as usize].unwrap_or(handlers.default_isr)
        };
        handler(regs);
    } else if vec >= IRQ_START as u32 && vec < IRQ_START as u32 + NUM_IRQS as u32 {
        if !irq_begin(regs) {
            return;
        }
        let handler = HANDLERS.lock().irq[(vec - IRQ_START as u32) as usize];
        if let Some(handler) = handler {
            handler(regs);
        }
        irq_end(regs);
    } else if vec >= EXT_START as u32 && vec < EXT_START as u32 + NUM_EXT as u32 {
        let handler = HANDLERS.lock().ext[(vec - EXT_START as u32) as usize];
        if let Some(handler) = handler {
            handler(regs);
        }
    }
}

/// C-ABI entry called by the assembly stubs.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
extern "C" fn _idt_handle(regs: *mut InterruptFrame) {
    // SAFETY: the stub passes a pointer to the frame it just pushed.
    handle(unsafe { &mut *regs });
}

/// Whether the interrupted context was ring 0.
pub fn frame_is_ring0(regs: &InterruptFrame) -> bool {
    regs.cs & 0x3 == 0
}

// The assembly entry stubs: each pushes the vector (and an error-code
// placeholder where the CPU pushed none), then the full register frame,
// and calls _idt_handle. Exceptions 8, 10-14 and 17 carry CPU error
// codes.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
.altmacro

.macro INT_STUB n, has_err
.global _int_stub_\n
_int_stub_\n:
.if \has_err == 0
    push 0
.endif
    push \n
    jmp _int_common
.endm

.macro INT_STUB_N n
INT_STUB \n, 0
.endm

.macro STUB_ADDR n
.long _int_stub_\n
.endm

.section .text

# Frame layout relative to ESP after the segment pushes:
#   gs@0 fs@4 es@8 ds@12 | edi@16 esi@20 ebp@24 xsp@28 ebx@32 edx@36
#   ecx@40 eax@44 | esp@48 ss@52 | vec@56 err@60 | eip@64 cs@68 eflags@72
#   (ring-3 entries additionally keep the CPU's own esp/ss at @76/@80)
#
# On entry, the stub synthesizes the esp/ss pair the CPU omits for
# same-ring interrupts, so the frame is always a complete register image.
# The exit path restores *whatever frame exists at that pointer*, which is
# how the context switch works: the dispatcher rewrites the frame and the
# return lands in a different thread. Returning to ring 3 is the easy
# case (IRET pops ESP/SS itself); returning to ring 0 restores ESP by
# staging EAX plus the IRET triple just below the target stack pointer
# and switching ESP before the final pops. When no switch happened, that
# staging area degenerates onto this very frame.
_int_common:
    test dword ptr [esp + 12], 3
    jnz 2f
    push ss
    push esp
    add dword ptr [esp], 24
    jmp 4f
2:
    push dword ptr [esp + 24]
    push dword ptr [esp + 24]
4:
    pusha
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call _idt_handle
    add esp, 4

    mov eax, [esp + 68]
    and eax, 3
    jnz 3f

    # Ring-0 resume: stage [eax, eip, cs, eflags] on the target stack.
    mov eax, [esp + 48]
    sub eax, 16
    mov ebx, [esp + 64]
    mov [eax + 4], ebx
    mov ebx, [esp + 68]
    mov [eax + 8], ebx
    mov ebx, [esp + 72]
    mov [eax + 12], ebx
    mov ebx, [esp + 44]
    mov [eax], ebx

    pop gs
    pop fs
    pop es
    pop ds
    mov edi, [esp + 0]
    mov esi, [esp + 4]
    mov ebp, [esp + 8]
    mov ebx, [esp + 16]
    mov edx, [esp + 20]
    mov ecx, [esp + 24]
    mov esp, eax
    pop eax
    iretd

3:  # Ring-3 resume: drop the esp/ss copy and vec/err; the CPU restores
    # ESP/SS from its own tail.
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 16
    iretd

.irp n, 0,1,2,3,4,5,6,7,9,15,16,18,19,20,21,22,23,24,25,26,27,28,29,30,31
INT_STUB \n, 0
.endr
.irp n, 8,10,11,12,13,14,17
INT_STUB \n, 1
.endr

.set i, 32
.rept 16
INT_STUB_N %i
.set i, i+1
.endr

.set i, 128
.rept 64
INT_STUB_N %i
.set i, i+1
.endr

.section .rodata

.global _isr_stub_table
_isr_stub_table:
.set i, 0
.rept 32
STUB_ADDR %i
.set i, i+1
.endr

.global _irq_stub_table
_irq_stub_table:
.set i, 32
.rept 16
STUB_ADDR %i
.set i, i+1
.endr

.global _ext_stub_table
_ext_stub_table:
.set i, 128
.rept 64
STUB_ADDR %i
.set i, i+1
.endr
"#
);

/// Builds the IDT, loads it, and brings the PICs to the remapped, fully
/// masked state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    extern "C" {
        static _isr_stub_table: [u32; NUM_ISRS];
        static _irq_stub_table: [u32; NUM_IRQS];
        static _ext_stub_table: [u32; NUM_EXT];
    }

    // SAFETY: reading the stub address tables emitted by the asm block.
    unsafe {
        for (i, &stub) in _isr_stub_table.iter().enumerate() {
            set_entry(i, stub, super::gdt::KERNEL_CODE, GATE_KERNEL);
        }
        for (i, &stub) in _irq_stub_table.iter().enumerate() {
            set_entry(IRQ_START as usize + i, stub, super::gdt::KERNEL_CODE, GATE_KERNEL);
        }
        for (i, &stub) in _ext_stub_table.iter().enumerate() {
            set_entry(EXT_START as usize + i, stub, super::gdt::KERNEL_CODE, GATE_USER);
        }
    }

    register_isr_handler(14, page_fault_handler);

    let ptr = IdtPointer {
        size: (core::mem::size_of::<IdtEntry>() * NUM_ENTRIES - 1) as u16,
        base: IDT.lock().as_ptr() as u32,
    };
    // SAFETY: the pointer describes the fully built table above; the
    // array's address is stable inside its static.
    unsafe {
        core::arch::asm!("lidt [{0}]", in(reg) core::ptr::addr_of!(ptr), options(nostack));
    }

    // Everything masked until a driver asks for its line; the gates for
    // vectors 0x20-0x2F only make sense once the PICs deliver there.
    pic::mask_all();
    pic::remap(IRQ_START, IRQ_START + 8);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn frame(int_no: u32) -> InterruptFrame {
        InterruptFrame {
            int_no,
            cs: super::super::gdt::KERNEL_CODE as u32,
            ..InterruptFrame::default()
        }
    }

    #[test]
    fn gate_encoding_splits_the_offset() {
        let e = encode_gate(0xC012_3456, 0x08, GATE_KERNEL);
        // SAFETY: IdtEntry is 8 packed bytes.
        let b: [u8; 8] = unsafe { core::mem::transmute(e) };
        assert_eq!(b, [0x56, 0x34, 0x08, 0x00, 0x00, 0x8E, 0x12, 0xC0]);
    }

    #[test]
    fn extended_vectors_dispatch_by_index() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn handler(regs: &mut InterruptFrame) {
            CALLS.fetch_add(1, Ordering::Relaxed);
            regs.eax = 0x1234;
        }

        register_ext_handler(5, handler);
        let mut f = frame(EXT_START as u32 + 5);
        handle(&mut f);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(f.eax, 0x1234);

        // A neighbouring vector with no handler is silently ignored.
        let mut f = frame(EXT_START as u32 + 6);
        handle(&mut f);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn spurious_irq7_is_swallowed() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn handler(_regs: &mut InterruptFrame) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        // The hosted PIC stub reads the in-service register as 0, which is
        // exactly the spurious condition.
        register_irq_handler(7, handler);
        let mut f = frame(IRQ_START as u32 + 7);
        handle(&mut f);
        assert_eq!(CALLS.load(Ordering::Relaxed), 0);

        // IRQ 5 has no spurious check and dispatches normally.
        register_irq_handler(5, handler);
        let mut f = frame(IRQ_START as u32 + 5);
        handle(&mut f);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "Unexpected ISR")]
    fn unhandled_exceptions_are_fatal() {
        let mut f = frame(6);
        handle(&mut f);
    }

    #[test]
    fn ring_check_reads_the_frame_cs() {
        assert!(frame_is_ring0(&frame(0)));
        let mut f = frame(0);
        f.cs = super::super::gdt::USER_CODE as u32 | 3;
        assert!(!frame_is_ring0(&f));
    }
}
