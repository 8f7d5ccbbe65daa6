//! Global Descriptor Table.
//!
//! Flat 4 GiB segmentation: kernel code/data at DPL 0, user code/data at
//! DPL 3, plus one TSS used for ring transitions. Selectors are fixed and
//! known to the interrupt stubs and the scheduler. The table and the TSS
//! are built lazily on first access; [`init`] loads them into the CPU.

use lazy_static::lazy_static;

pub const KERNEL_CODE: u16 = 0x08;
pub const KERNEL_DATA: u16 = 0x10;
pub const USER_CODE: u16 = 0x18;
pub const USER_DATA: u16 = 0x20;

const NUM_ENTRIES: usize = 10;
/// The TSS occupies the last descriptor slot.
pub const TSS_SELECTOR: u16 = ((NUM_ENTRIES - 1) * 8) as u16;

const IOPB_SIZE: usize = 32;

/// A segment descriptor in its in-memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, packed)]
pub struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    /// Limit bits 16..20 in the low nibble, flags in the high nibble.
    granularity: u8,
    base_high: u8,
}

/// Encodes a descriptor from its base, limit, access byte and flag nibble.
pub const fn encode(base: u32, limit: u32, access: u8, flags: u8) -> GdtEntry {
    GdtEntry {
        limit_low: (limit & 0xFFFF) as u16,
        base_low: (base & 0xFFFF) as u16,
        base_mid: ((base >> 16) & 0xFF) as u8,
        access,
        granularity: (((limit >> 16) & 0xF) as u8) | ((flags & 0xF) << 4),
        base_high: ((base >> 24) & 0xFF) as u8,
    }
}

/// The 32-bit task state segment.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TssEntry {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub iopb_offset: u32,
    pub iopb: [u8; IOPB_SIZE],
}

impl TssEntry {
    const fn zeroed() -> Self {
        TssEntry {
            link: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            iopb_offset: 0,
            iopb: [0; IOPB_SIZE],
        }
    }
}

lazy_static! {
    /// The task state segment. Only the ring-0 stack fields matter: the
    /// scheduler points `esp0` at the current thread's kernel stack so
    /// ring transitions land somewhere sane.
    static ref TSS: TssEntry = {
        let mut tss = TssEntry::zeroed();
        tss.ss0 = KERNEL_DATA as u32;
        tss.iopb_offset = (core::mem::size_of::<TssEntry>() - IOPB_SIZE) as u32;
        tss
    };
}

lazy_static! {
    /// Layout:
    /// - 0x00: null descriptor
    /// - 0x08: kernel code segment (DPL 0)
    /// - 0x10: kernel data segment (DPL 0)
    /// - 0x18: user code segment (DPL 3)
    /// - 0x20: user data segment (DPL 3)
    /// - 0x48: TSS (last slot)
    static ref GDT: [GdtEntry; NUM_ENTRIES] = {
        let mut gdt = [encode(0, 0, 0, 0); NUM_ENTRIES];

        gdt[1] = encode(0, 0xFFFF_FFFF, 0x9A, 0xC);
        gdt[2] = encode(0, 0xFFFF_FFFF, 0x92, 0xC);
        gdt[3] = encode(0, 0xFFFF_FFFF, 0xFA, 0xC);
        gdt[4] = encode(0, 0xFFFF_FFFF, 0xF2, 0xC);

        let tss_base = &*TSS as *const TssEntry as usize as u32;
        gdt[NUM_ENTRIES - 1] = encode(
            tss_base,
            core::mem::size_of::<TssEntry>() as u32,
            0x89,
            0x4,
        );

        gdt
    };
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// Loads the descriptor table. Called once, before interrupts are
/// possible.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    let ptr = GdtPointer {
        limit: (core::mem::size_of::<GdtEntry>() * NUM_ENTRIES - 1) as u16,
        base: GDT.as_ptr() as u32,
    };

    // SAFETY: the pointer describes the fully built table; reloading the
    // segment registers with the selectors defined above is the required
    // follow-up to LGDT. CS is reloaded via a far return, the task
    // register with the TSS slot.
    unsafe {
        core::arch::asm!(
            "lgdt [{0}]",
            "mov ax, {kdata}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push {kcode}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            in(reg) core::ptr::addr_of!(ptr),
            kdata = const KERNEL_DATA,
            kcode = const KERNEL_CODE as u32,
            out("eax") _,
        );
        core::arch::asm!("ltr {0:x}", in(reg) TSS_SELECTOR as u32, options(nomem, nostack));
    }
}

/// Points the TSS's ring-0 stack at `stack_top`, so ring transitions land
/// on the current thread's kernel stack. Must be called with interrupts
/// disabled.
///
/// The TSS is a lazily built static; writing `esp0` through a raw pointer
/// is safe here because only the scheduler calls this, with interrupts
/// off, so no concurrent access exists.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn set_kernel_stack(stack_top: u32) {
    // SAFETY: see above; the pointer derives from a live 'static.
    unsafe {
        let tss_ptr = &*TSS as *const TssEntry as *mut TssEntry;
        (*tss_ptr).esp0 = stack_top;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn bytes(e: GdtEntry) -> [u8; 8] {
        // SAFETY: GdtEntry is 8 packed bytes.
        unsafe { core::mem::transmute(e) }
    }

    #[test]
    fn flat_kernel_code_descriptor_encoding() {
        // Base 0, limit 0xFFFFF pages, present|code|readable, 4K gran + 32-bit.
        let e = encode(0, 0xFFFF_FFFF, 0x9A, 0xC);
        assert_eq!(bytes(e), [0xFF, 0xFF, 0x00, 0x00, 0x9A, 0xCF, 0x00, 0x00]);
    }

    #[test]
    fn base_and_limit_split_across_the_descriptor() {
        let e = encode(0x1234_5678, 0x000A_BCDE, 0x89, 0x4);
        let b = bytes(e);
        assert_eq!(b[0], 0xDE); // limit 0..8
        assert_eq!(b[1], 0xBC); // limit 8..16
        assert_eq!(b[2], 0x78); // base 0..8
        assert_eq!(b[3], 0x56); // base 8..16
        assert_eq!(b[4], 0x34); // base 16..24
        assert_eq!(b[5], 0x89); // access
        assert_eq!(b[6], 0x4A); // flags nibble | limit 16..20
        assert_eq!(b[7], 0x12); // base 24..32
    }

    #[test]
    fn built_table_has_the_flat_segments_in_their_slots() {
        assert_eq!(GDT[0], encode(0, 0, 0, 0));
        assert_eq!(GDT[1], encode(0, 0xFFFF_FFFF, 0x9A, 0xC));
        assert_eq!(GDT[2], encode(0, 0xFFFF_FFFF, 0x92, 0xC));
        assert_eq!(GDT[3], encode(0, 0xFFFF_FFFF, 0xFA, 0xC));
        assert_eq!(GDT[4], encode(0, 0xFFFF_FFFF, 0xF2, 0xC));
    }

    #[test]
    fn tss_descriptor_points_at_the_tss() {
        let tss_base = &*TSS as *const TssEntry as usize as u32;
        let expected = encode(tss_base, core::mem::size_of::<TssEntry>() as u32, 0x89, 0x4);
        assert_eq!(GDT[NUM_ENTRIES - 1], expected);

        let tss = &*TSS;
        assert_eq!({ tss.ss0 }, KERNEL_DATA as u32);
        assert_eq!(
            { tss.iopb_offset } as usize,
            core::mem::size_of::<TssEntry>() - IOPB_SIZE
        );
    }

    #[test]
    fn selectors_are_descriptor_offsets() {
        assert_eq!(KERNEL_CODE, 8);
        assert_eq!(KERNEL_DATA, 16);
        assert_eq!(USER_CODE, 24);
        assert_eq!(USER_DATA, 32);
        assert_eq!(TSS_SELECTOR as usize, (NUM_ENTRIES - 1) * 8);
    }
}
