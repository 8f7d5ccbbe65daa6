//! Kernel symbol table, for naming addresses in stack traces.
//!
//! When the bootloader passes the kernel's ELF section headers, the symbol
//! and string tables are copied out at boot; [`lookup`] then resolves an
//! address to `name+0x<offset>`. Return addresses are biased back one byte
//! so a call at the very end of a function resolves to the caller, not to
//! whatever happens to follow it.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::bootinfo::BootParams;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// The address is a return address: resolve the call site.
        const RETURN_ADDRESS = 1 << 0;
    }
}

/// One kernel symbol.
#[derive(Debug, Clone, Copy)]
pub struct KernelSymbol {
    pub name: &'static str,
    pub address: u32,
    pub size: u32,
}

/// An ELF32 symbol-table entry.
#[cfg(target_os = "none")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Elf32Sym {
    st_name: u32,
    st_value: u32,
    st_size: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
}

#[cfg(target_os = "none")]
const STT_FUNC: u8 = 2;

/// The loaded table, sorted by address. Filled once at boot.
static SYMBOLS: AtomicUsize = AtomicUsize::new(0);
static SYMBOL_COUNT: AtomicUsize = AtomicUsize::new(0);

fn symbols() -> &'static [KernelSymbol] {
    let ptr = SYMBOLS.load(Ordering::Relaxed) as *const KernelSymbol;
    if ptr.is_null() {
        return &[];
    }
    // SAFETY: the table is built once at boot and never freed.
    unsafe { core::slice::from_raw_parts(ptr, SYMBOL_COUNT.load(Ordering::Relaxed)) }
}

/// Searches a sorted symbol slice. Split out so the search rules can be
/// tested without a boot-provided table.
fn lookup_in(
    table: &[KernelSymbol],
    address: u32,
    flags: LookupFlags,
) -> Option<(&'static str, u32)> {
    let probe = if flags.contains(LookupFlags::RETURN_ADDRESS) {
        address.wrapping_sub(1)
    } else {
        address
    };

    let idx = table.partition_point(|s| s.address <= probe).checked_sub(1)?;
    let sym = &table[idx];
    let offset = address.wrapping_sub(sym.address);

    // Zero-sized symbols (common for assembly labels) match anything up to
    // the next symbol; sized symbols must contain the address.
    if sym.size != 0 && u64::from(probe.wrapping_sub(sym.address)) >= u64::from(sym.size) {
        return None;
    }
    Some((sym.name, offset))
}

/// Resolves an address to a symbol name and offset.
pub fn lookup(address: u32, flags: LookupFlags) -> Option<(&'static str, u32)> {
    lookup_in(symbols(), address, flags)
}

/// Ingests the boot-provided ELF section headers. Requires the memory
/// manager (the copied tables live on the kernel heap).
#[cfg(target_os = "none")]
pub fn init(param: &BootParams) {
    extern crate alloc;
    use alloc::vec::Vec;

    use crate::bootinfo::{ELF_SHT_STRTAB, ELF_SHT_SYMTAB};
    use crate::mm::KERNEL_VIRTUAL_BASE_NORM;

    let symtab = match param
        .elf_sections
        .iter()
        .find(|s| s.sh_type == ELF_SHT_SYMTAB)
    {
        Some(s) => s,
        None => {
            log::warn!("No kernel symbol table; stack traces will be bare addresses");
            return;
        }
    };
    let strtab = match param.elf_sections.get(symtab.sh_link as usize) {
        Some(s) if s.sh_type == ELF_SHT_STRTAB => s,
        _ => {
            log::warn!("Kernel symbol table has no string table");
            return;
        }
    };

    let section_va = |addr: u32| -> usize {
        // Section addresses may be physical (from the bootloader) or
        // already higher-half.
        if (addr as usize) >= crate::mm::KERNEL_VIRTUAL_BASE {
            addr as usize
        } else {
            addr as usize + crate::mm::KERNEL_VIRTUAL_BASE
        }
    };

    // SAFETY: the symbol and string tables are part of the loaded kernel
    // image, mapped and immutable.
    let (syms, strs) = unsafe {
        (
            core::slice::from_raw_parts(
                section_va(symtab.sh_addr) as *const Elf32Sym,
                symtab.sh_size as usize / core::mem::size_of::<Elf32Sym>(),
            ),
            core::slice::from_raw_parts(
                section_va(strtab.sh_addr) as *const u8,
                strtab.sh_size as usize,
            ),
        )
    };

    let mut table: Vec<KernelSymbol> = Vec::new();
    for sym in syms {
        if sym.st_info & 0xf != STT_FUNC || sym.st_value < KERNEL_VIRTUAL_BASE_NORM {
            continue;
        }
        let name_off = sym.st_name as usize;
        if name_off == 0 || name_off >= strs.len() {
            continue;
        }
        let end = name_off
            + strs[name_off..]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(0);
        let name = match core::str::from_utf8(&strs[name_off..end]) {
            Ok(n) if !n.is_empty() => n,
            _ => continue,
        };

        table.push(KernelSymbol {
            name,
            address: sym.st_value,
            size: sym.st_size,
        });
    }

    table.sort_unstable_by_key(|s| s.address);
    let count = table.len();
    let slice = table.leak();

    SYMBOLS.store(slice.as_ptr() as usize, Ordering::Relaxed);
    SYMBOL_COUNT.store(count, Ordering::Relaxed);
    log::info!("Loaded {} kernel symbols", count);
}

/// Hosted builds carry no symbol table.
#[cfg(not(target_os = "none"))]
pub fn init(_param: &BootParams) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn table() -> [KernelSymbol; 3] {
        [
            KernelSymbol {
                name: "kmem_frame_alloc",
                address: 0xC010_0000,
                size: 0x80,
            },
            KernelSymbol {
                name: "sched_switch_any",
                address: 0xC010_0100,
                size: 0x200,
            },
            KernelSymbol {
                name: "asm_label",
                address: 0xC010_0400,
                size: 0,
            },
        ]
    }

    #[test]
    fn addresses_resolve_to_name_plus_offset() {
        let t = table();
        assert_eq!(
            lookup_in(&t, 0xC010_0010, LookupFlags::empty()),
            Some(("kmem_frame_alloc", 0x10))
        );
        assert_eq!(
            lookup_in(&t, 0xC010_0100, LookupFlags::empty()),
            Some(("sched_switch_any", 0))
        );
    }

    #[test]
    fn sized_symbols_reject_addresses_past_their_end() {
        let t = table();
        // 0xC0100080..0xC0100100 is a gap.
        assert_eq!(lookup_in(&t, 0xC010_00A0, LookupFlags::empty()), None);
    }

    #[test]
    fn return_addresses_bias_into_the_call_site() {
        let t = table();
        // A return address exactly at a function boundary belongs to the
        // *previous* function's trailing call.
        assert_eq!(
            lookup_in(&t, 0xC010_0300, LookupFlags::RETURN_ADDRESS),
            Some(("sched_switch_any", 0x200))
        );
    }

    #[test]
    fn unsized_labels_cover_the_following_gap() {
        let t = table();
        assert_eq!(
            lookup_in(&t, 0xC010_0500, LookupFlags::empty()),
            Some(("asm_label", 0x100))
        );
    }

    #[test]
    fn addresses_below_every_symbol_are_unnamed() {
        let t = table();
        assert_eq!(lookup_in(&t, 0xC000_0000, LookupFlags::empty()), None);
    }
}
