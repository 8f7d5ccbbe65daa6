//! Boot information handling.
//!
//! The bootloader hands the kernel a multiboot information structure living
//! in low physical memory. Everything the kernel needs out of it (command
//! line, module list, memory map, ELF section table) is copied into
//! [`BootParams`] early during boot, while the identity mapping from the
//! trampoline is still in place; afterwards only `BootParams` is consulted.

use crate::mm::PhysAddr;

bitflags::bitflags! {
    /// Validity bits of [`MultibootInfo::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MultibootFlags: u32 {
        const MEMORY      = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE     = 1 << 2;
        const MODULES     = 1 << 3;
        const ELF_SHDR    = 1 << 5;
        const MEM_MAP     = 1 << 6;
    }
}

/// The multiboot information structure as the bootloader leaves it in
/// memory. All `*_addr` fields are physical addresses.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline_addr: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub elf_num: u32,
    pub elf_size: u32,
    pub elf_addr: u32,
    pub elf_shndx: u32,
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

/// A module list entry inside the multiboot structure.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MultibootModuleEntry {
    pub mod_start: u32,
    pub mod_end: u32,
    pub name: u32,
    pub reserved: u32,
}

/// A memory-map entry. The `size` prefix counts the bytes *following* it,
/// which is why the iterator below advances by `size + 4`.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct MultibootMmapEntry {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    pub entry_type: u32,
}

/// An ELF section header, as found in the table the bootloader passes when
/// [`MultibootFlags::ELF_SHDR`] is set. Only the fields the kernel symbol
/// module reads are interpreted.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ElfSectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

pub const ELF_SHT_SYMTAB: u32 = 2;
pub const ELF_SHT_STRTAB: u32 = 3;

/// A boot module (physical extent plus name).
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    pub start_address: PhysAddr,
    pub end_address: PhysAddr,
    pub name: &'static str,
}

/// A normalised memory-map region.
#[derive(Debug, Clone, Copy)]
pub struct MmapRegion {
    pub region_type: u32,
    pub start_address: PhysAddr,
    pub end_address: PhysAddr,
}

impl MmapRegion {
    /// Type 1 regions are usable RAM; everything else is reserved.
    pub fn is_usable(&self) -> bool {
        self.region_type == 1
    }
}

/// Boot information normalised into kernel structures.
pub struct BootParams {
    cmdline_parts: &'static [&'static str],
    pub modules: &'static [ModuleInfo],
    pub mmap_regions: &'static [MmapRegion],
    pub elf_sections: &'static [ElfSectionHeader],
    pub elf_shndx: usize,
}

impl BootParams {
    /// Builds boot parameters from pre-normalised parts. Boot uses
    /// [`BootParams::from_multiboot`]; tests fabricate these directly.
    pub const fn new(
        cmdline_parts: &'static [&'static str],
        modules: &'static [ModuleInfo],
        mmap_regions: &'static [MmapRegion],
        elf_sections: &'static [ElfSectionHeader],
        elf_shndx: usize,
    ) -> Self {
        BootParams {
            cmdline_parts,
            modules,
            mmap_regions,
            elf_sections,
            elf_shndx,
        }
    }

    /// Looks for a bare `name` token on the command line.
    pub fn cmdline_bool(&self, name: &str) -> bool {
        self.cmdline_parts.iter().any(|p| *p == name)
    }

    /// Looks for a `name=value` token and returns `value`.
    pub fn cmdline_str(&self, name: &str) -> Option<&'static str> {
        self.cmdline_parts.iter().find_map(|p| {
            let rest = p.strip_prefix(name)?;
            rest.strip_prefix('=')
        })
    }

    /// Parses a `name=N` token, clamping malformed or out-of-range values
    /// back to the default.
    pub fn cmdline_int(&self, name: &str, min: i32, max: i32, default: i32) -> i32 {
        match self.cmdline_str(name).map(str::parse::<i32>) {
            Some(Ok(v)) if v >= min && v <= max => v,
            _ => default,
        }
    }
}

/// Splits a raw command line into its space-separated parts, dropping the
/// first part (the kernel binary location supplied by the bootloader).
pub fn split_cmdline(
    cmdline: &'static str,
    mut emit: impl FnMut(&'static str),
) -> usize {
    let mut n = 0;
    for (i, part) in cmdline.split(' ').filter(|p| !p.is_empty()).enumerate() {
        if i == 0 {
            continue;
        }
        emit(part);
        n += 1;
    }
    n
}

#[cfg(target_os = "none")]
mod from_multiboot {
    use super::*;
    use crate::mm::{early, KERNEL_VIRTUAL_BASE};

    fn phys_ref<T>(addr: u32) -> &'static T {
        // SAFETY: the multiboot structures live in low physical memory,
        // which the boot trampoline mapped at KERNEL_VIRTUAL_BASE; boot
        // data is never written after the bootloader hands over control.
        unsafe { &*((addr as usize + KERNEL_VIRTUAL_BASE) as *const T) }
    }

    fn phys_str(addr: u32) -> &'static str {
        let mut len = 0usize;
        let base = (addr as usize + KERNEL_VIRTUAL_BASE) as *const u8;
        // SAFETY: as for phys_ref; the string is NUL-terminated by the
        // bootloader and scanned byte-by-byte within the mapped low region.
        unsafe {
            while *base.add(len) != 0 {
                len += 1;
            }
            core::str::from_utf8_unchecked(core::slice::from_raw_parts(base, len))
        }
    }

    impl BootParams {
        /// Normalises the bootloader-provided structure. Must run while the
        /// low-memory identity mapping is still intact and before the early
        /// allocator is finalized.
        pub fn from_multiboot(mb: &'static MultibootInfo) -> BootParams {
            let flags = MultibootFlags::from_bits_truncate(mb.flags);

            let cmdline_parts: &'static [&'static str] =
                if flags.contains(MultibootFlags::CMDLINE) {
                    let raw = phys_str(mb.cmdline_addr);
                    let count = split_cmdline(raw, |_| {});
                    let (addr, _) = early::alloc(
                        count * core::mem::size_of::<&str>(),
                        core::mem::align_of::<&str>(),
                    );
                    let slots = addr as *mut &'static str;
                    let mut i = 0;
                    split_cmdline(raw, |p| {
                        // SAFETY: slots has room for `count` entries and i
                        // counts the same split a second time.
                        unsafe {
                            slots.add(i).write(p);
                        }
                        i += 1;
                    });
                    // SAFETY: all `count` entries were just written.
                    unsafe { core::slice::from_raw_parts(slots, count) }
                } else {
                    &[]
                };

            let modules: &'static [ModuleInfo] = if flags.contains(MultibootFlags::MODULES) {
                let count = mb.mods_count as usize;
                let (addr, _) = early::alloc(
                    count * core::mem::size_of::<ModuleInfo>(),
                    core::mem::align_of::<ModuleInfo>(),
                );
                let slots = addr as *mut ModuleInfo;
                for i in 0..count {
                    let e: &MultibootModuleEntry = phys_ref(
                        mb.mods_addr + (i * core::mem::size_of::<MultibootModuleEntry>()) as u32,
                    );
                    // SAFETY: slots has room for `count` entries.
                    unsafe {
                        slots.add(i).write(ModuleInfo {
                            start_address: e.mod_start as PhysAddr,
                            end_address: e.mod_end as PhysAddr,
                            name: if e.name != 0 { phys_str(e.name) } else { "" },
                        });
                    }
                }
                // SAFETY: all `count` entries were just written.
                unsafe { core::slice::from_raw_parts(slots, count) }
            } else {
                &[]
            };

            let mmap_regions: &'static [MmapRegion] = if flags.contains(MultibootFlags::MEM_MAP) {
                let mut count = 0;
                let mut off = 0u32;
                while off < mb.mmap_length {
                    let e: &MultibootMmapEntry = phys_ref(mb.mmap_addr + off);
                    off += e.size + 4;
                    count += 1;
                }
                let out = early::alloc_slice::<MmapRegion>(count);
                let mut off = 0u32;
                for slot in out.iter_mut() {
                    let e: &MultibootMmapEntry = phys_ref(mb.mmap_addr + off);
                    let base = e.base_addr;
                    *slot = MmapRegion {
                        region_type: e.entry_type,
                        start_address: base,
                        end_address: base + e.length,
                    };
                    off += e.size + 4;
                }
                out
            } else {
                &[]
            };

            let elf_sections: &'static [ElfSectionHeader] =
                if flags.contains(MultibootFlags::ELF_SHDR) && mb.elf_num != 0 {
                    // SAFETY: the section header table is part of the boot
                    // data in mapped low memory; entries are elf_num
                    // contiguous headers.
                    unsafe {
                        core::slice::from_raw_parts(
                            (mb.elf_addr as usize + KERNEL_VIRTUAL_BASE)
                                as *const ElfSectionHeader,
                            mb.elf_num as usize,
                        )
                    }
                } else {
                    &[]
                };

            BootParams::new(
                cmdline_parts,
                modules,
                mmap_regions,
                elf_sections,
                mb.elf_shndx as usize,
            )
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn params(parts: &'static [&'static str]) -> BootParams {
        BootParams::new(parts, &[], &[], &[], 0)
    }

    #[test]
    fn cmdline_queries() {
        let p = params(&["no_pae", "klog_console_level=7", "klog_serial_port=bogus"]);
        assert!(p.cmdline_bool("no_pae"));
        assert!(!p.cmdline_bool("no_nx"));
        assert!(!p.cmdline_bool("klog_console_level"));
        assert_eq!(p.cmdline_str("klog_console_level"), Some("7"));
        assert_eq!(p.cmdline_int("klog_console_level", 0, 8, 6), 7);
        // Malformed and out-of-range values fall back to the default.
        assert_eq!(p.cmdline_int("klog_serial_port", 0, 3, 0), 0);
        assert_eq!(p.cmdline_int("missing", 0, 8, 5), 5);
    }

    #[test]
    fn split_drops_the_kernel_path() {
        let mut parts = Vec::new();
        let n = split_cmdline("/boot/kernel  preinit_serial no_pae ", |p| parts.push(p));
        assert_eq!(n, 2);
        assert_eq!(parts, ["preinit_serial", "no_pae"]);
    }

    #[test]
    fn mmap_region_usability() {
        let usable = MmapRegion {
            region_type: 1,
            start_address: 0x10_0000,
            end_address: 0x80_0000,
        };
        let reserved = MmapRegion {
            region_type: 2,
            ..usable
        };
        assert!(usable.is_usable());
        assert!(!reserved.is_usable());
    }
}
