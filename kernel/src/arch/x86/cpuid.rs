//! CPU identification.
//!
//! A single probe at boot discovers the vendor, family/model and feature
//! bits; everything else queries the cached [`CpuInfo`]. Hosted builds use
//! a fixed synthetic CPU so the layers above behave deterministically under
//! test.

use spin::Once;

bitflags::bitflags! {
    /// CPUID leaf 1 EDX feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureEdx: u32 {
        const FPU   = 1 << 0;
        const VME   = 1 << 1;
        const DE    = 1 << 2;
        const PSE   = 1 << 3;
        const TSC   = 1 << 4;
        const MSR   = 1 << 5;
        const PAE   = 1 << 6;
        const MCE   = 1 << 7;
        const CX8   = 1 << 8;
        const APIC  = 1 << 9;
        const SEP   = 1 << 11;
        const MTRR  = 1 << 12;
        const PGE   = 1 << 13;
        const MCA   = 1 << 14;
        const CMOV  = 1 << 15;
        const PAT   = 1 << 16;
        const PSE36 = 1 << 17;
        const CLF   = 1 << 19;
        const ACPI  = 1 << 22;
        const MMX   = 1 << 23;
        const FXSR  = 1 << 24;
        const SSE   = 1 << 25;
        const SSE2  = 1 << 26;
        const HTT   = 1 << 28;
    }
}

bitflags::bitflags! {
    /// CPUID leaf 1 ECX feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureEcx: u32 {
        const SSE3    = 1 << 0;
        const MONITOR = 1 << 3;
        const VMX     = 1 << 5;
        const SSSE3   = 1 << 9;
        const CX16    = 1 << 13;
        const SSE41   = 1 << 19;
        const SSE42   = 1 << 20;
        const POPCNT  = 1 << 23;
        const XSAVE   = 1 << 26;
        const AVX     = 1 << 28;
        const RDRND   = 1 << 30;
        const HV      = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CPUID extended leaf 0x80000001 EDX feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureExtEdx: u32 {
        const SYSCALL   = 1 << 11;
        const NX        = 1 << 20;
        const RDTSCP    = 1 << 27;
        const LONG_MODE = 1 << 29;
    }
}

/// A known CPU vendor: the 12-byte CPUID signature and a display name.
struct Vendor {
    id: &'static [u8; 12],
    name: &'static str,
}

static KNOWN_VENDORS: &[Vendor] = &[
    Vendor { id: b"AMDisbetter!", name: "AMD" },
    Vendor { id: b"AuthenticAMD", name: "AMD" },
    Vendor { id: b"GenuineIntel", name: "Intel" },
    Vendor { id: b"VIA VIA VIA ", name: "VIA Technologies" },
    Vendor { id: b"CentaurHauls", name: "Centaur Technologies" },
    Vendor { id: b"TransmetaCPU", name: "Transmeta" },
    Vendor { id: b"GenuineTMx86", name: "Transmeta" },
    Vendor { id: b"CyrixInstead", name: "Cyrix" },
    Vendor { id: b"NexGenDriven", name: "NexGen" },
    Vendor { id: b"UMC UMC UMC ", name: "United Microelectronics Corporation" },
    Vendor { id: b"SiS SiS SiS ", name: "Silicon Integrated Systems" },
    Vendor { id: b"Geode by NSC", name: "National Semiconductor" },
    Vendor { id: b"RiseRiseRise", name: "Rise Technology" },
    Vendor { id: b"Vortex86 SoC", name: "Vortex86" },
    Vendor { id: b"KVMKVMKVMKVM", name: "Kernel-based Virtual Machine" },
    Vendor { id: b"Microsoft Hv", name: "Hyper-V Virtual Machine" },
    Vendor { id: b"VMwareVMware", name: "VMware Virtual Machine" },
];

/// Raw register values gathered by the probe; separated from [`CpuInfo`] so
/// the decoding rules can be tested against fabricated CPUs.
#[derive(Debug, Clone, Copy)]
pub struct RawCpuid {
    pub max_eax: u32,
    pub vendor: [u32; 3],
    pub version_eax: u32,
    pub features_edx: u32,
    pub features_ecx: u32,
    pub ext_edx: u32,
    pub ext_ecx: u32,
}

/// Decoded CPU identity and feature set.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub vendor_id: [u8; 12],
    pub vendor_name: &'static str,
    pub max_eax: u32,
    pub processor_type: u8,
    pub family_id: u16,
    pub model_id: u8,
    features_edx: FeatureEdx,
    features_ecx: FeatureEcx,
    ext_edx: FeatureExtEdx,
}

impl CpuInfo {
    pub fn supports_edx(&self, f: FeatureEdx) -> bool {
        self.features_edx.contains(f)
    }

    pub fn supports_ecx(&self, f: FeatureEcx) -> bool {
        self.features_ecx.contains(f)
    }

    pub fn supports_ext_edx(&self, f: FeatureExtEdx) -> bool {
        self.ext_edx.contains(f)
    }
}

/// Applies the standard family/model combination rules to a leaf-1 EAX
/// value: the extended family is added on family 0xF, and the extended
/// model extends families 0x6 and 0xF.
pub fn decode(raw: &RawCpuid) -> CpuInfo {
    let stepping_eax = raw.version_eax;
    let family = ((stepping_eax >> 8) & 0xF) as u16;
    let model = ((stepping_eax >> 4) & 0xF) as u8;
    let processor_type = ((stepping_eax >> 12) & 0x3) as u8;
    let ext_model = ((stepping_eax >> 16) & 0xF) as u8;
    let ext_family = ((stepping_eax >> 20) & 0xFF) as u16;

    let family_id = if family == 0xF { 0xF + ext_family } else { family };
    let model_id = if family == 0x6 || family == 0xF {
        model.wrapping_add(ext_model << 4)
    } else {
        model
    };

    let mut vendor_id = [0u8; 12];
    for (i, reg) in raw.vendor.iter().enumerate() {
        vendor_id[i * 4..i * 4 + 4].copy_from_slice(&reg.to_le_bytes());
    }

    let vendor_name = KNOWN_VENDORS
        .iter()
        .find(|v| *v.id == vendor_id)
        .map(|v| v.name)
        .unwrap_or("Unknown Vendor");

    CpuInfo {
        vendor_id,
        vendor_name,
        max_eax: raw.max_eax,
        processor_type,
        family_id,
        model_id,
        features_edx: FeatureEdx::from_bits_truncate(raw.features_edx),
        features_ecx: FeatureEcx::from_bits_truncate(raw.features_ecx),
        ext_edx: FeatureExtEdx::from_bits_truncate(raw.ext_edx),
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
    // SAFETY: CPUID is unprivileged and side-effect free. EBX is reserved
    // by LLVM on x86, so it is moved through ESI around the instruction.
    unsafe {
        core::arch::asm!(
            "mov esi, ebx",
            "cpuid",
            "xchg esi, ebx",
            inout("eax") leaf => eax,
            out("esi") ebx,
            inout("ecx") 0u32 => ecx,
            out("edx") edx,
            options(nomem, nostack, preserves_flags)
        );
    }
    (eax, ebx, ecx, edx)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn read_raw() -> RawCpuid {
    let (max_eax, b, c, d) = cpuid(0);
    let (version_eax, _, features_ecx, features_edx) = cpuid(1);

    let (max_ext, _, _, _) = cpuid(0x8000_0000);
    let (ext_edx, ext_ecx) = if max_ext >= 0x8000_0001 {
        let (_, _, ecx, edx) = cpuid(0x8000_0001);
        (edx, ecx)
    } else {
        (0, 0)
    };

    RawCpuid {
        max_eax,
        vendor: [b, d, c],
        version_eax,
        features_edx,
        features_ecx,
        ext_edx,
        ext_ecx,
    }
}

/// Hosted builds probe a fixed synthetic CPU: an Intel family-6 part with
/// every feature the paging layer cares about (MSR, PAE, PGE, NX).
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn read_raw() -> RawCpuid {
    RawCpuid {
        max_eax: 0xd,
        vendor: [
            u32::from_le_bytes(*b"Genu"),
            u32::from_le_bytes(*b"ineI"),
            u32::from_le_bytes(*b"ntel"),
        ],
        version_eax: (0x6 << 8) | (0xA << 4) | (0x2 << 16),
        features_edx: (FeatureEdx::FPU
            | FeatureEdx::TSC
            | FeatureEdx::MSR
            | FeatureEdx::PAE
            | FeatureEdx::PGE
            | FeatureEdx::SEP)
            .bits(),
        features_ecx: FeatureEcx::SSE3.bits(),
        ext_edx: FeatureExtEdx::NX.bits(),
        ext_ecx: 0,
    }
}

static CPU_INFO: Once<CpuInfo> = Once::new();

/// Probes the CPU. Idempotent; called once during kernel bring-up.
pub fn init() {
    let info = CPU_INFO.call_once(|| decode(&read_raw()));
    log::info!(
        "CPU: {} family {:#x} model {:#x}",
        info.vendor_name,
        info.family_id,
        info.model_id
    );
}

/// The cached probe result.
pub fn info() -> &'static CpuInfo {
    CPU_INFO.call_once(|| decode(&read_raw()))
}

pub fn supports_edx(f: FeatureEdx) -> bool {
    info().supports_edx(f)
}

pub fn supports_ecx(f: FeatureEcx) -> bool {
    info().supports_ecx(f)
}

pub fn supports_ext_edx(f: FeatureExtEdx) -> bool {
    info().supports_ext_edx(f)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn raw_with_version(version_eax: u32) -> RawCpuid {
        RawCpuid {
            max_eax: 1,
            vendor: [
                u32::from_le_bytes(*b"Auth"),
                u32::from_le_bytes(*b"enti"),
                u32::from_le_bytes(*b"cAMD"),
            ],
            version_eax,
            features_edx: 0,
            features_ecx: 0,
            ext_edx: 0,
            ext_ecx: 0,
        }
    }

    #[test]
    fn vendor_signature_matching() {
        let info = decode(&raw_with_version(0));
        assert_eq!(info.vendor_name, "AMD");
        assert_eq!(&info.vendor_id, b"AuthenticAMD");

        let mut unknown = raw_with_version(0);
        unknown.vendor = [1, 2, 3];
        assert_eq!(decode(&unknown).vendor_name, "Unknown Vendor");
    }

    #[test]
    fn plain_family_does_not_combine() {
        // Family 5, model 4: extended fields must be ignored.
        let info = decode(&raw_with_version((5 << 8) | (4 << 4) | (7 << 16) | (3 << 20)));
        assert_eq!(info.family_id, 5);
        assert_eq!(info.model_id, 4);
    }

    #[test]
    fn family_6_combines_model_only() {
        let info = decode(&raw_with_version((0x6 << 8) | (0xA << 4) | (0x2 << 16)));
        assert_eq!(info.family_id, 0x6);
        assert_eq!(info.model_id, 0x2A);
    }

    #[test]
    fn family_f_combines_both() {
        let info = decode(&raw_with_version((0xF << 8) | (0x1 << 4) | (0x3 << 16) | (0x2 << 20)));
        assert_eq!(info.family_id, 0xF + 0x2);
        assert_eq!(info.model_id, 0x31);
    }

    #[test]
    fn synthetic_cpu_has_paging_features() {
        assert!(supports_edx(FeatureEdx::PAE));
        assert!(supports_edx(FeatureEdx::PGE));
        assert!(supports_edx(FeatureEdx::MSR));
        assert!(supports_ext_edx(FeatureExtEdx::NX));
    }
}
