//! The module containing the emulator-side view of guest CPU state, and the
//! bookkeeping of which parts of it currently live in the hardware.

use core::fmt;

use crate::hypervisor::{
    error::Error,
    lbr::LbrState,
    segment::{DescriptorTable, SegmentRegister},
};

/// A set of guest state categories.
///
/// Used both as the context's "externalized" mask (categories whose
/// authoritative copy is in the hardware) and as the per-vCPU changed set
/// (categories that must be written on the next entry).
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    derive_more::BitAnd,
    derive_more::BitOr,
    derive_more::Not,
    derive_more::BitAndAssign,
    derive_more::BitOrAssign,
)]
pub struct ContextFlags(u64);

macro_rules! context_flags {
    ($($(#[$doc:meta])* $name:ident = $bit:expr;)+) => {
        impl ContextFlags {
            $(
                $(#[$doc])*
                pub const $name: Self = Self(1 << $bit);
            )+
        }

        const NAMES: &[(ContextFlags, &str)] = &[$((ContextFlags::$name, stringify!($name)),)+];
    };
}

context_flags! {
    /// RAX.
    RAX = 0;
    /// RCX.
    RCX = 1;
    /// RDX.
    RDX = 2;
    /// RBX.
    RBX = 3;
    /// RSP.
    RSP = 4;
    /// RBP.
    RBP = 5;
    /// RSI.
    RSI = 6;
    /// RDI.
    RDI = 7;
    /// R8 to R15.
    R8_R15 = 8;
    /// RIP.
    RIP = 9;
    /// RFLAGS.
    RFLAGS = 10;
    /// ES.
    ES = 11;
    /// CS.
    CS = 12;
    /// SS.
    SS = 13;
    /// DS.
    DS = 14;
    /// FS.
    FS = 15;
    /// GS.
    GS = 16;
    /// LDTR.
    LDTR = 17;
    /// TR.
    TR = 18;
    /// GDTR.
    GDTR = 19;
    /// IDTR.
    IDTR = 20;
    /// CR0.
    CR0 = 21;
    /// CR2.
    CR2 = 22;
    /// CR3, and the PAE PDPTEs.
    CR3 = 23;
    /// CR4.
    CR4 = 24;
    /// The task-priority register of the local APIC.
    APIC_TPR = 25;
    /// DR0 to DR3.
    DR0_DR3 = 26;
    /// DR6.
    DR6 = 27;
    /// DR7.
    DR7 = 28;
    /// The x87 part of the XSAVE area.
    X87 = 29;
    /// The SSE and AVX parts of the XSAVE area.
    SSE_AVX = 30;
    /// Every other component of the XSAVE area.
    OTHER_XSAVE = 31;
    /// XCR0.
    XCRX = 32;
    /// `IA32_EFER`.
    EFER = 33;
    /// `IA32_KERNEL_GS_BASE`.
    KERNEL_GS_BASE = 34;
    /// `IA32_SYSENTER_CS`, `IA32_SYSENTER_EIP` and `IA32_SYSENTER_ESP`.
    SYSENTER_MSRS = 35;
    /// `IA32_STAR`, `IA32_LSTAR`, `IA32_CSTAR` and `IA32_FMASK`.
    SYSCALL_MSRS = 36;
    /// `IA32_TSC_AUX`.
    TSC_AUX = 37;
    /// The last branch record MSRs.
    OTHER_MSRS = 38;
    /// Blocking by STI and by MOV SS.
    INHIBIT_INT = 39;
    /// Blocking by NMI.
    INHIBIT_NMI = 40;
}

impl ContextFlags {
    /// No category.
    pub const NONE: Self = Self(0);

    /// Every general purpose register.
    pub const GPRS_MASK: Self = Self(0x1ff);

    /// Every segment register except LDTR and TR.
    pub const SREG_MASK: Self = Self(0x3f << 11);

    /// LDTR, TR, GDTR and IDTR.
    pub const TABLE_MASK: Self = Self(0xf << 17);

    /// Every control register.
    pub const CR_MASK: Self = Self(0xf << 21);

    /// Every debug register.
    pub const DR_MASK: Self = Self(0x7 << 26);

    /// The whole XSAVE area.
    pub const XSAVE_MASK: Self = Self(0x7 << 29);

    /// Every category the hardware can hold.
    pub const ALL: Self = Self((1 << 41) - 1);

    /// The state the instruction emulator needs to make progress on an
    /// instruction after an exit.
    pub const IEM_MASK: Self = Self(
        Self::GPRS_MASK.0
            | Self::RIP.0
            | Self::RFLAGS.0
            | Self::CS.0
            | Self::SS.0
            | Self::CR0.0
            | Self::CR3.0
            | Self::CR4.0
            | Self::APIC_TPR.0
            | Self::EFER.0,
    );

    /// The state needed on top of [`ContextFlags::IEM_MASK`] to deliver an
    /// interrupt.
    pub const XCPT_MASK: Self = Self(Self::INHIBIT_INT.0 | Self::INHIBIT_NMI.0);

    /// Returns the raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns whether every category of `other` is in `self`.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns whether any category of `other` is in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Returns whether no category is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Removes every category of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return f.write_str("ALL");
        }
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                let _ = set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// The size of the XSAVE area exchanged with the host.
pub const XSAVE_AREA_SIZE: usize = 0x1000;

/// The FPU, SSE, AVX and other XSAVE-managed state of a guest, as the host
/// reads and writes it in one block.
#[repr(C, align(64))]
pub struct XSaveArea(pub [u8; XSAVE_AREA_SIZE]);

impl Default for XSaveArea {
    fn default() -> Self {
        Self([0; XSAVE_AREA_SIZE])
    }
}

impl fmt::Debug for XSaveArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XSaveArea").finish_non_exhaustive()
    }
}

/// The XSAVE area of a context, heap allocated as it is too big to move
/// around.
#[derive(Debug, Default, derive_deref::Deref, derive_deref::DerefMut)]
pub struct XSaveBox {
    ptr: Box<XSaveArea>,
}

/// The guest CPU state as the emulator sees it.
///
/// Categories set in `externalized` are stale here: their current value is
/// in the hardware and has to be imported before use.
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct CpuContext {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// The PAE page-directory-pointer-table entries.
    pub pae_pdptes: [u64; 4],

    /// DR0 to DR7. DR4 and DR5 are unused.
    pub dr: [u64; 8],
    pub xcr0: u64,
    pub efer: u64,

    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_eip: u64,
    pub sysenter_esp: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sf_mask: u64,
    pub tsc_aux: u64,

    /// The guest interruptibility state, in the VMCS layout.
    pub interruptibility: u32,

    pub xsave: XSaveBox,
    pub lbr: LbrState,

    /// The categories held by the hardware.
    pub externalized: ContextFlags,
}

const X86_CR0_PG: u64 = 1 << 31;
const X86_CR4_PAE: u64 = 1 << 5;
const MSR_K6_EFER_LMA: u64 = 1 << 10;

impl CpuContext {
    /// Returns whether the guest uses PAE paging without long mode, the mode
    /// in which the processor caches the PDPTEs.
    pub fn is_pae_paging(&self) -> bool {
        (self.cr0 & X86_CR0_PG) != 0
            && (self.cr4 & X86_CR4_PAE) != 0
            && (self.efer & MSR_K6_EFER_LMA) == 0
    }

    /// Returns whether long mode is active.
    pub fn is_long_mode_active(&self) -> bool {
        (self.efer & MSR_K6_EFER_LMA) != 0
    }
}

/// The emulator's paging code, told about guest paging changes.
pub trait PageTableManager {
    /// CR0, CR4 or EFER changed in a way that may switch the paging mode.
    fn change_mode(&mut self, cr0: u64, cr4: u64, efer: u64) -> Result<(), Error>;

    /// CR3 or the PAE PDPTEs changed.
    fn update_cr3(&mut self, cr3: u64) -> Result<(), Error>;

    /// `EFER.NXE` was toggled.
    fn nxe_changed(&mut self, enabled: bool);

    /// Returns the PDPTEs to load in PAE mode.
    fn pae_pdptes(&self, ctx: &CpuContext) -> [u64; 4] {
        ctx.pae_pdptes
    }

    /// CR3 is about to be exported. Returning `false` asks for the guest to
    /// be rescheduled to the interpreter.
    fn cr3_changed_export(&mut self, _cr3: u64) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_cover_their_categories() {
        assert!(ContextFlags::GPRS_MASK.contains(ContextFlags::RAX | ContextFlags::R8_R15));
        assert!(!ContextFlags::GPRS_MASK.intersects(ContextFlags::RIP));
        assert!(ContextFlags::SREG_MASK.contains(ContextFlags::ES | ContextFlags::GS));
        assert!(!ContextFlags::SREG_MASK.intersects(ContextFlags::LDTR));
        assert!(ContextFlags::TABLE_MASK.contains(ContextFlags::LDTR | ContextFlags::IDTR));
        assert!(ContextFlags::CR_MASK.contains(ContextFlags::CR0 | ContextFlags::CR4));
        assert!(!ContextFlags::CR_MASK.intersects(ContextFlags::APIC_TPR));
        assert!(ContextFlags::ALL.contains(ContextFlags::INHIBIT_NMI));
        assert!(ContextFlags::ALL.contains(ContextFlags::IEM_MASK | ContextFlags::XCPT_MASK));
    }

    #[test]
    fn operators_work_bitwise() {
        let mut flags = ContextFlags::RAX | ContextFlags::CR3;
        flags &= !ContextFlags::RAX;
        assert_eq!(flags, ContextFlags::CR3);
        flags |= ContextFlags::DR7;
        flags.remove(ContextFlags::CR3);
        assert_eq!(flags, ContextFlags::DR7);
        assert!((flags & ContextFlags::CR3).is_empty());
    }

    #[test]
    fn debug_lists_names() {
        assert_eq!(
            format!("{:?}", ContextFlags::RIP | ContextFlags::EFER),
            "{RIP, EFER}"
        );
        assert_eq!(format!("{:?}", ContextFlags::ALL), "ALL");
    }

    #[test]
    fn pae_paging_excludes_long_mode() {
        let mut ctx = CpuContext {
            cr0: X86_CR0_PG,
            cr4: X86_CR4_PAE,
            ..CpuContext::default()
        };
        assert!(ctx.is_pae_paging());
        ctx.efer = MSR_K6_EFER_LMA;
        assert!(!ctx.is_pae_paging());
        assert!(ctx.is_long_mode_active());
    }
}
