//! The module containing width-checked access to the VMCS of a vCPU through
//! the host, and the labelled VMCS dump.

use bit_field::BitField;
use x86::vmx::vmcs;

use crate::hypervisor::{
    error::Error,
    host_api::{HostApi, HostStatus, HostVcpuId},
};

/// The width of a VMCS field, encoded in bits 14:13 of its encoding.
///
/// See: 25.11.2 VMREAD, VMWRITE, and Encodings of VMCS Fields
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldWidth {
    /// A 16-bit field.
    Bits16,
    /// A 64-bit field, accessed through its full encoding.
    Bits64,
    /// A 32-bit field.
    Bits32,
    /// A natural-width field, 64 bits on x86_64.
    Natural,
}

impl FieldWidth {
    /// Returns the width of the field `encoding`.
    pub fn of(encoding: u32) -> Self {
        match encoding.get_bits(13..=14) {
            0 => Self::Bits16,
            1 => Self::Bits64,
            2 => Self::Bits32,
            _ => Self::Natural,
        }
    }

    fn max_value(self) -> u64 {
        match self {
            Self::Bits16 => u64::from(u16::MAX),
            Self::Bits32 => u64::from(u32::MAX),
            Self::Bits64 | Self::Natural => u64::MAX,
        }
    }
}

/// The VMCS of one vCPU, accessed through the host.
#[derive(Clone, Copy)]
pub(crate) struct Vmcs<'a> {
    host: &'a dyn HostApi,
    vcpu: HostVcpuId,
}

impl<'a> Vmcs<'a> {
    pub(crate) fn new(host: &'a dyn HostApi, vcpu: HostVcpuId) -> Self {
        Self { host, vcpu }
    }

    /// Reads a 64-bit or natural-width field.
    pub(crate) fn read(&self, encoding: u32) -> Result<u64, Error> {
        self.check_width(encoding, &[FieldWidth::Bits64, FieldWidth::Natural])?;
        self.read_raw(encoding)
    }

    /// Reads a 32-bit field.
    pub(crate) fn read32(&self, encoding: u32) -> Result<u32, Error> {
        self.check_width(encoding, &[FieldWidth::Bits32])?;
        Ok(self.read_raw(encoding)? as u32)
    }

    /// Reads a 16-bit field.
    pub(crate) fn read16(&self, encoding: u32) -> Result<u16, Error> {
        self.check_width(encoding, &[FieldWidth::Bits16])?;
        Ok(self.read_raw(encoding)? as u16)
    }

    /// Writes a field. The value must fit the width of the field.
    pub(crate) fn write<T: Into<u64>>(&self, encoding: u32, value: T) -> Result<(), Error> {
        let value = value.into();
        let width = FieldWidth::of(encoding);
        if value > width.max_value() {
            debug_assert!(false, "{value:#x?} does not fit {encoding:#x?} ({width:?})");
            return Err(Error::StateSync {
                field: field_name(encoding),
                status: HostStatus::BadArgument,
            });
        }
        self.host
            .vmcs_write(self.vcpu, encoding, value)
            .map_err(|status| Error::StateSync {
                field: field_name(encoding),
                status,
            })
    }

    /// Reads a field of any width. Returns zero on error.
    fn read_relaxed(&self, encoding: u32) -> u64 {
        self.host.vmcs_read(self.vcpu, encoding).unwrap_or(0)
    }

    fn read_raw(&self, encoding: u32) -> Result<u64, Error> {
        self.host
            .vmcs_read(self.vcpu, encoding)
            .map_err(|status| Error::StateSync {
                field: field_name(encoding),
                status,
            })
    }

    fn check_width(&self, encoding: u32, expected: &[FieldWidth]) -> Result<(), Error> {
        let width = FieldWidth::of(encoding);
        if expected.contains(&width) {
            Ok(())
        } else {
            debug_assert!(false, "{encoding:#x?} is {width:?}, not {expected:?}");
            Err(Error::StateSync {
                field: field_name(encoding),
                status: HostStatus::BadArgument,
            })
        }
    }
}

/// Returns the label of a VMCS field for error messages and dumps.
pub(crate) fn field_name(encoding: u32) -> &'static str {
    FIELDS
        .iter()
        .find(|(field, _)| *field == encoding)
        .map_or("VMCS field", |&(_, name)| name)
}

/// A labelled listing of the significant VMCS fields of a vCPU, for
/// diagnosing failed VM-entries.
pub struct VmcsDump<'a> {
    vmcs: Vmcs<'a>,
}

impl<'a> VmcsDump<'a> {
    /// Captures the VMCS of `vcpu`. The fields are read when formatted.
    pub fn new(host: &'a dyn HostApi, vcpu: HostVcpuId) -> Self {
        Self {
            vmcs: Vmcs::new(host, vcpu),
        }
    }
}

impl core::fmt::Debug for VmcsDump<'_> {
    fn fmt(&self, format: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut dump = format.debug_struct("Vmcs");
        let _ = dump.field("vCPU", &self.vmcs.vcpu);
        for (encoding, name) in FIELDS {
            let _ = dump.field(name, &self.vmcs.read_relaxed(*encoding));
        }
        dump.finish()
    }
}

// Only the fields the host lets the guest observe or the engine writes,
// grouped by what they describe rather than by width.
static FIELDS: &[(u32, &str)] = &[
    // Execution controls.
    (vmcs::control::VPID, "VPID"),
    (vmcs::control::PINBASED_EXEC_CONTROLS, "Pin-based controls"),
    (vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, "Processor-based controls"),
    (vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, "Secondary processor-based controls"),
    (vmcs::control::EXCEPTION_BITMAP, "Exception bitmap"),
    (vmcs::control::PAGE_FAULT_ERR_CODE_MASK, "#PF error code mask"),
    (vmcs::control::PAGE_FAULT_ERR_CODE_MATCH, "#PF error code match"),
    (vmcs::control::CR3_TARGET_COUNT, "CR3 target count"),
    (vmcs::control::CR0_GUEST_HOST_MASK, "CR0 mask"),
    (vmcs::control::CR4_GUEST_HOST_MASK, "CR4 mask"),
    (vmcs::control::CR0_READ_SHADOW, "CR0 shadow"),
    (vmcs::control::CR4_READ_SHADOW, "CR4 shadow"),
    (vmcs::control::MSR_BITMAPS_ADDR_FULL, "MSR bitmap"),
    (vmcs::control::TSC_OFFSET_FULL, "TSC offset"),
    (vmcs::control::VIRT_APIC_ADDR_FULL, "Virtual APIC page"),
    (vmcs::control::APIC_ACCESS_ADDR_FULL, "APIC access page"),
    (vmcs::control::TPR_THRESHOLD, "TPR threshold"),
    (vmcs::control::EPTP_FULL, "EPTP"),
    (vmcs::control::PLE_GAP, "PLE gap"),
    (vmcs::control::PLE_WINDOW, "PLE window"),
    // Entry and exit controls.
    (vmcs::control::VMEXIT_CONTROLS, "Exit controls"),
    (vmcs::control::VMEXIT_MSR_STORE_COUNT, "Exit MSR store count"),
    (vmcs::control::VMEXIT_MSR_LOAD_COUNT, "Exit MSR load count"),
    (vmcs::control::VMENTRY_CONTROLS, "Entry controls"),
    (vmcs::control::VMENTRY_MSR_LOAD_COUNT, "Entry MSR load count"),
    (vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, "Entry event"),
    (vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, "Entry error code"),
    (vmcs::control::VMENTRY_INSTRUCTION_LEN, "Entry instruction length"),
    (vmcs::host::IA32_EFER_FULL, "Host EFER"),
    // Exit information.
    (vmcs::ro::VM_INSTRUCTION_ERROR, "Instruction error"),
    (vmcs::ro::EXIT_REASON, "Exit reason"),
    (vmcs::ro::EXIT_QUALIFICATION, "Exit qualification"),
    (vmcs::ro::GUEST_LINEAR_ADDR, "Exit linear address"),
    (vmcs::ro::GUEST_PHYSICAL_ADDR_FULL, "Exit physical address"),
    (vmcs::ro::VMEXIT_INTERRUPTION_INFO, "Exit event"),
    (vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE, "Exit error code"),
    (vmcs::ro::IDT_VECTORING_INFO, "Vectoring event"),
    (vmcs::ro::IDT_VECTORING_ERR_CODE, "Vectoring error code"),
    (vmcs::ro::VMEXIT_INSTRUCTION_LEN, "Exit instruction length"),
    (vmcs::ro::VMEXIT_INSTRUCTION_INFO, "Exit instruction info"),
    // Guest registers.
    (vmcs::guest::RIP, "Guest RIP"),
    (vmcs::guest::RSP, "Guest RSP"),
    (vmcs::guest::RFLAGS, "Guest RFLAGS"),
    (vmcs::guest::CR0, "Guest CR0"),
    (vmcs::guest::CR3, "Guest CR3"),
    (vmcs::guest::CR4, "Guest CR4"),
    (vmcs::guest::DR7, "Guest DR7"),
    (vmcs::guest::PDPTE0_FULL, "Guest PDPTE0"),
    (vmcs::guest::PDPTE1_FULL, "Guest PDPTE1"),
    (vmcs::guest::PDPTE2_FULL, "Guest PDPTE2"),
    (vmcs::guest::PDPTE3_FULL, "Guest PDPTE3"),
    (vmcs::guest::IA32_EFER_FULL, "Guest EFER"),
    (vmcs::guest::IA32_PAT_FULL, "Guest PAT"),
    (vmcs::guest::IA32_DEBUGCTL_FULL, "Guest DEBUGCTL"),
    (vmcs::guest::IA32_SYSENTER_CS, "Guest SYSENTER CS"),
    (vmcs::guest::IA32_SYSENTER_ESP, "Guest SYSENTER ESP"),
    (vmcs::guest::IA32_SYSENTER_EIP, "Guest SYSENTER EIP"),
    (vmcs::guest::LINK_PTR_FULL, "Link pointer"),
    // Guest segments and tables.
    (vmcs::guest::CS_SELECTOR, "Guest CS"),
    (vmcs::guest::CS_BASE, "Guest CS base"),
    (vmcs::guest::CS_LIMIT, "Guest CS limit"),
    (vmcs::guest::CS_ACCESS_RIGHTS, "Guest CS attributes"),
    (vmcs::guest::SS_SELECTOR, "Guest SS"),
    (vmcs::guest::SS_BASE, "Guest SS base"),
    (vmcs::guest::SS_LIMIT, "Guest SS limit"),
    (vmcs::guest::SS_ACCESS_RIGHTS, "Guest SS attributes"),
    (vmcs::guest::DS_SELECTOR, "Guest DS"),
    (vmcs::guest::DS_BASE, "Guest DS base"),
    (vmcs::guest::DS_LIMIT, "Guest DS limit"),
    (vmcs::guest::DS_ACCESS_RIGHTS, "Guest DS attributes"),
    (vmcs::guest::ES_SELECTOR, "Guest ES"),
    (vmcs::guest::ES_BASE, "Guest ES base"),
    (vmcs::guest::ES_LIMIT, "Guest ES limit"),
    (vmcs::guest::ES_ACCESS_RIGHTS, "Guest ES attributes"),
    (vmcs::guest::FS_SELECTOR, "Guest FS"),
    (vmcs::guest::FS_BASE, "Guest FS base"),
    (vmcs::guest::FS_LIMIT, "Guest FS limit"),
    (vmcs::guest::FS_ACCESS_RIGHTS, "Guest FS attributes"),
    (vmcs::guest::GS_SELECTOR, "Guest GS"),
    (vmcs::guest::GS_BASE, "Guest GS base"),
    (vmcs::guest::GS_LIMIT, "Guest GS limit"),
    (vmcs::guest::GS_ACCESS_RIGHTS, "Guest GS attributes"),
    (vmcs::guest::LDTR_SELECTOR, "Guest LDTR"),
    (vmcs::guest::LDTR_BASE, "Guest LDTR base"),
    (vmcs::guest::LDTR_LIMIT, "Guest LDTR limit"),
    (vmcs::guest::LDTR_ACCESS_RIGHTS, "Guest LDTR attributes"),
    (vmcs::guest::TR_SELECTOR, "Guest TR"),
    (vmcs::guest::TR_BASE, "Guest TR base"),
    (vmcs::guest::TR_LIMIT, "Guest TR limit"),
    (vmcs::guest::TR_ACCESS_RIGHTS, "Guest TR attributes"),
    (vmcs::guest::GDTR_BASE, "Guest GDTR base"),
    (vmcs::guest::GDTR_LIMIT, "Guest GDTR limit"),
    (vmcs::guest::IDTR_BASE, "Guest IDTR base"),
    (vmcs::guest::IDTR_LIMIT, "Guest IDTR limit"),
    // Guest event state.
    (vmcs::guest::INTERRUPTIBILITY_STATE, "Guest interruptibility"),
    (vmcs::guest::ACTIVITY_STATE, "Guest activity state"),
    (vmcs::guest::PENDING_DBG_EXCEPTIONS, "Guest pending #DB"),
];
