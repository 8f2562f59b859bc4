use x86::{segmentation::SystemDescriptorTypes64, vmx::vmcs};

use crate::hypervisor::{error::Error, vmcs::Vmcs};

/// A segment register in the layout of the VMCS guest-state area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    /// The visible selector.
    pub selector: u16,
    /// The limit in bytes.
    pub limit: u32,
    /// The access rights, see [`VmxSegmentAccessRights`].
    pub access_rights: u32,
    /// The base address.
    pub base: u64,
}

/// GDTR or IDTR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    /// The limit in bytes.
    pub limit: u32,
    /// The base address.
    pub base: u64,
}

bitfield::bitfield! {
    /// The access rights of a segment register as the VMCS holds them.
    ///
    /// See: 25.4.1 Guest Register State
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct VmxSegmentAccessRights(u32);
    impl Debug;

    /// The segment or gate type.
    pub segment_type, set_segment_type: 3, 0;
    /// Set for code and data segments.
    pub descriptor_type, set_descriptor_type: 4;
    /// The descriptor privilege level.
    pub dpl, set_dpl: 6, 5;
    /// Segment present.
    pub present, set_present: 7;
    /// Available for use by system software.
    pub available, set_available: 12;
    /// 64-bit code segment (CS only).
    pub long_mode, set_long_mode: 13;
    /// Default operation size.
    pub default_big, set_default_big: 14;
    /// Limit granularity.
    pub granularity, set_granularity: 15;
    /// The register holds a null selector or was never loaded.
    pub unusable, set_unusable: 16;
}

/// The segment registers the VMCS holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

struct SegmentFields {
    selector: u32,
    limit: u32,
    access_rights: u32,
    base: u32,
}

impl Segment {
    fn fields(self) -> SegmentFields {
        use vmcs::guest::*;
        let (selector, limit, access_rights, base) = match self {
            Self::Es => (ES_SELECTOR, ES_LIMIT, ES_ACCESS_RIGHTS, ES_BASE),
            Self::Cs => (CS_SELECTOR, CS_LIMIT, CS_ACCESS_RIGHTS, CS_BASE),
            Self::Ss => (SS_SELECTOR, SS_LIMIT, SS_ACCESS_RIGHTS, SS_BASE),
            Self::Ds => (DS_SELECTOR, DS_LIMIT, DS_ACCESS_RIGHTS, DS_BASE),
            Self::Fs => (FS_SELECTOR, FS_LIMIT, FS_ACCESS_RIGHTS, FS_BASE),
            Self::Gs => (GS_SELECTOR, GS_LIMIT, GS_ACCESS_RIGHTS, GS_BASE),
            Self::Ldtr => (LDTR_SELECTOR, LDTR_LIMIT, LDTR_ACCESS_RIGHTS, LDTR_BASE),
            Self::Tr => (TR_SELECTOR, TR_LIMIT, TR_ACCESS_RIGHTS, TR_BASE),
        };
        SegmentFields {
            selector,
            limit,
            access_rights,
            base,
        }
    }
}

impl SegmentRegister {
    pub(crate) fn read(vmcs: &Vmcs<'_>, segment: Segment) -> Result<Self, Error> {
        let fields = segment.fields();
        let mut register = Self {
            selector: vmcs.read16(fields.selector)?,
            limit: vmcs.read32(fields.limit)?,
            access_rights: vmcs.read32(fields.access_rights)?,
            base: vmcs.read(fields.base)?,
        };
        if segment == Segment::Tr {
            register.fix_tss_type();
        }
        Ok(register)
    }

    pub(crate) fn write(&self, vmcs: &Vmcs<'_>, segment: Segment) -> Result<(), Error> {
        let fields = segment.fields();
        vmcs.write(fields.selector, self.selector)?;
        vmcs.write(fields.limit, self.limit)?;
        vmcs.write(fields.access_rights, self.access_rights)?;
        vmcs.write(fields.base, self.base)
    }

    /// VM-entry requires TR to hold a busy TSS. Some hosts leave it marked
    /// available, so turn available into busy.
    fn fix_tss_type(&mut self) {
        const TSS16_AVAILABLE: u32 = 1;
        const TSS16_BUSY: u32 = 3;

        let mut access_rights = VmxSegmentAccessRights(self.access_rights);
        match access_rights.segment_type() {
            TSS16_AVAILABLE => access_rights.set_segment_type(TSS16_BUSY),
            t if t == SystemDescriptorTypes64::TssAvailable as u32 => {
                access_rights.set_segment_type(SystemDescriptorTypes64::TssBusy as u32);
            }
            _ => {}
        }
        self.access_rights = access_rights.0;
    }
}

impl DescriptorTable {
    pub(crate) fn read_gdtr(vmcs: &Vmcs<'_>) -> Result<Self, Error> {
        Ok(Self {
            limit: vmcs.read32(vmcs::guest::GDTR_LIMIT)?,
            base: vmcs.read(vmcs::guest::GDTR_BASE)?,
        })
    }

    pub(crate) fn read_idtr(vmcs: &Vmcs<'_>) -> Result<Self, Error> {
        Ok(Self {
            limit: vmcs.read32(vmcs::guest::IDTR_LIMIT)?,
            base: vmcs.read(vmcs::guest::IDTR_BASE)?,
        })
    }

    pub(crate) fn write_gdtr(&self, vmcs: &Vmcs<'_>) -> Result<(), Error> {
        vmcs.write(vmcs::guest::GDTR_LIMIT, self.limit)?;
        vmcs.write(vmcs::guest::GDTR_BASE, self.base)
    }

    pub(crate) fn write_idtr(&self, vmcs: &Vmcs<'_>) -> Result<(), Error> {
        vmcs.write(vmcs::guest::IDTR_LIMIT, self.limit)?;
        vmcs.write(vmcs::guest::IDTR_BASE, self.base)
    }
}
