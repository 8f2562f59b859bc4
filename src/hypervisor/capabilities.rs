//! The module containing the one-time discovery of VMX capabilities.

use bit_field::BitField;
use spin::Once;

use crate::hypervisor::{
    controls::ControlCategory,
    error::Error,
    host_api::{HostApi, HostResultExt, HostStatus, MsrInfo, VmxCapability},
};

/// The allowed settings of one control field.
///
/// Bits set in `allowed0` must be set in the committed value; bits clear in
/// `allowed1` must be clear.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlPair {
    /// Bits that must be 1.
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
}

impl ControlPair {
    /// Splits a capability value in the layout of the VMX capability MSRs.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            allowed0: raw.get_bits(0..32) as u32,
            allowed1: raw.get_bits(32..64) as u32,
        }
    }

    /// Returns whether every bit in `bits` may be set.
    pub fn permits(self, bits: u32) -> bool {
        (self.allowed1 & bits) == bits
    }

    /// Returns whether any bit in `bits` must be set.
    pub fn forces(self, bits: u32) -> bool {
        (self.allowed0 & bits) != 0
    }

    fn validate(self, category: ControlCategory) -> Result<Self, Error> {
        if (self.allowed0 & self.allowed1) == self.allowed0 {
            Ok(self)
        } else {
            Err(Error::InvalidCapabilities {
                category,
                allowed0: self.allowed0,
                allowed1: self.allowed1,
            })
        }
    }
}

/// Host CPU properties from `IA32_ARCH_CAPABILITIES`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ArchCapabilities {
    /// Not susceptible to rogue data cache load.
    pub rdcl_no: bool,
    /// Enhanced IBRS is supported.
    pub ibrs_all: bool,
    /// RSB alternate behavior is not exhibited.
    pub rsbo: bool,
    /// L1D flushes on VM-entry are unnecessary.
    pub vmm_need_not_flush_l1d: bool,
    /// Not susceptible to microarchitectural data sampling.
    pub mds_no: bool,
}

impl ArchCapabilities {
    fn from_raw(raw: u64) -> Self {
        Self {
            rdcl_no: raw.get_bit(0),
            ibrs_all: raw.get_bit(1),
            rsbo: raw.get_bit(2),
            vmm_need_not_flush_l1d: raw.get_bit(3),
            mds_no: raw.get_bit(5),
        }
    }
}

/// Everything the host reports about its VMX implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmxCapabilities {
    /// Pin-based VM-execution controls.
    pub pin: ControlPair,
    /// Primary processor-based VM-execution controls.
    pub proc: ControlPair,
    /// Secondary processor-based VM-execution controls. Zero when secondary
    /// controls are not available.
    pub proc2: ControlPair,
    /// VM-entry controls.
    pub entry: ControlPair,
    /// VM-exit controls.
    pub exit: ControlPair,
    /// The TRUE variants of pin, proc, entry and exit controls, in that
    /// order, when the processor reports them.
    pub true_controls: Option<[ControlPair; 4]>,
    /// `IA32_VMX_BASIC`, or zero when the host does not report it.
    pub basic: u64,
    /// `IA32_VMX_MISC`.
    pub misc: u64,
    /// `IA32_VMX_CR0_FIXED0`.
    pub cr0_fixed0: u64,
    /// `IA32_VMX_CR0_FIXED1`.
    pub cr0_fixed1: u64,
    /// `IA32_VMX_CR4_FIXED0`.
    pub cr4_fixed0: u64,
    /// `IA32_VMX_CR4_FIXED1`.
    pub cr4_fixed1: u64,
    /// `IA32_VMX_VMCS_ENUM`.
    pub vmcs_enum: u64,
    /// `IA32_VMX_EPT_VPID_CAP`.
    pub ept_vpid_caps: u64,
    /// Host CPU vulnerability properties.
    pub arch: ArchCapabilities,
}

const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;
const PROC_ACTIVATE_SECONDARY_CONTROLS: u32 = 1 << 31;
const PROC2_ENABLE_EPT: u32 = 1 << 1;
const PROC2_ENABLE_VPID: u32 = 1 << 5;

impl VmxCapabilities {
    /// Reads every capability from the host.
    ///
    /// Hosts without `HV_VMX_CAP_BASIC` do not report the other extended
    /// values either. The CR0/CR4 fixed bits then fall back to the values
    /// every VMX processor uses.
    pub fn probe(host: &dyn HostApi) -> Result<Self, Error> {
        let read = |cap: VmxCapability| {
            host.read_capability(cap)
                .op("hv_vmx_read_capability")
        };

        let mut caps = Self {
            pin: ControlPair::from_raw(read(VmxCapability::Pinbased)?)
                .validate(ControlCategory::PinBased)?,
            proc: ControlPair::from_raw(read(VmxCapability::Procbased)?)
                .validate(ControlCategory::ProcessorBased)?,
            entry: ControlPair::from_raw(read(VmxCapability::Entry)?)
                .validate(ControlCategory::VmEntry)?,
            exit: ControlPair::from_raw(read(VmxCapability::Exit)?)
                .validate(ControlCategory::VmExit)?,
            ..Self::default()
        };

        match host.read_capability(VmxCapability::Basic) {
            Ok(basic) => {
                caps.basic = basic;
                caps.misc = read(VmxCapability::Misc)?;
                caps.cr0_fixed0 = read(VmxCapability::Cr0Fixed0)?;
                caps.cr0_fixed1 = read(VmxCapability::Cr0Fixed1)?;
                caps.cr4_fixed0 = read(VmxCapability::Cr4Fixed0)?;
                caps.cr4_fixed1 = read(VmxCapability::Cr4Fixed1)?;
                caps.vmcs_enum = read(VmxCapability::VmcsEnum)?;
                if (basic & IA32_VMX_BASIC_VMX_CONTROLS_FLAG) != 0 {
                    caps.true_controls = Some([
                        ControlPair::from_raw(read(VmxCapability::TruePinbased)?),
                        ControlPair::from_raw(read(VmxCapability::TrueProcbased)?),
                        ControlPair::from_raw(read(VmxCapability::TrueEntry)?),
                        ControlPair::from_raw(read(VmxCapability::TrueExit)?),
                    ]);
                }
            }
            Err(status) => {
                log::warn!("HV_VMX_CAP_BASIC is unavailable ({status}), using default fixed CR bits");
                caps.cr0_fixed0 = 0x8000_0021;
                caps.cr0_fixed1 = 0xffff_ffff;
                caps.cr4_fixed0 = 0x2000;
                caps.cr4_fixed1 = 0x17_67ff;
            }
        }

        if (caps.proc.allowed1 & PROC_ACTIVATE_SECONDARY_CONTROLS) != 0 {
            caps.proc2 = ControlPair::from_raw(read(VmxCapability::Procbased2)?)
                .validate(ControlCategory::ProcessorBased2)?;
            if (caps.proc2.allowed1 & (PROC2_ENABLE_EPT | PROC2_ENABLE_VPID)) != 0 {
                // Older hosts do not report this.
                caps.ept_vpid_caps = host.read_capability(VmxCapability::EptVpidCap).unwrap_or(0);
            }
        }

        if host.features().msr_info {
            match host.msr_info(MsrInfo::ArchCapabilities) {
                Ok(raw) => caps.arch = ArchCapabilities::from_raw(raw),
                Err(HostStatus::Unsupported) => {}
                Err(status) => log::debug!("IA32_ARCH_CAPABILITIES is unavailable: {status}"),
            }
        }

        Ok(caps)
    }

    /// Returns the capabilities of this process, probing the host on the
    /// first call.
    pub fn get_or_probe(host: &dyn HostApi) -> Result<&'static Self, Error> {
        CAPABILITIES.try_call_once(|| {
            let caps = Self::probe(host)?;
            log::debug!("{caps:#x?}");
            Ok(caps)
        })
    }

    /// Returns the allowed settings of `category`.
    pub fn pair(&self, category: ControlCategory) -> ControlPair {
        match category {
            ControlCategory::PinBased => self.pin,
            ControlCategory::ProcessorBased => self.proc,
            ControlCategory::ProcessorBased2 => self.proc2,
            ControlCategory::VmEntry => self.entry,
            ControlCategory::VmExit => self.exit,
        }
    }
}

static CAPABILITIES: Once<VmxCapabilities> = Once::new();
