//! The module containing the per-vCPU VMX control setup and the shadow of
//! every control the engine committed.

use core::fmt;

use x86::vmx::vmcs::{
    self,
    control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
};

use crate::hypervisor::{
    capabilities::{ControlPair, VmxCapabilities},
    config::{GuestFeatures, HostCpu, VmxConfig},
    error::Error,
    host_api::{HostApi, HostResultExt, HostVcpuId, MsrAccess},
    lbr::LbrMsrs,
    vmcs::Vmcs,
};

/// The VMX control fields adjusted against allowed0/allowed1 pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlCategory {
    /// Pin-based VM-execution controls.
    PinBased,
    /// Primary processor-based VM-execution controls.
    ProcessorBased,
    /// Secondary processor-based VM-execution controls.
    ProcessorBased2,
    /// VM-entry controls.
    VmEntry,
    /// VM-exit controls.
    VmExit,
}

impl fmt::Display for ControlCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PinBased => "pin-based",
            Self::ProcessorBased => "processor-based",
            Self::ProcessorBased2 => "secondary processor-based",
            Self::VmEntry => "VM-entry",
            Self::VmExit => "VM-exit",
        })
    }
}

/// Computes the value of a control field as `allowed0 | requested` and
/// checks that every bit of it is permitted.
///
/// Each bit of the following VMCS values might have to be set or cleared
/// according to the value indicated by the VMX capability:
///  - pin-based VM-execution controls,
///  - primary and secondary processor-based VM-execution controls,
///  - VM-exit controls,
///  - VM-entry controls.
///
/// The VMX capability is a pair of 32bit values:
///  - allowed0: bit X is 1 if the control is required to be 1.
///  - allowed1: bit X is 0 if the control is required to be 0.
///
/// See: A.3.1 Pin-Based VM-Execution Controls
pub fn adjust(pair: ControlPair, category: ControlCategory, requested: u32) -> Result<u32, Error> {
    let value = pair.allowed0 | requested;
    if (value & pair.allowed1) == value {
        Ok(value)
    } else {
        log::error!(
            "Invalid {category} controls: {value:#x?} (allowed0 {:#x?}, allowed1 {:#x?})",
            pair.allowed0,
            pair.allowed1
        );
        Err(Error::UnsupportedConfiguration {
            category,
            requested: value,
            allowed0: pair.allowed0,
            allowed1: pair.allowed1,
        })
    }
}

/// The VM-wide inputs to the control setup of a vCPU.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ControlSetup<'a> {
    pub(crate) caps: &'a VmxCapabilities,
    pub(crate) config: &'a VmxConfig,
    pub(crate) guest: GuestFeatures,
    pub(crate) host_cpu: HostCpu,
    pub(crate) lbr: Option<&'a LbrMsrs>,
}

/// The control fields of a vCPU as last written to its VMCS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlShadow {
    /// Pin-based VM-execution controls.
    pub pin: u32,
    /// Primary processor-based VM-execution controls.
    pub proc: u32,
    /// Secondary processor-based VM-execution controls.
    pub proc2: u32,
    /// VM-entry controls.
    pub entry: u32,
    /// VM-exit controls.
    pub exit: u32,
    /// The exception bitmap.
    pub exception_bitmap: u32,
    /// The CR0 guest/host mask.
    pub cr0_mask: u64,
    /// The CR4 guest/host mask.
    pub cr4_mask: u64,
    /// Whether the MSR permissions were set up.
    pub msr_permissions_done: bool,
}

const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_NE: u64 = 1 << 5;
const X86_CR0_PG: u64 = 1 << 31;
// Bits the VM-exit CR0 load leaves untouched.
const VMX_EXIT_HOST_CR0_IGNORE_MASK: u64 = 0xffff_ffff_7ffa_ffd0;

const X86_CR4_VME: u64 = 1 << 0;
const X86_CR4_PSE: u64 = 1 << 4;
const X86_CR4_PAE: u64 = 1 << 5;
const X86_CR4_PGE: u64 = 1 << 7;
const X86_CR4_VMXE: u64 = 1 << 13;
const X86_CR4_FSGSBASE: u64 = 1 << 16;
const X86_CR4_PCIDE: u64 = 1 << 17;
const X86_CR4_OSXSAVE: u64 = 1 << 18;

const X86_XCPT_AC: u32 = 17;
const IA32_DEBUGCTL_LBR: u64 = 1 << 0;

const IA32_SYSENTER_CS: u32 = 0x174;
const IA32_SYSENTER_ESP: u32 = 0x175;
const IA32_SYSENTER_EIP: u32 = 0x176;
const IA32_SPEC_CTRL: u32 = 0x48;
const IA32_PRED_CMD: u32 = 0x49;
const IA32_STAR: u32 = 0xc000_0081;
const IA32_LSTAR: u32 = 0xc000_0082;
const IA32_FMASK: u32 = 0xc000_0084;
const IA32_FS_BASE: u32 = 0xc000_0100;
const IA32_GS_BASE: u32 = 0xc000_0101;
const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
const IA32_TSC_AUX: u32 = 0xc000_0103;

impl ControlShadow {
    /// Sets up the VMCS of a freshly created vCPU.
    pub(crate) fn init(
        host: &dyn HostApi,
        vcpu: HostVcpuId,
        setup: &ControlSetup<'_>,
    ) -> Result<Self, Error> {
        let vmcs = Vmcs::new(host, vcpu);
        let caps = setup.caps;
        let mut shadow = Self::default();

        // Pin-based controls.
        let mut pin = 0;
        if caps.pin.permits(PinbasedControls::VIRTUAL_NMIS.bits()) {
            pin |= PinbasedControls::VIRTUAL_NMIS.bits();
        }
        shadow.pin = adjust(caps.pin, ControlCategory::PinBased, pin)?;
        vmcs.write(vmcs::control::PINBASED_EXEC_CONTROLS, shadow.pin)?;

        // Primary processor-based controls. MOV DRx exiting is toggled per
        // entry, so it must be neither forced nor forbidden.
        let mut proc = (PrimaryControls::HLT_EXITING
            | PrimaryControls::UNCOND_IO_EXITING
            | PrimaryControls::RDPMC_EXITING
            | PrimaryControls::MONITOR_EXITING
            | PrimaryControls::MWAIT_EXITING)
            .bits();
        let mov_dr = PrimaryControls::MOV_DR_EXITING.bits();
        if !caps.proc.permits(mov_dr) || caps.proc.forces(mov_dr) {
            return Err(Error::UnsupportedConfiguration {
                category: ControlCategory::ProcessorBased,
                requested: caps.proc.allowed0 | proc | mov_dr,
                allowed0: caps.proc.allowed0,
                allowed1: caps.proc.allowed1,
            });
        }
        if caps.proc.permits(PrimaryControls::SECONDARY_CONTROLS.bits()) {
            proc |= PrimaryControls::SECONDARY_CONTROLS.bits();
        }
        shadow.proc = adjust(caps.proc, ControlCategory::ProcessorBased, proc)?;
        vmcs.write(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, shadow.proc)?;

        shadow.init_msr_permissions(host, vcpu, setup)?;

        // Secondary processor-based controls.
        if (shadow.proc & PrimaryControls::SECONDARY_CONTROLS.bits()) != 0 {
            shadow.proc2 = Self::secondary_controls(&vmcs, setup)?;
            vmcs.write(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, shadow.proc2)?;
        }

        // Guest/host masks, and LBR recording.
        shadow.cr0_mask = X86_CR0_PE | X86_CR0_NE | X86_CR0_PG | VMX_EXIT_HOST_CR0_IGNORE_MASK;
        shadow.cr4_mask = X86_CR4_VMXE
            | X86_CR4_VME
            | X86_CR4_PAE
            | X86_CR4_PGE
            | X86_CR4_PSE
            | X86_CR4_PCIDE;
        if setup.host_cpu.xsave {
            shadow.cr4_mask |= X86_CR4_OSXSAVE;
        }
        if setup.guest.fsgsbase {
            shadow.cr4_mask |= X86_CR4_FSGSBASE;
        }
        vmcs.write(vmcs::control::CR0_GUEST_HOST_MASK, shadow.cr0_mask)?;
        vmcs.write(vmcs::control::CR4_GUEST_HOST_MASK, shadow.cr4_mask)?;
        if setup.lbr.is_some() {
            vmcs.write(vmcs::guest::IA32_DEBUGCTL_FULL, IA32_DEBUGCTL_LBR)?;
        }

        // The host sets up entry and exit controls; take them as they are.
        shadow.entry = vmcs.read32(vmcs::control::VMENTRY_CONTROLS)?;
        shadow.exit = vmcs.read32(vmcs::control::VMEXIT_CONTROLS)?;

        shadow.exception_bitmap = 1 << X86_XCPT_AC;
        vmcs.write(vmcs::control::EXCEPTION_BITMAP, shadow.exception_bitmap)?;

        log::debug!("{shadow:#x?}");
        Ok(shadow)
    }

    fn secondary_controls(vmcs: &Vmcs<'_>, setup: &ControlSetup<'_>) -> Result<u32, Error> {
        let pair = setup.caps.proc2;
        let mut proc2 = 0;
        if pair.permits(SecondaryControls::WBINVD_EXITING.bits()) {
            proc2 |= SecondaryControls::WBINVD_EXITING.bits();
        }
        if setup.guest.invpcid && pair.permits(SecondaryControls::ENABLE_INVPCID.bits()) {
            proc2 |= SecondaryControls::ENABLE_INVPCID.bits();
        }
        if setup.guest.rdtscp && pair.permits(SecondaryControls::ENABLE_RDTSCP.bits()) {
            proc2 |= SecondaryControls::ENABLE_RDTSCP.bits();
        }
        if setup.config.pause_loop_exiting()
            && pair.permits(SecondaryControls::PAUSE_LOOP_EXITING.bits())
        {
            proc2 |= SecondaryControls::PAUSE_LOOP_EXITING.bits();
            vmcs.write(vmcs::control::PLE_GAP, setup.config.ple_gap)?;
            vmcs.write(vmcs::control::PLE_WINDOW, setup.config.ple_window)?;
        }
        adjust(pair, ControlCategory::ProcessorBased2, proc2)
    }

    /// Lets the guest access the MSRs that have no side effects on the host
    /// without exiting. Every other MSR access exits.
    fn init_msr_permissions(
        &mut self,
        host: &dyn HostApi,
        vcpu: HostVcpuId,
        setup: &ControlSetup<'_>,
    ) -> Result<(), Error> {
        let native = |msr: u32| {
            host.enable_native_msr(vcpu, msr, true)
                .op("hv_vcpu_enable_native_msr")
        };

        for msr in [
            IA32_SYSENTER_CS,
            IA32_SYSENTER_ESP,
            IA32_SYSENTER_EIP,
            IA32_GS_BASE,
            IA32_FS_BASE,
        ] {
            native(msr)?;
        }
        if setup.guest.ibpb {
            native(IA32_PRED_CMD)?;
        }
        if setup.guest.ibrs {
            native(IA32_SPEC_CTRL)?;
        }
        for msr in [
            IA32_LSTAR,
            IA32_STAR,
            IA32_FMASK,
            IA32_KERNEL_GS_BASE,
            IA32_TSC_AUX,
        ] {
            native(msr)?;
        }

        if let Some(lbr) = setup.lbr {
            for msr in lbr.all() {
                host.enable_managed_msr(vcpu, msr, true)
                    .op("hv_vcpu_enable_managed_msr")?;
                host.set_msr_access(vcpu, msr, MsrAccess::READ | MsrAccess::WRITE)
                    .op("hv_vcpu_set_msr_access")?;
            }
        }

        self.msr_permissions_done = true;
        Ok(())
    }

    /// Enables TPR shadowing when the guest has an APIC and the processor
    /// supports it. Otherwise CR8 accesses exit.
    pub(crate) fn init_tpr_shadowing(
        &mut self,
        host: &dyn HostApi,
        vcpu: HostVcpuId,
        caps: &VmxCapabilities,
        apic: bool,
    ) -> Result<(), Error> {
        let tpr_shadow = PrimaryControls::USE_TPR_SHADOW.bits();
        let mut proc = self.proc;
        if apic && caps.proc.permits(tpr_shadow) {
            proc |= tpr_shadow;
        } else {
            proc |= (PrimaryControls::CR8_LOAD_EXITING | PrimaryControls::CR8_STORE_EXITING).bits();
        }
        let proc = adjust(caps.proc, ControlCategory::ProcessorBased, proc)?;
        Vmcs::new(host, vcpu).write(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc)?;
        self.proc = proc;
        Ok(())
    }

    /// Returns whether TPR shadowing is enabled.
    pub fn uses_tpr_shadow(&self) -> bool {
        (self.proc & PrimaryControls::USE_TPR_SHADOW.bits()) != 0
    }

    /// Commits entry and exit controls for the guest's current EFER.
    ///
    /// Only fields that differ from the shadow are written.
    pub(crate) fn export_entry_exit(
        &mut self,
        vmcs: &Vmcs<'_>,
        caps: &VmxCapabilities,
        long_mode_active: bool,
    ) -> Result<(), Error> {
        let mut entry = EntryControls::LOAD_DEBUG_CONTROLS.bits();
        if long_mode_active {
            entry |= EntryControls::IA32E_MODE_GUEST.bits();
        }
        if caps.entry.permits(EntryControls::LOAD_IA32_EFER.bits()) {
            entry |= EntryControls::LOAD_IA32_EFER.bits();
        }
        let entry = adjust(caps.entry, ControlCategory::VmEntry, entry)?;
        if entry != self.entry {
            vmcs.write(vmcs::control::VMENTRY_CONTROLS, entry)?;
            self.entry = entry;
        }

        let mut exit = (ExitControls::SAVE_DEBUG_CONTROLS | ExitControls::HOST_ADDRESS_SPACE_SIZE).bits();
        let efer = (ExitControls::SAVE_IA32_EFER | ExitControls::LOAD_IA32_EFER).bits();
        if caps.exit.permits(efer) {
            exit |= efer;
        }
        let exit = adjust(caps.exit, ControlCategory::VmExit, exit)?;
        if exit != self.exit {
            vmcs.write(vmcs::control::VMEXIT_CONTROLS, exit)?;
            self.exit = exit;
        }
        Ok(())
    }

    /// Sets or clears bits of the primary processor-based controls and writes
    /// the field when it changed.
    pub(crate) fn set_proc_bits(&mut self, vmcs: &Vmcs<'_>, bits: u32, enable: bool) -> Result<(), Error> {
        let proc = if enable { self.proc | bits } else { self.proc & !bits };
        if proc != self.proc {
            vmcs.write(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc)?;
            self.proc = proc;
        }
        Ok(())
    }

    /// Intercepts or stops intercepting exception `vector`, writing the
    /// bitmap when it changed.
    pub(crate) fn set_exception_intercept(
        &mut self,
        vmcs: &Vmcs<'_>,
        vector: u8,
        intercept: bool,
    ) -> Result<(), Error> {
        let bit = 1u32 << vector;
        let bitmap = if intercept {
            self.exception_bitmap | bit
        } else {
            self.exception_bitmap & !bit
        };
        if bitmap != self.exception_bitmap {
            vmcs.write(vmcs::control::EXCEPTION_BITMAP, bitmap)?;
            self.exception_bitmap = bitmap;
        }
        Ok(())
    }
}

/// Logs what the host lets the engine write into the control fields, one
/// line per bit.
pub(crate) fn log_write_vmcs_caps(host: &dyn HostApi, vcpu: HostVcpuId) {
    const FIELDS: [(u32, &str, bool); 10] = [
        (vmcs::control::PINBASED_EXEC_CONTROLS, "PINBASED_EXEC_CONTROLS", false),
        (vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, "PRIMARY_PROCBASED_EXEC_CONTROLS", false),
        (vmcs::control::EXCEPTION_BITMAP, "EXCEPTION_BITMAP", false),
        (vmcs::control::VMEXIT_CONTROLS, "VMEXIT_CONTROLS", false),
        (vmcs::control::VMENTRY_CONTROLS, "VMENTRY_CONTROLS", false),
        (vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, "SECONDARY_PROCBASED_EXEC_CONTROLS", false),
        (vmcs::control::PLE_GAP, "PLE_GAP", false),
        (vmcs::control::PLE_WINDOW, "PLE_WINDOW", false),
        (vmcs::control::TSC_OFFSET_FULL, "TSC_OFFSET_FULL", true),
        (vmcs::guest::IA32_DEBUGCTL_FULL, "GUEST_IA32_DEBUGCTL_FULL", true),
    ];

    for (field, name, is_64bit) in FIELDS {
        let (allowed0, allowed1) = match host.cap_write_vmcs(vcpu, field) {
            Ok(caps) => caps,
            Err(status) => {
                log::info!("{name} = failed to query ({status})");
                continue;
            }
        };
        log::info!("{name} = (allowed0 {allowed0:#x?}, allowed1 {allowed1:#x?})");

        let bits = if is_64bit { 64 } else { 32 };
        for bit in 0..bits {
            let must = (allowed0 & (1 << bit)) != 0;
            let may = (allowed1 & (1 << bit)) != 0;
            let meaning = match (must, may) {
                (false, false) => "must not be set",
                (false, true) => "can be set or not be set",
                (true, false) => "undefined (host error)",
                (true, true) => "must be set",
            };
            log::info!("    Bit {bit:02} = {meaning}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockHost;

    fn setup<'a>(caps: &'a VmxCapabilities, config: &'a VmxConfig) -> ControlSetup<'a> {
        ControlSetup {
            caps,
            config,
            guest: GuestFeatures::default(),
            host_cpu: HostCpu {
                family: 6,
                model: 0x9e,
                xsave: true,
            },
            lbr: None,
        }
    }

    #[test]
    fn pin_controls_combine_allowed0_and_virtual_nmis() {
        let pair = ControlPair {
            allowed0: 0x16,
            allowed1: 0x7e,
        };
        let value = adjust(pair, ControlCategory::PinBased, PinbasedControls::VIRTUAL_NMIS.bits());
        assert_eq!(value, Ok(0x36));
    }

    #[test]
    fn forbidden_bits_are_reported_with_category() {
        let pair = ControlPair {
            allowed0: 0x16,
            allowed1: 0x1e,
        };
        let err = adjust(pair, ControlCategory::PinBased, 0x20).unwrap_err();
        assert_eq!(
            err,
            Error::UnsupportedConfiguration {
                category: ControlCategory::PinBased,
                requested: 0x36,
                allowed0: 0x16,
                allowed1: 0x1e,
            }
        );
        assert!(err.to_string().starts_with("pin-based controls 0x36"));
    }

    #[test]
    fn committed_controls_honor_capabilities() {
        let host = MockHost::new();
        let caps = VmxCapabilities::probe(&host).unwrap();
        let config = VmxConfig::default();
        let shadow = ControlShadow::init(&host, HostVcpuId(0), &setup(&caps, &config)).unwrap();

        for (value, pair) in [
            (shadow.pin, caps.pin),
            (shadow.proc, caps.proc),
            (shadow.proc2, caps.proc2),
        ] {
            assert_eq!(value & pair.allowed1, value);
            assert_eq!(value & pair.allowed0, pair.allowed0);
        }
        assert_eq!(shadow.pin, 0x36);
        assert_eq!(shadow.exception_bitmap, 1 << 17);
        assert_eq!(shadow.proc & PrimaryControls::MOV_DR_EXITING.bits(), 0);
        assert!(shadow.msr_permissions_done);
        assert_eq!(
            host.vmcs_value(vmcs::control::PINBASED_EXEC_CONTROLS),
            Some(0x36)
        );
        assert!(host.calls().contains(&"enable_native_msr(0xc0000103, true)".to_string()));
    }

    #[test]
    fn forced_mov_dr_exiting_is_rejected() {
        let host = MockHost::new();
        let mut caps = VmxCapabilities::probe(&host).unwrap();
        caps.proc.allowed0 |= PrimaryControls::MOV_DR_EXITING.bits();
        let config = VmxConfig::default();

        let result = ControlShadow::init(&host, HostVcpuId(0), &setup(&caps, &config));
        assert!(matches!(
            result,
            Err(Error::UnsupportedConfiguration {
                category: ControlCategory::ProcessorBased,
                ..
            })
        ));
    }

    #[test]
    fn pause_loop_exiting_needs_gap_and_window() {
        let host = MockHost::new();
        let caps = VmxCapabilities::probe(&host).unwrap();
        let ple = SecondaryControls::PAUSE_LOOP_EXITING.bits();

        let config = VmxConfig::default().with_pause_loop_exiting(128, 0);
        let shadow = ControlShadow::init(&host, HostVcpuId(0), &setup(&caps, &config)).unwrap();
        assert_eq!(shadow.proc2 & ple, 0);

        let config = VmxConfig::default().with_pause_loop_exiting(128, 4096);
        let shadow = ControlShadow::init(&host, HostVcpuId(0), &setup(&caps, &config)).unwrap();
        assert_eq!(shadow.proc2 & ple, ple);
        assert_eq!(host.vmcs_value(vmcs::control::PLE_GAP), Some(128));
        assert_eq!(host.vmcs_value(vmcs::control::PLE_WINDOW), Some(4096));
    }

    #[test]
    fn lbr_msrs_become_managed() {
        let host = MockHost::new();
        let caps = VmxCapabilities::probe(&host).unwrap();
        let config = VmxConfig::default().with_lbr(true);
        let lbr = LbrMsrs::for_host(HostCpu {
            family: 0xf,
            model: 1,
            xsave: false,
        })
        .unwrap();
        let mut setup = setup(&caps, &config);
        setup.lbr = Some(&lbr);

        let shadow = ControlShadow::init(&host, HostVcpuId(0), &setup).unwrap();
        assert_eq!(shadow.exception_bitmap & (1 << 17), 1 << 17);
        assert_eq!(host.vmcs_value(vmcs::guest::IA32_DEBUGCTL_FULL), Some(1));
        assert!(host.calls().contains(&"enable_managed_msr(0x1da, true)".to_string()));
        assert!(host.calls().contains(&"set_msr_access(0x1da, MsrAccess(3))".to_string()));
    }

    #[test]
    fn tpr_shadow_falls_back_to_cr8_exiting() {
        let host = MockHost::new();
        let caps = VmxCapabilities::probe(&host).unwrap();
        let config = VmxConfig::default();
        let mut shadow = ControlShadow::init(&host, HostVcpuId(0), &setup(&caps, &config)).unwrap();

        let mut no_tpr_shadow = caps;
        no_tpr_shadow.proc.allowed1 &= !PrimaryControls::USE_TPR_SHADOW.bits();
        shadow
            .init_tpr_shadowing(&host, HostVcpuId(0), &no_tpr_shadow, true)
            .unwrap();
        assert!(!shadow.uses_tpr_shadow());
        let cr8 = (PrimaryControls::CR8_LOAD_EXITING | PrimaryControls::CR8_STORE_EXITING).bits();
        assert_eq!(shadow.proc & cr8, cr8);

        let mut shadow = ControlShadow::init(&host, HostVcpuId(0), &setup(&caps, &config)).unwrap();
        shadow.init_tpr_shadowing(&host, HostVcpuId(0), &caps, true).unwrap();
        assert!(shadow.uses_tpr_shadow());
    }

    #[test]
    fn entry_controls_follow_long_mode() {
        let host = MockHost::new();
        let caps = VmxCapabilities::probe(&host).unwrap();
        let vmcs = Vmcs::new(&host, HostVcpuId(0));
        let mut shadow = ControlShadow::default();

        shadow.export_entry_exit(&vmcs, &caps, true).unwrap();
        assert_ne!(shadow.entry & EntryControls::IA32E_MODE_GUEST.bits(), 0);
        host.clear_calls();

        shadow.export_entry_exit(&vmcs, &caps, true).unwrap();
        assert!(host.calls().is_empty());

        shadow.export_entry_exit(&vmcs, &caps, false).unwrap();
        assert_eq!(shadow.entry & EntryControls::IA32E_MODE_GUEST.bits(), 0);
        assert_eq!(host.calls().len(), 1);
    }
}
