//! The module containing the VM-wide engine state: host VM creation, the
//! optional address space, and the creation of vCPUs.

use core::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::hypervisor::{
    config::{GuestFeatures, HostCpu, VmxConfig},
    error::Error,
    host_api::{HostApi, HostFeatures, HostResultExt, SpaceId, VcpuHandle},
    lbr::LbrMsrs,
    page_map::PageMapper,
    vcpu::Vcpu,
};

const IA32_TSC_AUX: u32 = 0xc000_0103;

/// What the engine offers to the emulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::BitOr)]
pub struct EngineFeatures(u32);

impl EngineFeatures {
    /// Guest-physical memory is translated by EPT.
    pub const NESTED_PAGING: Self = Self(1 << 0);
    /// The guest runs in every processor mode without emulation.
    pub const FULL_GUEST_EXEC: Self = Self(1 << 1);
    /// XSAVE and XRSTOR are available to the guest.
    pub const XSAVE_XRSTOR: Self = Self(1 << 2);

    /// Returns whether every feature of `other` is offered.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// The state every vCPU of a VM shares.
pub(crate) struct VmShared {
    pub(crate) host: Arc<dyn HostApi>,
    pub(crate) features: HostFeatures,
    pub(crate) config: VmxConfig,
    pub(crate) host_cpu: HostCpu,
    pub(crate) lbr: Option<LbrMsrs>,
    pub(crate) space: Option<SpaceId>,
    pub(crate) mapper: PageMapper,
    /// Every vCPU runs through the debug loop.
    pub(crate) debug_all: AtomicBool,
    /// The number of vCPUs not destroyed yet.
    pub(crate) vcpus: AtomicU32,
}

/// The VM of this process.
pub struct Vm {
    shared: Arc<VmShared>,
    terminated: bool,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("features", &self.shared.features)
            .field("config", &self.shared.config)
            .field("space", &self.shared.space)
            .field("vcpus", &self.shared.vcpus)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Creates the host VM.
    ///
    /// The LBR layout is resolved first, so an unsupported host processor
    /// fails before anything is created.
    pub fn new(host: Arc<dyn HostApi>, config: VmxConfig, host_cpu: HostCpu) -> Result<Self, Error> {
        let features = host.features().normalized();
        log::debug!("{features:#?}");

        let lbr = if !config.lbr {
            None
        } else if !features.managed_msrs {
            log::warn!("Last branch records need managed MSRs, disabling them");
            None
        } else {
            Some(LbrMsrs::for_host(host_cpu)?)
        };

        log::info!("Initializing the VM");
        host.vm_create().op("hv_vm_create")?;

        let space = if features.address_spaces {
            match host.vm_space_create() {
                Ok(space) => Some(space),
                Err(status) => {
                    log::warn!("Failed to create an address space ({status}), using the default one");
                    None
                }
            }
        } else {
            None
        };

        let mapper = PageMapper::new(Arc::clone(&host), space);
        Ok(Self {
            shared: Arc::new(VmShared {
                host,
                features,
                config,
                host_cpu,
                lbr,
                space,
                mapper,
                debug_all: AtomicBool::new(false),
                vcpus: AtomicU32::new(0),
            }),
            terminated: false,
        })
    }

    /// Creates a vCPU owned by the calling thread.
    ///
    /// The host vCPU is destroyed again when any later step fails.
    pub fn create_vcpu(&self, index: u32, guest: GuestFeatures) -> Result<Vcpu, Error> {
        let id = self.shared.host.vcpu_create().op("hv_vcpu_create")?;
        let mut vcpu = Vcpu::new(Arc::clone(&self.shared), VcpuHandle::new(id, index), guest);
        vcpu.init()?;
        Ok(vcpu)
    }

    /// The mapper of guest-physical memory.
    pub fn page_mapper(&self) -> &PageMapper {
        &self.shared.mapper
    }

    /// The optional host entry points, as used.
    pub fn host_features(&self) -> HostFeatures {
        self.shared.features
    }

    /// What the engine offers to the emulator.
    pub fn features(&self) -> EngineFeatures {
        EngineFeatures::NESTED_PAGING | EngineFeatures::FULL_GUEST_EXEC | EngineFeatures::XSAVE_XRSTOR
    }

    /// The number of vCPUs not destroyed yet.
    pub fn live_vcpus(&self) -> u32 {
        self.shared.vcpus.load(Ordering::SeqCst)
    }

    /// Routes every vCPU through the debug loop. Takes effect on the next
    /// call to [`Vcpu::set_single_instruction`] or on vCPU creation.
    pub fn set_use_debug_loop(&self, enable: bool) {
        self.shared.debug_all.store(enable, Ordering::Relaxed);
    }

    /// Resumes the guest TSC of every vCPU at `paused_tsc`.
    ///
    /// The host only offers a VM-wide TSC write, which clobbers
    /// `IA32_TSC_AUX`, so it is cleared on the calling vCPU.
    pub fn resume_cpu_tick_on_all(&self, vcpu: &Vcpu, paused_tsc: u64) -> Result<(), Error> {
        vcpu.handle.assert_owner()?;
        let host = &*self.shared.host;
        host.vm_sync_tsc(paused_tsc).op("hv_vm_sync_tsc")?;
        host.write_msr(vcpu.id(), IA32_TSC_AUX, 0)
            .field("IA32_TSC_AUX")
    }

    /// Destroys the VM, reporting failures. Dropping a [`Vm`] does the same
    /// and only logs them.
    pub fn terminate(mut self) -> Result<(), Error> {
        self.destroy()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.terminated = true;
        let live = self.live_vcpus();
        if live != 0 {
            log::warn!("Destroying the VM with {live} live vCPU(s)");
        }

        let host = &*self.shared.host;
        if let Some(space) = self.shared.space {
            if let Err(status) = host.vm_space_destroy(space) {
                log::error!("Failed to destroy address space {}: {status}", space.0);
            }
        }
        host.vm_destroy().op("hv_vm_destroy")?;
        log::info!("Destroyed the VM");
        Ok(())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.destroy() {
            log::error!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{host_api::HostStatus, mock::MockHost};

    const HOST_CPU: HostCpu = HostCpu {
        family: 6,
        model: 0x9e,
        xsave: true,
    };

    #[test]
    fn unknown_lbr_layout_fails_before_creating_the_vm() {
        let host = Arc::new(MockHost::new());
        let cpu = HostCpu {
            family: 6,
            model: 0x01,
            xsave: true,
        };

        let err = Vm::new(host.clone(), VmxConfig::default().with_lbr(true), cpu).unwrap_err();
        assert_eq!(err, Error::UnknownHostCpu { family: 6, model: 1 });
        assert!(host.calls().is_empty());
    }

    #[test]
    fn lbr_needs_managed_msrs() {
        let host = Arc::new(MockHost::new());
        host.set_features(HostFeatures {
            managed_msrs: false,
            ..MockHost::all_features()
        });
        let cpu = HostCpu {
            family: 6,
            model: 0x01,
            xsave: true,
        };

        let vm = Vm::new(host.clone(), VmxConfig::default().with_lbr(true), cpu).unwrap();
        assert!(vm.shared.lbr.is_none());
    }

    #[test]
    fn address_space_failure_falls_back_to_the_default() {
        let host = Arc::new(MockHost::new());
        host.fail_space_create(HostStatus::NoResources);

        let vm = Vm::new(host.clone(), VmxConfig::default(), HOST_CPU).unwrap();
        assert_eq!(vm.shared.space, None);
        let vcpu = vm.create_vcpu(0, GuestFeatures::default()).unwrap();
        assert!(!host.calls().iter().any(|call| call.starts_with("vcpu_set_space")));
        drop(vcpu);
    }

    #[test]
    fn failed_vcpu_setup_destroys_the_vcpu() {
        let host = Arc::new(MockHost::new());
        let vm = Vm::new(host.clone(), VmxConfig::default(), HOST_CPU).unwrap();
        host.fail_vcpu_set_space(HostStatus::Error);

        let err = vm.create_vcpu(0, GuestFeatures::default()).unwrap_err();
        assert_eq!(
            err,
            Error::HostApi {
                op: "hv_vcpu_set_space",
                status: HostStatus::Error
            }
        );
        assert_eq!(vm.live_vcpus(), 0);
        assert_eq!(host.calls().last().unwrap(), "vcpu_destroy(0)");
    }

    #[test]
    fn terminate_destroys_space_then_vm() {
        let host = Arc::new(MockHost::new());
        let vm = Vm::new(host.clone(), VmxConfig::default(), HOST_CPU).unwrap();
        host.clear_calls();

        vm.terminate().unwrap();
        assert_eq!(host.calls(), ["vm_space_destroy(1)", "vm_destroy()"]);
    }

    #[test]
    fn resuming_ticks_clears_tsc_aux() {
        let host = Arc::new(MockHost::new());
        let vm = Vm::new(host.clone(), VmxConfig::default(), HOST_CPU).unwrap();
        let vcpu = vm.create_vcpu(0, GuestFeatures::default()).unwrap();
        host.set_msr(IA32_TSC_AUX, 5);

        vm.resume_cpu_tick_on_all(&vcpu, 0x1000).unwrap();
        assert!(host.calls().contains(&"vm_sync_tsc(0x1000)".to_string()));
        assert_eq!(host.msr(IA32_TSC_AUX), 0);
    }

    #[test]
    fn features_include_nested_paging() {
        let host = Arc::new(MockHost::new());
        let vm = Vm::new(host, VmxConfig::default(), HOST_CPU).unwrap();
        assert!(vm.features().contains(EngineFeatures::NESTED_PAGING | EngineFeatures::XSAVE_XRSTOR));
    }
}
