//! A VMX execution engine for a user-space hypervisor API.
//!
//! The engine runs guest code on hardware virtualization for an emulator
//! that owns the architectural state. It sets up the VMX controls of each
//! vCPU, moves guest state between the emulator's [`CpuContext`] and the
//! hardware on demand, keeps guest-physical mappings in sync with the
//! emulator's memory manager, and hands every exit it does not settle itself
//! to an [`ExitDispatcher`].
//!
//! ```no_run
//! # fn run(host: std::sync::Arc<dyn vmx_engine::HostApi>,
//! #        dispatcher: &mut dyn vmx_engine::ExitDispatcher) -> Result<(), vmx_engine::Error> {
//! use vmx_engine::{CpuContext, GuestFeatures, HostCpu, Vm, VmxConfig};
//!
//! let cpu = HostCpu { family: 6, model: 0x9e, xsave: true };
//! let vm = Vm::new(host, VmxConfig::default(), cpu)?;
//! let mut vcpu = vm.create_vcpu(0, GuestFeatures::default())?;
//! vcpu.init_completed()?;
//!
//! let mut ctx = CpuContext::default();
//! let status = vcpu.run_gc(&mut ctx, dispatcher)?;
//! log::info!("{status:?}");
//! # Ok(())
//! # }
//! ```

pub mod hypervisor;

pub use hypervisor::{
    capabilities::VmxCapabilities,
    config::{GuestFeatures, HostCpu, VmxConfig},
    context::{ContextFlags, CpuContext, PageTableManager},
    error::Error,
    events::{PendingEvent, TrapEvent, TrapKind},
    exit::{ExitAction, ExitDispatcher, ExitInfo, ExitReason, HyperDebugRegisters, RunStatus},
    host_api::{HostApi, HostFeatures, HostStatus},
    page_map::{EptResolution, MemoryProtection, PageManager, PageMapper, PageState},
    state::ExportOutcome,
    vcpu::{Vcpu, VcpuKicker},
    vm::{EngineFeatures, Vm},
};

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub use hypervisor::hvf::Hvf;
