//! The module containing the per-vCPU engine state and its lifecycle.

use core::fmt;
use std::sync::{Arc, atomic::Ordering};

use crate::hypervisor::{
    capabilities::VmxCapabilities,
    config::GuestFeatures,
    context::{ContextFlags, CpuContext, PageTableManager},
    controls::{ControlSetup, ControlShadow, log_write_vmcs_caps},
    error::Error,
    events::PendingEvent,
    host_api::{HostApi, HostResultExt, HostStatus, HostVcpuId, SpaceId, VcpuHandle},
    vm::VmShared,
};

const IA32_TIME_STAMP_COUNTER: u32 = 0x10;
const IA32_TSC_AUX: u32 = 0xc000_0103;

/// Single-stepping and debug register bookkeeping of a vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DebugState {
    /// Execute one instruction per entry.
    pub single_instruction: bool,
    /// Run through the debug loop.
    pub use_debug_loop: bool,
    /// `RFLAGS.TF` was set by the engine and must be cleared afterwards.
    pub clear_trap_flag: bool,
    /// DR7 and DR0 to DR3 hold the debugger's values instead of the guest's.
    pub using_hyper_dr7: bool,
    /// Stepping through `RFLAGS.TF` because the processor lacks the monitor
    /// trap flag.
    pub stepping_by_trap_flag: bool,
    /// The DR7 value loaded on the next entry.
    pub dr7: u64,
}

/// An emulated processor backed by a host vCPU.
///
/// Bound to the thread that created it. Use [`Vcpu::kicker`] to reach it
/// from other threads.
pub struct Vcpu {
    pub(crate) shared: Arc<VmShared>,
    pub(crate) handle: VcpuHandle,
    pub(crate) guest: GuestFeatures,
    /// A copy of the process-wide capabilities.
    pub(crate) caps: VmxCapabilities,
    pub(crate) controls: ControlShadow,
    /// Categories to write on the next entry.
    pub(crate) changed: ContextFlags,
    pub(crate) pending_event: Option<PendingEvent>,
    pub(crate) debug: DebugState,
    /// The TPR last written to the host.
    pub(crate) guest_tpr: u8,
    terminated: bool,
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("handle", &self.handle)
            .field("changed", &self.changed)
            .field("pending_event", &self.pending_event)
            .field("debug", &self.debug)
            .field("guest_tpr", &self.guest_tpr)
            .finish_non_exhaustive()
    }
}

impl Vcpu {
    pub(crate) fn new(shared: Arc<VmShared>, handle: VcpuHandle, guest: GuestFeatures) -> Self {
        let _ = shared.vcpus.fetch_add(1, Ordering::SeqCst);
        let use_debug_loop = shared.debug_all.load(Ordering::Relaxed);
        Self {
            shared,
            handle,
            guest,
            caps: VmxCapabilities::default(),
            controls: ControlShadow::default(),
            changed: ContextFlags::ALL,
            pending_event: None,
            debug: DebugState {
                use_debug_loop,
                ..DebugState::default()
            },
            guest_tpr: 0,
            terminated: false,
        }
    }

    /// Attaches the vCPU to the VM's address space and sets up its VMCS.
    pub(crate) fn init(&mut self) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        let host = &*shared.host;
        let id = self.handle.id();

        if let Some(space) = shared.space {
            host.vcpu_set_space(id, space).op("hv_vcpu_set_space")?;
        }

        self.caps = *VmxCapabilities::get_or_probe(host)?;
        if self.handle.index() == 0 && shared.features.cap_write_vmcs {
            log_write_vmcs_caps(host, id);
        }

        let setup = ControlSetup {
            caps: &self.caps,
            config: &shared.config,
            guest: self.guest,
            host_cpu: shared.host_cpu,
            lbr: shared.lbr.as_ref(),
        };
        self.controls = ControlShadow::init(host, id, &setup)?;
        self.changed = ContextFlags::ALL;
        log::debug!("vCPU {} created as {:?}", self.handle.index(), id);
        Ok(())
    }

    /// The host's identifier of this vCPU.
    pub fn id(&self) -> HostVcpuId {
        self.handle.id()
    }

    /// The emulator's index of this vCPU.
    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    /// The control fields as last committed.
    pub fn controls(&self) -> &ControlShadow {
        &self.controls
    }

    /// The categories to be written on the next entry.
    pub fn changed(&self) -> ContextFlags {
        self.changed
    }

    /// The single-stepping and debug register state.
    pub fn debug_state(&self) -> DebugState {
        self.debug
    }

    /// The event waiting for the next entry, if any.
    pub fn pending_event(&self) -> Option<PendingEvent> {
        self.pending_event
    }

    /// Finishes the setup once the emulator knows whether the guest has an
    /// APIC.
    pub fn init_completed(&mut self) -> Result<(), Error> {
        self.handle.assert_owner()?;
        let apic = self.guest.apic;
        self.controls
            .init_tpr_shadowing(&*self.shared.host, self.handle.id(), &self.caps, apic)
    }

    /// Enables or disables single-instruction execution and returns the
    /// previous setting.
    pub fn set_single_instruction(&mut self, enable: bool) -> bool {
        let previous = self.debug.single_instruction;
        self.debug.single_instruction = enable;
        self.debug.use_debug_loop = enable || self.shared.debug_all.load(Ordering::Relaxed);
        previous
    }

    /// Returns a handle that forces this vCPU out of the guest from any
    /// thread.
    pub fn kicker(&self) -> VcpuKicker {
        VcpuKicker {
            host: Arc::clone(&self.shared.host),
            id: self.handle.id(),
            index: self.handle.index(),
        }
    }

    /// Pulls `what` from the hardware on behalf of the emulator.
    pub fn import_state_on_demand(
        &self,
        ctx: &mut CpuContext,
        what: ContextFlags,
        page_tables: &mut dyn PageTableManager,
    ) -> Result<(), Error> {
        self.handle.assert_owner()?;
        log::trace!("Importing {:?} on demand", what & ctx.externalized);
        self.import_state(ctx, what, page_tables)
    }

    /// Returns the guest TSC and `IA32_TSC_AUX`.
    pub fn query_cpu_tick(&self, ctx: &CpuContext) -> Result<(u64, u32), Error> {
        self.handle.assert_owner()?;
        let host = &*self.shared.host;
        let id = self.handle.id();

        let tsc = host
            .read_msr(id, IA32_TIME_STAMP_COUNTER)
            .field("IA32_TIME_STAMP_COUNTER")?;
        let aux = if ctx.externalized.contains(ContextFlags::TSC_AUX) {
            host.read_msr(id, IA32_TSC_AUX).field("IA32_TSC_AUX")?
        } else {
            ctx.tsc_aux
        };
        Ok((tsc, aux as u32))
    }

    /// Forces every category to be written on the next entry.
    pub fn reset(&mut self) {
        self.changed = ContextFlags::ALL;
        self.pending_event = None;
    }

    /// Returns the time the guest ran on this vCPU, in nanoseconds.
    pub fn exec_time(&self) -> Result<u64, Error> {
        self.handle.assert_owner()?;
        if !self.shared.features.exec_time {
            return Err(Error::HostApi {
                op: "hv_vcpu_get_exec_time",
                status: HostStatus::Unsupported,
            });
        }
        self.shared
            .host
            .exec_time(self.handle.id())
            .op("hv_vcpu_get_exec_time")
    }

    /// Destroys the vCPU, reporting failures. Dropping a [`Vcpu`] does the
    /// same and only logs them.
    pub fn terminate(mut self) -> Result<(), Error> {
        self.handle.assert_owner()?;
        self.destroy()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.terminated = true;
        let _ = self.shared.vcpus.fetch_sub(1, Ordering::SeqCst);
        let host = &*self.shared.host;
        let id = self.handle.id();

        let detached = if self.shared.space.is_some() {
            host.vcpu_set_space(id, SpaceId::DEFAULT)
                .op("hv_vcpu_set_space")
        } else {
            Ok(())
        };
        let destroyed = host.vcpu_destroy(id).op("hv_vcpu_destroy");
        detached.and(destroyed)
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.destroy() {
            log::error!("Failed to destroy vCPU {}: {err}", self.handle.index());
        }
    }
}

/// Forces a vCPU out of the guest so that it notices new force flags.
#[derive(Clone)]
pub struct VcpuKicker {
    host: Arc<dyn HostApi>,
    id: HostVcpuId,
    index: u32,
}

impl fmt::Debug for VcpuKicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcpuKicker")
            .field("id", &self.id)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl VcpuKicker {
    /// Interrupts the vCPU if it is in the guest.
    pub fn notify_ff(&self) {
        if let Err(status) = self.host.interrupt(self.id) {
            log::warn!("Failed to interrupt vCPU {}: {status}", self.index);
        }
    }
}
