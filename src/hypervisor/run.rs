//! The module containing the run loops: event injection before entry, the
//! entry itself, exit dispatch, and the debug loop used while stepping.

use std::sync::Arc;

use num_traits::FromPrimitive;
use x86::vmx::vmcs::{self, control::PrimaryControls};

use crate::hypervisor::{
    context::{ContextFlags, CpuContext},
    error::Error,
    events::{InterruptionType, PendingEvent},
    exit::{ExitAction, ExitDispatcher, ExitInfo, ExitReason, RunStatus},
    host_api::{HostResultExt, HvRegister},
    page_map::EptResolution,
    state::ExportOutcome,
    vcpu::Vcpu,
    vmcs::{Vmcs, VmcsDump},
};

const X86_EFL_IF: u64 = 1 << 9;
const X86_EFL_TF: u64 = 1 << 8;
const X86_XCPT_DB: u8 = 1;
const X86_XCPT_BP: u8 = 3;
const X86_XCPT_PF: u8 = 14;

const BLOCK_STI: u32 = 1 << 0;
const BLOCK_MOVSS: u32 = 1 << 1;
const BLOCK_NMI: u32 = 1 << 3;

const EXIT_REASON_ENTRY_FAILURE: u32 = 1 << 31;

/// The controls the debug loop changes, as they were before it started.
#[derive(Clone, Copy, Debug)]
struct DebugLoopState {
    proc: u32,
    exception_bitmap: u32,
}

impl Vcpu {
    /// Runs the guest until the emulator has to take over.
    ///
    /// Events that were not delivered go back to the emulator, and the state
    /// the emulator needs next is imported before returning.
    pub fn run_gc(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<RunStatus, Error> {
        self.handle.assert_owner()?;

        let use_debug_loop = self.debug.use_debug_loop
            || dispatcher.debugger_stepping()
            || dispatcher.int3_breakpoints_armed();
        let status = if use_debug_loop {
            self.run_debug(ctx, dispatcher)
        } else {
            self.run_normal(ctx, dispatcher)
        };
        let status = match status {
            Ok(RunStatus::ReturnToRing3) => Ok(RunStatus::Success),
            other => other,
        };
        log::trace!("vCPU {} leaves the run loop with {status:?}", self.handle.index());

        if let Some(event) = self.pending_event.take() {
            dispatcher.put_trap(event.to_trap());
            let vmcs = Vmcs::new(&*self.shared.host, self.handle.id());
            vmcs.write(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, 0u32)?;
            vmcs.write(vmcs::guest::PENDING_DBG_EXCEPTIONS, 0u64)?;
        }

        if ctx.externalized.intersects(ContextFlags::ALL) {
            let what = match status {
                Ok(status) if !status.is_em_status() => {
                    if dispatcher.interrupt_pending() {
                        ContextFlags::IEM_MASK | ContextFlags::XCPT_MASK
                    } else {
                        ContextFlags::IEM_MASK
                    }
                }
                _ => ContextFlags::ALL,
            };
            if ctx.externalized.intersects(what) {
                let imported = self.import_state(ctx, what, dispatcher.page_tables());
                let status = status?;
                imported?;
                if !ctx.externalized.intersects(ContextFlags::ALL) {
                    ctx.externalized = ContextFlags::NONE;
                    self.changed |= ContextFlags::ALL;
                }
                return Ok(status);
            }
        } else {
            ctx.externalized = ContextFlags::NONE;
            self.changed |= ContextFlags::ALL;
        }
        status
    }

    fn run_normal(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<RunStatus, Error> {
        loop {
            if let Some(status) = self.prerun(ctx, dispatcher)? {
                return Ok(status);
            }
            self.run_once(dispatcher)?;
            if let ExitAction::Return(status) = self.handle_exit(ctx, dispatcher, false)? {
                return Ok(status);
            }
        }
    }

    /// Runs one instruction at a time, or until a debug event, detecting
    /// completed steps by a change of CS:RIP.
    fn run_debug(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<RunStatus, Error> {
        let saved_single_instruction = self.debug.single_instruction;
        self.debug.single_instruction |= dispatcher.debugger_stepping();
        let saved = DebugLoopState {
            proc: self.controls.proc,
            exception_bitmap: self.controls.exception_bitmap,
        };

        let status = self.debug_iterations(ctx, dispatcher);

        let cleanup = self.leave_debug_loop(ctx, dispatcher, saved);
        self.debug.single_instruction = saved_single_instruction;
        let status = status?;
        cleanup?;
        Ok(status)
    }

    fn debug_iterations(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<RunStatus, Error> {
        let stepping = self.debug.single_instruction;
        loop {
            self.import_state(ctx, ContextFlags::CS | ContextFlags::RIP, dispatcher.page_tables())?;
            let start = (ctx.cs.selector, ctx.rip);

            // Applied again after pre-run, as exporting may reset them.
            self.apply_debug_intercepts(dispatcher, stepping)?;
            if let Some(status) = self.prerun(ctx, dispatcher)? {
                return Ok(status);
            }
            self.apply_debug_intercepts(dispatcher, stepping)?;

            self.run_once(dispatcher)?;
            if let ExitAction::Return(status) = self.handle_exit(ctx, dispatcher, true)? {
                return Ok(status);
            }

            if stepping {
                self.import_state(ctx, ContextFlags::CS | ContextFlags::RIP, dispatcher.page_tables())?;
                if (ctx.cs.selector, ctx.rip) != start {
                    return Ok(RunStatus::Stepped);
                }
                self.changed |= ContextFlags::DR7;
            }
        }
    }

    fn apply_debug_intercepts(
        &mut self,
        dispatcher: &dyn ExitDispatcher,
        stepping: bool,
    ) -> Result<(), Error> {
        let vmcs = Vmcs::new(&*self.shared.host, self.handle.id());
        if dispatcher.int3_breakpoints_armed() {
            self.controls.set_exception_intercept(&vmcs, X86_XCPT_BP, true)?;
        }
        if stepping && self.debug.stepping_by_trap_flag {
            self.controls.set_exception_intercept(&vmcs, X86_XCPT_DB, true)?;
        }
        Ok(())
    }

    fn leave_debug_loop(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
        saved: DebugLoopState,
    ) -> Result<(), Error> {
        if self.debug.clear_trap_flag {
            self.import_state(ctx, ContextFlags::RFLAGS, dispatcher.page_tables())?;
            ctx.rflags &= !X86_EFL_TF;
            self.changed |= ContextFlags::RFLAGS;
            self.debug.clear_trap_flag = false;
        }
        self.debug.stepping_by_trap_flag = false;

        let vmcs = Vmcs::new(&*self.shared.host, self.handle.id());
        if self.controls.proc != saved.proc {
            vmcs.write(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, saved.proc)?;
            self.controls.proc = saved.proc;
        }
        if self.controls.exception_bitmap != saved.exception_bitmap {
            vmcs.write(vmcs::control::EXCEPTION_BITMAP, saved.exception_bitmap)?;
            self.controls.exception_bitmap = saved.exception_bitmap;
        }
        // The debug registers are loaded again for the normal loop.
        self.changed |= ContextFlags::DR_MASK;
        Ok(())
    }

    /// Gets the vCPU ready for entry. Returns a status when the guest must
    /// not be entered.
    fn prerun(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<Option<RunStatus>, Error> {
        if let Some(status) = dispatcher.force_flags(ctx) {
            return Ok(Some(status));
        }
        if !dispatcher.a20_enabled() {
            log::trace!("A20 is disabled, rescheduling");
            return Ok(Some(RunStatus::RescheduleToInterpreter));
        }

        // A queued event keeps its place until it is delivered or returned.
        if self.pending_event.is_none() {
            self.pending_event = match dispatcher.take_trap() {
                Some(trap) => Some(PendingEvent::from_trap(&trap)),
                None => dispatcher.evaluate_pending(ctx),
            };
        }
        let injected = self.inject_pending_event(ctx, dispatcher)?;

        if self.export_state(ctx, dispatcher)? == ExportOutcome::Reschedule {
            return Ok(Some(RunStatus::RescheduleToInterpreter));
        }
        if injected {
            self.pending_event = None;
        }
        Ok(None)
    }

    /// Writes the pending event into the VM-entry fields, or asks for an
    /// exit as soon as the guest can take it.
    ///
    /// See: 27.6 Event Injection
    fn inject_pending_event(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<bool, Error> {
        let shared = Arc::clone(&self.shared);
        let vmcs = Vmcs::new(&*shared.host, self.handle.id());
        let interrupt_window = PrimaryControls::INTERRUPT_WINDOW_EXITING.bits();
        let nmi_window = PrimaryControls::NMI_WINDOW_EXITING.bits();

        let Some(event) = self.pending_event else {
            self.controls.set_proc_bits(&vmcs, interrupt_window | nmi_window, false)?;
            return Ok(false);
        };

        self.import_state(
            ctx,
            ContextFlags::RFLAGS | ContextFlags::XCPT_MASK,
            dispatcher.page_tables(),
        )?;
        let shadowed = (ctx.interruptibility & (BLOCK_STI | BLOCK_MOVSS)) != 0;
        if event.is_maskable() && ((ctx.rflags & X86_EFL_IF) == 0 || shadowed) {
            log::trace!("Interrupt {:#x} waits for a window", event.vector());
            self.controls.set_proc_bits(&vmcs, interrupt_window, true)?;
            return Ok(false);
        }
        if event.kind() == InterruptionType::Nmi
            && ((ctx.interruptibility & BLOCK_NMI) != 0 || shadowed)
        {
            if self.caps.proc.permits(nmi_window) {
                self.controls.set_proc_bits(&vmcs, nmi_window, true)?;
            }
            return Ok(false);
        }

        vmcs.write(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.interruption_info)?;
        if let Some(error_code) = event.error_code {
            vmcs.write(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code)?;
        }
        if event.is_software() {
            vmcs.write(vmcs::control::VMENTRY_INSTRUCTION_LEN, event.instruction_len)?;
        }
        if event.vector() == X86_XCPT_PF && event.kind() == InterruptionType::HardwareException {
            ctx.cr2 = event.fault_address;
            self.changed |= ContextFlags::CR2;
        }
        self.controls.set_proc_bits(&vmcs, interrupt_window | nmi_window, false)?;
        Ok(true)
    }

    /// Enters the guest once and synchronizes the TPR shadow.
    fn run_once(&mut self, dispatcher: &mut dyn ExitDispatcher) -> Result<(), Error> {
        let host = &*self.shared.host;
        let id = self.handle.id();

        let result = if self.shared.features.run_until {
            host.run_until(id, self.shared.config.run_deadline)
        } else {
            host.run(id)
        };
        if let Err(status) = result {
            log::error!("{:#x?}", VmcsDump::new(host, id));
            return Err(Error::HostApi {
                op: "hv_vcpu_run",
                status,
            });
        }

        if self.controls.uses_tpr_shadow() {
            let tpr = host.read_register(id, HvRegister::Tpr).field("TPR")? as u8;
            if tpr != self.guest_tpr {
                dispatcher.apic_set_tpr(tpr);
                self.guest_tpr = tpr;
                self.changed |= ContextFlags::APIC_TPR;
            }
        }
        Ok(())
    }

    /// Reads the exit, imports the full state, and settles what the engine
    /// owns. Everything else goes to the dispatcher.
    fn handle_exit(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
        debug: bool,
    ) -> Result<ExitAction, Error> {
        let host = &*self.shared.host;
        let vmcs = Vmcs::new(host, self.handle.id());

        let raw = vmcs.read32(vmcs::ro::EXIT_REASON)?;
        let basic = raw as u16;
        if (raw & EXIT_REASON_ENTRY_FAILURE) != 0 {
            log::error!("{:#x?}", VmcsDump::new(host, self.handle.id()));
            return Err(Error::EntryFailed { reason: basic });
        }
        let Some(reason) = ExitReason::from_u16(basic) else {
            return Err(Error::UnknownExitReason { reason: basic });
        };

        self.import_state(ctx, ContextFlags::ALL, dispatcher.page_tables())?;
        let info = ExitInfo::read(&vmcs, reason)?;
        log::trace!("{:?} at {:#x}", info.reason, ctx.rip);

        match reason {
            ExitReason::EptViolation => {
                if let Some(page_manager) = dispatcher.page_manager() {
                    let resolution = self
                        .shared
                        .mapper
                        .resolve_ept_violation(&info.ept_violation(), page_manager)?;
                    if resolution == EptResolution::Resume {
                        return Ok(ExitAction::Continue);
                    }
                }
            }
            ExitReason::MonitorTrapFlag if debug => {
                return Ok(ExitAction::Return(RunStatus::Stepped));
            }
            ExitReason::ExceptionOrNmi
                if debug
                    && self.debug.stepping_by_trap_flag
                    && info.exception_vector() == Some(X86_XCPT_DB) =>
            {
                return Ok(ExitAction::Return(RunStatus::Stepped));
            }
            // The host interrupted the guest so that force flags get looked at.
            ExitReason::ExternalInterrupt | ExitReason::PreemptionTimer => {
                return Ok(ExitAction::Continue);
            }
            ExitReason::InvalidGuestState | ExitReason::MsrLoading | ExitReason::MachineCheck => {
                log::error!("{:#x?}", VmcsDump::new(host, self.handle.id()));
            }
            ExitReason::ExceptionOrNmi
            | ExitReason::TripleFault
            | ExitReason::InitSignal
            | ExitReason::StartupIpi
            | ExitReason::IoSmi
            | ExitReason::OtherSmi
            | ExitReason::InterruptWindow
            | ExitReason::NmiWindow
            | ExitReason::TaskSwitch
            | ExitReason::Cpuid
            | ExitReason::Getsec
            | ExitReason::Hlt
            | ExitReason::Invd
            | ExitReason::Invlpg
            | ExitReason::Rdpmc
            | ExitReason::Rdtsc
            | ExitReason::Rsm
            | ExitReason::Vmcall
            | ExitReason::Vmclear
            | ExitReason::Vmlaunch
            | ExitReason::Vmptrld
            | ExitReason::Vmptrst
            | ExitReason::Vmread
            | ExitReason::Vmresume
            | ExitReason::Vmwrite
            | ExitReason::Vmxoff
            | ExitReason::Vmxon
            | ExitReason::ControlRegisterAccess
            | ExitReason::MovDr
            | ExitReason::IoInstruction
            | ExitReason::Rdmsr
            | ExitReason::Wrmsr
            | ExitReason::Mwait
            | ExitReason::MonitorTrapFlag
            | ExitReason::Monitor
            | ExitReason::Pause
            | ExitReason::TprBelowThreshold
            | ExitReason::ApicAccess
            | ExitReason::VirtualizedEoi
            | ExitReason::GdtrIdtrAccess
            | ExitReason::LdtrTrAccess
            | ExitReason::EptMisconfig
            | ExitReason::Invept
            | ExitReason::Rdtscp
            | ExitReason::Invvpid
            | ExitReason::Wbinvd
            | ExitReason::Xsetbv
            | ExitReason::ApicWrite
            | ExitReason::Rdrand
            | ExitReason::Invpcid
            | ExitReason::Vmfunc
            | ExitReason::Encls
            | ExitReason::Rdseed
            | ExitReason::PmlFull
            | ExitReason::Xsaves
            | ExitReason::Xrstors
            | ExitReason::SppEvent
            | ExitReason::Umwait
            | ExitReason::Tpause
            | ExitReason::Loadiwkey => {}
        }

        // Leave the window open only as long as something waits for it.
        if matches!(reason, ExitReason::InterruptWindow | ExitReason::NmiWindow)
            && self.pending_event.is_none()
        {
            let bits = (PrimaryControls::INTERRUPT_WINDOW_EXITING
                | PrimaryControls::NMI_WINDOW_EXITING)
                .bits();
            self.controls.set_proc_bits(&vmcs, bits, false)?;
        }
        dispatcher.handle_exit(ctx, &info)
    }
}
