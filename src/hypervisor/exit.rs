//! The module containing VM-exit reasons, the information read on each exit,
//! and the seam through which the engine hands exits to the emulator.
//!
//! See: Appendix C VMX Basic Exit Reasons

use num_derive::FromPrimitive;
use x86::vmx::vmcs;

use crate::hypervisor::{
    context::{CpuContext, PageTableManager},
    error::Error,
    events::{PendingEvent, TrapEvent},
    page_map::{EptViolation, PageManager},
    vmcs::Vmcs,
};

/// The basic exit reason, bits 15:0 of the exit reason field.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccess = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    InvalidGuestState = 33,
    MsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    MachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PmlFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    SppEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

/// Everything the engine reads from the VMCS on an exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    /// The basic exit reason.
    pub reason: ExitReason,
    /// The exit qualification.
    pub qualification: u64,
    /// The guest-physical address, for EPT exits.
    pub guest_physical_address: u64,
    /// The length of the instruction that caused the exit.
    pub instruction_len: u32,
    /// The VM-exit interruption information, for exception and NMI exits.
    pub interruption_info: u32,
    /// The VM-exit interruption error code.
    pub interruption_error_code: u32,
    /// The IDT-vectoring information, set when the exit interrupted the
    /// delivery of an event.
    pub idt_vectoring_info: u32,
    /// The IDT-vectoring error code.
    pub idt_vectoring_error_code: u32,
}

impl ExitInfo {
    pub(crate) fn read(vmcs: &Vmcs<'_>, reason: ExitReason) -> Result<Self, Error> {
        let guest_physical_address = if matches!(
            reason,
            ExitReason::EptViolation | ExitReason::EptMisconfig
        ) {
            vmcs.read(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL)?
        } else {
            0
        };
        Ok(Self {
            reason,
            qualification: vmcs.read(vmcs::ro::EXIT_QUALIFICATION)?,
            guest_physical_address,
            instruction_len: vmcs.read32(vmcs::ro::VMEXIT_INSTRUCTION_LEN)?,
            interruption_info: vmcs.read32(vmcs::ro::VMEXIT_INTERRUPTION_INFO)?,
            interruption_error_code: vmcs.read32(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE)?,
            idt_vectoring_info: vmcs.read32(vmcs::ro::IDT_VECTORING_INFO)?,
            idt_vectoring_error_code: vmcs.read32(vmcs::ro::IDT_VECTORING_ERR_CODE)?,
        })
    }

    /// The EPT violation described by this exit.
    pub fn ept_violation(&self) -> EptViolation {
        EptViolation {
            gpa: self.guest_physical_address,
            qualification: self.qualification,
        }
    }

    /// The vector of the exception or NMI that caused the exit.
    pub fn exception_vector(&self) -> Option<u8> {
        const VALID: u32 = 1 << 31;
        if self.reason == ExitReason::ExceptionOrNmi && (self.interruption_info & VALID) != 0 {
            Some(self.interruption_info as u8)
        } else {
            None
        }
    }
}

/// Why the engine gave control back to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Keep going. Returned when a force flag needs service.
    Success,
    /// The guest halted.
    Halt,
    /// The guest needs the instruction emulator until further notice.
    RescheduleToInterpreter,
    /// A single step completed.
    Stepped,
    /// A breakpoint was hit.
    Breakpoint,
    /// The caller has work to do in ring-3, such as device emulation.
    ReturnToRing3,
    /// Emulate the instruction at RIP, then continue.
    ExecuteInstruction,
}

impl RunStatus {
    /// Returns whether the status asks the emulator to take over execution,
    /// in which case it needs the full guest state.
    pub fn is_em_status(self) -> bool {
        matches!(
            self,
            Self::Halt
                | Self::RescheduleToInterpreter
                | Self::Stepped
                | Self::Breakpoint
                | Self::ExecuteInstruction
        )
    }
}

/// What to do after an exit was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Continue,
    /// Leave the run loop.
    Return(RunStatus),
}

/// The debug registers an external debugger armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HyperDebugRegisters {
    /// DR0 to DR3.
    pub dr: [u64; 4],
    /// DR6.
    pub dr6: u64,
    /// DR7.
    pub dr7: u64,
}

impl HyperDebugRegisters {
    /// Returns whether any breakpoint is enabled.
    pub fn is_armed(&self) -> bool {
        (self.dr7 & 0xff) != 0
    }
}

/// The emulator side of the run loop.
///
/// The engine consults it for pending work before every entry and hands it
/// every exit the engine does not settle itself.
pub trait ExitDispatcher {
    /// Handles an exit. The context owns the whole guest state.
    fn handle_exit(&mut self, ctx: &mut CpuContext, info: &ExitInfo) -> Result<ExitAction, Error>;

    /// The paging code of the emulator.
    fn page_tables(&mut self) -> &mut dyn PageTableManager;

    /// The guest-physical memory manager. EPT violations are forwarded
    /// unresolved when there is none.
    fn page_manager(&mut self) -> Option<&mut dyn PageManager> {
        None
    }

    /// Returns a status when a pending force flag needs the caller before
    /// the next entry.
    fn force_flags(&mut self, _ctx: &CpuContext) -> Option<RunStatus> {
        None
    }

    /// Whether the A20 gate is enabled.
    fn a20_enabled(&self) -> bool {
        true
    }

    /// Whether an interrupt is waiting to be delivered.
    fn interrupt_pending(&self) -> bool {
        false
    }

    /// Takes the trap the emulator wants delivered, if any.
    fn take_trap(&mut self) -> Option<TrapEvent> {
        None
    }

    /// Gives back a trap that was not delivered.
    fn put_trap(&mut self, trap: TrapEvent);

    /// Picks the next interrupt to deliver, if any.
    fn evaluate_pending(&mut self, _ctx: &CpuContext) -> Option<PendingEvent> {
        None
    }

    /// The task-priority register of the local APIC.
    fn apic_tpr(&self) -> u8 {
        0
    }

    /// The guest changed its task-priority register.
    fn apic_set_tpr(&mut self, _tpr: u8) {}

    /// Whether an external debugger is single-stepping the guest.
    fn debugger_stepping(&self) -> bool {
        false
    }

    /// Whether software breakpoints are armed.
    fn int3_breakpoints_armed(&self) -> bool {
        false
    }

    /// The debug registers of an external debugger.
    fn hyper_debug_registers(&self) -> HyperDebugRegisters {
        HyperDebugRegisters::default()
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn undefined_reasons_are_rejected() {
        for reason in [35u16, 38, 42, 65, 70, 0xffff] {
            assert_eq!(ExitReason::from_u16(reason), None, "{reason}");
        }
        assert_eq!(ExitReason::from_u16(48), Some(ExitReason::EptViolation));
        assert_eq!(ExitReason::from_u16(69), Some(ExitReason::Loadiwkey));
    }

    #[test]
    fn em_statuses_want_the_full_state() {
        assert!(RunStatus::Halt.is_em_status());
        assert!(RunStatus::Stepped.is_em_status());
        assert!(!RunStatus::Success.is_em_status());
        assert!(!RunStatus::ReturnToRing3.is_em_status());
    }

    #[test]
    fn exception_vector_needs_a_valid_exception_exit() {
        let info = ExitInfo {
            reason: ExitReason::ExceptionOrNmi,
            qualification: 0,
            guest_physical_address: 0,
            instruction_len: 0,
            interruption_info: 0x8000_0301,
            interruption_error_code: 0,
            idt_vectoring_info: 0,
            idt_vectoring_error_code: 0,
        };
        assert_eq!(info.exception_vector(), Some(1));
        assert_eq!(
            ExitInfo {
                interruption_info: 0x301,
                ..info
            }
            .exception_vector(),
            None
        );
        assert_eq!(
            ExitInfo {
                reason: ExitReason::Hlt,
                ..info
            }
            .exception_vector(),
            None
        );
    }
}
