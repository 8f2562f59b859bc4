//! The module containing the event waiting to be injected into a guest, and
//! its conversion from and to the emulator's trap representation.
//!
//! See: 27.6 Event Injection

use bit_field::BitField;

/// The kind of a trap as the emulator tracks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    /// A CPU exception.
    Exception,
    /// An interrupt from a device, or an NMI when the vector is 2.
    HardwareInterrupt,
    /// An `INT n` instruction.
    SoftwareInterrupt,
}

/// A trap the emulator wants delivered to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapEvent {
    /// The vector.
    pub vector: u8,
    /// How the trap was raised.
    pub kind: TrapKind,
    /// The error code, for exceptions that push one.
    pub error_code: Option<u32>,
    /// The faulting address, for page faults.
    pub fault_address: u64,
    /// The length of the instruction raising a software interrupt or
    /// exception.
    pub instruction_len: u32,
}

/// The interruption type of an event, bits 10:8 of the interruption
/// information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptionType {
    /// External interrupt.
    External = 0,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Hardware exception.
    HardwareException = 3,
    /// Software interrupt (`INT n`).
    SoftwareInterrupt = 4,
    /// Privileged software exception (`INT1`).
    PrivilegedSoftwareException = 5,
    /// Software exception (`INT3`, `INTO`).
    SoftwareException = 6,
    /// Other event, such as an MTF exit pending.
    Other = 7,
}

impl InterruptionType {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::External,
            2 => Self::Nmi,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::Other,
        }
    }
}

const X86_XCPT_DB: u8 = 1;
const X86_XCPT_NMI: u8 = 2;
const X86_XCPT_BP: u8 = 3;
const X86_XCPT_OF: u8 = 4;
const X86_XCPT_DF: u8 = 8;
const X86_XCPT_TS: u8 = 10;
const X86_XCPT_NP: u8 = 11;
const X86_XCPT_SS: u8 = 12;
const X86_XCPT_GP: u8 = 13;
const X86_XCPT_PF: u8 = 14;
const X86_XCPT_AC: u8 = 17;

const VALID: usize = 31;
const ERROR_CODE_VALID: usize = 11;

/// An event waiting for VM-entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    /// The VM-entry interruption-information field.
    pub interruption_info: u32,
    /// The error code, delivered when bit 11 of the information is set.
    pub error_code: Option<u32>,
    /// The instruction length for software events.
    pub instruction_len: u32,
    /// The faulting address for page faults.
    pub fault_address: u64,
}

impl PendingEvent {
    /// Builds an event of `kind` for `vector`.
    pub fn new(vector: u8, kind: InterruptionType, error_code: Option<u32>) -> Self {
        let info = *0u32
            .set_bits(0..8, u32::from(vector))
            .set_bits(8..11, kind as u32)
            .set_bit(ERROR_CODE_VALID, error_code.is_some())
            .set_bit(VALID, true);
        Self {
            interruption_info: info,
            error_code,
            instruction_len: 0,
            fault_address: 0,
        }
    }

    /// Converts a trap of the emulator.
    pub fn from_trap(trap: &TrapEvent) -> Self {
        let kind = match trap.kind {
            TrapKind::HardwareInterrupt if trap.vector == X86_XCPT_NMI => InterruptionType::Nmi,
            TrapKind::HardwareInterrupt => InterruptionType::External,
            TrapKind::SoftwareInterrupt => InterruptionType::SoftwareInterrupt,
            TrapKind::Exception => match trap.vector {
                X86_XCPT_BP | X86_XCPT_OF => InterruptionType::SoftwareException,
                X86_XCPT_DB if trap.instruction_len != 0 => {
                    InterruptionType::PrivilegedSoftwareException
                }
                _ => InterruptionType::HardwareException,
            },
        };
        let error_code = if kind == InterruptionType::HardwareException
            && pushes_error_code(trap.vector)
        {
            Some(trap.error_code.unwrap_or(0))
        } else {
            None
        };

        let mut event = Self::new(trap.vector, kind, error_code);
        event.instruction_len = trap.instruction_len;
        if trap.vector == X86_XCPT_PF && kind == InterruptionType::HardwareException {
            event.fault_address = trap.fault_address;
        }
        event
    }

    /// Converts back to a trap of the emulator, for events that did not get
    /// injected before the engine returned.
    pub fn to_trap(&self) -> TrapEvent {
        let kind = match self.kind() {
            InterruptionType::External | InterruptionType::Nmi => TrapKind::HardwareInterrupt,
            InterruptionType::SoftwareInterrupt => TrapKind::SoftwareInterrupt,
            _ => TrapKind::Exception,
        };
        TrapEvent {
            vector: self.vector(),
            kind,
            error_code: self.error_code,
            fault_address: self.fault_address,
            instruction_len: self.instruction_len,
        }
    }

    /// The vector.
    pub fn vector(&self) -> u8 {
        self.interruption_info.get_bits(0..8) as u8
    }

    /// The interruption type.
    pub fn kind(&self) -> InterruptionType {
        InterruptionType::from_bits(self.interruption_info.get_bits(8..11))
    }

    /// Whether the event is blocked by `RFLAGS.IF` and interrupt shadows.
    pub fn is_maskable(&self) -> bool {
        self.kind() == InterruptionType::External
    }

    /// Whether delivering the event needs the instruction length.
    pub fn is_software(&self) -> bool {
        matches!(
            self.kind(),
            InterruptionType::SoftwareInterrupt
                | InterruptionType::SoftwareException
                | InterruptionType::PrivilegedSoftwareException
        )
    }
}

fn pushes_error_code(vector: u8) -> bool {
    matches!(
        vector,
        X86_XCPT_DF
            | X86_XCPT_TS
            | X86_XCPT_NP
            | X86_XCPT_SS
            | X86_XCPT_GP
            | X86_XCPT_PF
            | X86_XCPT_AC
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trap(vector: u8, kind: TrapKind) -> TrapEvent {
        TrapEvent {
            vector,
            kind,
            error_code: None,
            fault_address: 0,
            instruction_len: 0,
        }
    }

    #[test]
    fn page_fault_carries_error_code_and_address() {
        let event = PendingEvent::from_trap(&TrapEvent {
            error_code: Some(2),
            fault_address: 0xdead_b000,
            ..trap(14, TrapKind::Exception)
        });
        assert_eq!(event.interruption_info, 0x8000_0b0e);
        assert_eq!(event.error_code, Some(2));
        assert_eq!(event.fault_address, 0xdead_b000);
        assert_eq!(event.to_trap().fault_address, 0xdead_b000);
    }

    #[test]
    fn external_interrupts_and_nmis_are_hardware_interrupts() {
        let event = PendingEvent::from_trap(&trap(0x30, TrapKind::HardwareInterrupt));
        assert_eq!(event.interruption_info, 0x8000_0030);
        assert!(event.is_maskable());

        let event = PendingEvent::from_trap(&trap(2, TrapKind::HardwareInterrupt));
        assert_eq!(event.kind(), InterruptionType::Nmi);
        assert!(!event.is_maskable());
        assert_eq!(event.to_trap().kind, TrapKind::HardwareInterrupt);
    }

    #[test]
    fn breakpoints_are_software_exceptions() {
        let event = PendingEvent::from_trap(&TrapEvent {
            instruction_len: 1,
            ..trap(3, TrapKind::Exception)
        });
        assert_eq!(event.kind(), InterruptionType::SoftwareException);
        assert!(event.is_software());
        assert_eq!(event.error_code, None);
        assert_eq!(event.to_trap().kind, TrapKind::Exception);
    }

    #[test]
    fn software_interrupts_keep_their_length() {
        let event = PendingEvent::from_trap(&TrapEvent {
            instruction_len: 2,
            ..trap(0x80, TrapKind::SoftwareInterrupt)
        });
        assert_eq!(event.kind(), InterruptionType::SoftwareInterrupt);
        let back = event.to_trap();
        assert_eq!(back.kind, TrapKind::SoftwareInterrupt);
        assert_eq!(back.instruction_len, 2);
        assert_eq!(back.vector, 0x80);
    }

    #[test]
    fn general_protection_gets_a_zero_error_code_by_default() {
        let event = PendingEvent::from_trap(&trap(13, TrapKind::Exception));
        assert_eq!(event.error_code, Some(0));
        assert!(event.interruption_info.get_bit(ERROR_CODE_VALID));
    }
}
