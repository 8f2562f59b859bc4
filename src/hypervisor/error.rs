use crate::hypervisor::{controls::ControlCategory, host_api::HostStatus, page_map::MappingError};

/// Errors the execution engine reports to its callers.
///
/// Every variant names the operation, field or control category involved, so
/// that a failure is actionable without looking up raw VMX status codes.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A host hypervisor API call failed.
    #[error("`{op}` failed: {status}")]
    HostApi {
        /// The host call that was attempted.
        op: &'static str,
        /// The status the host returned.
        status: HostStatus,
    },

    /// A control the engine needs cannot be set on this processor.
    #[error(
        "{category} controls {requested:#x} are not supported (allowed0 {allowed0:#x}, allowed1 {allowed1:#x})"
    )]
    UnsupportedConfiguration {
        /// The control field that could not be satisfied.
        category: ControlCategory,
        /// The value the engine wanted to commit.
        requested: u32,
        /// Bits the processor requires to be set.
        allowed0: u32,
        /// Bits the processor allows to be set.
        allowed1: u32,
    },

    /// The host processor reports a capability pair that cannot be right.
    #[error("{category} capability reports allowed0 {allowed0:#x} outside allowed1 {allowed1:#x}")]
    InvalidCapabilities {
        /// The control field whose capability is broken.
        category: ControlCategory,
        /// Bits reported as mandatory.
        allowed0: u32,
        /// Bits reported as permitted.
        allowed1: u32,
    },

    /// Last branch records were requested on a processor with no known MSR layout.
    #[error("no last branch record layout is known for CPU family {family:#x} model {model:#x}")]
    UnknownHostCpu {
        /// The host CPU family.
        family: u8,
        /// The host CPU model.
        model: u8,
    },

    /// The last branch record stack of the host is deeper than the engine tracks.
    #[error("last branch record stack of {count} entries exceeds {max}")]
    LbrStackOverflow {
        /// The number of entries on the host.
        count: u32,
        /// The maximum number of entries tracked.
        max: u32,
    },

    /// Reading or writing guest state failed.
    #[error("could not access `{field}`: {status}")]
    StateSync {
        /// The register, field or MSR being accessed.
        field: &'static str,
        /// The status the host returned.
        status: HostStatus,
    },

    /// Mapping, unmapping or protecting guest-physical memory failed.
    #[error("could not update the mapping of {gpa:#x} ({len:#x} bytes): {reason}")]
    Mapping {
        /// The start of the range.
        gpa: u64,
        /// The size of the range in bytes.
        len: u64,
        /// Why the transition failed.
        reason: MappingError,
    },

    /// The processor refused to enter the guest.
    #[error("VM-entry failed with basic exit reason {reason}")]
    EntryFailed {
        /// The basic exit reason reported with the failure.
        reason: u16,
    },

    /// The processor reported an exit reason the engine does not know.
    #[error("unknown VM-exit reason {reason}")]
    UnknownExitReason {
        /// The raw basic exit reason.
        reason: u16,
    },

    /// A vCPU was used from a thread other than the one that created it.
    #[error("vCPU {vcpu} was used from a thread that does not own it")]
    WrongThread {
        /// The emulator's index of the vCPU.
        vcpu: u32,
    },

    /// A collaborator of the engine (page-table manager, emulator) failed.
    #[error("{what} failed")]
    External {
        /// What the collaborator was asked to do.
        what: &'static str,
    },
}
