//! The module containing the seam between the engine and the host hypervisor
//! API, and the translation of its status codes.

use core::{marker::PhantomData, time::Duration};
use std::thread::{self, ThreadId};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::hypervisor::{error::Error, page_map::MemoryProtection};

/// The result of a single host call.
pub type HostResult<T> = Result<T, HostStatus>;

/// Raw status codes returned by the host (`hv_return_t`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
enum HvReturn {
    Success = 0,
    Error = 0xfae9_4001,
    Busy = 0xfae9_4002,
    BadArgument = 0xfae9_4003,
    NoResources = 0xfae9_4005,
    NoDevice = 0xfae9_4006,
    Unsupported = 0xfae9_4007,
}

/// A failed host call, classified.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// `HV_ERROR`.
    #[error("invalid state")]
    Error,

    /// `HV_BUSY`.
    #[error("busy")]
    Busy,

    /// `HV_BAD_ARGUMENT`.
    #[error("invalid parameter")]
    BadArgument,

    /// `HV_NO_RESOURCES`.
    #[error("out of resources")]
    NoResources,

    /// `HV_NO_DEVICE`.
    #[error("not found")]
    NoDevice,

    /// `HV_UNSUPPORTED`, also reported for optional entry points the host
    /// does not export.
    #[error("not supported")]
    Unsupported,

    /// A code outside the documented set.
    #[error("unexpected status {0:#x}")]
    Unexpected(u32),
}

impl HostStatus {
    /// Classifies a raw `hv_return_t`.
    pub fn check(raw: u32) -> HostResult<()> {
        match <HvReturn as FromPrimitive>::from_u32(raw) {
            Some(HvReturn::Success) => Ok(()),
            Some(HvReturn::Error) => Err(Self::Error),
            Some(HvReturn::Busy) => Err(Self::Busy),
            Some(HvReturn::BadArgument) => Err(Self::BadArgument),
            Some(HvReturn::NoResources) => Err(Self::NoResources),
            Some(HvReturn::NoDevice) => Err(Self::NoDevice),
            Some(HvReturn::Unsupported) => Err(Self::Unsupported),
            None => Err(Self::Unexpected(raw)),
        }
    }
}

/// Attaches the failed operation or field to a [`HostResult`].
pub(crate) trait HostResultExt<T> {
    /// Reports a failed host call as [`Error::HostApi`].
    fn op(self, op: &'static str) -> Result<T, Error>;

    /// Reports a failed state access as [`Error::StateSync`].
    fn field(self, field: &'static str) -> Result<T, Error>;
}

impl<T> HostResultExt<T> for HostResult<T> {
    fn op(self, op: &'static str) -> Result<T, Error> {
        self.map_err(|status| Error::HostApi { op, status })
    }

    fn field(self, field: &'static str) -> Result<T, Error> {
        self.map_err(|status| Error::StateSync { field, status })
    }
}

/// The host's identifier of a vCPU (`hv_vcpuid_t`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostVcpuId(pub u32);

/// The host's identifier of a guest address space (`hv_vm_space_t`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// The address space every VM starts with.
    pub const DEFAULT: Self = Self(0);
}

/// A user-space address backing guest-physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostAddr(pub usize);

/// Guest access rights of an MSR handled by the host (`hv_msr_flags_t`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::BitOr)]
pub struct MsrAccess(pub u32);

impl MsrAccess {
    /// The guest cannot access the MSR without an exit.
    pub const NONE: Self = Self(0);
    /// The guest may read the MSR.
    pub const READ: Self = Self(1 << 0);
    /// The guest may write the MSR.
    pub const WRITE: Self = Self(1 << 1);
}

/// Guest registers the host exposes directly (`hv_x86_reg_t`).
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HvRegister {
    Rip = 0,
    Rflags,
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    IdtBase,
    IdtLimit,
    GdtBase,
    GdtLimit,
    Ldtr,
    LdtBase,
    LdtLimit,
    LdtAr,
    Tr,
    TssBase,
    TssLimit,
    TssAr,
    Cr0,
    Cr1,
    Cr2,
    Cr3,
    Cr4,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr4,
    Dr5,
    Dr6,
    Dr7,
    Tpr,
    Xcr0,
}

/// VMX capabilities the host reports (`hv_vmx_capability_t`).
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VmxCapability {
    Pinbased = 0,
    Procbased,
    Procbased2,
    Entry,
    Exit,
    Basic,
    TruePinbased,
    TrueProcbased,
    TrueEntry,
    TrueExit,
    Misc,
    Cr0Fixed0,
    Cr0Fixed1,
    Cr4Fixed0,
    Cr4Fixed1,
    VmcsEnum,
    EptVpidCap,
    PreemptionTimer = 32,
}

/// Host MSR values the host reports (`hv_vmx_msr_info_t`).
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsrInfo {
    ArchCapabilities = 0,
    PerfCapabilities,
}

/// Which optional host entry points exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct HostFeatures {
    /// `hv_vm_space_*`, `hv_vm_*_space` and `hv_vcpu_set_space`.
    pub address_spaces: bool,
    /// `hv_vcpu_run_until`.
    pub run_until: bool,
    /// `hv_vmx_get_msr_info`.
    pub msr_info: bool,
    /// `hv_vcpu_enable_managed_msr` and `hv_vcpu_set_msr_access`.
    pub managed_msrs: bool,
    /// `hv_vcpu_get_exec_time`.
    pub exec_time: bool,
    /// `hv_vmx_vcpu_get_cap_write_vmcs`.
    pub cap_write_vmcs: bool,
}

impl HostFeatures {
    /// Applies the dependencies between entry points.
    ///
    /// Deadline-bound runs are only trusted on hosts that also report MSR
    /// information, as older hosts mis-handle the deadline.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if !self.msr_info {
            self.run_until = false;
        }
        self
    }
}

/// The host hypervisor API.
///
/// The methods mirror the host's entry points one to one. Optional entry
/// points default to [`HostStatus::Unsupported`], and [`HostApi::features`]
/// reports which of them exist. Calls taking a [`HostVcpuId`] must be made
/// on the thread that created that vCPU.
pub trait HostApi: Send + Sync {
    /// Returns which optional entry points exist.
    fn features(&self) -> HostFeatures;

    /// Creates the VM of this process.
    fn vm_create(&self) -> HostResult<()>;

    /// Destroys the VM of this process.
    fn vm_destroy(&self) -> HostResult<()>;

    /// Creates an additional guest address space.
    fn vm_space_create(&self) -> HostResult<SpaceId> {
        Err(HostStatus::Unsupported)
    }

    /// Destroys an address space created by [`HostApi::vm_space_create`].
    fn vm_space_destroy(&self, _space: SpaceId) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Maps `len` bytes at `backing` to `gpa` in the default address space.
    fn vm_map(
        &self,
        backing: HostAddr,
        gpa: u64,
        len: u64,
        prot: MemoryProtection,
    ) -> HostResult<()>;

    /// Unmaps a range of the default address space.
    fn vm_unmap(&self, gpa: u64, len: u64) -> HostResult<()>;

    /// Changes the protection of a range of the default address space.
    fn vm_protect(&self, gpa: u64, len: u64, prot: MemoryProtection) -> HostResult<()>;

    /// Maps `len` bytes at `backing` to `gpa` in `space`.
    fn vm_map_space(
        &self,
        _space: SpaceId,
        _backing: HostAddr,
        _gpa: u64,
        _len: u64,
        _prot: MemoryProtection,
    ) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Unmaps a range of `space`.
    fn vm_unmap_space(&self, _space: SpaceId, _gpa: u64, _len: u64) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Changes the protection of a range of `space`.
    fn vm_protect_space(
        &self,
        _space: SpaceId,
        _gpa: u64,
        _len: u64,
        _prot: MemoryProtection,
    ) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Sets the TSC of every vCPU of the VM.
    fn vm_sync_tsc(&self, tsc: u64) -> HostResult<()>;

    /// Creates a vCPU owned by the calling thread.
    fn vcpu_create(&self) -> HostResult<HostVcpuId>;

    /// Destroys a vCPU.
    fn vcpu_destroy(&self, vcpu: HostVcpuId) -> HostResult<()>;

    /// Attaches a vCPU to an address space.
    fn vcpu_set_space(&self, _vcpu: HostVcpuId, _space: SpaceId) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Reads a guest register.
    fn read_register(&self, vcpu: HostVcpuId, reg: HvRegister) -> HostResult<u64>;

    /// Writes a guest register.
    fn write_register(&self, vcpu: HostVcpuId, reg: HvRegister, value: u64) -> HostResult<()>;

    /// Reads the guest FPU/XSAVE area.
    fn read_fpstate(&self, vcpu: HostVcpuId, buffer: &mut [u8]) -> HostResult<()>;

    /// Writes the guest FPU/XSAVE area.
    fn write_fpstate(&self, vcpu: HostVcpuId, buffer: &[u8]) -> HostResult<()>;

    /// Lets the guest access an MSR without exiting.
    fn enable_native_msr(&self, vcpu: HostVcpuId, msr: u32, enable: bool) -> HostResult<()>;

    /// Lets the host keep a guest copy of an MSR.
    fn enable_managed_msr(&self, _vcpu: HostVcpuId, _msr: u32, _enable: bool) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Sets the guest access rights of a managed MSR.
    fn set_msr_access(&self, _vcpu: HostVcpuId, _msr: u32, _access: MsrAccess) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Reads the guest value of an MSR.
    fn read_msr(&self, vcpu: HostVcpuId, msr: u32) -> HostResult<u64>;

    /// Writes the guest value of an MSR.
    fn write_msr(&self, vcpu: HostVcpuId, msr: u32, value: u64) -> HostResult<()>;

    /// Forces the host to commit cached guest state.
    fn flush(&self, vcpu: HostVcpuId) -> HostResult<()>;

    /// Invalidates the guest TLB.
    fn invalidate_tlb(&self, vcpu: HostVcpuId) -> HostResult<()>;

    /// Runs the guest until the next exit.
    fn run(&self, vcpu: HostVcpuId) -> HostResult<()>;

    /// Runs the guest until the next exit or until `timeout` elapses.
    fn run_until(&self, _vcpu: HostVcpuId, _timeout: Duration) -> HostResult<()> {
        Err(HostStatus::Unsupported)
    }

    /// Forces a running vCPU to exit. Callable from any thread.
    fn interrupt(&self, vcpu: HostVcpuId) -> HostResult<()>;

    /// Returns the accumulated guest execution time in nanoseconds.
    fn exec_time(&self, _vcpu: HostVcpuId) -> HostResult<u64> {
        Err(HostStatus::Unsupported)
    }

    /// Reads a VMX capability.
    fn read_capability(&self, cap: VmxCapability) -> HostResult<u64>;

    /// Reads a VMCS field.
    fn vmcs_read(&self, vcpu: HostVcpuId, field: u32) -> HostResult<u64>;

    /// Writes a VMCS field.
    fn vmcs_write(&self, vcpu: HostVcpuId, field: u32, value: u64) -> HostResult<()>;

    /// Sets the guest-physical address of the virtual APIC page.
    fn set_apic_address(&self, vcpu: HostVcpuId, gpa: u64) -> HostResult<()>;

    /// Reads a host MSR value relevant to guests.
    fn msr_info(&self, _info: MsrInfo) -> HostResult<u64> {
        Err(HostStatus::Unsupported)
    }

    /// Returns the bits of a VMCS field that must be 0 and may be 1 when
    /// written by the caller.
    fn cap_write_vmcs(&self, _vcpu: HostVcpuId, _field: u32) -> HostResult<(u64, u64)> {
        Err(HostStatus::Unsupported)
    }
}

/// A vCPU handle, tied to the thread that created it.
///
/// The host only accepts calls for a vCPU from its creating thread, so the
/// handle is neither `Send` nor `Sync`, and every operation re-checks the
/// calling thread.
#[derive(Debug)]
pub struct VcpuHandle {
    id: HostVcpuId,
    index: u32,
    owner: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl VcpuHandle {
    pub(crate) fn new(id: HostVcpuId, index: u32) -> Self {
        Self {
            id,
            index,
            owner: thread::current().id(),
            _not_send: PhantomData,
        }
    }

    /// The host's identifier of this vCPU.
    pub fn id(&self) -> HostVcpuId {
        self.id
    }

    /// The emulator's index of this vCPU.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Fails unless called on the creating thread.
    pub fn assert_owner(&self) -> Result<(), Error> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(Error::WrongThread { vcpu: self.index })
        }
    }
}
