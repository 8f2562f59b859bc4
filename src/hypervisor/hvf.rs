//! The module containing the [`HostApi`] implementation over
//! Hypervisor.framework on Intel Macs.

use core::{ffi::c_void, time::Duration};

use crate::hypervisor::{
    host_api::{
        HostAddr, HostApi, HostFeatures, HostResult, HostStatus, HostVcpuId, HvRegister, MsrAccess,
        MsrInfo, SpaceId, VmxCapability,
    },
    page_map::MemoryProtection,
};

const HV_VM_DEFAULT: u64 = 0;
const HV_VCPU_DEFAULT: u64 = 0;

#[repr(C)]
#[derive(Default)]
struct MachTimebaseInfo {
    numer: u32,
    denom: u32,
}

#[link(name = "Hypervisor", kind = "framework")]
unsafe extern "C" {
    fn hv_vm_create(flags: u64) -> u32;
    fn hv_vm_destroy() -> u32;
    fn hv_vm_space_create(asid: *mut u32) -> u32;
    fn hv_vm_space_destroy(asid: u32) -> u32;
    fn hv_vm_map(uva: *const c_void, gpa: u64, size: usize, flags: u64) -> u32;
    fn hv_vm_unmap(gpa: u64, size: usize) -> u32;
    fn hv_vm_protect(gpa: u64, size: usize, flags: u64) -> u32;
    fn hv_vm_map_space(asid: u32, uva: *const c_void, gpa: u64, size: usize, flags: u64) -> u32;
    fn hv_vm_unmap_space(asid: u32, gpa: u64, size: usize) -> u32;
    fn hv_vm_protect_space(asid: u32, gpa: u64, size: usize, flags: u64) -> u32;
    fn hv_vm_sync_tsc(tsc: u64) -> u32;

    fn hv_vcpu_create(vcpu: *mut u32, flags: u64) -> u32;
    fn hv_vcpu_destroy(vcpu: u32) -> u32;
    fn hv_vcpu_set_space(vcpu: u32, asid: u32) -> u32;
    fn hv_vcpu_read_register(vcpu: u32, reg: u32, value: *mut u64) -> u32;
    fn hv_vcpu_write_register(vcpu: u32, reg: u32, value: u64) -> u32;
    fn hv_vcpu_read_fpstate(vcpu: u32, buffer: *mut c_void, size: usize) -> u32;
    fn hv_vcpu_write_fpstate(vcpu: u32, buffer: *const c_void, size: usize) -> u32;
    fn hv_vcpu_enable_native_msr(vcpu: u32, msr: u32, enable: bool) -> u32;
    fn hv_vcpu_enable_managed_msr(vcpu: u32, msr: u32, enable: bool) -> u32;
    fn hv_vcpu_set_msr_access(vcpu: u32, msr: u32, flags: u32) -> u32;
    fn hv_vcpu_read_msr(vcpu: u32, msr: u32, value: *mut u64) -> u32;
    fn hv_vcpu_write_msr(vcpu: u32, msr: u32, value: u64) -> u32;
    fn hv_vcpu_flush(vcpu: u32) -> u32;
    fn hv_vcpu_invalidate_tlb(vcpu: u32) -> u32;
    fn hv_vcpu_run(vcpu: u32) -> u32;
    fn hv_vcpu_run_until(vcpu: u32, deadline: u64) -> u32;
    fn hv_vcpu_interrupt(vcpus: *const u32, vcpu_count: u32) -> u32;
    fn hv_vcpu_get_exec_time(vcpu: u32, time: *mut u64) -> u32;

    fn hv_vmx_read_capability(field: u32, value: *mut u64) -> u32;
    fn hv_vmx_vcpu_read_vmcs(vcpu: u32, field: u32, value: *mut u64) -> u32;
    fn hv_vmx_vcpu_write_vmcs(vcpu: u32, field: u32, value: u64) -> u32;
    fn hv_vmx_vcpu_set_apic_address(vcpu: u32, gpa: u64) -> u32;
    fn hv_vmx_get_msr_info(field: u32, value: *mut u64) -> u32;
    fn hv_vmx_vcpu_get_cap_write_vmcs(
        vcpu: u32,
        field: u32,
        allowed_0: *mut u64,
        allowed_1: *mut u64,
    ) -> u32;
}

unsafe extern "C" {
    fn mach_absolute_time() -> u64;
    fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
}

/// Hypervisor.framework.
///
/// The framework is linked as a whole, so the embedder states which of the
/// optional entry points the running OS release provides.
#[derive(Debug)]
pub struct Hvf {
    features: HostFeatures,
    timebase: (u32, u32),
}

impl Hvf {
    /// Binds to the framework, using the optional entry points in
    /// `features`.
    pub fn new(features: HostFeatures) -> Self {
        let mut info = MachTimebaseInfo::default();
        // Safety: `info` is a valid out-pointer for the duration of the call.
        let kr = unsafe { mach_timebase_info(&raw mut info) };
        let timebase = if kr == 0 && info.numer != 0 && info.denom != 0 {
            (info.numer, info.denom)
        } else {
            log::warn!("mach_timebase_info failed ({kr}), assuming nanosecond ticks");
            (1, 1)
        };
        Self { features, timebase }
    }

    /// Converts a timeout into an absolute deadline in mach ticks.
    fn deadline(&self, timeout: Duration) -> u64 {
        let (numer, denom) = self.timebase;
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let ticks = u128::from(nanos) * u128::from(denom) / u128::from(numer);
        // Safety: no preconditions.
        let now = unsafe { mach_absolute_time() };
        now.saturating_add(u64::try_from(ticks).unwrap_or(u64::MAX))
    }
}

fn optional(available: bool) -> HostResult<()> {
    if available {
        Ok(())
    } else {
        Err(HostStatus::Unsupported)
    }
}

fn len(len: u64) -> HostResult<usize> {
    usize::try_from(len).map_err(|_| HostStatus::BadArgument)
}

fn memory_flags(prot: MemoryProtection) -> u64 {
    u64::from(prot.bits())
}

// Every call below passes plain values or pointers to locals and buffers that
// outlive the call, which is all the framework requires.
#[allow(clippy::undocumented_unsafe_blocks)]
impl HostApi for Hvf {
    fn features(&self) -> HostFeatures {
        self.features
    }

    fn vm_create(&self) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vm_create(HV_VM_DEFAULT) })
    }

    fn vm_destroy(&self) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vm_destroy() })
    }

    fn vm_space_create(&self) -> HostResult<SpaceId> {
        optional(self.features.address_spaces)?;
        let mut asid = 0;
        HostStatus::check(unsafe { hv_vm_space_create(&raw mut asid) })?;
        Ok(SpaceId(asid))
    }

    fn vm_space_destroy(&self, space: SpaceId) -> HostResult<()> {
        optional(self.features.address_spaces)?;
        HostStatus::check(unsafe { hv_vm_space_destroy(space.0) })
    }

    fn vm_map(
        &self,
        backing: HostAddr,
        gpa: u64,
        size: u64,
        prot: MemoryProtection,
    ) -> HostResult<()> {
        let size = len(size)?;
        let uva = backing.0 as *const c_void;
        HostStatus::check(unsafe { hv_vm_map(uva, gpa, size, memory_flags(prot)) })
    }

    fn vm_unmap(&self, gpa: u64, size: u64) -> HostResult<()> {
        let size = len(size)?;
        HostStatus::check(unsafe { hv_vm_unmap(gpa, size) })
    }

    fn vm_protect(&self, gpa: u64, size: u64, prot: MemoryProtection) -> HostResult<()> {
        let size = len(size)?;
        HostStatus::check(unsafe { hv_vm_protect(gpa, size, memory_flags(prot)) })
    }

    fn vm_map_space(
        &self,
        space: SpaceId,
        backing: HostAddr,
        gpa: u64,
        size: u64,
        prot: MemoryProtection,
    ) -> HostResult<()> {
        optional(self.features.address_spaces)?;
        let size = len(size)?;
        let uva = backing.0 as *const c_void;
        HostStatus::check(unsafe { hv_vm_map_space(space.0, uva, gpa, size, memory_flags(prot)) })
    }

    fn vm_unmap_space(&self, space: SpaceId, gpa: u64, size: u64) -> HostResult<()> {
        optional(self.features.address_spaces)?;
        let size = len(size)?;
        HostStatus::check(unsafe { hv_vm_unmap_space(space.0, gpa, size) })
    }

    fn vm_protect_space(
        &self,
        space: SpaceId,
        gpa: u64,
        size: u64,
        prot: MemoryProtection,
    ) -> HostResult<()> {
        optional(self.features.address_spaces)?;
        let size = len(size)?;
        HostStatus::check(unsafe { hv_vm_protect_space(space.0, gpa, size, memory_flags(prot)) })
    }

    fn vm_sync_tsc(&self, tsc: u64) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vm_sync_tsc(tsc) })
    }

    fn vcpu_create(&self) -> HostResult<HostVcpuId> {
        let mut vcpu = 0;
        HostStatus::check(unsafe { hv_vcpu_create(&raw mut vcpu, HV_VCPU_DEFAULT) })?;
        Ok(HostVcpuId(vcpu))
    }

    fn vcpu_destroy(&self, vcpu: HostVcpuId) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_destroy(vcpu.0) })
    }

    fn vcpu_set_space(&self, vcpu: HostVcpuId, space: SpaceId) -> HostResult<()> {
        optional(self.features.address_spaces)?;
        HostStatus::check(unsafe { hv_vcpu_set_space(vcpu.0, space.0) })
    }

    fn read_register(&self, vcpu: HostVcpuId, reg: HvRegister) -> HostResult<u64> {
        let mut value = 0;
        HostStatus::check(unsafe { hv_vcpu_read_register(vcpu.0, reg as u32, &raw mut value) })?;
        Ok(value)
    }

    fn write_register(&self, vcpu: HostVcpuId, reg: HvRegister, value: u64) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_write_register(vcpu.0, reg as u32, value) })
    }

    fn read_fpstate(&self, vcpu: HostVcpuId, buffer: &mut [u8]) -> HostResult<()> {
        HostStatus::check(unsafe {
            hv_vcpu_read_fpstate(vcpu.0, buffer.as_mut_ptr().cast(), buffer.len())
        })
    }

    fn write_fpstate(&self, vcpu: HostVcpuId, buffer: &[u8]) -> HostResult<()> {
        HostStatus::check(unsafe {
            hv_vcpu_write_fpstate(vcpu.0, buffer.as_ptr().cast(), buffer.len())
        })
    }

    fn enable_native_msr(&self, vcpu: HostVcpuId, msr: u32, enable: bool) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_enable_native_msr(vcpu.0, msr, enable) })
    }

    fn enable_managed_msr(&self, vcpu: HostVcpuId, msr: u32, enable: bool) -> HostResult<()> {
        optional(self.features.managed_msrs)?;
        HostStatus::check(unsafe { hv_vcpu_enable_managed_msr(vcpu.0, msr, enable) })
    }

    fn set_msr_access(&self, vcpu: HostVcpuId, msr: u32, access: MsrAccess) -> HostResult<()> {
        optional(self.features.managed_msrs)?;
        HostStatus::check(unsafe { hv_vcpu_set_msr_access(vcpu.0, msr, access.0) })
    }

    fn read_msr(&self, vcpu: HostVcpuId, msr: u32) -> HostResult<u64> {
        let mut value = 0;
        HostStatus::check(unsafe { hv_vcpu_read_msr(vcpu.0, msr, &raw mut value) })?;
        Ok(value)
    }

    fn write_msr(&self, vcpu: HostVcpuId, msr: u32, value: u64) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_write_msr(vcpu.0, msr, value) })
    }

    fn flush(&self, vcpu: HostVcpuId) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_flush(vcpu.0) })
    }

    fn invalidate_tlb(&self, vcpu: HostVcpuId) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_invalidate_tlb(vcpu.0) })
    }

    fn run(&self, vcpu: HostVcpuId) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vcpu_run(vcpu.0) })
    }

    fn run_until(&self, vcpu: HostVcpuId, timeout: Duration) -> HostResult<()> {
        optional(self.features.run_until)?;
        let deadline = self.deadline(timeout);
        HostStatus::check(unsafe { hv_vcpu_run_until(vcpu.0, deadline) })
    }

    fn interrupt(&self, vcpu: HostVcpuId) -> HostResult<()> {
        let vcpus = [vcpu.0];
        HostStatus::check(unsafe { hv_vcpu_interrupt(vcpus.as_ptr(), 1) })
    }

    fn exec_time(&self, vcpu: HostVcpuId) -> HostResult<u64> {
        optional(self.features.exec_time)?;
        let mut time = 0;
        HostStatus::check(unsafe { hv_vcpu_get_exec_time(vcpu.0, &raw mut time) })?;
        Ok(time)
    }

    fn read_capability(&self, cap: VmxCapability) -> HostResult<u64> {
        let mut value = 0;
        HostStatus::check(unsafe { hv_vmx_read_capability(cap as u32, &raw mut value) })?;
        Ok(value)
    }

    fn vmcs_read(&self, vcpu: HostVcpuId, field: u32) -> HostResult<u64> {
        let mut value = 0;
        HostStatus::check(unsafe { hv_vmx_vcpu_read_vmcs(vcpu.0, field, &raw mut value) })?;
        Ok(value)
    }

    fn vmcs_write(&self, vcpu: HostVcpuId, field: u32, value: u64) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vmx_vcpu_write_vmcs(vcpu.0, field, value) })
    }

    fn set_apic_address(&self, vcpu: HostVcpuId, gpa: u64) -> HostResult<()> {
        HostStatus::check(unsafe { hv_vmx_vcpu_set_apic_address(vcpu.0, gpa) })
    }

    fn msr_info(&self, info: MsrInfo) -> HostResult<u64> {
        optional(self.features.msr_info)?;
        let mut value = 0;
        HostStatus::check(unsafe { hv_vmx_get_msr_info(info as u32, &raw mut value) })?;
        Ok(value)
    }

    fn cap_write_vmcs(&self, vcpu: HostVcpuId, field: u32) -> HostResult<(u64, u64)> {
        optional(self.features.cap_write_vmcs)?;
        let (mut allowed0, mut allowed1) = (0, 0);
        HostStatus::check(unsafe {
            hv_vmx_vcpu_get_cap_write_vmcs(vcpu.0, field, &raw mut allowed0, &raw mut allowed1)
        })?;
        Ok((allowed0, allowed1))
    }
}
