//! An in-memory host and emulator for unit tests.
//!
//! The host keeps VMCS fields, registers and MSRs in maps, replays scripted
//! exits on `run`, and logs every call that changes state.

use core::time::Duration;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use x86::vmx::vmcs;

use crate::hypervisor::{
    context::{CpuContext, PageTableManager},
    error::Error,
    events::TrapEvent,
    exit::{ExitAction, ExitDispatcher, ExitInfo, ExitReason, RunStatus},
    host_api::{
        HostAddr, HostApi, HostFeatures, HostResult, HostStatus, HostVcpuId, HvRegister, MsrAccess,
        MsrInfo, SpaceId, VmxCapability,
    },
    page_map::{MemoryProtection, PageInfo, PageManager, PageState},
};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the host reports for the next `run`.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockExit {
    pub(crate) reason: u32,
    pub(crate) qualification: u64,
    pub(crate) gpa: u64,
    pub(crate) interruption_info: u32,
    /// Registers the guest changed before exiting.
    pub(crate) registers: Vec<(HvRegister, u64)>,
}

impl MockExit {
    pub(crate) fn new(reason: ExitReason) -> Self {
        Self::raw(reason as u32)
    }

    pub(crate) fn raw(reason: u32) -> Self {
        Self {
            reason,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct State {
    features: HostFeatures,
    capabilities: HashMap<VmxCapability, HostResult<u64>>,
    msr_info: HashMap<MsrInfo, u64>,
    vmcs: HashMap<u32, u64>,
    vmcs_failures: HashMap<u32, HostStatus>,
    registers: HashMap<HvRegister, u64>,
    msrs: HashMap<u32, u64>,
    fpstate: Vec<u8>,
    exits: VecDeque<MockExit>,
    next_vcpu: u32,
    mapping_failure: Option<HostStatus>,
    unmap_failure: Option<HostStatus>,
    space_create_failure: Option<HostStatus>,
    set_space_failure: Option<HostStatus>,
    calls: Vec<String>,
}

/// A host whose state lives in memory.
#[derive(Debug)]
pub(crate) struct MockHost {
    state: Mutex<State>,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        let capabilities = [
            (VmxCapability::Pinbased, 0x0000_007f_0000_0016),
            (VmxCapability::Procbased, 0xfff9_fffe_0401_e172),
            (VmxCapability::Procbased2, 0x00ff_ffff_0000_0000),
            (VmxCapability::Entry, 0x0003_ffff_0000_11ff),
            (VmxCapability::Exit, 0x00ff_ffff_0003_6dff),
            (VmxCapability::Basic, 0x00da_0400_0000_0004),
            (VmxCapability::TruePinbased, 0x0000_007f_0000_0016),
            (VmxCapability::TrueProcbased, 0xfff9_fffe_0401_e172),
            (VmxCapability::TrueEntry, 0x0003_ffff_0000_11ff),
            (VmxCapability::TrueExit, 0x00ff_ffff_0003_6dff),
            (VmxCapability::Misc, 0x7004_c1e7),
            (VmxCapability::Cr0Fixed0, 0x8000_0021),
            (VmxCapability::Cr0Fixed1, 0xffff_ffff),
            (VmxCapability::Cr4Fixed0, 0x2000),
            (VmxCapability::Cr4Fixed1, 0x0037_27ff),
            (VmxCapability::VmcsEnum, 0x2e),
            (VmxCapability::EptVpidCap, 0x0f01_0611_4141),
        ]
        .into_iter()
        .map(|(cap, value)| (cap, Ok(value)))
        .collect();

        Self {
            state: Mutex::new(State {
                features: Self::all_features(),
                capabilities,
                msr_info: HashMap::new(),
                vmcs: HashMap::new(),
                vmcs_failures: HashMap::new(),
                registers: HashMap::new(),
                msrs: HashMap::new(),
                fpstate: vec![0; 0x1000],
                exits: VecDeque::new(),
                next_vcpu: 0,
                mapping_failure: None,
                unmap_failure: None,
                space_create_failure: None,
                set_space_failure: None,
                calls: Vec::new(),
            }),
        }
    }

    pub(crate) fn all_features() -> HostFeatures {
        HostFeatures {
            address_spaces: true,
            run_until: true,
            msr_info: true,
            managed_msrs: true,
            exec_time: true,
            cap_write_vmcs: true,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn log(&self, call: String) {
        self.state().calls.push(call);
    }

    pub(crate) fn set_features(&self, features: HostFeatures) {
        self.state().features = features;
    }

    pub(crate) fn set_capability(&self, cap: VmxCapability, value: u64) {
        let _ = self.state().capabilities.insert(cap, Ok(value));
    }

    pub(crate) fn fail_capability(&self, cap: VmxCapability, status: HostStatus) {
        let _ = self.state().capabilities.insert(cap, Err(status));
    }

    pub(crate) fn set_msr_info(&self, info: MsrInfo, value: u64) {
        let _ = self.state().msr_info.insert(info, value);
    }

    pub(crate) fn fail_vmcs(&self, field: u32, status: HostStatus) {
        let _ = self.state().vmcs_failures.insert(field, status);
    }

    pub(crate) fn vmcs_value(&self, field: u32) -> Option<u64> {
        self.state().vmcs.get(&field).copied()
    }

    pub(crate) fn set_vmcs(&self, field: u32, value: u64) {
        let _ = self.state().vmcs.insert(field, value);
    }

    pub(crate) fn register(&self, reg: HvRegister) -> u64 {
        self.state().registers.get(&reg).copied().unwrap_or(0)
    }

    pub(crate) fn set_register(&self, reg: HvRegister, value: u64) {
        let _ = self.state().registers.insert(reg, value);
    }

    pub(crate) fn msr(&self, msr: u32) -> u64 {
        self.state().msrs.get(&msr).copied().unwrap_or(0)
    }

    pub(crate) fn set_msr(&self, msr: u32, value: u64) {
        let _ = self.state().msrs.insert(msr, value);
    }

    pub(crate) fn push_exit(&self, exit: MockExit) {
        self.state().exits.push_back(exit);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Fails every map, unmap and protect call.
    pub(crate) fn fail_mapping(&self, status: HostStatus) {
        self.state().mapping_failure = Some(status);
    }

    pub(crate) fn fail_unmap(&self, status: HostStatus) {
        self.state().unmap_failure = Some(status);
    }

    pub(crate) fn clear_failures(&self) {
        let mut state = self.state();
        state.mapping_failure = None;
        state.unmap_failure = None;
    }

    pub(crate) fn fail_space_create(&self, status: HostStatus) {
        self.state().space_create_failure = Some(status);
    }

    pub(crate) fn fail_vcpu_set_space(&self, status: HostStatus) {
        self.state().set_space_failure = Some(status);
    }

    fn mapping_result(&self, unmap: bool) -> HostResult<()> {
        let state = self.state();
        let failure = if unmap {
            state.unmap_failure.or(state.mapping_failure)
        } else {
            state.mapping_failure
        };
        failure.map_or(Ok(()), Err)
    }

    fn enter(&self, call: String) -> HostResult<()> {
        self.log(call);
        let mut state = self.state();
        let exit = state.exits.pop_front().ok_or(HostStatus::Error)?;
        let _ = state.vmcs.insert(vmcs::ro::EXIT_REASON, u64::from(exit.reason));
        let _ = state.vmcs.insert(vmcs::ro::EXIT_QUALIFICATION, exit.qualification);
        let _ = state.vmcs.insert(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL, exit.gpa);
        let _ = state
            .vmcs
            .insert(vmcs::ro::VMEXIT_INTERRUPTION_INFO, u64::from(exit.interruption_info));
        for (reg, value) in exit.registers {
            let _ = state.registers.insert(reg, value);
        }
        Ok(())
    }
}

impl HostApi for MockHost {
    fn features(&self) -> HostFeatures {
        self.state().features
    }

    fn vm_create(&self) -> HostResult<()> {
        self.log("vm_create()".to_string());
        Ok(())
    }

    fn vm_destroy(&self) -> HostResult<()> {
        self.log("vm_destroy()".to_string());
        Ok(())
    }

    fn vm_space_create(&self) -> HostResult<SpaceId> {
        self.log("vm_space_create()".to_string());
        self.state().space_create_failure.map_or(Ok(SpaceId(1)), Err)
    }

    fn vm_space_destroy(&self, space: SpaceId) -> HostResult<()> {
        self.log(format!("vm_space_destroy({})", space.0));
        Ok(())
    }

    fn vm_map(
        &self,
        _backing: HostAddr,
        gpa: u64,
        len: u64,
        prot: MemoryProtection,
    ) -> HostResult<()> {
        self.log(format!("vm_map({gpa:#x}, {len:#x}, {prot:?})"));
        self.mapping_result(false)
    }

    fn vm_unmap(&self, gpa: u64, len: u64) -> HostResult<()> {
        self.log(format!("vm_unmap({gpa:#x}, {len:#x})"));
        self.mapping_result(true)
    }

    fn vm_protect(&self, gpa: u64, len: u64, prot: MemoryProtection) -> HostResult<()> {
        self.log(format!("vm_protect({gpa:#x}, {len:#x}, {prot:?})"));
        self.mapping_result(false)
    }

    fn vm_map_space(
        &self,
        space: SpaceId,
        _backing: HostAddr,
        gpa: u64,
        len: u64,
        prot: MemoryProtection,
    ) -> HostResult<()> {
        self.log(format!("vm_map_space({}, {gpa:#x}, {len:#x}, {prot:?})", space.0));
        self.mapping_result(false)
    }

    fn vm_unmap_space(&self, space: SpaceId, gpa: u64, len: u64) -> HostResult<()> {
        self.log(format!("vm_unmap_space({}, {gpa:#x}, {len:#x})", space.0));
        self.mapping_result(true)
    }

    fn vm_protect_space(
        &self,
        space: SpaceId,
        gpa: u64,
        len: u64,
        prot: MemoryProtection,
    ) -> HostResult<()> {
        self.log(format!("vm_protect_space({}, {gpa:#x}, {len:#x}, {prot:?})", space.0));
        self.mapping_result(false)
    }

    fn vm_sync_tsc(&self, tsc: u64) -> HostResult<()> {
        self.log(format!("vm_sync_tsc({tsc:#x})"));
        Ok(())
    }

    fn vcpu_create(&self) -> HostResult<HostVcpuId> {
        let mut state = self.state();
        let id = state.next_vcpu;
        state.next_vcpu += 1;
        state.calls.push("vcpu_create()".to_string());
        Ok(HostVcpuId(id))
    }

    fn vcpu_destroy(&self, vcpu: HostVcpuId) -> HostResult<()> {
        self.log(format!("vcpu_destroy({})", vcpu.0));
        Ok(())
    }

    fn vcpu_set_space(&self, vcpu: HostVcpuId, space: SpaceId) -> HostResult<()> {
        self.log(format!("vcpu_set_space({}, {})", vcpu.0, space.0));
        self.state().set_space_failure.map_or(Ok(()), Err)
    }

    fn read_register(&self, _vcpu: HostVcpuId, reg: HvRegister) -> HostResult<u64> {
        Ok(self.register(reg))
    }

    fn write_register(&self, _vcpu: HostVcpuId, reg: HvRegister, value: u64) -> HostResult<()> {
        self.log(format!("write_register({reg:?}, {value:#x})"));
        self.set_register(reg, value);
        Ok(())
    }

    fn read_fpstate(&self, _vcpu: HostVcpuId, buffer: &mut [u8]) -> HostResult<()> {
        let state = self.state();
        let len = buffer.len().min(state.fpstate.len());
        buffer[..len].copy_from_slice(&state.fpstate[..len]);
        Ok(())
    }

    fn write_fpstate(&self, _vcpu: HostVcpuId, buffer: &[u8]) -> HostResult<()> {
        self.log("write_fpstate()".to_string());
        self.state().fpstate = buffer.to_vec();
        Ok(())
    }

    fn enable_native_msr(&self, _vcpu: HostVcpuId, msr: u32, enable: bool) -> HostResult<()> {
        self.log(format!("enable_native_msr({msr:#x}, {enable})"));
        Ok(())
    }

    fn enable_managed_msr(&self, _vcpu: HostVcpuId, msr: u32, enable: bool) -> HostResult<()> {
        self.log(format!("enable_managed_msr({msr:#x}, {enable})"));
        Ok(())
    }

    fn set_msr_access(&self, _vcpu: HostVcpuId, msr: u32, access: MsrAccess) -> HostResult<()> {
        self.log(format!("set_msr_access({msr:#x}, {access:?})"));
        Ok(())
    }

    fn read_msr(&self, _vcpu: HostVcpuId, msr: u32) -> HostResult<u64> {
        Ok(self.msr(msr))
    }

    fn write_msr(&self, _vcpu: HostVcpuId, msr: u32, value: u64) -> HostResult<()> {
        self.log(format!("write_msr({msr:#x}, {value:#x})"));
        self.set_msr(msr, value);
        Ok(())
    }

    fn flush(&self, vcpu: HostVcpuId) -> HostResult<()> {
        self.log(format!("flush({})", vcpu.0));
        Ok(())
    }

    fn invalidate_tlb(&self, vcpu: HostVcpuId) -> HostResult<()> {
        self.log(format!("invalidate_tlb({})", vcpu.0));
        Ok(())
    }

    fn run(&self, vcpu: HostVcpuId) -> HostResult<()> {
        self.enter(format!("run({})", vcpu.0))
    }

    fn run_until(&self, vcpu: HostVcpuId, _timeout: Duration) -> HostResult<()> {
        self.enter(format!("run_until({})", vcpu.0))
    }

    fn interrupt(&self, vcpu: HostVcpuId) -> HostResult<()> {
        self.log(format!("interrupt({})", vcpu.0));
        Ok(())
    }

    fn exec_time(&self, _vcpu: HostVcpuId) -> HostResult<u64> {
        Ok(1_000_000)
    }

    fn read_capability(&self, cap: VmxCapability) -> HostResult<u64> {
        self.log(format!("read_capability({cap:?})"));
        self.state()
            .capabilities
            .get(&cap)
            .copied()
            .unwrap_or(Err(HostStatus::Unsupported))
    }

    fn vmcs_read(&self, _vcpu: HostVcpuId, field: u32) -> HostResult<u64> {
        let state = self.state();
        if let Some(status) = state.vmcs_failures.get(&field) {
            return Err(*status);
        }
        Ok(state.vmcs.get(&field).copied().unwrap_or(0))
    }

    fn vmcs_write(&self, _vcpu: HostVcpuId, field: u32, value: u64) -> HostResult<()> {
        self.log(format!("vmcs_write({field:#x}, {value:#x})"));
        let mut state = self.state();
        if let Some(status) = state.vmcs_failures.get(&field) {
            return Err(*status);
        }
        let _ = state.vmcs.insert(field, value);
        Ok(())
    }

    fn set_apic_address(&self, _vcpu: HostVcpuId, gpa: u64) -> HostResult<()> {
        self.log(format!("set_apic_address({gpa:#x})"));
        Ok(())
    }

    fn msr_info(&self, info: MsrInfo) -> HostResult<u64> {
        Ok(self.state().msr_info.get(&info).copied().unwrap_or(0))
    }

    fn cap_write_vmcs(&self, _vcpu: HostVcpuId, _field: u32) -> HostResult<(u64, u64)> {
        Ok((0, u64::MAX))
    }
}

/// Paging code that records what it was told.
#[derive(Debug, Default)]
pub(crate) struct TestPaging {
    pub(crate) mode_changes: Vec<(u64, u64, u64)>,
    pub(crate) cr3_updates: Vec<u64>,
    pub(crate) nxe: Vec<bool>,
    pub(crate) refuse_cr3: bool,
}

impl PageTableManager for TestPaging {
    fn change_mode(&mut self, cr0: u64, cr4: u64, efer: u64) -> Result<(), Error> {
        self.mode_changes.push((cr0, cr4, efer));
        Ok(())
    }

    fn update_cr3(&mut self, cr3: u64) -> Result<(), Error> {
        self.cr3_updates.push(cr3);
        Ok(())
    }

    fn nxe_changed(&mut self, enabled: bool) {
        self.nxe.push(enabled);
    }

    fn cr3_changed_export(&mut self, _cr3: u64) -> bool {
        !self.refuse_cr3
    }
}

/// An emulator that replays scripted exit actions.
///
/// Exits left over once the script runs out return to ring-3.
#[derive(Debug, Default)]
pub(crate) struct TestDispatcher {
    pub(crate) paging: TestPaging,
    pub(crate) tpr: u8,
    pub(crate) actions: Vec<ExitAction>,
    pub(crate) exits: Vec<ExitReason>,
    pub(crate) force: Option<RunStatus>,
    pub(crate) a20: Option<bool>,
    /// Traps handed out in order by `take_trap`.
    pub(crate) traps: Vec<TrapEvent>,
    pub(crate) returned_traps: Vec<TrapEvent>,
    /// Page-aligned guest-physical address to state and protection.
    pub(crate) pages: HashMap<u64, (PageState, MemoryProtection)>,
}

const PAGE_MASK: u64 = !0xfff;

impl ExitDispatcher for TestDispatcher {
    fn handle_exit(&mut self, _ctx: &mut CpuContext, info: &ExitInfo) -> Result<ExitAction, Error> {
        self.exits.push(info.reason);
        if self.actions.is_empty() {
            Ok(ExitAction::Return(RunStatus::ReturnToRing3))
        } else {
            Ok(self.actions.remove(0))
        }
    }

    fn page_tables(&mut self) -> &mut dyn PageTableManager {
        &mut self.paging
    }

    fn page_manager(&mut self) -> Option<&mut dyn PageManager> {
        Some(self)
    }

    fn force_flags(&mut self, _ctx: &CpuContext) -> Option<RunStatus> {
        self.force
    }

    fn a20_enabled(&self) -> bool {
        self.a20.unwrap_or(true)
    }

    fn take_trap(&mut self) -> Option<TrapEvent> {
        if self.traps.is_empty() {
            None
        } else {
            Some(self.traps.remove(0))
        }
    }

    fn put_trap(&mut self, trap: TrapEvent) {
        self.returned_traps.push(trap);
    }

    fn apic_tpr(&self) -> u8 {
        self.tpr
    }

    fn apic_set_tpr(&mut self, tpr: u8) {
        self.tpr = tpr;
    }
}

impl PageManager for TestDispatcher {
    fn query(&mut self, gpa: u64) -> Option<PageInfo> {
        let (_, prot) = self.pages.get(&(gpa & PAGE_MASK))?;
        Some(PageInfo {
            backing: Some(HostAddr(0x7f00_0000_0000 + (gpa & PAGE_MASK) as usize)),
            prot: *prot,
        })
    }

    fn page_state(&mut self, gpa: u64) -> Option<PageState> {
        self.pages.get(&(gpa & PAGE_MASK)).map(|(state, _)| *state)
    }

    fn set_page_state(&mut self, gpa: u64, state: PageState) {
        if let Some(page) = self.pages.get_mut(&(gpa & PAGE_MASK)) {
            page.0 = state;
        }
    }
}
