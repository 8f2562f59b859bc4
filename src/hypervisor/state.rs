//! The module containing the transfer of guest state between the emulator's
//! context and the hardware.
//!
//! Export writes every category the context owns and the vCPU marked as
//! changed. Import reads the requested categories the hardware owns and
//! tells the paging code about mode and CR3 changes once at the end.

use std::sync::Arc;

use x86::vmx::vmcs::{self, control::PrimaryControls};

use crate::hypervisor::{
    context::{ContextFlags, CpuContext, PageTableManager},
    error::Error,
    exit::{ExitDispatcher, HyperDebugRegisters},
    host_api::{HostApi, HostResultExt, HostVcpuId, HvRegister},
    segment::{DescriptorTable, Segment, SegmentRegister},
    vcpu::Vcpu,
    vmcs::Vmcs,
};

const X86_EFL_TF: u64 = 1 << 8;

const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_PG: u64 = 1 << 31;
const X86_CR4_VMXE: u64 = 1 << 13;
const MSR_K6_EFER_NXE: u64 = 1 << 11;

const X86_DR7_ENABLED_MASK: u64 = 0xff;
const X86_DR7_GD: u64 = 1 << 13;
const X86_DR7_RA1_MASK: u64 = 1 << 10;

const X86_XCPT_DB: u8 = 1;
const X86_XCPT_BP: u8 = 3;

const BLOCK_STI: u32 = 1 << 0;
const BLOCK_MOVSS: u32 = 1 << 1;

const IA32_SYSENTER_CS: u32 = 0x174;
const IA32_SYSENTER_ESP: u32 = 0x175;
const IA32_SYSENTER_EIP: u32 = 0x176;
const IA32_STAR: u32 = 0xc000_0081;
const IA32_LSTAR: u32 = 0xc000_0082;
const IA32_CSTAR: u32 = 0xc000_0083;
const IA32_FMASK: u32 = 0xc000_0084;
const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
const IA32_TSC_AUX: u32 = 0xc000_0103;

/// What an export did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The owned state was written.
    Exported,
    /// The hardware already owned everything.
    NothingOwned,
    /// The paging code refused the new CR3. Nothing after CR3 was written.
    Reschedule,
}

struct GprSlot<'a> {
    flag: ContextFlags,
    register: HvRegister,
    name: &'static str,
    value: &'a mut u64,
}

fn gprs(ctx: &mut CpuContext) -> [GprSlot<'_>; 16] {
    macro_rules! slot {
        ($flag:ident, $register:ident, $field:ident) => {
            GprSlot {
                flag: ContextFlags::$flag,
                register: HvRegister::$register,
                name: stringify!($register),
                value: &mut ctx.$field,
            }
        };
    }
    [
        slot!(RAX, Rax, rax),
        slot!(RCX, Rcx, rcx),
        slot!(RDX, Rdx, rdx),
        slot!(RBX, Rbx, rbx),
        slot!(RSP, Rsp, rsp),
        slot!(RBP, Rbp, rbp),
        slot!(RSI, Rsi, rsi),
        slot!(RDI, Rdi, rdi),
        slot!(R8_R15, R8, r8),
        slot!(R8_R15, R9, r9),
        slot!(R8_R15, R10, r10),
        slot!(R8_R15, R11, r11),
        slot!(R8_R15, R12, r12),
        slot!(R8_R15, R13, r13),
        slot!(R8_R15, R14, r14),
        slot!(R8_R15, R15, r15),
    ]
}

const SEGMENTS: [(ContextFlags, Segment); 8] = [
    (ContextFlags::ES, Segment::Es),
    (ContextFlags::CS, Segment::Cs),
    (ContextFlags::SS, Segment::Ss),
    (ContextFlags::DS, Segment::Ds),
    (ContextFlags::FS, Segment::Fs),
    (ContextFlags::GS, Segment::Gs),
    (ContextFlags::LDTR, Segment::Ldtr),
    (ContextFlags::TR, Segment::Tr),
];

fn segment_mut(ctx: &mut CpuContext, segment: Segment) -> &mut SegmentRegister {
    match segment {
        Segment::Es => &mut ctx.es,
        Segment::Cs => &mut ctx.cs,
        Segment::Ss => &mut ctx.ss,
        Segment::Ds => &mut ctx.ds,
        Segment::Fs => &mut ctx.fs,
        Segment::Gs => &mut ctx.gs,
        Segment::Ldtr => &mut ctx.ldtr,
        Segment::Tr => &mut ctx.tr,
    }
}

fn msrs(ctx: &mut CpuContext) -> [(ContextFlags, u32, &'static str, &mut u64); 9] {
    [
        (ContextFlags::KERNEL_GS_BASE, IA32_KERNEL_GS_BASE, "IA32_KERNEL_GS_BASE", &mut ctx.kernel_gs_base),
        (ContextFlags::SYSENTER_MSRS, IA32_SYSENTER_CS, "IA32_SYSENTER_CS", &mut ctx.sysenter_cs),
        (ContextFlags::SYSENTER_MSRS, IA32_SYSENTER_EIP, "IA32_SYSENTER_EIP", &mut ctx.sysenter_eip),
        (ContextFlags::SYSENTER_MSRS, IA32_SYSENTER_ESP, "IA32_SYSENTER_ESP", &mut ctx.sysenter_esp),
        (ContextFlags::SYSCALL_MSRS, IA32_STAR, "IA32_STAR", &mut ctx.star),
        (ContextFlags::SYSCALL_MSRS, IA32_LSTAR, "IA32_LSTAR", &mut ctx.lstar),
        (ContextFlags::SYSCALL_MSRS, IA32_CSTAR, "IA32_CSTAR", &mut ctx.cstar),
        (ContextFlags::SYSCALL_MSRS, IA32_FMASK, "IA32_FMASK", &mut ctx.sf_mask),
        (ContextFlags::TSC_AUX, IA32_TSC_AUX, "IA32_TSC_AUX", &mut ctx.tsc_aux),
    ]
}

/// Register access of one vCPU, labelling failures with the register.
#[derive(Clone, Copy)]
struct Registers<'a> {
    host: &'a dyn HostApi,
    vcpu: HostVcpuId,
}

impl Registers<'_> {
    fn read(&self, register: HvRegister, name: &'static str) -> Result<u64, Error> {
        self.host.read_register(self.vcpu, register).field(name)
    }

    fn write(&self, register: HvRegister, name: &'static str, value: u64) -> Result<(), Error> {
        self.host.write_register(self.vcpu, register, value).field(name)
    }

    fn read_msr(&self, msr: u32, name: &'static str) -> Result<u64, Error> {
        self.host.read_msr(self.vcpu, msr).field(name)
    }

    fn write_msr(&self, msr: u32, name: &'static str, value: u64) -> Result<(), Error> {
        self.host.write_msr(self.vcpu, msr, value).field(name)
    }
}

impl Vcpu {
    /// Reads the categories of `what` the hardware owns into `ctx`.
    ///
    /// A change of CR0, CR4 or EFER is reported to the paging code once,
    /// followed by a CR3 change.
    pub fn import_state(
        &self,
        ctx: &mut CpuContext,
        what: ContextFlags,
        page_tables: &mut dyn PageTableManager,
    ) -> Result<(), Error> {
        let what = what & ctx.externalized;
        if what.is_empty() {
            return Ok(());
        }

        let host = &*self.shared.host;
        let vmcs = Vmcs::new(host, self.handle.id());
        let regs = Registers {
            host,
            vcpu: self.handle.id(),
        };
        let mut mode_changed = false;
        let mut cr3_changed = false;

        if what.intersects(ContextFlags::XCPT_MASK) {
            ctx.interruptibility = vmcs.read32(vmcs::guest::INTERRUPTIBILITY_STATE)?;
        }

        for slot in gprs(ctx) {
            if what.contains(slot.flag) {
                *slot.value = regs.read(slot.register, slot.name)?;
            }
        }
        if what.contains(ContextFlags::RIP) {
            ctx.rip = regs.read(HvRegister::Rip, "RIP")?;
        }
        if what.contains(ContextFlags::RFLAGS) {
            ctx.rflags = regs.read(HvRegister::Rflags, "RFLAGS")?;
        }

        for (flag, segment) in SEGMENTS {
            if what.contains(flag) {
                *segment_mut(ctx, segment) = SegmentRegister::read(&vmcs, segment)?;
            }
        }
        if what.contains(ContextFlags::GDTR) {
            ctx.gdtr = DescriptorTable::read_gdtr(&vmcs)?;
        }
        if what.contains(ContextFlags::IDTR) {
            ctx.idtr = DescriptorTable::read_idtr(&vmcs)?;
        }

        // Bits owned by the host read back from the read shadows.
        if what.contains(ContextFlags::CR0) {
            let mask = self.controls.cr0_mask;
            let shadow = vmcs.read(vmcs::control::CR0_READ_SHADOW)?;
            let cr0 = (regs.read(HvRegister::Cr0, "CR0")? & !mask) | (shadow & mask);
            if cr0 != ctx.cr0 {
                ctx.cr0 = cr0;
                mode_changed = true;
            }
        }
        if what.contains(ContextFlags::CR2) {
            ctx.cr2 = regs.read(HvRegister::Cr2, "CR2")?;
        }
        if what.contains(ContextFlags::CR4) {
            let mask = self.controls.cr4_mask;
            let shadow = vmcs.read(vmcs::control::CR4_READ_SHADOW)?;
            let cr4 = ((regs.read(HvRegister::Cr4, "CR4")? & !mask) | (shadow & mask)) & !X86_CR4_VMXE;
            if cr4 != ctx.cr4 {
                ctx.cr4 = cr4;
                mode_changed = true;
            }
        }
        if what.contains(ContextFlags::EFER) {
            let efer = vmcs.read(vmcs::guest::IA32_EFER_FULL)?;
            if efer != ctx.efer {
                if ((efer ^ ctx.efer) & MSR_K6_EFER_NXE) != 0 {
                    page_tables.nxe_changed((efer & MSR_K6_EFER_NXE) != 0);
                }
                ctx.efer = efer;
                mode_changed = true;
            }
        }
        // After CR0, CR4 and EFER so that the PAE check sees current values.
        if what.contains(ContextFlags::CR3) {
            let cr3 = regs.read(HvRegister::Cr3, "CR3")?;
            if cr3 != ctx.cr3 {
                ctx.cr3 = cr3;
                cr3_changed = true;
            }
            if ctx.is_pae_paging() {
                let pdptes = [
                    vmcs.read(vmcs::guest::PDPTE0_FULL)?,
                    vmcs.read(vmcs::guest::PDPTE1_FULL)?,
                    vmcs.read(vmcs::guest::PDPTE2_FULL)?,
                    vmcs.read(vmcs::guest::PDPTE3_FULL)?,
                ];
                if pdptes != ctx.pae_pdptes {
                    ctx.pae_pdptes = pdptes;
                    cr3_changed = true;
                }
            }
        }

        if what.contains(ContextFlags::XCRX) {
            ctx.xcr0 = regs.read(HvRegister::Xcr0, "XCR0")?;
        }

        // While the debugger owns the debug registers, the context keeps the
        // guest's values.
        if !self.debug.using_hyper_dr7 {
            if what.contains(ContextFlags::DR7) {
                ctx.dr[7] = regs.read(HvRegister::Dr7, "DR7")?;
            }
            if what.contains(ContextFlags::DR0_DR3) {
                ctx.dr[0] = regs.read(HvRegister::Dr0, "DR0")?;
                ctx.dr[1] = regs.read(HvRegister::Dr1, "DR1")?;
                ctx.dr[2] = regs.read(HvRegister::Dr2, "DR2")?;
                ctx.dr[3] = regs.read(HvRegister::Dr3, "DR3")?;
            }
            if what.contains(ContextFlags::DR6) {
                ctx.dr[6] = regs.read(HvRegister::Dr6, "DR6")?;
            }
        }

        if what.intersects(ContextFlags::XSAVE_MASK) {
            host.read_fpstate(self.handle.id(), &mut ctx.xsave.0)
                .field("XSAVE area")?;
        }

        for (flag, msr, name, value) in msrs(ctx) {
            if what.contains(flag) {
                *value = regs.read_msr(msr, name)?;
            }
        }
        if what.contains(ContextFlags::OTHER_MSRS) {
            self.import_lbr(&regs, ctx)?;
        }

        ctx.externalized.remove(what);
        if !ctx.externalized.intersects(ContextFlags::ALL) {
            ctx.externalized = ContextFlags::NONE;
        }

        if mode_changed {
            page_tables.change_mode(ctx.cr0, ctx.cr4, ctx.efer)?;
        }
        if cr3_changed {
            page_tables.update_cr3(ctx.cr3)?;
        }
        Ok(())
    }

    fn import_lbr(&self, regs: &Registers<'_>, ctx: &mut CpuContext) -> Result<(), Error> {
        let Some(lbr) = self.shared.lbr else {
            return Ok(());
        };
        for i in 0..lbr.depth() {
            let n = i as usize;
            ctx.lbr.from_ip[n] = regs.read_msr(lbr.from_ip_first + i, "LBR from IP")?;
            if let Some(first) = lbr.to_ip_first {
                ctx.lbr.to_ip[n] = regs.read_msr(first + i, "LBR to IP")?;
            }
            if let Some(first) = lbr.info_first {
                ctx.lbr.info[n] = regs.read_msr(first + i, "LBR info")?;
            }
        }
        ctx.lbr.tos = regs.read_msr(lbr.tos, "LBR TOS")?;
        if let Some(msr) = lbr.ler_from_ip {
            ctx.lbr.ler_from_ip = regs.read_msr(msr, "LER from IP")?;
        }
        if let Some(msr) = lbr.ler_to_ip {
            ctx.lbr.ler_to_ip = regs.read_msr(msr, "LER to IP")?;
        }
        Ok(())
    }

    fn export_lbr(&self, regs: &Registers<'_>, ctx: &CpuContext) -> Result<(), Error> {
        let Some(lbr) = self.shared.lbr else {
            return Ok(());
        };
        for i in 0..lbr.depth() {
            let n = i as usize;
            regs.write_msr(lbr.from_ip_first + i, "LBR from IP", ctx.lbr.from_ip[n])?;
            if let Some(first) = lbr.to_ip_first {
                regs.write_msr(first + i, "LBR to IP", ctx.lbr.to_ip[n])?;
            }
            if let Some(first) = lbr.info_first {
                regs.write_msr(first + i, "LBR info", ctx.lbr.info[n])?;
            }
        }
        regs.write_msr(lbr.tos, "LBR TOS", ctx.lbr.tos)?;
        if let Some(msr) = lbr.ler_from_ip {
            regs.write_msr(msr, "LER from IP", ctx.lbr.ler_from_ip)?;
        }
        if let Some(msr) = lbr.ler_to_ip {
            regs.write_msr(msr, "LER to IP", ctx.lbr.ler_to_ip)?;
        }
        Ok(())
    }

    /// Writes every category `ctx` owns and this vCPU marked as changed, then
    /// hands everything to the hardware.
    pub fn export_state(
        &mut self,
        ctx: &mut CpuContext,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<ExportOutcome, Error> {
        let owned = !ctx.externalized & ContextFlags::ALL;
        if owned.is_empty() {
            return Ok(ExportOutcome::NothingOwned);
        }
        self.changed |= owned;
        // The TPR lives in the APIC, not in the context.
        let mut what = self.changed & (owned | ContextFlags::APIC_TPR);

        let shared = Arc::clone(&self.shared);
        let host = &*shared.host;
        let id = self.handle.id();
        let vmcs = Vmcs::new(host, id);
        let regs = Registers { host, vcpu: id };

        self.controls
            .export_entry_exit(&vmcs, &self.caps, ctx.is_long_mode_active())?;

        for slot in gprs(ctx) {
            if what.contains(slot.flag) {
                regs.write(slot.register, slot.name, *slot.value)?;
            }
        }
        if what.contains(ContextFlags::CR2) {
            regs.write(HvRegister::Cr2, "CR2", ctx.cr2)?;
        }

        // Unrestricted guests may run with paging and protection disabled.
        if what.contains(ContextFlags::CR0) {
            let fixed0 = self.caps.cr0_fixed0 & !(X86_CR0_PE | X86_CR0_PG);
            let cr0 = (ctx.cr0 | fixed0) & (self.caps.cr0_fixed1 | !0xffff_ffff);
            regs.write(HvRegister::Cr0, "CR0", cr0)?;
            vmcs.write(vmcs::control::CR0_READ_SHADOW, ctx.cr0)?;
        }
        if what.contains(ContextFlags::CR3) {
            let page_tables = dispatcher.page_tables();
            if !page_tables.cr3_changed_export(ctx.cr3) {
                log::trace!("CR3 {:#x} needs the interpreter", ctx.cr3);
                return Ok(ExportOutcome::Reschedule);
            }
            regs.write(HvRegister::Cr3, "CR3", ctx.cr3)?;
            if ctx.is_pae_paging() {
                let pdptes = page_tables.pae_pdptes(ctx);
                vmcs.write(vmcs::guest::PDPTE0_FULL, pdptes[0])?;
                vmcs.write(vmcs::guest::PDPTE1_FULL, pdptes[1])?;
                vmcs.write(vmcs::guest::PDPTE2_FULL, pdptes[2])?;
                vmcs.write(vmcs::guest::PDPTE3_FULL, pdptes[3])?;
            }
        }
        if what.contains(ContextFlags::CR4) {
            let cr4 = (ctx.cr4 | self.caps.cr4_fixed0 | X86_CR4_VMXE) & (self.caps.cr4_fixed1 | X86_CR4_VMXE);
            regs.write(HvRegister::Cr4, "CR4", cr4)?;
            vmcs.write(vmcs::control::CR4_READ_SHADOW, ctx.cr4)?;
        }

        if what.intersects(ContextFlags::XCPT_MASK) {
            vmcs.write(vmcs::guest::INTERRUPTIBILITY_STATE, ctx.interruptibility)?;
        }
        let hyper = dispatcher.hyper_debug_registers();
        self.export_debug_state(&vmcs, ctx, &hyper, &mut what, dispatcher)?;

        self.controls.set_exception_intercept(
            &vmcs,
            X86_XCPT_DB,
            self.debug.using_hyper_dr7 || self.debug.stepping_by_trap_flag,
        )?;
        self.controls
            .set_exception_intercept(&vmcs, X86_XCPT_BP, dispatcher.int3_breakpoints_armed())?;
        if what.contains(ContextFlags::RIP) {
            regs.write(HvRegister::Rip, "RIP", ctx.rip)?;
        }
        if what.contains(ContextFlags::RFLAGS) {
            regs.write(HvRegister::Rflags, "RFLAGS", ctx.rflags)?;
        }
        for (flag, segment) in SEGMENTS {
            if what.contains(flag) {
                segment_mut(ctx, segment).write(&vmcs, segment)?;
            }
        }
        if what.contains(ContextFlags::GDTR) {
            ctx.gdtr.write_gdtr(&vmcs)?;
        }
        if what.contains(ContextFlags::IDTR) {
            ctx.idtr.write_idtr(&vmcs)?;
        }

        if what.contains(ContextFlags::XCRX) {
            regs.write(HvRegister::Xcr0, "XCR0", ctx.xcr0)?;
        }

        if what.contains(ContextFlags::APIC_TPR) {
            let tpr = dispatcher.apic_tpr();
            regs.write(HvRegister::Tpr, "TPR", u64::from(tpr))?;
            self.guest_tpr = tpr;
        }

        if what.contains(ContextFlags::DR0_DR3) || self.debug.using_hyper_dr7 {
            let dr = if self.debug.using_hyper_dr7 {
                hyper.dr
            } else {
                [ctx.dr[0], ctx.dr[1], ctx.dr[2], ctx.dr[3]]
            };
            regs.write(HvRegister::Dr0, "DR0", dr[0])?;
            regs.write(HvRegister::Dr1, "DR1", dr[1])?;
            regs.write(HvRegister::Dr2, "DR2", dr[2])?;
            regs.write(HvRegister::Dr3, "DR3", dr[3])?;
        }
        if what.contains(ContextFlags::DR6) || self.debug.using_hyper_dr7 {
            let dr6 = if self.debug.using_hyper_dr7 { hyper.dr6 } else { ctx.dr[6] };
            regs.write(HvRegister::Dr6, "DR6", dr6)?;
        }
        if what.contains(ContextFlags::DR7) || self.debug.using_hyper_dr7 {
            regs.write(HvRegister::Dr7, "DR7", self.debug.dr7)?;
        }

        if what.intersects(ContextFlags::XSAVE_MASK) {
            host.write_fpstate(id, &ctx.xsave.0).field("XSAVE area")?;
        }

        if what.contains(ContextFlags::EFER) {
            vmcs.write(vmcs::guest::IA32_EFER_FULL, ctx.efer)?;
        }
        for (flag, msr, name, value) in msrs(ctx) {
            if what.contains(flag) {
                regs.write_msr(msr, name, *value)?;
            }
        }
        if what.contains(ContextFlags::OTHER_MSRS) {
            self.export_lbr(&regs, ctx)?;
        }

        host.invalidate_tlb(id).op("hv_vcpu_invalidate_tlb")?;
        host.flush(id).op("hv_vcpu_flush")?;

        ctx.externalized = ContextFlags::ALL;
        self.changed = ContextFlags::NONE;
        Ok(ExportOutcome::Exported)
    }

    /// Picks the single-stepping mechanism and the DR7 to load, and toggles
    /// MOV DRx interception accordingly.
    fn export_debug_state(
        &mut self,
        vmcs: &Vmcs<'_>,
        ctx: &mut CpuContext,
        hyper: &HyperDebugRegisters,
        what: &mut ContextFlags,
        dispatcher: &mut dyn ExitDispatcher,
    ) -> Result<(), Error> {
        let mtf = PrimaryControls::MONITOR_TRAP_FLAG.bits();
        if self.debug.single_instruction {
            if self.caps.proc.permits(mtf) {
                self.controls.set_proc_bits(vmcs, mtf, true)?;
            } else {
                if ctx.externalized.contains(ContextFlags::RFLAGS) {
                    self.import_state(ctx, ContextFlags::RFLAGS, dispatcher.page_tables())?;
                }
                if (ctx.rflags & X86_EFL_TF) == 0 {
                    ctx.rflags |= X86_EFL_TF;
                    self.debug.clear_trap_flag = true;
                }
                *what |= ContextFlags::RFLAGS;
                self.debug.stepping_by_trap_flag = true;
            }
        } else {
            self.controls.set_proc_bits(vmcs, mtf, false)?;
        }

        let intercept_mov_dr = if self.debug.stepping_by_trap_flag || hyper.is_armed() {
            self.debug.dr7 = hyper.dr7 | X86_DR7_RA1_MASK;
            self.debug.using_hyper_dr7 = true;
            true
        } else {
            self.debug.dr7 = ctx.dr[7];
            self.debug.using_hyper_dr7 = false;
            (ctx.dr[7] & (X86_DR7_ENABLED_MASK | X86_DR7_GD)) == 0
        };
        if self.shared.config.intercept_mov_dr {
            self.controls
                .set_proc_bits(vmcs, PrimaryControls::MOV_DR_EXITING.bits(), intercept_mov_dr)?;
        }

        // A pending interrupt shadow would swallow the single-step #DB.
        if self.debug.stepping_by_trap_flag {
            let state = vmcs.read32(vmcs::guest::INTERRUPTIBILITY_STATE)?;
            if (state & (BLOCK_STI | BLOCK_MOVSS)) != 0 {
                vmcs.write(
                    vmcs::guest::INTERRUPTIBILITY_STATE,
                    state & !(BLOCK_STI | BLOCK_MOVSS),
                )?;
                ctx.interruptibility &= !(BLOCK_STI | BLOCK_MOVSS);
            }
        }
        Ok(())
    }
}
