//! The module containing the last branch record (LBR) MSR layouts of the
//! supported host processors, and the per-vCPU LBR state.
//!
//! See: 18.4.8 LBR Stack

use crate::hypervisor::{config::HostCpu, error::Error};

/// The number of LBR entries the engine tracks per vCPU.
pub const MAX_LBR_ENTRIES: u32 = 32;

const MSR_P4_LASTBRANCH_TOS: u32 = 0x1da;
const MSR_P4_LASTBRANCH_0: u32 = 0x1db;
const MSR_P4_LASTBRANCH_3: u32 = 0x1de;

const MSR_CORE2_LASTBRANCH_0_FROM_IP: u32 = 0x40;
const MSR_CORE2_LASTBRANCH_3_FROM_IP: u32 = 0x43;
const MSR_CORE2_LASTBRANCH_0_TO_IP: u32 = 0x60;

const MSR_LASTBRANCH_SELECT: u32 = 0x1c8;
const MSR_LASTBRANCH_TOS: u32 = 0x1c9;
const MSR_LER_FROM_IP: u32 = 0x1dd;
const MSR_LER_TO_IP: u32 = 0x1de;
const MSR_LASTBRANCH_0_FROM_IP: u32 = 0x680;
const MSR_LASTBRANCH_15_FROM_IP: u32 = 0x68f;
const MSR_LASTBRANCH_31_FROM_IP: u32 = 0x69f;
const MSR_LASTBRANCH_0_TO_IP: u32 = 0x6c0;
const MSR_LASTBRANCH_0_INFO: u32 = 0xdc0;

/// The LBR MSRs of a processor model.
///
/// Optional MSRs are `None` on processors that do not have them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LbrMsrs {
    /// The first branch-from (or P4 branch) MSR.
    pub from_ip_first: u32,
    /// The last branch-from MSR.
    pub from_ip_last: u32,
    /// The first branch-to MSR.
    pub to_ip_first: Option<u32>,
    /// The first branch-info MSR.
    pub info_first: Option<u32>,
    /// The top-of-stack MSR.
    pub tos: u32,
    /// The LBR filter MSR.
    pub select: Option<u32>,
    /// The last-exception-record from MSR.
    pub ler_from_ip: Option<u32>,
    /// The last-exception-record to MSR.
    pub ler_to_ip: Option<u32>,
}

impl LbrMsrs {
    /// Looks up the layout of the host processor.
    pub fn for_host(cpu: HostCpu) -> Result<Self, Error> {
        let family_model = (u32::from(cpu.family) << 8) | u32::from(cpu.model);
        let msrs = match family_model {
            0x0f01 | 0x0f02 => Self {
                from_ip_first: MSR_P4_LASTBRANCH_0,
                from_ip_last: MSR_P4_LASTBRANCH_3,
                to_ip_first: None,
                info_first: None,
                tos: MSR_P4_LASTBRANCH_TOS,
                select: None,
                ler_from_ip: None,
                ler_to_ip: None,
            },
            0x065c | 0x065f | 0x064e | 0x065e | 0x068e | 0x069e | 0x0655 | 0x0666 | 0x067a
            | 0x0667 | 0x066a | 0x066c | 0x067d | 0x067e => {
                Self::architectural(MSR_LASTBRANCH_31_FROM_IP)
            }
            0x063d | 0x0647 | 0x064f | 0x0656 | 0x063c | 0x0645 | 0x0646 | 0x063f | 0x062a
            | 0x062d | 0x063a | 0x063e | 0x061a | 0x061e | 0x061f | 0x062e | 0x0625 | 0x062c
            | 0x062f => Self::architectural(MSR_LASTBRANCH_15_FROM_IP),
            0x0617 | 0x061d | 0x060f => Self {
                from_ip_first: MSR_CORE2_LASTBRANCH_0_FROM_IP,
                from_ip_last: MSR_CORE2_LASTBRANCH_3_FROM_IP,
                to_ip_first: Some(MSR_CORE2_LASTBRANCH_0_TO_IP),
                info_first: None,
                tos: MSR_LASTBRANCH_TOS,
                select: None,
                ler_from_ip: None,
                ler_to_ip: None,
            },
            _ => {
                return Err(Error::UnknownHostCpu {
                    family: cpu.family,
                    model: cpu.model,
                });
            }
        };

        let count = msrs.depth();
        if count > MAX_LBR_ENTRIES {
            return Err(Error::LbrStackOverflow {
                count,
                max: MAX_LBR_ENTRIES,
            });
        }
        Ok(msrs)
    }

    fn architectural(from_ip_last: u32) -> Self {
        Self {
            from_ip_first: MSR_LASTBRANCH_0_FROM_IP,
            from_ip_last,
            to_ip_first: Some(MSR_LASTBRANCH_0_TO_IP),
            info_first: Some(MSR_LASTBRANCH_0_INFO),
            tos: MSR_LASTBRANCH_TOS,
            select: Some(MSR_LASTBRANCH_SELECT),
            ler_from_ip: Some(MSR_LER_FROM_IP),
            ler_to_ip: Some(MSR_LER_TO_IP),
        }
    }

    /// The number of entries of the LBR stack.
    pub fn depth(&self) -> u32 {
        self.from_ip_last - self.from_ip_first + 1
    }

    /// Returns every MSR the guest accesses directly.
    pub fn all(&self) -> Vec<u32> {
        let mut msrs = Vec::new();
        for i in 0..self.depth() {
            msrs.push(self.from_ip_first + i);
            if let Some(first) = self.to_ip_first {
                msrs.push(first + i);
            }
            if let Some(first) = self.info_first {
                msrs.push(first + i);
            }
        }
        msrs.push(self.tos);
        msrs.extend(self.ler_from_ip);
        msrs.extend(self.ler_to_ip);
        msrs.extend(self.select);
        msrs
    }
}

/// One entry of the LBR stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchRecord {
    /// The index in the LBR stack.
    pub index: u32,
    /// The source of the branch.
    pub from_ip: u64,
    /// The target of the branch, when the processor records it.
    pub to_ip: Option<u64>,
    /// The branch information, when the processor records it.
    pub info: Option<u64>,
}

/// The guest LBR stack of a vCPU, as last imported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LbrState {
    /// Branch-from MSR values.
    pub from_ip: [u64; MAX_LBR_ENTRIES as usize],
    /// Branch-to MSR values.
    pub to_ip: [u64; MAX_LBR_ENTRIES as usize],
    /// Branch-info MSR values.
    pub info: [u64; MAX_LBR_ENTRIES as usize],
    /// The top-of-stack MSR value.
    pub tos: u64,
    /// The last-exception-record from MSR value.
    pub ler_from_ip: u64,
    /// The last-exception-record to MSR value.
    pub ler_to_ip: u64,
}

impl LbrState {
    /// Returns the recorded branches, most recent first. Returns `None` when
    /// the top-of-stack index is out of range.
    pub fn records(&self, msrs: &LbrMsrs) -> Option<Vec<BranchRecord>> {
        let depth = msrs.depth();
        // The TOS width varies per processor, but 4 bits cover all of the above.
        let top = (self.tos & 0xf) as u32;
        if top >= depth {
            return None;
        }

        let records = (0..depth)
            .map(|n| {
                let index = (top + depth - n) % depth;
                let i = index as usize;
                BranchRecord {
                    index,
                    from_ip: self.from_ip[i],
                    to_ip: msrs.to_ip_first.map(|_| self.to_ip[i]),
                    info: msrs.info_first.map(|_| self.info[i]),
                }
            })
            .collect();
        Some(records)
    }
}
