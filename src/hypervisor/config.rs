use core::time::Duration;

/// Tunables of the execution engine, fixed for the lifetime of a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmxConfig {
    /// The PAUSE-loop exiting gap. Zero disables PAUSE-loop exiting.
    pub ple_gap: u32,

    /// The PAUSE-loop exiting window. Zero disables PAUSE-loop exiting.
    pub ple_window: u32,

    /// Whether the guest gets last branch records.
    pub lbr: bool,

    /// Whether MOV DRx is intercepted when the guest leaves its debug
    /// registers unarmed or the debugger owns DR7.
    ///
    /// Off by default: intercepting breaks single-stepping under an external
    /// debugger on some hosts.
    pub intercept_mov_dr: bool,

    /// How long a single run may last before the vCPU is forced back to the
    /// engine, when the host supports deadline-bound runs.
    pub run_deadline: Duration,
}

impl Default for VmxConfig {
    fn default() -> Self {
        Self {
            ple_gap: 0,
            ple_window: 0,
            lbr: false,
            intercept_mov_dr: false,
            run_deadline: Duration::from_secs(2),
        }
    }
}

impl VmxConfig {
    /// Enables PAUSE-loop exiting with the given gap and window.
    #[must_use]
    pub fn with_pause_loop_exiting(mut self, gap: u32, window: u32) -> Self {
        self.ple_gap = gap;
        self.ple_window = window;
        self
    }

    /// Enables or disables last branch records.
    #[must_use]
    pub fn with_lbr(mut self, enabled: bool) -> Self {
        self.lbr = enabled;
        self
    }

    /// Enables or disables MOV DRx interception.
    #[must_use]
    pub fn with_mov_dr_intercept(mut self, enabled: bool) -> Self {
        self.intercept_mov_dr = enabled;
        self
    }

    /// Sets the upper bound of a single run.
    #[must_use]
    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub(crate) fn pause_loop_exiting(&self) -> bool {
        self.ple_gap != 0 && self.ple_window != 0
    }
}

/// CPU features exposed to the guest that affect control setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct GuestFeatures {
    /// INVPCID is exposed.
    pub invpcid: bool,
    /// RDTSCP is exposed.
    pub rdtscp: bool,
    /// The indirect branch prediction barrier (`IA32_PRED_CMD`) is exposed.
    pub ibpb: bool,
    /// Indirect branch restricted speculation (`IA32_SPEC_CTRL`) is exposed.
    pub ibrs: bool,
    /// FSGSBASE is exposed.
    pub fsgsbase: bool,
    /// The guest has a local APIC.
    pub apic: bool,
}

/// Identification of the host processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostCpu {
    /// The display family, with the extended family folded in.
    pub family: u8,
    /// The display model, with the extended model folded in.
    pub model: u8,
    /// Whether the host supports XSAVE/XRSTOR.
    pub xsave: bool,
}

impl HostCpu {
    /// Identifies the processor this code runs on.
    #[cfg(target_arch = "x86_64")]
    pub fn current() -> Self {
        let cpuid = x86::cpuid::CpuId::new();
        cpuid
            .get_feature_info()
            .map_or(Self { family: 0, model: 0, xsave: false }, |info| Self {
                family: info.family_id(),
                model: info.model_id(),
                xsave: info.has_xsave(),
            })
    }
}
