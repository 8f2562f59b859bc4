//! The module containing the guest-physical memory mapping state machine,
//! the EPT violation policy, and the handlers of page manager notifications.
//!
//! Every mapped guest page is in one of four states. The engine is the only
//! writer of a page's state, but the page manager owns the storage: each
//! transition takes the state by `&mut` and leaves it at its last known good
//! value when the host refuses the change.

use core::fmt;
use std::sync::Arc;

use bitvec::prelude::*;

use crate::hypervisor::{
    error::Error,
    host_api::{HostAddr, HostApi, HostResult, HostStatus, SpaceId},
};

/// The size of a guest page.
pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Guest access rights of a mapping (`hv_memory_flags_t`).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, derive_more::BitOr, derive_more::BitAnd)]
pub struct MemoryProtection(u32);

impl MemoryProtection {
    /// No access.
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const READ: Self = Self(1 << 0);
    /// Writable.
    pub const WRITE: Self = Self(1 << 1);
    /// Executable.
    pub const EXEC: Self = Self(1 << 2);

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns whether every right in `other` is granted.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns whether any right in `other` is granted.
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

impl fmt::Debug for MemoryProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("NONE");
        }
        let names = [(Self::READ, "R"), (Self::WRITE, "W"), (Self::EXEC, "X")];
        let mut first = true;
        for (right, name) in names {
            if self.contains(right) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The mapping state of a guest page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Not mapped. Any access exits.
    #[default]
    Unmapped = 0,
    /// Readable and executable.
    Rx = 1,
    /// Readable and writable.
    Rw = 2,
    /// Readable, writable and executable.
    Rwx = 3,
}

impl PageState {
    /// Returns the state a mapping with `prot` ends in, or `None` for
    /// protections the engine does not map.
    pub fn from_prot(prot: MemoryProtection) -> Option<Self> {
        const R: MemoryProtection = MemoryProtection::READ;
        const W: MemoryProtection = MemoryProtection::WRITE;
        const X: MemoryProtection = MemoryProtection::EXEC;

        match prot {
            MemoryProtection::NONE => Some(Self::Unmapped),
            p if p == R | X => Some(Self::Rx),
            p if p == R | W => Some(Self::Rw),
            p if p == R | W | X => Some(Self::Rwx),
            _ => None,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Unmapped,
            1 => Self::Rx,
            2 => Self::Rw,
            _ => Self::Rwx,
        }
    }
}

/// Why a mapping transition was refused.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// Mapping a range that is mapped already.
    #[error("already mapped as {0:?}")]
    AlreadyMapped(PageState),

    /// Changing the protection of a range that is not mapped.
    #[error("not mapped")]
    NotMapped,

    /// The protection has no corresponding page state.
    #[error("protection {0:?} cannot be mapped")]
    InvalidProtection(MemoryProtection),

    /// The host refused the change.
    #[error("{0}")]
    Host(HostStatus),
}

/// The 2-bit page states of a contiguous guest-physical range, packed.
#[derive(Debug)]
pub struct PageStateTable {
    base: u64,
    bits: BitVec<u8, Lsb0>,
}

impl PageStateTable {
    /// Creates a table of `pages` unmapped pages starting at `base`.
    pub fn new(base: u64, pages: usize) -> Self {
        Self {
            base: base & !PAGE_OFFSET_MASK,
            bits: bitvec![u8, Lsb0; 0; pages * 2],
        }
    }

    fn index(&self, gpa: u64) -> Option<usize> {
        let page = usize::try_from(gpa.checked_sub(self.base)? / PAGE_SIZE).ok()?;
        (page * 2 < self.bits.len()).then_some(page * 2)
    }

    /// Returns the state of the page containing `gpa`.
    pub fn get(&self, gpa: u64) -> Option<PageState> {
        let index = self.index(gpa)?;
        Some(PageState::from_bits(self.bits[index..index + 2].load::<u8>()))
    }

    /// Sets the state of the page containing `gpa`. Returns `false` when
    /// the page is outside the table.
    pub fn set(&mut self, gpa: u64, state: PageState) -> bool {
        let Some(index) = self.index(gpa) else {
            return false;
        };
        self.bits[index..index + 2].store(state as u8);
        true
    }
}

/// What the page manager knows about a guest page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    /// The host memory backing the page, if any.
    pub backing: Option<HostAddr>,
    /// The access the guest is allowed.
    pub prot: MemoryProtection,
}

/// The emulator's guest-physical memory manager.
pub trait PageManager {
    /// Looks up the page containing `gpa`.
    fn query(&mut self, gpa: u64) -> Option<PageInfo>;

    /// Returns the mapping state of the page containing `gpa`.
    fn page_state(&mut self, gpa: u64) -> Option<PageState>;

    /// Stores the mapping state of the page containing `gpa`.
    fn set_page_state(&mut self, gpa: u64, state: PageState);
}

/// An EPT violation as reported on exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EptViolation {
    /// The guest-physical address accessed.
    pub gpa: u64,
    /// The exit qualification.
    pub qualification: u64,
}

impl EptViolation {
    /// Whether the access was a write.
    ///
    /// See: Table 28-7. Exit Qualification for EPT Violations
    pub fn is_write(&self) -> bool {
        (self.qualification & (1 << 1)) != 0
    }
}

/// How an EPT violation was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EptResolution {
    /// The mapping was fixed up. Re-execute the instruction.
    Resume,
    /// The access needs emulation.
    Forward,
}

/// Flags of an MMIO range mapping notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmioFlags {
    /// The range replaces RAM.
    pub replace: bool,
    /// The range is backed by MMIO2 memory.
    pub mmio2: bool,
}

/// Applies mapping transitions of guest-physical memory through the host.
#[derive(Clone)]
pub struct PageMapper {
    host: Arc<dyn HostApi>,
    space: Option<SpaceId>,
}

impl fmt::Debug for PageMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMapper")
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

impl PageMapper {
    /// Creates a mapper for the default address space, or for `space`.
    pub fn new(host: Arc<dyn HostApi>, space: Option<SpaceId>) -> Self {
        Self { host, space }
    }

    /// Maps `len` bytes at `backing` to `gpa` with `prot`.
    ///
    /// Only legal from [`PageState::Unmapped`].
    pub fn map(
        &self,
        gpa: u64,
        len: u64,
        backing: HostAddr,
        prot: MemoryProtection,
        state: &mut PageState,
    ) -> Result<(), Error> {
        let failed = |reason| Error::Mapping { gpa, len, reason };
        if *state != PageState::Unmapped {
            return Err(failed(MappingError::AlreadyMapped(*state)));
        }
        let new_state = match PageState::from_prot(prot) {
            Some(PageState::Unmapped) | None => {
                log::error!("Refusing to map {gpa:#x} with {prot:?}");
                return Err(failed(MappingError::InvalidProtection(prot)));
            }
            Some(new_state) => new_state,
        };

        let result = match self.space {
            Some(space) => self.host.vm_map_space(space, backing, gpa, len, prot),
            None => self.host.vm_map(backing, gpa, len, prot),
        };
        self.commit(result, gpa, len, state, new_state)
    }

    /// Unmaps `len` bytes at `gpa`. Unmapping an unmapped range succeeds
    /// without asking the host.
    pub fn unmap(&self, gpa: u64, len: u64, state: &mut PageState) -> Result<(), Error> {
        if *state == PageState::Unmapped {
            return Ok(());
        }
        let gpa = gpa & !PAGE_OFFSET_MASK;
        let result = match self.space {
            Some(space) => self.host.vm_unmap_space(space, gpa, len),
            None => self.host.vm_unmap(gpa, len),
        };
        self.commit(result, gpa, len, state, PageState::Unmapped)
    }

    /// Changes the protection of a mapped range. Protecting to
    /// [`MemoryProtection::NONE`] unmaps the range.
    pub fn reprotect(
        &self,
        gpa: u64,
        len: u64,
        prot: MemoryProtection,
        state: &mut PageState,
    ) -> Result<(), Error> {
        let failed = |reason| Error::Mapping { gpa, len, reason };
        if *state == PageState::Unmapped {
            return Err(failed(MappingError::NotMapped));
        }
        let new_state = match PageState::from_prot(prot) {
            Some(PageState::Unmapped) => return self.unmap(gpa, len, state),
            Some(new_state) => new_state,
            None => {
                log::error!("Refusing to protect {gpa:#x} with {prot:?}");
                return Err(failed(MappingError::InvalidProtection(prot)));
            }
        };

        let result = match self.space {
            Some(space) => self.host.vm_protect_space(space, gpa, len, prot),
            None => self.host.vm_protect(gpa, len, prot),
        };
        self.commit(result, gpa, len, state, new_state)
    }

    fn commit(
        &self,
        result: HostResult<()>,
        gpa: u64,
        len: u64,
        state: &mut PageState,
        new_state: PageState,
    ) -> Result<(), Error> {
        match result {
            Ok(()) => {
                *state = new_state;
                Ok(())
            }
            Err(status) => {
                log::warn!("{gpa:#x} ({len:#x} bytes) stays {state:?}: {status}");
                Err(Error::Mapping {
                    gpa,
                    len,
                    reason: MappingError::Host(status),
                })
            }
        }
    }

    /// Settles an EPT violation against what the page manager knows about
    /// the page.
    pub fn handle_ept_violation(
        &self,
        violation: &EptViolation,
        page: Option<PageInfo>,
        state: &mut PageState,
    ) -> Result<EptResolution, Error> {
        let gpa = violation.gpa & !PAGE_OFFSET_MASK;
        let prot = page.map_or(MemoryProtection::NONE, |page| page.prot);
        let writable = prot.contains(MemoryProtection::WRITE);
        log::trace!("EPT violation {:#x?} on {state:?} page, {prot:?}", violation.gpa);

        match *state {
            PageState::Unmapped => {
                let Some(backing) = page.and_then(|page| page.backing) else {
                    return Ok(EptResolution::Forward);
                };
                if prot == MemoryProtection::NONE || (violation.is_write() && !writable) {
                    return Ok(EptResolution::Forward);
                }
                if PageState::from_prot(prot).is_none() {
                    log::warn!("Cannot map {gpa:#x} with {prot:?}, forwarding");
                    return Ok(EptResolution::Forward);
                }
                self.map(gpa, PAGE_SIZE, backing, prot, state)?;
                Ok(EptResolution::Resume)
            }
            PageState::Rx if violation.is_write() && writable => {
                self.unmap(gpa, PAGE_SIZE, state)?;
                if let Some(backing) = page.and_then(|page| page.backing) {
                    self.map(gpa, PAGE_SIZE, backing, prot, state)?;
                }
                Ok(EptResolution::Resume)
            }
            PageState::Rx
                if !writable && prot.intersects(MemoryProtection::READ | MemoryProtection::EXEC) =>
            {
                Ok(EptResolution::Resume)
            }
            PageState::Rw | PageState::Rwx if writable => {
                log::trace!("Spurious EPT violation {gpa:#x?}");
                Ok(EptResolution::Resume)
            }
            _ => {
                self.unmap(gpa, PAGE_SIZE, state)?;
                Ok(EptResolution::Resume)
            }
        }
    }

    /// Settles an EPT violation, loading and storing the page state through
    /// the page manager.
    pub fn resolve_ept_violation(
        &self,
        violation: &EptViolation,
        page_manager: &mut dyn PageManager,
    ) -> Result<EptResolution, Error> {
        let Some(mut state) = page_manager.page_state(violation.gpa) else {
            return Ok(EptResolution::Forward);
        };
        let page = page_manager.query(violation.gpa);
        let result = self.handle_ept_violation(violation, page, &mut state);
        page_manager.set_page_state(violation.gpa, state);
        result
    }

    /// RAM was registered. Backed RAM is mapped with full access.
    pub fn on_ram_register(
        &self,
        gpa: u64,
        len: u64,
        backing: Option<HostAddr>,
        state: &mut PageState,
    ) -> Result<(), Error> {
        log::debug!("RAM {gpa:#x} ({len:#x} bytes) at {backing:x?}");
        match backing {
            Some(backing) => self.map(gpa, len, backing, rwx(), state),
            None => Ok(()),
        }
    }

    /// An MMIO range is about to be mapped.
    pub fn on_mmio_map_early(
        &self,
        gpa: u64,
        len: u64,
        flags: MmioFlags,
        mmio2: Option<HostAddr>,
        state: &mut PageState,
    ) -> Result<(), Error> {
        log::debug!("MMIO {gpa:#x} ({len:#x} bytes) {flags:?} MMIO2 {mmio2:x?}");
        if flags.replace {
            if let Err(err) = self.unmap(gpa, len, state) {
                if mmio2.is_none() {
                    return Err(err);
                }
                log::warn!("Ignoring failure to unmap replaced RAM: {err}");
            }
        }
        match mmio2 {
            Some(backing) => {
                self.map(gpa, len, backing, MemoryProtection::READ | MemoryProtection::WRITE, state)
            }
            None => Ok(()),
        }
    }

    /// An MMIO range was unmapped. RAM it replaced is mapped back.
    pub fn on_mmio_unmap(
        &self,
        gpa: u64,
        len: u64,
        flags: MmioFlags,
        ram: Option<HostAddr>,
        state: &mut PageState,
    ) -> Result<(), Error> {
        log::debug!("MMIO {gpa:#x} ({len:#x} bytes) {flags:?} gone, RAM {ram:x?}");
        if flags.mmio2 {
            self.unmap(gpa, len, state)?;
        }
        match ram {
            Some(backing) if flags.replace => self.map(gpa, len, backing, rwx(), state),
            _ => Ok(()),
        }
    }

    /// A ROM range is about to be registered.
    pub fn on_rom_register_early(
        &self,
        gpa: u64,
        len: u64,
        replace: bool,
        state: &mut PageState,
    ) -> Result<(), Error> {
        if replace {
            self.unmap(gpa, len, state)?;
        }
        Ok(())
    }

    /// A zero page got real backing. Unmap it so that the next access maps
    /// the new backing.
    pub fn on_page_allocated(&self, gpa: u64, state: &mut PageState) -> Result<(), Error> {
        self.unmap(gpa, PAGE_SIZE, state)
    }

    /// The guest access rights of a page changed. Failures are logged, as
    /// the next access settles the mapping through an EPT violation.
    pub fn on_protection_changed(
        &self,
        gpa: u64,
        backing: Option<HostAddr>,
        prot: MemoryProtection,
        state: &mut PageState,
    ) {
        let gpa = gpa & !PAGE_OFFSET_MASK;
        let result = match (*state, backing) {
            (PageState::Unmapped, _) if prot == MemoryProtection::NONE => return,
            (PageState::Unmapped, Some(backing)) => self.map(gpa, PAGE_SIZE, backing, prot, state),
            (PageState::Unmapped, None) => return,
            _ => self.reprotect(gpa, PAGE_SIZE, prot, state),
        };
        if let Err(err) = result {
            log::warn!("{err}");
        }
    }

    /// The backing of a page moved.
    pub fn on_page_relocated(
        &self,
        gpa: u64,
        new_backing: HostAddr,
        prot: MemoryProtection,
        state: &mut PageState,
    ) -> Result<(), Error> {
        let gpa = gpa & !PAGE_OFFSET_MASK;
        self.unmap(gpa, PAGE_SIZE, state)?;
        if prot == MemoryProtection::NONE {
            return Ok(());
        }
        if let Err(err) = self.map(gpa, PAGE_SIZE, new_backing, prot, state) {
            log::warn!("{err}");
        }
        Ok(())
    }

    /// The A20 gate changed. Nothing to do, as the guest does not run while
    /// A20 is masked.
    pub fn on_a20_changed(&self, enabled: bool) {
        log::debug!("A20 {}", if enabled { "enabled" } else { "disabled" });
    }
}

fn rwx() -> MemoryProtection {
    MemoryProtection::READ | MemoryProtection::WRITE | MemoryProtection::EXEC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockHost;

    const RW: MemoryProtection =
        MemoryProtection(MemoryProtection::READ.0 | MemoryProtection::WRITE.0);
    const RX: MemoryProtection =
        MemoryProtection(MemoryProtection::READ.0 | MemoryProtection::EXEC.0);
    const BACKING: HostAddr = HostAddr(0x7f00_0000_0000);

    fn mapper() -> (Arc<MockHost>, PageMapper) {
        let host = Arc::new(MockHost::new());
        let mapper = PageMapper::new(host.clone(), None);
        (host, mapper)
    }

    fn write_violation(gpa: u64) -> EptViolation {
        EptViolation {
            gpa,
            qualification: 0b10,
        }
    }

    #[test]
    fn protections_map_to_states() {
        assert_eq!(PageState::from_prot(MemoryProtection::NONE), Some(PageState::Unmapped));
        assert_eq!(PageState::from_prot(RX), Some(PageState::Rx));
        assert_eq!(PageState::from_prot(RW), Some(PageState::Rw));
        assert_eq!(PageState::from_prot(rwx()), Some(PageState::Rwx));
        assert_eq!(PageState::from_prot(MemoryProtection::EXEC), None);
        assert_eq!(PageState::from_prot(MemoryProtection::WRITE), None);
        assert_eq!(format!("{:?}", rwx()), "R|W|X");
    }

    #[test]
    fn unmap_is_idempotent() {
        let (host, mapper) = mapper();
        let mut state = PageState::Rw;

        mapper.unmap(0x1000, PAGE_SIZE, &mut state).unwrap();
        mapper.unmap(0x1000, PAGE_SIZE, &mut state).unwrap();
        assert_eq!(state, PageState::Unmapped);
        assert_eq!(host.calls(), ["vm_unmap(0x1000, 0x1000)"]);
    }

    #[test]
    fn map_unmap_map_reproduces_the_state() {
        let (_host, mapper) = mapper();
        let mut state = PageState::Unmapped;

        mapper.map(0x1000, PAGE_SIZE, BACKING, RX, &mut state).unwrap();
        let first = state;
        mapper.unmap(0x1000, PAGE_SIZE, &mut state).unwrap();
        mapper.map(0x1000, PAGE_SIZE, BACKING, RX, &mut state).unwrap();
        assert_eq!(state, first);
        assert_eq!(state, PageState::Rx);
    }

    #[test]
    fn map_requires_unmapped() {
        let (host, mapper) = mapper();
        let mut state = PageState::Rx;

        let err = mapper.map(0x1000, PAGE_SIZE, BACKING, RW, &mut state).unwrap_err();
        assert_eq!(
            err,
            Error::Mapping {
                gpa: 0x1000,
                len: PAGE_SIZE,
                reason: MappingError::AlreadyMapped(PageState::Rx),
            }
        );
        assert!(host.calls().is_empty());
    }

    #[test]
    fn map_then_reprotect_does_not_unmap() {
        let (host, mapper) = mapper();
        let mut state = PageState::Unmapped;

        mapper.map(0x1000, PAGE_SIZE, BACKING, RW, &mut state).unwrap();
        mapper.reprotect(0x1000, PAGE_SIZE, rwx(), &mut state).unwrap();
        assert_eq!(state, PageState::Rwx);
        assert!(!host.calls().iter().any(|call| call.starts_with("vm_unmap")));
        assert_eq!(host.calls().last().unwrap(), "vm_protect(0x1000, 0x1000, R|W|X)");
    }

    #[test]
    fn reprotect_requires_a_mapping() {
        let (_host, mapper) = mapper();
        let mut state = PageState::Unmapped;

        let err = mapper.reprotect(0x1000, PAGE_SIZE, RW, &mut state).unwrap_err();
        assert!(matches!(
            err,
            Error::Mapping {
                reason: MappingError::NotMapped,
                ..
            }
        ));
    }

    #[test]
    fn host_failure_keeps_the_last_state() {
        let (host, mapper) = mapper();
        host.fail_mapping(HostStatus::NoResources);
        let mut state = PageState::Rx;

        let err = mapper.reprotect(0x1000, PAGE_SIZE, RW, &mut state).unwrap_err();
        assert_eq!(state, PageState::Rx);
        assert_eq!(
            err.to_string(),
            "could not update the mapping of 0x1000 (0x1000 bytes): out of resources"
        );
    }

    #[test]
    fn address_spaces_use_space_calls() {
        let host = Arc::new(MockHost::new());
        let mapper = PageMapper::new(host.clone(), Some(SpaceId(1)));
        let mut state = PageState::Unmapped;

        mapper.map(0x2000, PAGE_SIZE, BACKING, RW, &mut state).unwrap();
        mapper.unmap(0x2000, PAGE_SIZE, &mut state).unwrap();
        assert_eq!(
            host.calls(),
            [
                "vm_map_space(1, 0x2000, 0x1000, R|W)",
                "vm_unmap_space(1, 0x2000, 0x1000)"
            ]
        );
    }

    #[test]
    fn write_to_rx_page_remaps_writable() {
        let (host, mapper) = mapper();
        let mut state = PageState::Rx;
        let page = PageInfo {
            backing: Some(BACKING),
            prot: RW,
        };

        let resolution = mapper
            .handle_ept_violation(&write_violation(0x3004), Some(page), &mut state)
            .unwrap();
        assert_eq!(resolution, EptResolution::Resume);
        assert_eq!(state, PageState::Rw);
        assert_eq!(
            host.calls(),
            ["vm_unmap(0x3000, 0x1000)", "vm_map(0x3000, 0x1000, R|W)"]
        );
    }

    #[test]
    fn unmapped_page_without_access_is_forwarded() {
        let (host, mapper) = mapper();
        let mut state = PageState::Unmapped;

        let none = PageInfo {
            backing: Some(BACKING),
            prot: MemoryProtection::NONE,
        };
        let resolution = mapper
            .handle_ept_violation(&write_violation(0x3000), Some(none), &mut state)
            .unwrap();
        assert_eq!(resolution, EptResolution::Forward);

        let read_only = PageInfo {
            backing: Some(BACKING),
            prot: RX,
        };
        let resolution = mapper
            .handle_ept_violation(&write_violation(0x3000), Some(read_only), &mut state)
            .unwrap();
        assert_eq!(resolution, EptResolution::Forward);
        assert!(host.calls().is_empty());

        let read = EptViolation {
            gpa: 0x3000,
            qualification: 0b1,
        };
        let resolution = mapper
            .handle_ept_violation(&read, Some(read_only), &mut state)
            .unwrap();
        assert_eq!(resolution, EptResolution::Resume);
        assert_eq!(state, PageState::Rx);
    }

    #[test]
    fn unmappable_protection_is_forwarded() {
        let (host, mapper) = mapper();
        let mut state = PageState::Unmapped;
        let read = EptViolation {
            gpa: 0x3000,
            qualification: 0b1,
        };

        for prot in [
            MemoryProtection::READ,
            MemoryProtection::WRITE | MemoryProtection::EXEC,
        ] {
            let page = PageInfo {
                backing: Some(BACKING),
                prot,
            };
            let resolution = mapper
                .handle_ept_violation(&read, Some(page), &mut state)
                .unwrap();
            assert_eq!(resolution, EptResolution::Forward);
            assert_eq!(state, PageState::Unmapped);
        }
        assert!(host.calls().is_empty());
    }

    #[test]
    fn spurious_violation_resumes_without_host_calls() {
        let (host, mapper) = mapper();
        let mut state = PageState::Rwx;
        let page = PageInfo {
            backing: Some(BACKING),
            prot: rwx(),
        };

        let resolution = mapper
            .handle_ept_violation(&write_violation(0x3000), Some(page), &mut state)
            .unwrap();
        assert_eq!(resolution, EptResolution::Resume);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn lost_write_access_unmaps() {
        let (host, mapper) = mapper();
        let mut state = PageState::Rw;
        let page = PageInfo {
            backing: Some(BACKING),
            prot: RX,
        };

        let resolution = mapper
            .handle_ept_violation(&write_violation(0x3000), Some(page), &mut state)
            .unwrap();
        assert_eq!(resolution, EptResolution::Resume);
        assert_eq!(state, PageState::Unmapped);
        assert_eq!(host.calls(), ["vm_unmap(0x3000, 0x1000)"]);
    }

    #[test]
    fn protection_changes_map_or_reprotect() {
        let (host, mapper) = mapper();
        let mut state = PageState::Unmapped;

        mapper.on_protection_changed(0x4000, None, MemoryProtection::NONE, &mut state);
        assert!(host.calls().is_empty());

        mapper.on_protection_changed(0x4000, Some(BACKING), RX, &mut state);
        assert_eq!(state, PageState::Rx);
        mapper.on_protection_changed(0x4000, Some(BACKING), rwx(), &mut state);
        assert_eq!(state, PageState::Rwx);
        mapper.on_protection_changed(0x4000, Some(BACKING), MemoryProtection::NONE, &mut state);
        assert_eq!(state, PageState::Unmapped);
    }

    #[test]
    fn mmio2_replacing_ram_tolerates_unmap_failure() {
        let (host, mapper) = mapper();
        let flags = MmioFlags {
            replace: true,
            mmio2: true,
        };
        let mut state = PageState::Rwx;
        host.fail_unmap(HostStatus::Error);

        let err = mapper.on_mmio_map_early(0x5000, PAGE_SIZE, MmioFlags { mmio2: false, ..flags }, None, &mut state);
        assert!(err.is_err());
        assert_eq!(state, PageState::Rwx);

        let mut state = PageState::Unmapped;
        mapper
            .on_mmio_map_early(0x5000, PAGE_SIZE, flags, Some(BACKING), &mut state)
            .unwrap();
        assert_eq!(state, PageState::Rw);

        host.clear_failures();
        mapper
            .on_mmio_unmap(0x5000, PAGE_SIZE, flags, Some(BACKING), &mut state)
            .unwrap();
        assert_eq!(state, PageState::Rwx);
    }

    #[test]
    fn relocated_page_is_remapped() {
        let (host, mapper) = mapper();
        let mut state = PageState::Rw;

        mapper
            .on_page_relocated(0x6000, HostAddr(0x7f00_0000_8000), RW, &mut state)
            .unwrap();
        assert_eq!(state, PageState::Rw);
        assert_eq!(
            host.calls(),
            ["vm_unmap(0x6000, 0x1000)", "vm_map(0x6000, 0x1000, R|W)"]
        );
    }

    #[test]
    fn table_packs_two_bits_per_page() {
        let mut table = PageStateTable::new(0x10_0000, 4);
        assert_eq!(table.get(0x10_2fff), Some(PageState::Unmapped));
        assert!(table.set(0x10_2000, PageState::Rwx));
        assert!(table.set(0x10_1000, PageState::Rx));
        assert_eq!(table.get(0x10_2000), Some(PageState::Rwx));
        assert_eq!(table.get(0x10_1abc), Some(PageState::Rx));
        assert_eq!(table.get(0x10_3000), Some(PageState::Unmapped));
        assert_eq!(table.get(0x10_4000), None);
        assert_eq!(table.get(0xf_f000), None);
        assert!(!table.set(0x10_4000, PageState::Rw));
    }
}
