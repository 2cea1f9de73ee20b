//! Processes

use alloc::vec::Vec;
use core::fmt;

use ember_intrusive::{List, RbLink};
use ember_paging::AddressSpace;
use ember_syscall::types::ProcessState;
use ember_syscall::SvcResult;

use super::handle_table::HandleTable;
use super::thread::ProcessThreadAdapter;
use super::ObjectRef;

/// Bytes of a process name.
pub const PROCESS_NAME_LEN: usize = 12;

/// Creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct ProcessParams {
    pub name: [u8; PROCESS_NAME_LEN],
    pub ideal_core: i32,
    pub core_mask: u64,
    /// Bit `p` set: threads may use priority `p`
    pub priority_mask: u64,
    /// 0 selects the kernel default
    pub handle_table_size: usize,
}

/// A `MapMemory` alias: `dst` shows the pages behind `src`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasRegion {
    pub dst: u64,
    pub src: u64,
    pub size: u64,
}

impl AliasRegion {
    fn overlaps(base: u64, size: u64, addr: u64, len: u64) -> bool {
        addr < base + size && base < addr + len
    }

    /// `[addr, addr + len)` touches the alias or its source.
    #[must_use]
    pub fn touches(&self, addr: u64, len: u64) -> bool {
        Self::overlaps(self.dst, self.size, addr, len) || Self::overlaps(self.src, self.size, addr, len)
    }
}

/// A process: an address space, a handle table and a set of threads.
pub struct Process {
    pub(crate) id: u64,
    pub(crate) name: [u8; PROCESS_NAME_LEN],
    pub(crate) state: ProcessState,
    pub(crate) handle_table: HandleTable<ObjectRef>,
    pub(crate) threads: List<ProcessThreadAdapter>,
    pub(crate) id_link: RbLink,

    pub(crate) ideal_core: i32,
    pub(crate) core_mask: u64,
    pub(crate) priority_mask: u64,

    pub(crate) ref_count: u32,
    /// Holds the reference dropped when the process terminates
    pub(crate) running: bool,
    pub(crate) schedule_count: i64,

    pub(crate) address_space: Option<AddressSpace>,
    pub(crate) aliases: Vec<AliasRegion>,
}

impl Process {
    pub(crate) fn new(
        id: u64,
        params: &ProcessParams,
        handle_table_size: usize,
        address_space: Option<AddressSpace>,
    ) -> SvcResult<Self> {
        Ok(Self {
            id,
            name: params.name,
            state: ProcessState::Created,
            handle_table: HandleTable::new(handle_table_size)?,
            threads: List::new(ProcessThreadAdapter),
            id_link: RbLink::new(),
            ideal_core: params.ideal_core,
            core_mask: params.core_mask,
            priority_mask: params.priority_mask,
            ref_count: 1,
            running: false,
            schedule_count: 0,
            address_space,
            aliases: Vec::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Name up to the first NUL.
    #[must_use]
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(PROCESS_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    #[must_use]
    pub fn ideal_core(&self) -> i32 {
        self.ideal_core
    }

    #[must_use]
    pub fn core_mask(&self) -> u64 {
        self.core_mask
    }

    #[must_use]
    pub fn handle_table(&self) -> &HandleTable<ObjectRef> {
        &self.handle_table
    }

    #[must_use]
    pub fn address_space(&self) -> Option<AddressSpace> {
        self.address_space
    }

    /// Whether threads of this process may use `priority`.
    #[must_use]
    pub fn check_thread_priority(&self, priority: i32) -> bool {
        (0..64).contains(&priority) && self.priority_mask & (1u64 << priority) != 0
    }

    #[must_use]
    pub fn is_debug_attached(&self) -> bool {
        matches!(
            self.state,
            ProcessState::CreatedAttached | ProcessState::RunningAttached | ProcessState::DebugBreak
        )
    }

    /// Started and not yet terminating, attached or not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            ProcessState::Running | ProcessState::RunningAttached | ProcessState::DebugBreak
        )
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state)
            .field("core_mask", &format_args!("{:#x}", self.core_mask))
            .field("handles", &self.handle_table.count())
            .field("refs", &self.ref_count)
            .finish_non_exhaustive()
    }
}
