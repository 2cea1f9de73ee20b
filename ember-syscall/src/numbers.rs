//! SVC numbers
//!
//! The kernel is entered with `svc #imm`, where the immediate carries the
//! SVC id. Arguments arrive in x0-x7 and results go back in x0 (result code)
//! followed by x1.. for output values.
//!
//! Numbering follows the Horizon ABI so that existing user-space runtimes
//! can target the kernel unmodified.

/// SVC ids implemented by this kernel.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SvcId {
    // === Memory ===
    /// Change the permission of a mapped range.
    SetMemoryPermission = 0x02,
    /// Alias a mapped range at a second address.
    MapMemory = 0x04,
    /// Remove an alias created by `MapMemory`.
    UnmapMemory = 0x05,
    /// Describe the mapping that contains an address.
    QueryMemory = 0x06,

    // === Threads ===
    /// Create a thread in the current process.
    CreateThread = 0x08,
    /// Make a created thread runnable.
    StartThread = 0x09,
    /// Terminate the calling thread.
    ExitThread = 0x0A,
    /// Sleep for a number of nanoseconds, or yield when the value is <= 0.
    SleepThread = 0x0B,
    /// Read a thread's priority.
    GetThreadPriority = 0x0C,
    /// Change a thread's priority.
    SetThreadPriority = 0x0D,
    /// Read a thread's ideal core and affinity mask.
    GetThreadCoreMask = 0x0E,
    /// Change a thread's ideal core and affinity mask.
    SetThreadCoreMask = 0x0F,
    /// Number of the core the caller runs on.
    GetCurrentProcessorNumber = 0x10,

    // === Handles ===
    /// Close a handle.
    CloseHandle = 0x16,

    // === Identity ===
    /// Process id of a process or thread handle.
    GetProcessId = 0x24,
    /// Thread id of a thread handle.
    GetThreadId = 0x25,
    /// Pause or resume a thread.
    SetThreadActivity = 0x32,

    // === Debug / process management ===
    /// Attach to a process by id.
    DebugActiveProcess = 0x60,
    /// List live process ids.
    GetProcessList = 0x65,
    /// List thread ids of a process.
    GetThreadList = 0x66,
    /// Create an empty process.
    CreateProcess = 0x79,
    /// Start a process's main thread.
    StartProcess = 0x7A,
    /// Terminate a process and all its threads.
    TerminateProcess = 0x7B,
    /// Query process state.
    GetProcessInfo = 0x7C,
}

impl SvcId {
    /// Every implemented id, in numeric order.
    pub const ALL: [Self; 24] = [
        Self::SetMemoryPermission,
        Self::MapMemory,
        Self::UnmapMemory,
        Self::QueryMemory,
        Self::CreateThread,
        Self::StartThread,
        Self::ExitThread,
        Self::SleepThread,
        Self::GetThreadPriority,
        Self::SetThreadPriority,
        Self::GetThreadCoreMask,
        Self::SetThreadCoreMask,
        Self::GetCurrentProcessorNumber,
        Self::CloseHandle,
        Self::GetProcessId,
        Self::GetThreadId,
        Self::SetThreadActivity,
        Self::DebugActiveProcess,
        Self::GetProcessList,
        Self::GetThreadList,
        Self::CreateProcess,
        Self::StartProcess,
        Self::TerminateProcess,
        Self::GetProcessInfo,
    ];

    /// Raw SVC number.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// Try to convert from a raw SVC number.
    #[must_use]
    pub const fn from_number(value: u32) -> Option<Self> {
        match value {
            0x02 => Some(Self::SetMemoryPermission),
            0x04 => Some(Self::MapMemory),
            0x05 => Some(Self::UnmapMemory),
            0x06 => Some(Self::QueryMemory),
            0x08 => Some(Self::CreateThread),
            0x09 => Some(Self::StartThread),
            0x0A => Some(Self::ExitThread),
            0x0B => Some(Self::SleepThread),
            0x0C => Some(Self::GetThreadPriority),
            0x0D => Some(Self::SetThreadPriority),
            0x0E => Some(Self::GetThreadCoreMask),
            0x0F => Some(Self::SetThreadCoreMask),
            0x10 => Some(Self::GetCurrentProcessorNumber),
            0x16 => Some(Self::CloseHandle),
            0x24 => Some(Self::GetProcessId),
            0x25 => Some(Self::GetThreadId),
            0x32 => Some(Self::SetThreadActivity),
            0x60 => Some(Self::DebugActiveProcess),
            0x65 => Some(Self::GetProcessList),
            0x66 => Some(Self::GetThreadList),
            0x79 => Some(Self::CreateProcess),
            0x7A => Some(Self::StartProcess),
            0x7B => Some(Self::TerminateProcess),
            0x7C => Some(Self::GetProcessInfo),
            _ => None,
        }
    }

    /// Get the SVC name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SetMemoryPermission => "SetMemoryPermission",
            Self::MapMemory => "MapMemory",
            Self::UnmapMemory => "UnmapMemory",
            Self::QueryMemory => "QueryMemory",
            Self::CreateThread => "CreateThread",
            Self::StartThread => "StartThread",
            Self::ExitThread => "ExitThread",
            Self::SleepThread => "SleepThread",
            Self::GetThreadPriority => "GetThreadPriority",
            Self::SetThreadPriority => "SetThreadPriority",
            Self::GetThreadCoreMask => "GetThreadCoreMask",
            Self::SetThreadCoreMask => "SetThreadCoreMask",
            Self::GetCurrentProcessorNumber => "GetCurrentProcessorNumber",
            Self::CloseHandle => "CloseHandle",
            Self::GetProcessId => "GetProcessId",
            Self::GetThreadId => "GetThreadId",
            Self::SetThreadActivity => "SetThreadActivity",
            Self::DebugActiveProcess => "DebugActiveProcess",
            Self::GetProcessList => "GetProcessList",
            Self::GetThreadList => "GetThreadList",
            Self::CreateProcess => "CreateProcess",
            Self::StartProcess => "StartProcess",
            Self::TerminateProcess => "TerminateProcess",
            Self::GetProcessInfo => "GetProcessInfo",
        }
    }
}

impl TryFrom<u32> for SvcId {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_number(value).ok_or(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_round_trip() {
        for id in SvcId::ALL {
            assert_eq!(SvcId::from_number(id.number()), Some(id), "{}", id.name());
        }
    }

    #[test]
    fn test_all_is_sorted_and_unique() {
        assert!(SvcId::ALL.windows(2).all(|w| w[0].number() < w[1].number()));
    }

    #[test]
    fn test_unknown_numbers() {
        assert_eq!(SvcId::from_number(0x00), None);
        assert_eq!(SvcId::from_number(0x01), None);
        assert_eq!(SvcId::from_number(0x7F), None);
        assert_eq!(SvcId::try_from(0x1234), Err(0x1234));
        assert_eq!(SvcId::try_from(0x0B), Ok(SvcId::SleepThread));
    }
}
