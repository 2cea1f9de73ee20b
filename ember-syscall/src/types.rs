//! Argument types shared by the SVC handlers and user space.

use core::fmt;

// === Priorities ===

/// Highest (most urgent) thread priority.
pub const HIGHEST_THREAD_PRIORITY: i32 = 0;

/// Lowest thread priority that is ever scheduled.
pub const LOWEST_THREAD_PRIORITY: i32 = 63;

/// Priorities below this are reserved for system threads.
pub const SYSTEM_THREAD_PRIORITY_HIGHEST: i32 = 16;

/// Number of schedulable priority levels.
pub const NUM_PRIORITIES: usize = (LOWEST_THREAD_PRIORITY + 1) as usize;

#[inline]
#[must_use]
pub const fn is_valid_priority(priority: i32) -> bool {
    priority >= HIGHEST_THREAD_PRIORITY && priority <= LOWEST_THREAD_PRIORITY
}

// === Ideal core ===

/// The thread may run on any core in its mask.
pub const IDEAL_CORE_DONT_CARE: i32 = -1;
/// Use the owning process's ideal core.
pub const IDEAL_CORE_USE_PROCESS_VALUE: i32 = -2;
/// Keep the current ideal core, only change the mask.
pub const IDEAL_CORE_NO_UPDATE: i32 = -3;

// === Yield ===

/// Yield variants selected by `SleepThread` with a non-positive timeout.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YieldType {
    WithoutCoreMigration = 0,
    WithCoreMigration = -1,
    ToAnyThread = -2,
}

impl YieldType {
    /// Decode a `SleepThread` argument.
    ///
    /// Positive values are real sleeps and return `None`; so do negative
    /// values with no yield meaning.
    #[must_use]
    pub const fn from_sleep_ns(ns: i64) -> Option<Self> {
        match ns {
            0 => Some(Self::WithoutCoreMigration),
            -1 => Some(Self::WithCoreMigration),
            -2 => Some(Self::ToAnyThread),
            _ => None,
        }
    }
}

// === Thread activity ===

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadActivity {
    Runnable = 0,
    Paused = 1,
}

impl ThreadActivity {
    #[must_use]
    pub const fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Runnable),
            1 => Some(Self::Paused),
            _ => None,
        }
    }
}

// === Processes ===

/// Selector for `GetProcessInfo`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessInfoType {
    ProcessState = 0,
}

impl ProcessInfoType {
    #[must_use]
    pub const fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::ProcessState),
            _ => None,
        }
    }
}

/// Process lifecycle state as reported to user space.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Created = 0,
    CreatedAttached = 1,
    Running = 2,
    Crashed = 3,
    RunningAttached = 4,
    Terminating = 5,
    Terminated = 6,
    DebugBreak = 7,
}

impl ProcessState {
    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::CreatedAttached => "created (attached)",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::RunningAttached => "running (attached)",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::DebugBreak => "debug break",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === Memory ===

/// Permission bits of a user mapping.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct MemoryPermission(u32);

impl MemoryPermission {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);
    pub const READ_WRITE: Self = Self(Self::READ.0 | Self::WRITE.0);
    pub const READ_EXECUTE: Self = Self(Self::READ.0 | Self::EXECUTE.0);

    const ALL: u32 = Self::READ.0 | Self::WRITE.0 | Self::EXECUTE.0;

    /// Decode a raw value. Unknown bits are rejected.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw & !Self::ALL != 0 {
            return None;
        }
        Some(Self(raw))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether user space may request this combination for its own memory.
    #[must_use]
    pub const fn is_user_settable(self) -> bool {
        self.0 == Self::READ.0 || self.0 == Self::READ_WRITE.0 || self.0 == Self::READ_EXECUTE.0
    }
}

impl fmt::Debug for MemoryPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Self, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "MemoryPermission({}{}{})",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXECUTE, 'x')
        )
    }
}

/// What a queried range is used for.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryState {
    Free = 0x00,
    Normal = 0x05,
    Alias = 0x07,
}

/// Result of `QueryMemory`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base: u64,
    pub size: u64,
    pub permission: MemoryPermission,
    pub state: MemoryState,
}
