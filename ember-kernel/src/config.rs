//! Kernel Configuration
//!
//! Runtime knobs the board code hands to [`Kernel::new`](crate::Kernel::new).
//! Everything fixed by the hardware or the ABI stays a constant next to its
//! user; this struct only holds what differs between boards and test setups.

use core::fmt;

use ember_arch::smp::{ALL_CORES_MASK, NUM_CORES};
use log::LevelFilter;

use crate::object::handle_table::MAX_HANDLE_TABLE_SIZE;

// -- Defaults

/// Default arena capacity for threads.
pub const DEFAULT_MAX_THREADS: usize = 256;

/// Default arena capacity for processes.
pub const DEFAULT_MAX_PROCESSES: usize = 32;

/// Generic timer frequency of the reference board (19.2 MHz).
pub const DEFAULT_TICKS_PER_SECOND: u64 = 19_200_000;

/// Runtime kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Cores the scheduler may place threads on.
    pub active_cores: u64,
    /// Capacity of the thread arena.
    pub max_threads: usize,
    /// Capacity of the process arena.
    pub max_processes: usize,
    /// Handle table size used when `CreateProcess` passes 0.
    pub default_handle_table_size: usize,
    /// Maximum level the kernel logger records.
    pub log_level: LevelFilter,
    /// Count scheduler switches to idle per core.
    pub count_idle: bool,
    /// Frequency of the tick passed to `handle_timer_tick`.
    pub ticks_per_second: u64,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        active_cores: ALL_CORES_MASK,
        max_threads: DEFAULT_MAX_THREADS,
        max_processes: DEFAULT_MAX_PROCESSES,
        default_handle_table_size: MAX_HANDLE_TABLE_SIZE,
        log_level: LevelFilter::Debug,
        count_idle: false,
        ticks_per_second: DEFAULT_TICKS_PER_SECOND,
    };

    /// Check the configuration before the kernel is built from it.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.active_cores == 0 || self.active_cores & !ALL_CORES_MASK != 0 {
            return Err(ConfigError::InvalidCoreMask);
        }
        if self.max_threads == 0 || self.max_threads >= u32::MAX as usize {
            return Err(ConfigError::InvalidThreadLimit);
        }
        if self.max_processes == 0 || self.max_processes >= u32::MAX as usize {
            return Err(ConfigError::InvalidProcessLimit);
        }
        if self.default_handle_table_size == 0
            || self.default_handle_table_size > MAX_HANDLE_TABLE_SIZE
        {
            return Err(ConfigError::InvalidHandleTableSize);
        }
        if self.ticks_per_second == 0 {
            return Err(ConfigError::InvalidTickRate);
        }
        Ok(())
    }

    /// Number of cores in [`active_cores`](Self::active_cores).
    #[must_use]
    pub const fn num_active_cores(&self) -> usize {
        let n = self.active_cores.count_ones() as usize;
        if n > NUM_CORES {
            NUM_CORES
        } else {
            n
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Rejected configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "configuration errors must be handled"]
pub enum ConfigError {
    /// No active core, or a core beyond `NUM_CORES`
    InvalidCoreMask,
    /// Thread capacity is zero or too large
    InvalidThreadLimit,
    /// Process capacity is zero or too large
    InvalidProcessLimit,
    /// Default handle table size outside 1..=1024
    InvalidHandleTableSize,
    /// Tick frequency is zero
    InvalidTickRate,
}

impl ConfigError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCoreMask => "active core mask is empty or names unknown cores",
            Self::InvalidThreadLimit => "thread limit out of range",
            Self::InvalidProcessLimit => "process limit out of range",
            Self::InvalidHandleTableSize => "default handle table size out of range",
            Self::InvalidTickRate => "tick frequency is zero",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
