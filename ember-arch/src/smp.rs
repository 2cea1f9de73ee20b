//! SMP (Symmetric Multi-Processing) Support
//!
//! Core count, core-mask arithmetic and online tracking. A core mask is a
//! `u64` with bit `n` standing for core `n`; the scheduler hands these to the
//! IPI path and stores them as thread affinities.

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of cores the kernel schedules on
pub const NUM_CORES: usize = 4;

/// Mask with every schedulable core set
pub const ALL_CORES_MASK: u64 = (1 << NUM_CORES) - 1;

/// Bitmask of online cores. The boot core is online from the start.
static ONLINE_CORES: AtomicU64 = AtomicU64::new(1);

/// A set of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct CoreMask(pub u64);

impl CoreMask {
    /// The empty set
    pub const EMPTY: Self = Self(0);

    /// Every schedulable core
    pub const ALL: Self = Self(ALL_CORES_MASK);

    /// Mask with only `core` set.
    #[inline]
    #[must_use]
    pub const fn single(core: usize) -> Self {
        Self(core_bit(core))
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, core: usize) -> bool {
        core < 64 && self.0 & core_bit(core) != 0
    }

    /// Copy of this mask with `core` removed.
    #[inline]
    #[must_use]
    pub const fn without(self, core: usize) -> Self {
        Self(self.0 & !core_bit(core))
    }

    /// Lowest-numbered core in the set.
    #[inline]
    #[must_use]
    pub const fn lowest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Highest-numbered core in the set.
    #[inline]
    #[must_use]
    pub const fn highest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }

    /// Iterate the cores in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let core = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(core)
        })
    }
}

/// Bit for a single core.
#[inline]
#[must_use]
pub const fn core_bit(core: usize) -> u64 {
    1u64 << core
}

/// Mark `core` as online.
///
/// Called by each secondary core once it can take scheduler IPIs.
pub fn mark_core_online(core: usize) {
    ONLINE_CORES.fetch_or(core_bit(core), Ordering::SeqCst);
}

/// Snapshot of the online cores.
#[must_use]
pub fn online_cores() -> CoreMask {
    CoreMask(ONLINE_CORES.load(Ordering::Acquire))
}
