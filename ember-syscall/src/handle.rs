//! Handles
//!
//! A handle names an entry in the calling process's handle table:
//!
//! ```text
//! +----------+-----------------+-----------------+
//! | reserved |    linear id    |      index      |
//! +----------+-----------------+-----------------+
//!   31    30   29           15   14             0
//! ```
//!
//! The linear id changes every time a slot is reused, so a closed handle
//! never resolves to the object that later takes its slot.

use core::fmt;

const INDEX_BITS: u32 = 15;
const LINEAR_ID_BITS: u32 = 15;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const LINEAR_ID_MASK: u32 = (1 << LINEAR_ID_BITS) - 1;

/// Handle value passed across the SVC boundary.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The null handle; never valid.
    pub const INVALID: Self = Self(0);

    /// Pseudo-handle for the calling thread.
    pub const CURRENT_THREAD: Self = Self(0xFFFF_8000);

    /// Pseudo-handle for the calling process.
    pub const CURRENT_PROCESS: Self = Self(0xFFFF_8001);

    /// Smallest linear id a live entry carries.
    pub const MIN_LINEAR_ID: u16 = 1;

    /// Largest linear id; allocation wraps back to [`Self::MIN_LINEAR_ID`].
    pub const MAX_LINEAR_ID: u16 = LINEAR_ID_MASK as u16;

    /// Build a handle from a table index and linear id.
    #[inline]
    #[must_use]
    pub const fn new(index: u16, linear_id: u16) -> Self {
        assert!((index as u32) <= INDEX_MASK);
        assert!((linear_id as u32) <= LINEAR_ID_MASK);
        Self((index as u32) | ((linear_id as u32) << INDEX_BITS))
    }

    /// Wrap a raw value received from user space.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Table index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u16 {
        (self.0 & INDEX_MASK) as u16
    }

    /// Linear id (generation).
    #[inline]
    #[must_use]
    pub const fn linear_id(self) -> u16 {
        ((self.0 >> INDEX_BITS) & LINEAR_ID_MASK) as u16
    }

    /// Reserved top bits; must be zero in a real handle.
    #[inline]
    #[must_use]
    pub const fn reserved(self) -> u32 {
        self.0 >> (INDEX_BITS + LINEAR_ID_BITS)
    }

    /// Whether this is one of the current thread/process pseudo-handles.
    #[inline]
    #[must_use]
    pub const fn is_pseudo(self) -> bool {
        self.0 == Self::CURRENT_THREAD.0 || self.0 == Self::CURRENT_PROCESS.0
    }

    #[inline]
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CURRENT_THREAD => f.write_str("Handle(CurrentThread)"),
            Self::CURRENT_PROCESS => f.write_str("Handle(CurrentProcess)"),
            h => write!(f, "Handle({:#x}: idx={}, lid={})", h.0, h.index(), h.linear_id()),
        }
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> u32 {
        handle.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields() {
        let h = Handle::new(5, 0x1234);
        assert_eq!(h.index(), 5);
        assert_eq!(h.linear_id(), 0x1234);
        assert_eq!(h.reserved(), 0);
        assert_eq!(h.raw(), 5 | (0x1234 << 15));
        assert!(!h.is_pseudo());
    }

    #[test]
    fn test_pseudo_handles() {
        assert!(Handle::CURRENT_THREAD.is_pseudo());
        assert!(Handle::CURRENT_PROCESS.is_pseudo());
        // Pseudo-handles always have reserved bits set, so they never
        // collide with table entries.
        assert_eq!(Handle::CURRENT_THREAD.reserved(), 3);
        assert_eq!(Handle::CURRENT_PROCESS.reserved(), 3);
        assert!(Handle::INVALID.is_invalid());
    }

    #[test]
    fn test_limits() {
        let h = Handle::new(0x7FFF, Handle::MAX_LINEAR_ID);
        assert_eq!(h.raw(), 0x3FFF_FFFF);
        assert_eq!(h.reserved(), 0);
    }

    #[test]
    #[should_panic]
    fn test_index_too_large() {
        let _ = Handle::new(0x8000, 1);
    }
}
