//! Physical and Virtual Address Types
//!
//! Thin `#[repr(transparent)]` wrappers around `u64` that keep physical and
//! virtual addresses apart at compile time. The page-table code works in
//! terms of these; user-supplied raw values are converted at the SVC edge.

use core::fmt;

use crate::memory::PAGE_SIZE;

/// Physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// Virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

macro_rules! address_ops {
    ($ty:ident) => {
        impl $ty {
            /// Create a new address.
            #[inline]
            #[must_use]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            /// Get the raw address value.
            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Check if this address is null (zero).
            #[inline]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Check if this address is aligned to `align` (a power of two).
            #[inline]
            #[must_use]
            pub const fn is_aligned(self, align: u64) -> bool {
                self.0 & (align - 1) == 0
            }

            /// Check if this address is page-aligned (4KB).
            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(PAGE_SIZE as u64)
            }

            /// Align down to `align` (a power of two).
            #[inline]
            #[must_use]
            pub const fn align_down(self, align: u64) -> Self {
                Self(self.0 & !(align - 1))
            }

            /// Align up to `align` (a power of two).
            #[inline]
            #[must_use]
            pub const fn align_up(self, align: u64) -> Self {
                Self((self.0 + (align - 1)) & !(align - 1))
            }

            /// Add an offset to this address.
            #[inline]
            #[must_use]
            pub const fn offset(self, offset: u64) -> Self {
                Self(self.0.wrapping_add(offset))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({:#x})"), self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<u64> for $ty {
            fn from(addr: u64) -> Self {
                Self(addr)
            }
        }

        impl From<$ty> for u64 {
            fn from(addr: $ty) -> u64 {
                addr.0
            }
        }
    };
}

address_ops!(PhysAddr);
address_ops!(VirtAddr);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        let pa = PhysAddr::new(0x4000_1234);
        assert!(!pa.is_page_aligned());
        assert_eq!(pa.align_down(0x1000), PhysAddr::new(0x4000_1000));
        assert_eq!(pa.align_up(0x1000), PhysAddr::new(0x4000_2000));
        assert_eq!(pa.align_down(0x20_0000), PhysAddr::new(0x4000_0000));
        assert!(PhysAddr::new(0x4000_0000).is_aligned(0x4000_0000));
    }

    #[test]
    fn test_debug_format() {
        let va = VirtAddr::new(0x1000);
        assert_eq!(format!("{va:?}"), "VirtAddr(0x1000)");
        assert_eq!(format!("{va:x}"), "1000");
    }
}
