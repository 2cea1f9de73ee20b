//! Page-table operation errors

use core::fmt;

/// Errors that can occur during mapping operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "mapping errors must be handled"]
pub enum MapError {
    /// Address or size is not page-aligned
    NotAligned,
    /// Part of the range is already mapped
    AlreadyMapped,
    /// Part of the range is not mapped
    NotMapped,
    /// A translation table could not be allocated
    OutOfResource,
    /// The attribute template is not one the kernel builds
    InvalidAttributes,
    /// The range leaves the address space
    OutOfRange,
}

impl MapError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAligned => "range is not page-aligned",
            Self::AlreadyMapped => "range is already mapped",
            Self::NotMapped => "range is not mapped",
            Self::OutOfResource => "failed to allocate translation table",
            Self::InvalidAttributes => "invalid mapping attributes",
            Self::OutOfRange => "range is outside the address space",
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a page-table operation
pub type MapResult<T> = Result<T, MapError>;
