//! SVC result codes
//!
//! A result is a 32-bit value `module | description << 9`. Zero is success.
//! Every error produced by this kernel belongs to module 1 (svc).

use core::fmt;

/// Module number of kernel (svc) results.
pub const SVC_MODULE: u32 = 1;

const MODULE_BITS: u32 = 9;
const DESCRIPTION_BITS: u32 = 13;

/// Errors returned from SVCs.
///
/// The discriminant is the Horizon description code.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "SVC errors must be reported to the caller"]
pub enum SvcError {
    OutOfSessions = 7,
    InvalidArgument = 14,
    NotImplemented = 33,
    InvalidSize = 101,
    InvalidAddress = 102,
    OutOfResource = 103,
    OutOfMemory = 104,
    OutOfHandles = 105,
    InvalidCurrentMemory = 106,
    InvalidNewMemoryPermission = 108,
    InvalidMemoryRegion = 110,
    InvalidPriority = 112,
    InvalidCoreId = 113,
    InvalidHandle = 114,
    InvalidPointer = 115,
    InvalidCombination = 116,
    TimedOut = 117,
    Cancelled = 118,
    OutOfRange = 119,
    InvalidEnumValue = 120,
    NotFound = 121,
    Busy = 122,
    SessionClosed = 123,
    InvalidState = 125,
    NotSupported = 127,
    LimitReached = 132,
    ReceiveListBroken = 258,
    OutOfAddressSpace = 259,
    MessageTooLarge = 260,
    InvalidProcessId = 517,
    InvalidThreadId = 518,
    InvalidId = 519,
    ProcessTerminated = 520,
}

impl SvcError {
    /// Description code of this error.
    #[inline]
    #[must_use]
    pub const fn description(self) -> u32 {
        self as u32
    }

    /// Try to convert from a description code.
    #[must_use]
    pub const fn from_description(value: u32) -> Option<Self> {
        Some(match value {
            7 => Self::OutOfSessions,
            14 => Self::InvalidArgument,
            33 => Self::NotImplemented,
            101 => Self::InvalidSize,
            102 => Self::InvalidAddress,
            103 => Self::OutOfResource,
            104 => Self::OutOfMemory,
            105 => Self::OutOfHandles,
            106 => Self::InvalidCurrentMemory,
            108 => Self::InvalidNewMemoryPermission,
            110 => Self::InvalidMemoryRegion,
            112 => Self::InvalidPriority,
            113 => Self::InvalidCoreId,
            114 => Self::InvalidHandle,
            115 => Self::InvalidPointer,
            116 => Self::InvalidCombination,
            117 => Self::TimedOut,
            118 => Self::Cancelled,
            119 => Self::OutOfRange,
            120 => Self::InvalidEnumValue,
            121 => Self::NotFound,
            122 => Self::Busy,
            123 => Self::SessionClosed,
            125 => Self::InvalidState,
            127 => Self::NotSupported,
            132 => Self::LimitReached,
            258 => Self::ReceiveListBroken,
            259 => Self::OutOfAddressSpace,
            260 => Self::MessageTooLarge,
            517 => Self::InvalidProcessId,
            518 => Self::InvalidThreadId,
            519 => Self::InvalidId,
            520 => Self::ProcessTerminated,
            _ => return None,
        })
    }

    /// Get the error name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfSessions => "OutOfSessions",
            Self::InvalidArgument => "InvalidArgument",
            Self::NotImplemented => "NotImplemented",
            Self::InvalidSize => "InvalidSize",
            Self::InvalidAddress => "InvalidAddress",
            Self::OutOfResource => "OutOfResource",
            Self::OutOfMemory => "OutOfMemory",
            Self::OutOfHandles => "OutOfHandles",
            Self::InvalidCurrentMemory => "InvalidCurrentMemory",
            Self::InvalidNewMemoryPermission => "InvalidNewMemoryPermission",
            Self::InvalidMemoryRegion => "InvalidMemoryRegion",
            Self::InvalidPriority => "InvalidPriority",
            Self::InvalidCoreId => "InvalidCoreId",
            Self::InvalidHandle => "InvalidHandle",
            Self::InvalidPointer => "InvalidPointer",
            Self::InvalidCombination => "InvalidCombination",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
            Self::OutOfRange => "OutOfRange",
            Self::InvalidEnumValue => "InvalidEnumValue",
            Self::NotFound => "NotFound",
            Self::Busy => "Busy",
            Self::SessionClosed => "SessionClosed",
            Self::InvalidState => "InvalidState",
            Self::NotSupported => "NotSupported",
            Self::LimitReached => "LimitReached",
            Self::ReceiveListBroken => "ReceiveListBroken",
            Self::OutOfAddressSpace => "OutOfAddressSpace",
            Self::MessageTooLarge => "MessageTooLarge",
            Self::InvalidProcessId => "InvalidProcessId",
            Self::InvalidThreadId => "InvalidThreadId",
            Self::InvalidId => "InvalidId",
            Self::ProcessTerminated => "ProcessTerminated",
        }
    }
}

impl fmt::Display for SvcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-{})", self.as_str(), 2000 + SVC_MODULE, self.description())
    }
}

/// Result alias for SVC handlers.
pub type SvcResult<T> = Result<T, SvcError>;

/// Raw 32-bit result code as seen by user space.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResultCode(u32);

impl ResultCode {
    /// The success result.
    pub const SUCCESS: Self = Self(0);

    /// Build a result from module and description.
    #[inline]
    #[must_use]
    pub const fn new(module: u32, description: u32) -> Self {
        assert!(module < (1 << MODULE_BITS));
        assert!(description < (1 << DESCRIPTION_BITS));
        Self(module | (description << MODULE_BITS))
    }

    /// Wrap a raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Module field.
    #[inline]
    #[must_use]
    pub const fn module(self) -> u32 {
        self.0 & ((1 << MODULE_BITS) - 1)
    }

    /// Description field.
    #[inline]
    #[must_use]
    pub const fn description(self) -> u32 {
        (self.0 >> MODULE_BITS) & ((1 << DESCRIPTION_BITS) - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !self.is_success()
    }

    /// Convert back to a `Result`.
    ///
    /// Results from other modules and unknown svc descriptions have no
    /// [`SvcError`] counterpart and come back as `Err(None)`.
    pub const fn to_result(self) -> Result<(), Option<SvcError>> {
        if self.is_success() {
            return Ok(());
        }
        if self.module() != SVC_MODULE {
            return Err(None);
        }
        Err(SvcError::from_description(self.description()))
    }
}

impl From<SvcError> for ResultCode {
    fn from(err: SvcError) -> Self {
        Self::new(SVC_MODULE, err.description())
    }
}

impl<T> From<SvcResult<T>> for ResultCode {
    fn from(result: SvcResult<T>) -> Self {
        match result {
            Ok(_) => Self::SUCCESS,
            Err(e) => e.into(),
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return f.write_str("ResultCode(Success)");
        }
        write!(f, "ResultCode({}-{:04})", 2000 + self.module(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_encoding() {
        assert_eq!(ResultCode::from(SvcError::InvalidHandle).raw(), 0xE401);
        assert_eq!(ResultCode::from(SvcError::OutOfRange).raw(), 1 | (119 << 9));
        assert_eq!(ResultCode::from(SvcError::MessageTooLarge).raw(), 1 | (260 << 9));
        assert_eq!(ResultCode::SUCCESS.raw(), 0);
    }

    #[test]
    fn test_fields() {
        let rc = ResultCode::from(SvcError::InvalidProcessId);
        assert_eq!(rc.module(), SVC_MODULE);
        assert_eq!(rc.description(), 517);
        assert!(rc.is_failure());
        assert_eq!(rc.to_result(), Err(Some(SvcError::InvalidProcessId)));
        assert_eq!(ResultCode::SUCCESS.to_result(), Ok(()));
    }

    #[test]
    fn test_foreign_module() {
        let rc = ResultCode::new(2, 1);
        assert_eq!(rc.to_result(), Err(None));
    }

    #[test]
    fn test_every_description_round_trips() {
        for code in 0..(1 << DESCRIPTION_BITS) {
            if let Some(err) = SvcError::from_description(code) {
                assert_eq!(err.description(), code);
                let rc = ResultCode::from(err);
                assert_eq!(rc.to_result(), Err(Some(err)));
            }
        }
    }

    #[test]
    fn test_from_result() {
        let ok: SvcResult<u64> = Ok(5);
        let err: SvcResult<u64> = Err(SvcError::Busy);
        assert!(ResultCode::from(ok).is_success());
        assert_eq!(ResultCode::from(err).description(), 122);
    }

    #[test]
    fn test_display() {
        let s = format!("{}", SvcError::InvalidHandle);
        assert_eq!(s, "InvalidHandle (2001-114)");
        assert_eq!(format!("{:?}", ResultCode::from(SvcError::Busy)), "ResultCode(2001-0122)");
    }
}
