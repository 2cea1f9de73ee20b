//! Thread-local region
//!
//! Each thread gets a 0x200-byte region that the kernel and user space share.
//! The first 0x100 bytes are the IPC message buffer.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::message_buffer::{MessageBuffer, MESSAGE_BUFFER_WORDS};

/// Size of the thread-local region.
pub const THREAD_LOCAL_REGION_SIZE: usize = 0x200;

/// Per-thread region shared between kernel and user space.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ThreadLocalRegion {
    /// IPC message buffer.
    pub message_buffer: [u32; MESSAGE_BUFFER_WORDS],
    /// Nesting depth of user-requested interrupt disable.
    pub disable_count: i16,
    /// Set by the kernel when an interrupt arrived while disabled.
    pub interrupt_flag: u8,
    _reserved: [u8; 0xFD],
}

const _: () = assert!(core::mem::size_of::<ThreadLocalRegion>() == THREAD_LOCAL_REGION_SIZE);
const _: () = assert!(core::mem::offset_of!(ThreadLocalRegion, disable_count) == 0x100);
const _: () = assert!(core::mem::offset_of!(ThreadLocalRegion, interrupt_flag) == 0x102);

impl ThreadLocalRegion {
    /// A zeroed region.
    #[must_use]
    pub fn zeroed() -> Self {
        <Self as FromZeros>::new_zeroed()
    }

    /// Interpret raw bytes (e.g. a mapped user page) as a region.
    ///
    /// Returns `None` on a size or alignment mismatch.
    pub fn from_bytes_mut(bytes: &mut [u8]) -> Option<&mut Self> {
        Self::mut_from_bytes(bytes).ok()
    }

    /// Message buffer view.
    pub fn message_buffer(&mut self) -> MessageBuffer<'_> {
        MessageBuffer::new(&mut self.message_buffer)
    }
}

impl Default for ThreadLocalRegion {
    fn default() -> Self {
        Self::zeroed()
    }
}
