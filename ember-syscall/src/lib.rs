//! Ember SVC ABI
//!
//! Shared definitions for kernel/user-space communication. This crate is
//! `no_std` and is used both by the kernel and by user-space runtimes.
//!
//! # Modules
//!
//! - [`numbers`] - SVC numbers
//! - [`result`] - Result codes and the SVC error enum
//! - [`handle`] - Handle encoding and pseudo-handles
//! - [`message_buffer`] - IPC message wire format
//! - [`tls`] - Per-thread region holding the message buffer
//! - [`types`] - Argument vocabularies (priorities, cores, permissions, ...)

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod handle;
pub mod message_buffer;
pub mod numbers;
pub mod result;
pub mod tls;
pub mod types;

// Re-export commonly used items
pub use handle::Handle;
pub use message_buffer::{
    MessageBuffer, MessageHeader, ReceiveListCountType, SpecialHeader, MAX_MESSAGE_SIZE,
    MESSAGE_BUFFER_SIZE,
};
pub use numbers::SvcId;
pub use result::{ResultCode, SvcError, SvcResult};
pub use tls::ThreadLocalRegion;
