//! # ember-common
//!
//! Shared types and constants for the Ember kernel crates.
//!
//! - [`addr`]: Physical and virtual address newtypes
//! - [`memory`]: Page and block geometry, named physical memory windows
//!
//! All types use `#[repr(transparent)]` or `#[repr(C)]` so they can cross the
//! kernel/user boundary unchanged.
//!
//! # no_std
//!
//! This crate has zero runtime dependencies so every other Ember crate can
//! depend on it.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod memory;

pub use addr::{PhysAddr, VirtAddr};
pub use memory::MemoryWindow;
