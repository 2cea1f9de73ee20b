//! # ember-arch
//!
//! ARM64 architecture support for the Ember kernel.
//!
//! - [`cpu`]: Core id, barriers, interrupt masking, WFI
//! - [`sync`]: [`IrqSpinMutex`], the interrupt-masking spinlock
//! - [`smp`]: Core count, core masks and online tracking
//! - [`gic`]: Software-generated interrupts used as IPIs
//!
//! # Host builds
//!
//! Everything that touches system registers is compiled only for
//! `target_arch = "aarch64", target_os = "none"`. On any other target the
//! same API is backed by portable fallbacks (fences for barriers, no-op
//! interrupt masking, core 0) so the kernel logic above it can be unit tested
//! on the build host.
//!
//! # Safety
//!
//! All unsafe operations are documented with `// SAFETY:` comments
//! explaining the invariants that must be maintained.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cpu;
pub mod gic;
pub mod smp;
pub mod sync;

pub use cpu::{halt, wait_for_interrupt};
pub use smp::{CoreMask, NUM_CORES};
pub use sync::IrqSpinMutex;
