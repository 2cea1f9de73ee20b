//! # ember-kernel
//!
//! Core of the Ember kernel: kernel objects, the per-core priority
//! scheduler and SVC dispatch. Architecture entry code (exception vectors,
//! context switching, the timer and GIC drivers) lives with the board and
//! calls in through [`Kernel`].
//!
//! # Layout
//!
//! - [`object`]: Threads, processes, handle tables and reference counting
//! - [`sched`]: Priority queue, per-core scheduling state, sleep queue, IPIs
//! - [`state`]: Lifecycle operations over objects and scheduler together
//! - [`kernel`]: The scheduler lock and its publishing guard
//! - [`svc`]: Horizon-numbered SVC handlers
//! - [`logging`]: Lock-free log ring drained by the board's console
//!
//! # Entry Points
//!
//! - [`svc::handle_svc`] from the synchronous exception vector, followed
//!   by [`Kernel::reschedule_current_core`] before returning to user space
//! - [`Kernel::handle_timer_tick`] from the timer interrupt
//! - [`Kernel::handle_scheduler_ipi`] from the scheduler SGI
//!
//! Secondary cores call [`ember_arch::smp::mark_core_online`] once they can
//! take SGIs; until then [`sched::GicIpi`] does not target them.
//!
//! The reschedule calls return the switch the core should make, if any.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod kernel;
pub mod logging;
pub mod object;
pub mod sched;
pub mod state;
pub mod svc;

pub use config::{ConfigError, KernelConfig};
pub use kernel::{init, kernel, Kernel, SchedulerGuard};
pub use sched::{SwitchTarget, ThreadSwitch};
pub use state::KernelState;
