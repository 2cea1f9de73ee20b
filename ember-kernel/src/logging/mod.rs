//! Kernel Logging
//!
//! The kernel logs through the `log` facade. Records land in a lock-free
//! ring ([`buffer`]) that user space drains, and are optionally echoed to an
//! early console sink while the board has no console driver yet.

pub mod buffer;
pub mod logger;

pub use buffer::{drain, LogBufferStats, LogEntry};
pub use logger::{disable_early_console, init, set_clock_ms, set_early_console};
