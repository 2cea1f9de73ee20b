//! `log::Log` implementation for the kernel.
//!
//! Records are formatted on the stack (no locks, no allocation) and pushed
//! to the ring buffer. While an early console is registered and enabled,
//! they are also echoed to it.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::logging::buffer::{self, LogEntry, LOG_ENTRY_CONTENT_SIZE};

/// Stack buffer for formatting one record
struct LineBuffer {
    data: [u8; LOG_ENTRY_CONTENT_SIZE],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; LOG_ENTRY_CONTENT_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.data[..self.len]) {
            Ok(s) => s,
            // Truncation may have split a multi-byte char
            Err(e) => core::str::from_utf8(&self.data[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(LOG_ENTRY_CONTENT_SIZE - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

static CLOCK_MS: AtomicU64 = AtomicU64::new(0);
static EARLY_CONSOLE: Once<fn(&str)> = Once::new();
static EARLY_CONSOLE_ENABLED: AtomicBool = AtomicBool::new(true);

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let time_ms = CLOCK_MS.load(Ordering::Relaxed);
        let mut msg = LineBuffer::new();
        let _ = write!(msg, "{}", record.args());

        buffer::push(LogEntry::new(time_ms, record.level(), record.target(), msg.as_str()));

        if EARLY_CONSOLE_ENABLED.load(Ordering::Acquire) {
            if let Some(puts) = EARLY_CONSOLE.get() {
                let level = match record.level() {
                    Level::Error => "ERROR",
                    Level::Warn => " WARN",
                    Level::Info => " INFO",
                    Level::Debug => "DEBUG",
                    Level::Trace => "TRACE",
                };
                let mut line = LineBuffer::new();
                let _ = writeln!(
                    line,
                    "[{:>8}.{:03}] {} {}: {}",
                    time_ms / 1000,
                    time_ms % 1000,
                    level,
                    record.target(),
                    msg.as_str()
                );
                puts(line.as_str());
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger and enable the ring buffer.
///
/// A second call only updates the level.
pub fn init(level: LevelFilter) {
    buffer::enable();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Register the early console sink. Only the first call has any effect.
pub fn set_early_console(puts: fn(&str)) {
    EARLY_CONSOLE.call_once(|| puts);
}

/// Stop echoing to the early console once a user-space console driver runs.
///
/// Also discards what is queued, since it has been printed already.
pub fn disable_early_console() {
    EARLY_CONSOLE_ENABLED.store(false, Ordering::Release);
    buffer::reset_read_position();
}

/// Update the timestamp stamped on new records.
pub fn set_clock_ms(ms: u64) {
    CLOCK_MS.store(ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_truncates() {
        let mut line = LineBuffer::new();
        for _ in 0..100 {
            let _ = write!(line, "abc");
        }
        assert_eq!(line.as_str().len(), LOG_ENTRY_CONTENT_SIZE);
    }

    #[test]
    fn test_line_buffer_split_char() {
        let mut line = LineBuffer::new();
        let _ = write!(line, "{}", "a".repeat(LOG_ENTRY_CONTENT_SIZE - 1));
        let _ = write!(line, "é");
        assert_eq!(line.as_str().len(), LOG_ENTRY_CONTENT_SIZE - 1);
    }
}
