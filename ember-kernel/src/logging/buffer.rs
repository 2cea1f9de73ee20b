//! Kernel Log Ring Buffer
//!
//! Fixed-size entries in a lock-free `thingbuf` ring, drained by user space.
//!
//! - 256 slots of 256 bytes each
//! - Safe from any context, including with the scheduler lock held
//! - Overflow drops the new entry

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;
use thingbuf::StaticThingBuf;

/// Bytes of target + message stored per entry.
pub const LOG_ENTRY_CONTENT_SIZE: usize = 240;

/// Number of slots in the ring.
pub const LOG_BUFFER_SLOTS: usize = 256;

/// One log record, truncated to fit.
#[derive(Clone)]
pub struct LogEntry {
    /// Milliseconds since boot
    pub timestamp_ms: u64,
    /// 0=Error .. 4=Trace
    pub level: u8,
    pub target_len: u8,
    pub message_len: u16,
    /// `[target bytes][message bytes]`
    pub content: [u8; LOG_ENTRY_CONTENT_SIZE],
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            level: 0,
            target_len: 0,
            message_len: 0,
            content: [0u8; LOG_ENTRY_CONTENT_SIZE],
        }
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl LogEntry {
    pub fn new(timestamp_ms: u64, level: log::Level, target: &str, message: &str) -> Self {
        let mut entry = Self {
            timestamp_ms,
            level: level_to_u8(level),
            ..Self::default()
        };

        let target = truncate(target, (u8::MAX as usize).min(LOG_ENTRY_CONTENT_SIZE));
        entry.content[..target.len()].copy_from_slice(target.as_bytes());
        entry.target_len = target.len() as u8;

        let message = truncate(message, LOG_ENTRY_CONTENT_SIZE - target.len());
        let start = target.len();
        entry.content[start..start + message.len()].copy_from_slice(message.as_bytes());
        entry.message_len = message.len() as u16;

        entry
    }

    pub fn level(&self) -> log::Level {
        u8_to_level(self.level)
    }

    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        core::str::from_utf8(&self.content[..len]).unwrap_or("<invalid>")
    }

    pub fn message(&self) -> &str {
        let start = self.target_len as usize;
        let end = start + self.message_len as usize;
        core::str::from_utf8(&self.content[start..end]).unwrap_or("<invalid>")
    }

    /// Write `"[LEVEL] target: message\n"` into `out`.
    ///
    /// Returns the number of bytes written, or `None` (writing nothing) when
    /// `out` is too small.
    pub fn format_into(&self, out: &mut [u8]) -> Option<usize> {
        let level = level_tag(self.level);
        let target = self.target();
        let message = self.message();

        let parts: [&[u8]; 6] = [
            level.as_bytes(),
            b" ",
            target.as_bytes(),
            b": ",
            message.as_bytes(),
            b"\n",
        ];
        let needed: usize = parts.iter().map(|p| p.len()).sum();
        if needed > out.len() {
            return None;
        }

        let mut written = 0;
        for part in parts {
            out[written..written + part.len()].copy_from_slice(part);
            written += part.len();
        }
        Some(written)
    }
}

fn level_to_u8(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 0,
        log::Level::Warn => 1,
        log::Level::Info => 2,
        log::Level::Debug => 3,
        log::Level::Trace => 4,
    }
}

pub fn u8_to_level(val: u8) -> log::Level {
    match val {
        0 => log::Level::Error,
        1 => log::Level::Warn,
        2 => log::Level::Info,
        3 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

fn level_tag(val: u8) -> &'static str {
    match val {
        0 => "[ERROR]",
        1 => "[WARN ]",
        2 => "[INFO ]",
        3 => "[DEBUG]",
        _ => "[TRACE]",
    }
}

static LOG_BUFFER: StaticThingBuf<LogEntry, LOG_BUFFER_SLOTS> = StaticThingBuf::new();

/// Entry popped by a drain that did not fit the caller's buffer.
static CARRY: Mutex<Option<LogEntry>> = Mutex::new(None);

static BUFFER_ENABLED: AtomicBool = AtomicBool::new(false);
static DROPPED: AtomicUsize = AtomicUsize::new(0);

pub fn enable() {
    BUFFER_ENABLED.store(true, Ordering::Release);
}

pub fn is_enabled() -> bool {
    BUFFER_ENABLED.load(Ordering::Acquire)
}

/// Queue an entry. Returns `false` if the buffer is disabled or full.
pub fn push(entry: LogEntry) -> bool {
    if !is_enabled() {
        return false;
    }
    if LOG_BUFFER.push(entry).is_err() {
        DROPPED.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    true
}

pub fn pop() -> Option<LogEntry> {
    if !is_enabled() {
        return None;
    }
    if let Some(entry) = CARRY.lock().take() {
        return Some(entry);
    }
    LOG_BUFFER.pop()
}

/// Format queued entries into `out` until it is full.
///
/// An entry that does not fit is kept for the next call. Returns the number
/// of bytes written.
pub fn drain(out: &mut [u8]) -> usize {
    let mut written = 0;
    while let Some(entry) = pop() {
        match entry.format_into(&mut out[written..]) {
            Some(n) => written += n,
            None => {
                *CARRY.lock() = Some(entry);
                break;
            }
        }
    }
    written
}

/// Discard everything queued so far.
pub fn reset_read_position() {
    while pop().is_some() {}
}

#[derive(Debug, Clone, Copy)]
pub struct LogBufferStats {
    pub entries: usize,
    pub capacity: usize,
    /// Entries lost to a full ring
    pub dropped: usize,
}

pub fn stats() -> LogBufferStats {
    LogBufferStats {
        entries: LOG_BUFFER.len(),
        capacity: LOG_BUFFER.capacity(),
        dropped: DROPPED.load(Ordering::Relaxed),
    }
}
