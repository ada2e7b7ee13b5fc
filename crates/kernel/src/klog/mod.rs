//! Kernel logging (printk) with ring buffer
//!
//! Formats messages into fixed records, keeps the most recent ones in a
//! ring buffer for post-mortem inspection, and mirrors them to the console
//! sink when one is registered (UART on bare metal, nothing by default on
//! hosted builds).

pub mod ringbuf;

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use ringbuf::RingBuffer;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// Global log level (default: INFO)
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

/// One formatted record kept in the ring buffer.
#[derive(Copy, Clone)]
pub struct LogRecord {
    pub timestamp_us: u64,
    pub level: LogLevel,
    pub message: [u8; 224],
    pub len: usize,
}

impl LogRecord {
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid>")
    }
}

static KERNEL_LOG: Mutex<RingBuffer<LogRecord, 1024>> = Mutex::new(RingBuffer::new());

/// Console sink; installed once the console driver is up.
static CONSOLE: spin::RwLock<Option<fn(&str)>> = spin::RwLock::new(None);

pub fn set_console(sink: fn(&str)) {
    *CONSOLE.write() = Some(sink);
}

struct RecordWriter {
    buf: [u8; 224],
    len: usize,
}

impl Write for RecordWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let avail = self.buf.len() - self.len;
        let take = s.len().min(avail);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Format and record one message. Used by the level macros, not directly.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let mut writer = RecordWriter {
        buf: [0u8; 224],
        len: 0,
    };
    let _ = write!(writer, "[{}] ", level.as_str());
    let _ = writer.write_fmt(args);

    let record = LogRecord {
        timestamp_us: crate::time::monotonic_us(),
        level,
        message: writer.buf,
        len: writer.len,
    };

    KERNEL_LOG.lock().push(record);

    if let Some(sink) = *CONSOLE.read() {
        sink(record.text());
        sink("\n");
    }
}

/// Drain the buffered records, oldest first (debugger / dmesg path).
pub fn drain() -> alloc::vec::Vec<LogRecord> {
    KERNEL_LOG.lock().drain_all()
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Trace, format_args!($($arg)*))
    };
}
