//! Logging facade of the VRG core
//!
//! Every module reports through the `vrg_*!` macros with a dotted source tag
//! (`"vrg::device"`, `"vrg::texture"`, ...). Entries go to one process-wide
//! [`Logger`]; [`DefaultLogger`] prints them to the terminal. Entries below
//! the severity floor set with [`set_min_severity`] are discarded before
//! formatting reaches the logger.

use chrono::{DateTime, Local};
use colored::{ColoredString, Colorize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};
use std::time::SystemTime;

/// Sink for log entries
///
/// # Example
///
/// ```no_run
/// use vrg_core::log::{LogEntry, LogSeverity, Logger};
///
/// struct ErrorsOnly;
///
/// impl Logger for ErrorsOnly {
///     fn log(&self, entry: &LogEntry) {
///         if entry.severity == LogSeverity::Error {
///             eprintln!("{}: {}", entry.source, entry.message);
///         }
///     }
/// }
///
/// vrg_core::log::set_logger(ErrorsOnly);
/// ```
pub trait Logger: Send + Sync {
    fn log(&self, entry: &LogEntry);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogSeverity {
    /// Object creation and cache hits
    Trace,
    /// Pool recycling and queue submissions
    Debug,
    Info,
    /// Recoverable anomalies such as dropping an in-flight command buffer
    Warn,
    /// Carries the file and line of the reporting site
    Error,
}

impl LogSeverity {
    fn tag(self) -> ColoredString {
        match self {
            LogSeverity::Trace => "TRACE".bright_black(),
            LogSeverity::Debug => "DEBUG".cyan(),
            LogSeverity::Info => "INFO ".green(),
            LogSeverity::Warn => "WARN ".yellow(),
            LogSeverity::Error => "ERROR".red().bold(),
        }
    }

    fn from_u8(value: u8) -> LogSeverity {
        match value {
            0 => LogSeverity::Trace,
            1 => LogSeverity::Debug,
            2 => LogSeverity::Info,
            3 => LogSeverity::Warn,
            _ => LogSeverity::Error,
        }
    }
}

/// One reported event
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub severity: LogSeverity,
    pub timestamp: SystemTime,
    /// Dotted module tag, e.g. `"vrg::command_buffer"`
    pub source: String,
    pub message: String,
    /// Reporting file, only set by `vrg_error!`
    pub file: Option<&'static str>,
    pub line: Option<u32>,
}

impl LogEntry {
    pub fn new(severity: LogSeverity, source: &str, message: String) -> Self {
        Self { severity, timestamp: SystemTime::now(), source: source.to_string(), message, file: None, line: None }
    }

    pub fn at(mut self, file: &'static str, line: u32) -> Self {
        self.file = Some(file);
        self.line = Some(line);
        self
    }

    /// `file:line` of the reporting site, when known
    pub fn location(&self) -> Option<String> {
        Some(format!("{}:{}", self.file?, self.line?))
    }
}

/// Terminal logger
///
/// Prints `[timestamp] [SEVERITY] [source] message`, with ` (file:line)`
/// appended when the entry has a location. Warnings and errors go to
/// stderr, everything else to stdout.
pub struct DefaultLogger;

impl DefaultLogger {
    pub fn format(entry: &LogEntry) -> String {
        let time: DateTime<Local> = entry.timestamp.into();
        let mut line = format!(
            "[{}] [{}] [{}] {}",
            time.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.severity.tag(),
            entry.source.bright_blue(),
            entry.message
        );
        if let Some(location) = entry.location() {
            line.push_str(&format!(" ({})", location));
        }
        line
    }
}

impl Logger for DefaultLogger {
    fn log(&self, entry: &LogEntry) {
        let line = Self::format(entry);
        if entry.severity >= LogSeverity::Warn {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }
}

// ===== GLOBAL LOGGER =====

static LOGGER: OnceLock<RwLock<Box<dyn Logger>>> = OnceLock::new();
static MIN_SEVERITY: AtomicU8 = AtomicU8::new(LogSeverity::Trace as u8);

fn logger() -> &'static RwLock<Box<dyn Logger>> {
    LOGGER.get_or_init(|| RwLock::new(Box::new(DefaultLogger)))
}

/// Install `logger` for the whole process
pub fn set_logger<L: Logger + 'static>(logger_impl: L) {
    *logger().write().unwrap_or_else(PoisonError::into_inner) = Box::new(logger_impl);
}

/// Go back to [`DefaultLogger`]
pub fn reset_logger() {
    set_logger(DefaultLogger);
}

/// Discard entries less severe than `severity`
pub fn set_min_severity(severity: LogSeverity) {
    MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
}

pub fn min_severity() -> LogSeverity {
    LogSeverity::from_u8(MIN_SEVERITY.load(Ordering::Relaxed))
}

pub fn enabled(severity: LogSeverity) -> bool {
    severity >= min_severity()
}

pub fn dispatch(entry: &LogEntry) {
    if enabled(entry.severity) {
        logger().read().unwrap_or_else(PoisonError::into_inner).log(entry);
    }
}

/// Report `message` without a location (backs the vrg_* macros)
pub fn log(severity: LogSeverity, source: &str, message: String) {
    dispatch(&LogEntry::new(severity, source, message));
}

/// Report `message` with the `file:line` it came from (backs `vrg_error!`)
pub fn log_detailed(severity: LogSeverity, source: &str, message: String, file: &'static str, line: u32) {
    dispatch(&LogEntry::new(severity, source, message).at(file, line));
}

// ===== MACROS =====

/// ```no_run
/// vrg_core::vrg_trace!("vrg::texture", "Created view {}", 3);
/// ```
#[macro_export]
macro_rules! vrg_trace {
    ($source:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogSeverity::Trace) {
            $crate::log::log($crate::log::LogSeverity::Trace, $source, format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! vrg_debug {
    ($source:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogSeverity::Debug) {
            $crate::log::log($crate::log::LogSeverity::Debug, $source, format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! vrg_info {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::LogSeverity::Info, $source, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! vrg_warn {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::LogSeverity::Warn, $source, format!($($arg)*))
    };
}

/// Error entry tagged with the caller's `file!()` and `line!()`
///
/// ```no_run
/// vrg_core::vrg_error!("vrg::device", "Submit failed: {}", "device lost");
/// ```
#[macro_export]
macro_rules! vrg_error {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log_detailed($crate::log::LogSeverity::Error, $source, format!($($arg)*), file!(), line!())
    };
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
