//! Lifecycle logging collaborator

use tracing::{info, warn};

/// Severity of a [`LogRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Normal lifecycle event
    Info,
    /// Something went wrong but was handled
    Warn,
}

/// One lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Component that produced the record
    pub source: &'static str,
    /// Severity
    pub level: LogLevel,
    /// Free-text message
    pub message: String,
}

impl LogRecord {
    /// Informational record
    pub fn info(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    /// Warning record
    pub fn warn(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            level: LogLevel::Warn,
            message: message.into(),
        }
    }
}

/// Receives lifecycle records from a session
///
/// Injected per session so callers decide where records go.
pub trait SessionLogger: Send + Sync {
    /// Handle one record
    fn log(&self, record: LogRecord);
}

/// Forwards records to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl SessionLogger for TracingLogger {
    fn log(&self, record: LogRecord) {
        match record.level {
            LogLevel::Info => info!(source = record.source, "{}", record.message),
            LogLevel::Warn => warn!(source = record.source, "{}", record.message),
        }
    }
}

/// Discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl SessionLogger for NullLogger {
    fn log(&self, _record: LogRecord) {}
}
