// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Channel-backed logger and consumer.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::time::SystemTime;

use super::{Facility, Severity};

/// Default bound on in-flight log entries before new entries are dropped
const DEFAULT_CAPACITY: usize = 4096;

/// A single log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Wall-clock timestamp at emission
    pub at: SystemTime,
    /// Severity level
    pub severity: Severity,
    /// Component that emitted the entry
    pub facility: Facility,
    /// Formatted message
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unix = self
            .at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        write!(
            f,
            "{}.{:03} [{}] {}: {}",
            unix.as_secs(),
            unix.subsec_millis(),
            self.severity,
            self.facility,
            self.message
        )
    }
}

/// Cheap, cloneable handle used by engine components to emit log entries.
/// Entries are dropped (never blocked on) when the consumer falls behind.
#[derive(Clone)]
pub struct Logger {
    tx: Option<SyncSender<LogEntry>>,
    min_severity: Severity,
}

impl Logger {
    /// A logger that discards everything; used in tests that do not care
    /// about log output.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            min_severity: Severity::Error,
        }
    }

    /// Emit an entry at the given severity
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if severity > self.min_severity {
            return;
        }
        if let Some(tx) = &self.tx {
            let entry = LogEntry {
                at: SystemTime::now(),
                severity,
                facility,
                message: message.to_string(),
            };
            match tx.try_send(entry) {
                Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Log at error severity
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    /// Log at warning severity
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    /// Log at notice severity
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    /// Log at info severity
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    /// Log at debug severity
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

/// Consumer side of the log channel
pub struct LogConsumer {
    rx: Receiver<LogEntry>,
}

impl LogConsumer {
    /// Drain all pending entries without blocking
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    /// Block-print entries to stderr until all loggers are dropped
    pub fn run_stderr(self) {
        while let Ok(entry) = self.rx.recv() {
            eprintln!("{}", entry);
        }
    }
}

/// Factory tying a logger to its consumer
pub struct LogRegistry;

impl LogRegistry {
    /// Create a logger/consumer pair with the default capacity, letting
    /// entries at or above `min_severity` verbosity through.
    pub fn new(min_severity: Severity) -> (Logger, LogConsumer) {
        let (tx, rx) = sync_channel(DEFAULT_CAPACITY);
        (
            Logger {
                tx: Some(tx),
                min_severity,
            },
            LogConsumer { rx },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_roundtrip() {
        let (logger, consumer) = LogRegistry::new(Severity::Debug);
        logger.info(Facility::Engine, "engine started");
        logger.debug(Facility::Codec, "decoded hello");

        let entries = consumer.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].facility, Facility::Engine);
        assert_eq!(entries[0].severity, Severity::Info);
        assert_eq!(entries[1].message, "decoded hello");
    }

    #[test]
    fn test_severity_filter() {
        let (logger, consumer) = LogRegistry::new(Severity::Warning);
        logger.debug(Facility::Engine, "suppressed");
        logger.error(Facility::Engine, "kept");

        let entries = consumer.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "kept");
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = Logger::disabled();
        // Must not panic or block
        logger.error(Facility::Engine, "nowhere");
    }

    #[test]
    fn test_entry_display() {
        let entry = LogEntry {
            at: SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1500),
            severity: Severity::Notice,
            facility: Facility::Hello,
            message: "neighbor up".to_string(),
        };
        assert_eq!(format!("{}", entry), "1.500 [NOTICE] Hello: neighbor up");
    }
}
