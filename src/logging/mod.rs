// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Facility/severity logging for the protocol engine.
//!
//! Loggers are cheap clones of a bounded channel sender; a consumer drains
//! entries off the hot path. When the channel is full the entry is dropped
//! rather than blocking a protocol handler.

mod logger;
#[macro_use]
mod macros;

pub use logger::{LogConsumer, LogEntry, LogRegistry, Logger};

use serde::{Deserialize, Serialize};

/// Log severity levels (RFC 5424 syslog-style, lower is more severe)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Error conditions (decode failure, invariant violation)
    Error = 3,
    /// Warning conditions (dropped packet, unresolved RPF)
    Warning = 4,
    /// Significant normal condition (neighbor up/down, RPF change)
    Notice = 5,
    /// Informational (state transitions, timer activity)
    Info = 6,
    /// Debug-level messages (verbose per-message traces)
    Debug = 7,
}

impl Severity {
    /// Get severity name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logging facility - identifies which engine component generated the entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Event dispatch, interface lifecycle
    Engine = 0,
    /// Wire codec (decode failures land here)
    Codec = 1,
    /// Hello protocol, neighbor table
    Hello = 2,
    /// Downstream Prune machine
    Downstream = 3,
    /// Upstream Graft/Prune machine
    Upstream = 4,
    /// Assert machine
    Assert = 5,
    /// Origination / State-Refresh machine
    Refresh = 6,
    /// RPF resolution and route cache
    Rpf = 7,
    /// Data-plane forwarding decisions
    Forwarding = 8,
    /// Timer manager
    Timer = 9,
    /// Test harness and fixtures
    Test = 10,
}

impl Facility {
    /// Get facility name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Engine => "Engine",
            Facility::Codec => "Codec",
            Facility::Hello => "Hello",
            Facility::Downstream => "Downstream",
            Facility::Upstream => "Upstream",
            Facility::Assert => "Assert",
            Facility::Refresh => "Refresh",
            Facility::Rpf => "Rpf",
            Facility::Forwarding => "Forwarding",
            Facility::Timer => "Timer",
            Facility::Test => "Test",
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Warning < Severity::Notice);
        assert!(Severity::Notice < Severity::Info);
        assert!(Severity::Info < Severity::Debug);
    }

    #[test]
    fn test_facility_display() {
        assert_eq!(format!("{}", Facility::Codec), "Codec");
        assert_eq!(format!("{}", Facility::Upstream), "Upstream");
    }
}
