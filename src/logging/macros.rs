// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros for convenient logging

/// Log a message with error severity
///
/// # Examples
/// ```ignore
/// log_error!(logger, Facility::Codec, "checksum mismatch");
/// ```
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.error($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)*) => {
        $logger.error($facility, &format!($fmt, $($arg)*))
    };
}

/// Log a message with warning severity
#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.warning($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)*) => {
        $logger.warning($facility, &format!($fmt, $($arg)*))
    };
}

/// Log a message with notice severity
#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.notice($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)*) => {
        $logger.notice($facility, &format!($fmt, $($arg)*))
    };
}

/// Log a message with info severity
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.info($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)*) => {
        $logger.info($facility, &format!($fmt, $($arg)*))
    };
}

/// Log a message with debug severity
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.debug($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)*) => {
        $logger.debug($facility, &format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use crate::logging::{Facility, LogRegistry, Severity};

    #[test]
    fn test_log_macros() {
        let (logger, consumer) = LogRegistry::new(Severity::Debug);

        log_error!(logger, Facility::Test, "error message");
        log_warning!(logger, Facility::Test, "warning message");
        log_notice!(logger, Facility::Test, "notice message");
        log_info!(logger, Facility::Test, "info message");
        log_debug!(logger, Facility::Test, "debug {} {}", "with", "args");

        let entries = consumer.drain();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].message, "debug with args");
    }
}
