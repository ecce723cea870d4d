//! Event log sink handed to each device test loop.
//!
//! The engine never talks to a file or a terminal directly: every
//! transition and every individual failure goes through an [`EventLog`]
//! injected via [`crate::TestSettings`]. Sinks are fire-and-forget, so
//! implementations must swallow their own failures instead of surfacing them
//! to the test loop.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Append-only log of test events for one device.
pub trait EventLog: Send + Sync + fmt::Debug {
    /// Records an informational transition (start, pause, rewrite done).
    fn info(&self, timestamp: SystemTime, message: &str);

    /// Records a detected data or device error.
    fn error(&self, timestamp: SystemTime, message: &str);

    /// Records a failure raised by an I/O collaborator, with its detail text.
    fn exception(&self, timestamp: SystemTime, message: &str, detail: &str);
}

/// Forwards records to `tracing`, tagging each with the device label.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TracingLog {
    device: String,
}

impl TracingLog {
    /// Creates a sink for the named device.
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    /// Label attached to every record.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl EventLog for TracingLog {
    fn info(&self, timestamp: SystemTime, message: &str) {
        tracing::info!(
            device = %self.device,
            at_ms = unix_millis(timestamp),
            "{message}"
        );
    }

    fn error(&self, timestamp: SystemTime, message: &str) {
        tracing::error!(
            device = %self.device,
            at_ms = unix_millis(timestamp),
            "{message}"
        );
    }

    fn exception(&self, timestamp: SystemTime, message: &str, detail: &str) {
        tracing::error!(
            device = %self.device,
            at_ms = unix_millis(timestamp),
            detail = %detail,
            "{message}"
        );
    }
}

fn unix_millis(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use rstest::rstest;

    #[rstest]
    fn unix_millis_clamps_pre_epoch_times() {
        let before_epoch = UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(unix_millis(before_epoch), 0);
    }

    #[rstest]
    fn unix_millis_counts_from_epoch() {
        let stamp = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(unix_millis(stamp), 1_500);
    }

    #[rstest]
    fn tracing_log_keeps_device_label() {
        let log = TracingLog::new("stick-07");
        assert_eq!(log.device(), "stick-07");
        log.info(SystemTime::now(), "no subscriber installed is fine");
    }
}
