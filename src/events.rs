//! Notifications pushed by device workers and the health summary derived
//! from them.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::device::DeviceId;
use crate::state::{Phase, RunState};

/// Change reported by a device worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// The error counter moved (up, or back to zero after a rewrite).
    ErrorCountChanged {
        /// New counter value.
        count: u32,
    },
    /// A verified file matched its source copy.
    ReadCyclesChanged {
        /// New counter value.
        count: u64,
    },
    /// A rewrite cycle completed.
    WriteCyclesChanged {
        /// New counter value.
        count: u64,
    },
    /// The worker started formatting the device.
    FormattingStarted,
    /// The worker started copying the reference dataset.
    WritingStarted,
    /// The error threshold was reached and the run ended.
    FatalErrorOccurred,
    /// The run state changed.
    StateChanged {
        /// State entered.
        state: RunState,
    },
    /// The file being verified changed.
    CurrentFileChanged {
        /// Relative path, or `None` once the run is idle.
        path: Option<String>,
    },
}

/// Notification tagged with the device that produced it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceEvent {
    /// Producing device.
    pub device: DeviceId,
    /// What changed.
    #[serde(flatten)]
    pub notification: Notification,
}

/// Channel end that device workers push their events into.
pub type EventSender = mpsc::UnboundedSender<DeviceEvent>;

/// Per-device handle used by the worker to publish notifications.
#[derive(Clone, Debug)]
pub(crate) struct Notifier {
    device: DeviceId,
    sender: Option<EventSender>,
}

impl Notifier {
    pub(crate) const fn new(device: DeviceId, sender: Option<EventSender>) -> Self {
        Self { device, sender }
    }

    /// Sends `notification` if anyone is listening. A closed channel only
    /// means the supervisor is gone; the worker carries on regardless.
    pub(crate) fn emit(&self, notification: Notification) {
        if let Some(sender) = &self.sender {
            sender
                .send(DeviceEvent {
                    device: self.device.clone(),
                    notification,
                })
                .ok();
        }
    }
}

/// Operator-facing summary of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Never started.
    NotActive,
    /// Queued for launch.
    Pending,
    /// Running, first rewrite or manifest build in progress.
    Launched,
    /// Format in progress.
    Formatting,
    /// Dataset copy in progress.
    Writing,
    /// Verifying with a clean error counter.
    NoErrorsFound,
    /// Verifying with at least one error recorded since the last rewrite.
    ErrorsFound,
    /// Error threshold reached.
    Fatal,
    /// Paused by the operator.
    Paused,
    /// Stopped.
    Stopped,
}

impl HealthStatus {
    /// Summarises the worst current condition of a device.
    #[must_use]
    pub const fn derive(state: RunState, phase: Phase, errors: u32) -> Self {
        match state {
            RunState::Idle => Self::NotActive,
            RunState::Pending => Self::Pending,
            RunState::Paused => Self::Paused,
            RunState::Stopped => Self::Stopped,
            RunState::Fatal => Self::Fatal,
            RunState::Running => match phase {
                Phase::Starting => Self::Launched,
                Phase::Formatting => Self::Formatting,
                Phase::Writing => Self::Writing,
                Phase::Verifying if errors > 0 => Self::ErrorsFound,
                Phase::Verifying => Self::NoErrorsFound,
            },
        }
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::NotActive => "not active",
            Self::Pending => "pending",
            Self::Launched => "launched",
            Self::Formatting => "formatting",
            Self::Writing => "writing",
            Self::NoErrorsFound => "no errors found",
            Self::ErrorsFound => "errors found",
            Self::Fatal => "fatal",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RunState::Idle, Phase::Verifying, 3, HealthStatus::NotActive)]
    #[case(RunState::Pending, Phase::Starting, 0, HealthStatus::Pending)]
    #[case(RunState::Running, Phase::Starting, 0, HealthStatus::Launched)]
    #[case(RunState::Running, Phase::Formatting, 9, HealthStatus::Formatting)]
    #[case(RunState::Running, Phase::Writing, 0, HealthStatus::Writing)]
    #[case(RunState::Running, Phase::Verifying, 0, HealthStatus::NoErrorsFound)]
    #[case(RunState::Running, Phase::Verifying, 1, HealthStatus::ErrorsFound)]
    #[case(RunState::Paused, Phase::Verifying, 5, HealthStatus::Paused)]
    #[case(RunState::Fatal, Phase::Verifying, 100, HealthStatus::Fatal)]
    #[case(RunState::Stopped, Phase::Writing, 0, HealthStatus::Stopped)]
    fn health_reflects_worst_condition(
        #[case] state: RunState,
        #[case] phase: Phase,
        #[case] errors: u32,
        #[case] expected: HealthStatus,
    ) {
        assert_eq!(HealthStatus::derive(state, phase, errors), expected);
    }

    #[rstest]
    fn notifier_without_channel_is_silent() {
        let notifier = Notifier::new(DeviceId::from("usb-a"), None);
        notifier.emit(Notification::FormattingStarted);
    }

    #[rstest]
    fn notifier_tags_events_with_device() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(DeviceId::from("usb-a"), Some(tx));

        notifier.emit(Notification::ErrorCountChanged { count: 2 });

        let event = rx.try_recv().expect("event should be queued");
        assert_eq!(event.device.as_str(), "usb-a");
        assert_eq!(event.notification, Notification::ErrorCountChanged { count: 2 });
    }

    #[rstest]
    fn events_serialise_with_flat_tag() {
        let event = DeviceEvent {
            device: DeviceId::from("usb-a"),
            notification: Notification::StateChanged {
                state: RunState::Fatal,
            },
        };

        let json = serde_json::to_value(&event).expect("serialise event");
        assert_eq!(json["device"], "usb-a");
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["state"], "fatal");
    }
}
