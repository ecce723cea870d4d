//! Per-device test configuration.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::log::EventLog;

/// Default interval between forced format-and-rewrite cycles.
pub const DEFAULT_REWRITE_PERIOD: Duration = Duration::from_secs(3 * 60 * 60);

/// Default number of automatic restarts after a fatal failure.
pub const DEFAULT_RECOVERY_ATTEMPTS: u32 = 4;

/// Default sleep between pause-state checks.
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_secs(1);

/// Default pacing delay between verify cycles.
pub const DEFAULT_CYCLE_DELAY: Duration = Duration::from_millis(10);

/// Default bound on how long a stop request waits for the worker.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for the format-and-rewrite loop.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts per rewrite; `None` retries until success or stop.
    pub limit: Option<u32>,
    /// Sleep inserted after each failed attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Retries forever with no backoff.
    pub const UNBOUNDED: Self = Self {
        limit: None,
        backoff: Duration::ZERO,
    };

    /// Returns `true` when another attempt may start after `attempts_made`.
    #[must_use]
    pub const fn allows(&self, attempts_made: u32) -> bool {
        match self.limit {
            Some(limit) => attempts_made < limit,
            None => true,
        }
    }
}

/// Configuration for one device. The fleet supervisor only accepts changes
/// while the device is not running.
#[derive(Clone, Debug)]
pub struct TestSettings {
    /// Time between forced format-and-rewrite cycles.
    pub rewrite_period: Duration,
    /// Automatic restarts allowed after a fatal failure.
    pub recovery_attempts: u32,
    /// Reference dataset copied onto the device.
    pub source_dir: Utf8PathBuf,
    /// Format and rewrite before the first verify pass.
    pub clean_start: bool,
    /// Request a quick format instead of a full surface check.
    pub quick_format: bool,
    /// Sink receiving every transition and failure.
    pub log: Arc<dyn EventLog>,
    /// Retry behaviour of the rewrite loop.
    pub retry: RetryPolicy,
    /// Sleep between checks while paused.
    pub pause_poll: Duration,
    /// Pacing delay between verify cycles.
    pub cycle_delay: Duration,
    /// How long a stop request waits before giving up (or aborting).
    pub stop_timeout: Duration,
}

impl TestSettings {
    /// Creates settings with the stock defaults.
    #[must_use]
    pub fn new(source_dir: impl Into<Utf8PathBuf>, log: Arc<dyn EventLog>) -> Self {
        Self {
            rewrite_period: DEFAULT_REWRITE_PERIOD,
            recovery_attempts: DEFAULT_RECOVERY_ATTEMPTS,
            source_dir: source_dir.into(),
            clean_start: false,
            quick_format: true,
            log,
            retry: RetryPolicy::UNBOUNDED,
            pause_poll: DEFAULT_PAUSE_POLL,
            cycle_delay: DEFAULT_CYCLE_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Overrides the rewrite period.
    #[must_use]
    pub const fn with_rewrite_period(mut self, period: Duration) -> Self {
        self.rewrite_period = period;
        self
    }

    /// Overrides the automatic restart budget.
    #[must_use]
    pub const fn with_recovery_attempts(mut self, attempts: u32) -> Self {
        self.recovery_attempts = attempts;
        self
    }

    /// Enables or disables formatting before the first verify pass.
    #[must_use]
    pub const fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    /// Chooses between quick and full formats.
    #[must_use]
    pub const fn with_quick_format(mut self, quick: bool) -> Self {
        self.quick_format = quick;
        self
    }

    /// Overrides the rewrite retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the pause polling interval.
    ///
    /// This is primarily used by tests to keep pause scenarios fast.
    #[must_use]
    pub const fn with_pause_poll(mut self, poll: Duration) -> Self {
        self.pause_poll = poll;
        self
    }

    /// Overrides the delay between verify cycles.
    #[must_use]
    pub const fn with_cycle_delay(mut self, delay: Duration) -> Self {
        self.cycle_delay = delay;
        self
    }

    /// Overrides the stop timeout.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}
