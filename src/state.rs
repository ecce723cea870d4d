//! Run state and live counters shared between a device worker and the
//! controller issuing pause and stop commands.
//!
//! The worker is the only writer of the counters; controllers read them and
//! flip the small command flags. Every field is atomic (or briefly locked),
//! so a snapshot can be taken from any thread without coordinating with the
//! worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Error count at which a run escalates to [`RunState::Fatal`].
pub const ERROR_THRESHOLD: u32 = 100;

/// Lifecycle of one device test loop instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Constructed but never armed or started.
    Idle,
    /// Waiting in the start queue for its launch slot.
    Pending,
    /// Worker is executing verify and rewrite cycles.
    Running,
    /// Worker is alive but performs no device I/O.
    Paused,
    /// Loop ended after a stop request or an unrecoverable condition.
    Stopped,
    /// Loop ended because the error threshold was reached.
    Fatal,
}

impl RunState {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Pending => 1,
            Self::Running => 2,
            Self::Paused => 3,
            Self::Stopped => 4,
            Self::Fatal => 5,
        }
    }

    // Raw values only ever come from `to_raw`.
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Pending,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Stopped,
            5 => Self::Fatal,
            _ => Self::Idle,
        }
    }

    /// Returns `true` while the device occupies the fleet: queued, running,
    /// or paused.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    /// Returns `true` for states that only a new start command can leave.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Fatal)
    }

    /// Lower-case label used in logs and summaries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Activity the worker is currently engaged in while running.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Worker spawned, initial rewrite or manifest build not finished yet.
    Starting,
    /// Device format in progress.
    Formatting,
    /// Reference dataset being copied onto the device.
    Writing,
    /// Read-back verification cycles.
    Verifying,
}

impl Phase {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Formatting => 1,
            Self::Writing => 2,
            Self::Verifying => 3,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Formatting,
            2 => Self::Writing,
            3 => Self::Verifying,
            _ => Self::Starting,
        }
    }
}

/// Flags and counters for one test loop instance.
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
    phase: AtomicU8,
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    error_count: AtomicU32,
    read_cycles: AtomicU64,
    write_cycles: AtomicU64,
    tracked_files: AtomicUsize,
    valid_files: AtomicUsize,
    current_file: Mutex<Option<String>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Idle.to_raw()),
            phase: AtomicU8::new(Phase::Starting.to_raw()),
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            read_cycles: AtomicU64::new(0),
            write_cycles: AtomicU64::new(0),
            tracked_files: AtomicUsize::new(0),
            valid_files: AtomicUsize::new(0),
            current_file: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> RunState {
        RunState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, next: RunState) {
        self.state.store(next.to_raw(), Ordering::Release);
    }

    /// Moves from `from` to `to` atomically, returning the observed state
    /// when it was not `from`.
    pub(crate) fn transition(&self, from: RunState, to: RunState) -> Result<(), RunState> {
        self.state
            .compare_exchange(
                from.to_raw(),
                to.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(RunState::from_raw)
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.to_raw(), Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Asks the worker to park at its next cycle boundary.
    pub(crate) fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    /// Withdraws a pause request. Returns whether one was pending.
    pub(crate) fn clear_pause(&self) -> bool {
        self.pause_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    pub(crate) fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Adds one error and returns the new total.
    pub(crate) fn increment_errors(&self) -> u32 {
        self.error_count
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    pub(crate) fn reset_errors(&self) {
        self.error_count.store(0, Ordering::Release);
    }

    pub(crate) fn read_cycles(&self) -> u64 {
        self.read_cycles.load(Ordering::Acquire)
    }

    pub(crate) fn increment_reads(&self) -> u64 {
        self.read_cycles
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    pub(crate) fn write_cycles(&self) -> u64 {
        self.write_cycles.load(Ordering::Acquire)
    }

    pub(crate) fn increment_writes(&self) -> u64 {
        self.write_cycles
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    /// Publishes the manifest size and its count of valid entries.
    pub(crate) fn publish_manifest(&self, tracked: usize, valid: usize) {
        self.tracked_files.store(tracked, Ordering::Release);
        self.valid_files.store(valid, Ordering::Release);
    }

    pub(crate) fn tracked_files(&self) -> usize {
        self.tracked_files.load(Ordering::Acquire)
    }

    pub(crate) fn valid_files(&self) -> usize {
        self.valid_files.load(Ordering::Acquire)
    }

    pub(crate) fn current_file(&self) -> Option<String> {
        self.current_file.lock().clone()
    }

    pub(crate) fn set_current_file(&self, path: Option<String>) {
        *self.current_file.lock() = path;
    }
}
