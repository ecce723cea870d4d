//! Write/verify state machine for a single device.
//!
//! A [`DeviceTester`] owns one run of the soak loop. Starting it spawns a
//! dedicated worker task that formats, writes and verifies the device until
//! it is stopped or reaches the error threshold. The controller side only
//! flips shared flags (`pause`, `resume`, `stop`) and reads counters; it never
//! touches the device itself. Pausing is a request: the worker parks at its
//! next cycle boundary and only then reports [`RunState::Paused`]. A stopped or fatal tester is spent: restarting a
//! device means constructing a new tester.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::device::{Device, DeviceId, DeviceIo};
use crate::events::{EventSender, HealthStatus, Notification, Notifier};
use crate::settings::TestSettings;
use crate::state::{Phase, RunState, SharedState};

mod run;

use run::Worker;

/// How a stop request treats a worker that does not exit in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopMode {
    /// Ask the worker to exit and wait up to the stop timeout.
    Graceful,
    /// As graceful, then abort the worker task if it is still running.
    /// Aborting may abandon a file half-written.
    Forced,
}

/// Errors raised by tester commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TesterError {
    /// The command is not valid in the current state.
    #[error("cannot {action} device {device} while {state}")]
    InvalidTransition {
        /// Device the command targeted.
        device: DeviceId,
        /// Command that was refused.
        action: &'static str,
        /// State observed when the command arrived.
        state: RunState,
    },
    /// The worker did not exit within the stop timeout.
    #[error("device {device} did not stop within {timeout:?} (aborted: {aborted})")]
    StopTimedOut {
        /// Device that was being stopped.
        device: DeviceId,
        /// Time waited before giving up.
        timeout: Duration,
        /// Whether the worker task was aborted afterwards.
        aborted: bool,
    },
    /// The worker task could not be spawned or ended abnormally.
    #[error("worker for device {device} failed: {message}")]
    Worker {
        /// Device whose worker failed.
        device: DeviceId,
        /// Failure description.
        message: String,
    },
}

/// One run of the soak loop against one device.
#[derive(Debug)]
pub struct DeviceTester {
    device: Device,
    settings: TestSettings,
    io: Arc<dyn DeviceIo>,
    shared: Arc<SharedState>,
    notifier: Notifier,
    worker: Mutex<Option<JoinHandle<()>>>,
    done_tx: Mutex<Option<watch::Sender<bool>>>,
    done: watch::Receiver<bool>,
}

impl DeviceTester {
    /// Creates an idle tester. Notifications go to `events` when provided.
    #[must_use]
    pub fn new(
        device: Device,
        settings: TestSettings,
        io: Arc<dyn DeviceIo>,
        events: Option<EventSender>,
    ) -> Self {
        let notifier = Notifier::new(device.id.clone(), events);
        let (done_tx, done) = watch::channel(false);
        Self {
            device,
            settings,
            io,
            shared: Arc::new(SharedState::new()),
            notifier,
            worker: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done,
        }
    }

    /// Device under test.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Settings this run was created with.
    #[must_use]
    pub const fn settings(&self) -> &TestSettings {
        &self.settings
    }

    /// Marks the tester as waiting for its launch slot.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::InvalidTransition`] unless the tester is idle.
    pub fn arm(&self) -> Result<(), TesterError> {
        self.shared
            .transition(RunState::Idle, RunState::Pending)
            .map_err(|state| self.invalid("arm", state))?;
        self.notifier.emit(Notification::StateChanged {
            state: RunState::Pending,
        });
        Ok(())
    }

    /// Moves to running and spawns the worker task.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::InvalidTransition`] unless the tester is idle
    /// or pending, and [`TesterError::Worker`] when called outside a Tokio
    /// runtime.
    pub fn start(&self) -> Result<(), TesterError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|err| TesterError::Worker {
                device: self.device.id.clone(),
                message: err.to_string(),
            })?;

        let state = self.shared.state();
        if !matches!(state, RunState::Idle | RunState::Pending) {
            return Err(self.invalid("start", state));
        }
        self.shared
            .transition(state, RunState::Running)
            .map_err(|observed| self.invalid("start", observed))?;
        self.notifier.emit(Notification::StateChanged {
            state: RunState::Running,
        });

        let Some(done) = self.done_tx.lock().take() else {
            return Err(self.invalid("start", state));
        };
        let worker = Worker::new(
            self.device.clone(),
            self.settings.clone(),
            Arc::clone(&self.io),
            Arc::clone(&self.shared),
            self.notifier.clone(),
            done,
        );
        *self.worker.lock() = Some(runtime.spawn(worker.drive()));
        Ok(())
    }

    /// Asks the worker to suspend device I/O at the next cycle boundary.
    ///
    /// The state stays [`RunState::Running`] until the worker parks; a
    /// rewrite already in flight finishes first and may still escalate to
    /// [`RunState::Fatal`].
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::InvalidTransition`] unless running.
    pub fn pause(&self) -> Result<(), TesterError> {
        let state = self.shared.state();
        if state != RunState::Running {
            return Err(self.invalid("pause", state));
        }
        self.shared.request_pause();
        tracing::debug!(device = %self.device.id, "pause requested");
        Ok(())
    }

    /// Continues a paused run with its counters and manifest intact. Also
    /// withdraws a pause the worker has not acted on yet.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::InvalidTransition`] unless paused or waiting
    /// to pause.
    pub fn resume(&self) -> Result<(), TesterError> {
        let pending = self.shared.clear_pause();
        match self.shared.transition(RunState::Paused, RunState::Running) {
            Ok(()) => self.notifier.emit(Notification::StateChanged {
                state: RunState::Running,
            }),
            Err(RunState::Running) if pending => {}
            Err(state) => return Err(self.invalid("resume", state)),
        }
        self.settings.log.info(SystemTime::now(), "test resumed");
        Ok(())
    }

    /// Returns `true` while a pause has been requested but not yet withdrawn.
    #[must_use]
    pub fn pause_requested(&self) -> bool {
        self.shared.pause_requested()
    }

    /// Stops the run and returns the final state.
    ///
    /// A pending tester stops immediately. A running or paused worker is
    /// asked to exit and awaited for up to the configured stop timeout.
    /// Stopping a tester that already ended is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::StopTimedOut`] when the worker overran the
    /// timeout; with [`StopMode::Graceful`] it is still running, with
    /// [`StopMode::Forced`] it has been aborted. Returns
    /// [`TesterError::Worker`] if the worker panicked.
    pub async fn stop(&self, mode: StopMode) -> Result<RunState, TesterError> {
        if self
            .shared
            .transition(RunState::Pending, RunState::Stopped)
            .is_ok()
        {
            self.notifier.emit(Notification::StateChanged {
                state: RunState::Stopped,
            });
            return Ok(RunState::Stopped);
        }

        self.shared.request_stop();
        let Some(mut handle) = self.worker.lock().take() else {
            return Ok(self.shared.state());
        };

        let timeout = self.settings.stop_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                joined.map_err(|err| self.worker_failed(&err))?;
                Ok(self.shared.state())
            }
            Err(_) if mode == StopMode::Graceful => {
                *self.worker.lock() = Some(handle);
                Err(self.timed_out(timeout, false))
            }
            Err(_) => {
                handle.abort();
                self.shared.set_current_file(None);
                if self.shared.state() != RunState::Fatal {
                    self.shared.set_state(RunState::Stopped);
                    self.notifier.emit(Notification::StateChanged {
                        state: RunState::Stopped,
                    });
                }
                self.settings
                    .log
                    .error(SystemTime::now(), "test aborted after stop timeout");
                Err(self.timed_out(timeout, true))
            }
        }
    }

    /// Waits for the worker to exit on its own and returns the final state.
    ///
    /// The join handle stays with the tester, so [`Self::is_finished`] and a
    /// forced [`Self::stop`] keep working while another task waits here.
    /// Returns at once if no worker was ever started.
    pub async fn wait(&self) -> RunState {
        if self.done_tx.lock().is_some() {
            return self.shared.state();
        }
        let mut done = self.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            // The worker was aborted or panicked before signalling.
            tracing::debug!(device = %self.device.id, "worker ended without completing");
        }
        self.shared.state()
    }

    /// Returns `true` once the worker has exited, or if none was spawned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Current activity of a running worker.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Errors recorded since the run started or the last successful rewrite.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.shared.error_count()
    }

    /// Files verified intact during this run.
    #[must_use]
    pub fn read_cycles(&self) -> u64 {
        self.shared.read_cycles()
    }

    /// Completed rewrite cycles during this run.
    #[must_use]
    pub fn write_cycles(&self) -> u64 {
        self.shared.write_cycles()
    }

    /// Number of files tracked by the manifest.
    #[must_use]
    pub fn tracked_files(&self) -> usize {
        self.shared.tracked_files()
    }

    /// Number of manifest entries still believed intact.
    #[must_use]
    pub fn valid_files(&self) -> usize {
        self.shared.valid_files()
    }

    /// File currently being verified, if any.
    #[must_use]
    pub fn current_file(&self) -> Option<String> {
        self.shared.current_file()
    }

    /// Operator-facing health summary.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        HealthStatus::derive(
            self.shared.state(),
            self.shared.phase(),
            self.shared.error_count(),
        )
    }

    fn invalid(&self, action: &'static str, state: RunState) -> TesterError {
        TesterError::InvalidTransition {
            device: self.device.id.clone(),
            action,
            state,
        }
    }

    fn timed_out(&self, timeout: Duration, aborted: bool) -> TesterError {
        TesterError::StopTimedOut {
            device: self.device.id.clone(),
            timeout,
            aborted,
        }
    }

    fn worker_failed(&self, err: &tokio::task::JoinError) -> TesterError {
        TesterError::Worker {
            device: self.device.id.clone(),
            message: err.to_string(),
        }
    }
}
