//! Body of the worker task: the verify loop, rewrite cycles and error
//! escalation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

use crate::device::{Device, DeviceError, DeviceIo};
use crate::events::{Notification, Notifier};
use crate::manifest::{Manifest, ManifestError};
use crate::settings::{RetryPolicy, TestSettings};
use crate::state::{ERROR_THRESHOLD, Phase, RunState, SharedState};

/// Reason the worker left its loop early.
#[derive(Debug)]
enum Halt {
    /// A stop was requested.
    Stopped,
    /// The error threshold was reached; escalation already happened.
    Fatal,
    /// The retry policy gave up on a rewrite or manifest rebuild.
    RetriesExhausted { attempts: u32 },
    /// The device went away or failed in a way the loop cannot absorb.
    Unexpected(DeviceError),
}

type Step<T = ()> = Result<T, Halt>;

#[derive(Debug, Error)]
enum RewriteError {
    #[error("format failed: {0}")]
    Format(DeviceError),
    #[error(transparent)]
    Source(ManifestError),
    #[error("cannot inspect device root: {0}")]
    Inspect(DeviceError),
    #[error("device still holds directories after format: {}", .directories.join(", "))]
    NotFormatted { directories: Vec<String> },
    #[error("copy failed: {0}")]
    Copy(DeviceError),
}

struct Attempts {
    policy: RetryPolicy,
    made: u32,
}

impl Attempts {
    const fn new(policy: RetryPolicy) -> Self {
        Self { policy, made: 0 }
    }

    fn begin(&mut self) -> Step {
        if !self.policy.allows(self.made) {
            return Err(Halt::RetriesExhausted {
                attempts: self.made,
            });
        }
        self.made = self.made.saturating_add(1);
        Ok(())
    }

    async fn back_off(&self) {
        if self.policy.backoff.is_zero() {
            tokio::task::yield_now().await;
        } else {
            sleep(self.policy.backoff).await;
        }
    }
}

pub(super) struct Worker {
    device: Device,
    settings: TestSettings,
    io: Arc<dyn DeviceIo>,
    shared: Arc<SharedState>,
    notifier: Notifier,
    manifest: Manifest,
    last_rewrite: Instant,
    done: watch::Sender<bool>,
}

impl Worker {
    pub(super) fn new(
        device: Device,
        settings: TestSettings,
        io: Arc<dyn DeviceIo>,
        shared: Arc<SharedState>,
        notifier: Notifier,
        done: watch::Sender<bool>,
    ) -> Self {
        Self {
            device,
            settings,
            io,
            shared,
            notifier,
            manifest: Manifest::new(),
            last_rewrite: Instant::now(),
            done,
        }
    }

    pub(super) async fn drive(mut self) {
        self.info("test started");
        match self.run().await {
            Ok(()) | Err(Halt::Stopped | Halt::Fatal) => {}
            Err(Halt::RetriesExhausted { attempts }) => {
                self.error(&format!("giving up after {attempts} failed attempts"));
            }
            Err(Halt::Unexpected(err)) => {
                self.exception("unexpected failure, stopping test", &err.to_string());
                self.bump_errors();
            }
        }

        self.set_current_file(None);
        self.info("test stopped");
        if self.shared.state() != RunState::Fatal {
            self.shared.set_state(RunState::Stopped);
            self.notifier.emit(Notification::StateChanged {
                state: RunState::Stopped,
            });
        }
        self.done.send_replace(true);
    }

    async fn run(&mut self) -> Step {
        self.ensure_ready().await?;
        if self.settings.clean_start {
            self.rewrite_until_success().await?;
        } else {
            self.rebuild_until_success().await?;
            self.last_rewrite = Instant::now();
        }
        self.reset_errors();
        self.shared.set_phase(Phase::Verifying);

        loop {
            self.hold_while_paused().await?;
            if self.shared.state() != RunState::Running {
                return Ok(());
            }
            self.ensure_ready().await?;

            if self.last_rewrite.elapsed() > self.settings.rewrite_period {
                self.info(&format!(
                    "rewrite due, {} read cycles completed so far",
                    self.shared.read_cycles()
                ));
                self.rewrite_until_success().await?;
            } else {
                self.verify_cycle().await?;
                sleep(self.settings.cycle_delay).await;
            }
        }
    }

    fn check_stop(&self) -> Step {
        if self.shared.stop_requested() {
            return Err(Halt::Stopped);
        }
        Ok(())
    }

    /// Cycle boundary. Parks while a pause is requested; the worker is the
    /// only place that moves the run into [`RunState::Paused`].
    async fn hold_while_paused(&self) -> Step {
        loop {
            self.check_stop()?;
            if !self.shared.pause_requested() {
                // Covers a resume that raced with parking.
                if self
                    .shared
                    .transition(RunState::Paused, RunState::Running)
                    .is_ok()
                {
                    self.notifier.emit(Notification::StateChanged {
                        state: RunState::Running,
                    });
                }
                return Ok(());
            }
            if self
                .shared
                .transition(RunState::Running, RunState::Paused)
                .is_ok()
            {
                self.info("test paused");
                self.notifier.emit(Notification::StateChanged {
                    state: RunState::Paused,
                });
            }
            sleep(self.settings.pause_poll).await;
        }
    }

    async fn ensure_ready(&self) -> Step {
        match self.io.is_ready(&self.device).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Halt::Unexpected(DeviceError::NotReady {
                label: self.device.id.to_string(),
            })),
            Err(err) => Err(Halt::Unexpected(err)),
        }
    }

    /// One pass over the valid manifest entries.
    async fn verify_cycle(&mut self) -> Step {
        let listed = match self.io.list_files(&self.device.root).await {
            Ok(files) => files,
            Err(err) => {
                self.exception("failed to list device files", &err.to_string());
                return self.count_error();
            }
        };

        let expected = self.manifest.valid_count();
        if listed.len() != expected {
            self.error(&format!(
                "file count mismatch: {} on device, {expected} expected",
                listed.len()
            ));
            self.count_error()?;
        }

        let present: HashSet<String> = listed.into_iter().collect();
        for relative in self.manifest.valid_entries() {
            if self.shared.stop_requested()
                || self.shared.pause_requested()
                || self.shared.state() != RunState::Running
            {
                return Ok(());
            }
            self.set_current_file(Some(relative.clone()));

            if !present.contains(&relative) {
                self.invalidate(&relative);
                self.error(&format!("file missing: {relative}"));
                self.count_error()?;
                continue;
            }

            let on_device = self.device.root.join(&relative);
            let in_source = self.settings.source_dir.join(&relative);
            match self.io.compare(&on_device, &in_source).await {
                Ok(true) => {
                    let count = self.shared.increment_reads();
                    self.notifier
                        .emit(Notification::ReadCyclesChanged { count });
                }
                Ok(false) => {
                    self.invalidate(&relative);
                    self.error(&format!("content mismatch: {relative}"));
                    self.count_error()?;
                }
                Err(err) => {
                    self.invalidate(&relative);
                    self.exception(&format!("failed to compare {relative}"), &err.to_string());
                    self.count_error()?;
                }
            }
        }
        Ok(())
    }

    async fn rewrite_until_success(&mut self) -> Step {
        let mut attempts = Attempts::new(self.settings.retry);
        loop {
            self.hold_while_paused().await?;
            attempts.begin()?;
            match self.rewrite_cycle().await {
                Ok(copied) => {
                    self.last_rewrite = Instant::now();
                    let count = self.shared.increment_writes();
                    self.notifier
                        .emit(Notification::WriteCyclesChanged { count });
                    self.info(&format!("write cycle {count} completed, {copied} files written"));
                    self.reset_errors();
                    self.shared.set_phase(Phase::Verifying);
                    return Ok(());
                }
                Err(err) => {
                    self.exception("rewrite attempt failed", &err.to_string());
                    self.count_error()?;
                    attempts.back_off().await;
                }
            }
        }
    }

    /// Formats the device, rebuilds the manifest and copies the dataset.
    async fn rewrite_cycle(&mut self) -> Result<usize, RewriteError> {
        self.shared.set_phase(Phase::Formatting);
        self.notifier.emit(Notification::FormattingStarted);
        self.info("formatting device");
        self.io
            .format(&self.device, self.settings.quick_format)
            .await
            .map_err(RewriteError::Format)?;

        self.rebuild_manifest().await.map_err(RewriteError::Source)?;

        let directories = self
            .io
            .root_directories(&self.device.root)
            .await
            .map_err(RewriteError::Inspect)?;
        if !directories.is_empty() {
            return Err(RewriteError::NotFormatted { directories });
        }

        self.shared.set_phase(Phase::Writing);
        self.notifier.emit(Notification::WritingStarted);
        self.info("writing dataset");
        self.io
            .copy_tree(&self.settings.source_dir, &self.device.root)
            .await
            .map_err(RewriteError::Copy)
    }

    async fn rebuild_until_success(&mut self) -> Step {
        let mut attempts = Attempts::new(self.settings.retry);
        loop {
            self.hold_while_paused().await?;
            attempts.begin()?;
            match self.rebuild_manifest().await {
                Ok(count) => {
                    self.info(&format!("manifest loaded with {count} files"));
                    return Ok(());
                }
                Err(err) => {
                    self.exception("failed to read source directory", &err.to_string());
                    self.count_error()?;
                    attempts.back_off().await;
                }
            }
        }
    }

    async fn rebuild_manifest(&mut self) -> Result<usize, ManifestError> {
        let outcome = self
            .manifest
            .rebuild(self.io.as_ref(), &self.settings.source_dir)
            .await;
        self.publish_manifest();
        outcome
    }

    fn invalidate(&mut self, relative: &str) {
        self.manifest.mark_invalid(relative);
        self.publish_manifest();
    }

    fn publish_manifest(&self) {
        self.shared
            .publish_manifest(self.manifest.len(), self.manifest.valid_count());
    }

    fn count_error(&self) -> Step {
        if self.bump_errors() {
            return Err(Halt::Fatal);
        }
        Ok(())
    }

    /// Records one error and escalates when the threshold is reached.
    /// Returns `true` if the run is now fatal.
    fn bump_errors(&self) -> bool {
        let count = self.shared.increment_errors();
        self.notifier
            .emit(Notification::ErrorCountChanged { count });
        if count != ERROR_THRESHOLD {
            return false;
        }

        self.shared.set_state(RunState::Fatal);
        self.shared.request_stop();
        self.notifier.emit(Notification::StateChanged {
            state: RunState::Fatal,
        });
        self.notifier.emit(Notification::FatalErrorOccurred);
        self.error(&format!(
            "error threshold of {ERROR_THRESHOLD} reached, emergency termination"
        ));
        true
    }

    fn reset_errors(&self) {
        self.shared.reset_errors();
        self.notifier
            .emit(Notification::ErrorCountChanged { count: 0 });
    }

    fn set_current_file(&self, path: Option<String>) {
        self.shared.set_current_file(path.clone());
        self.notifier
            .emit(Notification::CurrentFileChanged { path });
    }

    fn info(&self, message: &str) {
        self.settings.log.info(SystemTime::now(), message);
    }

    fn error(&self, message: &str) {
        self.settings.log.error(SystemTime::now(), message);
    }

    fn exception(&self, message: &str, detail: &str) {
        self.settings
            .log
            .exception(SystemTime::now(), message, detail);
    }
}
