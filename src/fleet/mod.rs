//! Fleet-wide device registry, command routing and bounded auto-recovery.
//!
//! The supervisor owns one slot per registered device. Start requests arm a
//! fresh [`DeviceTester`] and hand the device to the [`StartQueue`]; pause,
//! resume and stop are routed straight to the current tester. Worker
//! notifications flow through a single pump task that re-publishes them to
//! subscribers and restarts devices that went fatal while their restart
//! budget lasts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

use crate::device::{Device, DeviceId, DeviceIo};
use crate::events::{DeviceEvent, EventSender, HealthStatus, Notification};
use crate::queue::{Launcher, StartQueue};
use crate::settings::TestSettings;
use crate::state::RunState;
use crate::tester::{DeviceTester, StopMode, TesterError};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CAPACITY: usize = 4096;

/// Errors raised by fleet commands.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum FleetError {
    /// No device with this identifier is registered.
    #[error("unknown device {device}")]
    UnknownDevice {
        /// Requested identifier.
        device: DeviceId,
    },
    /// A device with this identifier is already registered.
    #[error("device {device} is already registered")]
    DuplicateDevice {
        /// Conflicting identifier.
        device: DeviceId,
    },
    /// The device is already running.
    #[error("device {device} is already running")]
    AlreadyRunning {
        /// Device that was asked to start.
        device: DeviceId,
    },
    /// The device is already waiting in the start queue.
    #[error("device {device} is already queued")]
    AlreadyQueued {
        /// Device that was asked to start.
        device: DeviceId,
    },
    /// The device cannot accept the command in its current state.
    #[error("device {device} is busy ({state})")]
    DeviceBusy {
        /// Device that refused the command.
        device: DeviceId,
        /// State observed.
        state: RunState,
    },
    /// A tester command failed.
    #[error(transparent)]
    Tester(#[from] TesterError),
    /// One or more devices failed to stop.
    #[error("{} device(s) failed to stop", .failures.len())]
    Stop {
        /// Per-device failures.
        failures: Vec<TesterError>,
    },
    /// The supervisor was created outside a Tokio runtime.
    #[error("fleet supervisor requires a Tokio runtime: {message}")]
    NoRuntime {
        /// Runtime lookup failure.
        message: String,
    },
}

/// Result of a start request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartOutcome {
    /// A fresh run was queued for launch.
    Queued,
    /// A paused run was resumed.
    Resumed,
}

/// Serialisable snapshot of one device.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Device identifier.
    pub device: DeviceId,
    /// Mount root.
    pub root: String,
    /// Run state of the current tester.
    pub state: RunState,
    /// Operator-facing health.
    pub health: HealthStatus,
    /// Errors since the run started or last rewrite.
    pub error_count: u32,
    /// Files verified intact during the current run.
    pub read_cycles: u64,
    /// Rewrite cycles completed during the current run.
    pub write_cycles: u64,
    /// Files tracked by the manifest.
    pub tracked_files: usize,
    /// Manifest entries still believed intact.
    pub valid_files: usize,
    /// File being verified, if any.
    pub current_file: Option<String>,
    /// Automatic restarts performed since the last operator start.
    pub restarts: u32,
    /// Automatic restarts still available.
    pub restart_budget: u32,
}

#[derive(Debug)]
struct DeviceSlot {
    device: Device,
    settings: TestSettings,
    tester: Option<Arc<DeviceTester>>,
    restart_budget: u32,
    restarts: u32,
    auto_restart: bool,
}

impl DeviceSlot {
    fn state(&self) -> RunState {
        self.tester
            .as_ref()
            .map_or(RunState::Idle, |tester| tester.state())
    }

    fn status(&self) -> DeviceStatus {
        let tester = self.tester.as_deref();
        DeviceStatus {
            device: self.device.id.clone(),
            root: self.device.root.to_string(),
            state: self.state(),
            health: tester.map_or(HealthStatus::NotActive, DeviceTester::health),
            error_count: tester.map_or(0, DeviceTester::error_count),
            read_cycles: tester.map_or(0, DeviceTester::read_cycles),
            write_cycles: tester.map_or(0, DeviceTester::write_cycles),
            tracked_files: tester.map_or(0, DeviceTester::tracked_files),
            valid_files: tester.map_or(0, DeviceTester::valid_files),
            current_file: tester.and_then(DeviceTester::current_file),
            restarts: self.restarts,
            restart_budget: self.restart_budget,
        }
    }
}

struct FleetInner {
    io: Arc<dyn DeviceIo>,
    slots: Mutex<BTreeMap<DeviceId, DeviceSlot>>,
    queue: StartQueue<FleetLauncher>,
    events: EventSender,
    broadcast: broadcast::Sender<DeviceEvent>,
    shutting_down: AtomicBool,
    runtime: Handle,
}

impl FleetInner {
    fn tester(&self, id: &DeviceId) -> Result<Option<Arc<DeviceTester>>, FleetError> {
        self.slots
            .lock()
            .get(id)
            .map(|slot| slot.tester.clone())
            .ok_or_else(|| FleetError::UnknownDevice { device: id.clone() })
    }

    fn arm(&self, slot: &mut DeviceSlot) -> Result<(), FleetError> {
        let tester = Arc::new(DeviceTester::new(
            slot.device.clone(),
            slot.settings.clone(),
            Arc::clone(&self.io),
            Some(self.events.clone()),
        ));
        tester.arm()?;
        slot.tester = Some(tester);
        Ok(())
    }

    fn launch(&self, id: &DeviceId) -> bool {
        let tester = self.slots.lock().get(id).and_then(|slot| slot.tester.clone());
        let Some(current) = tester else {
            return false;
        };
        if current.state() != RunState::Pending {
            return false;
        }
        match current.start() {
            Ok(()) => {
                tracing::info!(device = %id, "device launched");
                true
            }
            Err(err) => {
                tracing::warn!(device = %id, error = %err, "failed to launch device");
                false
            }
        }
    }

    /// Cold-restarts a device that went fatal, if its budget allows.
    fn recover(&self, id: &DeviceId) {
        if self.shutting_down.load(Ordering::Acquire) {
            tracing::info!(device = %id, "fleet stopping, skipping automatic restart");
            return;
        }

        let requeue = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id) else {
                return;
            };
            if slot.state() != RunState::Fatal || !slot.auto_restart {
                return;
            }
            if slot.restart_budget == 0 {
                tracing::warn!(device = %id, "restart budget exhausted, leaving device fatal");
                slot.settings.log.error(
                    std::time::SystemTime::now(),
                    "restart budget exhausted, device left in fatal state",
                );
                return;
            }
            slot.restart_budget -= 1;
            slot.restarts = slot.restarts.saturating_add(1);
            slot.settings.log.info(
                std::time::SystemTime::now(),
                &format!(
                    "automatic restart {} ({} remaining)",
                    slot.restarts, slot.restart_budget
                ),
            );
            match self.arm(slot) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(device = %id, error = %err, "failed to arm restart");
                    false
                }
            }
        };

        if requeue {
            tracing::info!(device = %id, "device queued for automatic restart");
            self.queue.enqueue(id.clone());
        }
    }

    fn schedule_recovery(self: &Arc<Self>, id: DeviceId) {
        let Ok(Some(tester)) = self.tester(&id) else {
            return;
        };
        let fleet = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let state = tester.wait().await;
            tracing::debug!(device = %id, %state, "fatal worker exited");
            if let Some(inner) = fleet.upgrade() {
                inner.recover(&id);
            }
        });
    }
}

async fn pump(fleet: Weak<FleetInner>, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = fleet.upgrade() else {
            break;
        };
        let fatal = event.notification == Notification::FatalErrorOccurred;
        let device = event.device.clone();
        // No subscribers is not an error.
        inner.broadcast.send(event).ok();
        if fatal {
            inner.schedule_recovery(device);
        }
    }
}

struct FleetLauncher {
    fleet: Weak<FleetInner>,
}

impl Launcher for FleetLauncher {
    fn launch(&self, device: &DeviceId) -> bool {
        self.fleet
            .upgrade()
            .is_some_and(|inner| inner.launch(device))
    }
}

/// Owns every device under test and routes operator commands.
#[derive(Clone)]
pub struct FleetSupervisor {
    inner: Arc<FleetInner>,
}

impl FleetSupervisor {
    /// Creates an empty fleet that staggers launches by `stagger`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::NoRuntime`] when called outside a Tokio
    /// runtime.
    pub fn new(io: Arc<dyn DeviceIo>, stagger: Duration) -> Result<Self, FleetError> {
        let runtime = Handle::try_current().map_err(|err| FleetError::NoRuntime {
            message: err.to_string(),
        })?;
        let (events, receiver) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<FleetInner>| FleetInner {
            io,
            slots: Mutex::new(BTreeMap::new()),
            queue: StartQueue::new(
                FleetLauncher {
                    fleet: weak.clone(),
                },
                stagger,
                runtime.clone(),
            ),
            events,
            broadcast,
            shutting_down: AtomicBool::new(false),
            runtime: runtime.clone(),
        });
        runtime.spawn(pump(Arc::downgrade(&inner), receiver));
        Ok(Self { inner })
    }

    /// Adds a device with its settings.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::DuplicateDevice`] when the identifier is taken.
    pub fn register(&self, device: Device, settings: TestSettings) -> Result<(), FleetError> {
        let mut slots = self.inner.slots.lock();
        if slots.contains_key(&device.id) {
            return Err(FleetError::DuplicateDevice { device: device.id });
        }
        tracing::debug!(device = %device.id, root = %device.root, "device registered");
        slots.insert(
            device.id.clone(),
            DeviceSlot {
                restart_budget: settings.recovery_attempts,
                device,
                settings,
                tester: None,
                restarts: 0,
                auto_restart: true,
            },
        );
        Ok(())
    }

    /// Replaces a device's settings while it is not running.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownDevice`] or, while the device is queued,
    /// running or paused, [`FleetError::DeviceBusy`].
    pub fn update_settings(&self, id: &DeviceId, settings: TestSettings) -> Result<(), FleetError> {
        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| FleetError::UnknownDevice { device: id.clone() })?;
        let state = slot.state();
        if state.is_active() {
            return Err(FleetError::DeviceBusy {
                device: id.clone(),
                state,
            });
        }
        slot.restart_budget = settings.recovery_attempts;
        slot.settings = settings;
        Ok(())
    }

    /// Starts a device: resumes it when paused or waiting to pause, otherwise
    /// queues a fresh run and re-arms its restart budget.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::AlreadyRunning`] or [`FleetError::AlreadyQueued`]
    /// for an active device, [`FleetError::DeviceBusy`] while a previous
    /// worker is still winding down, and [`FleetError::UnknownDevice`].
    pub fn request_start(&self, id: &DeviceId) -> Result<StartOutcome, FleetError> {
        {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| FleetError::UnknownDevice { device: id.clone() })?;
            if let Some(tester) = &slot.tester {
                match tester.state() {
                    RunState::Running if tester.pause_requested() => {
                        tester.resume()?;
                        return Ok(StartOutcome::Resumed);
                    }
                    RunState::Running => {
                        return Err(FleetError::AlreadyRunning { device: id.clone() });
                    }
                    RunState::Pending => {
                        return Err(FleetError::AlreadyQueued { device: id.clone() });
                    }
                    RunState::Paused => {
                        tester.resume()?;
                        return Ok(StartOutcome::Resumed);
                    }
                    state @ (RunState::Idle | RunState::Stopped | RunState::Fatal) => {
                        if !tester.is_finished() {
                            return Err(FleetError::DeviceBusy {
                                device: id.clone(),
                                state,
                            });
                        }
                    }
                }
            }
            slot.restart_budget = slot.settings.recovery_attempts;
            slot.restarts = 0;
            slot.auto_restart = true;
            self.inner.arm(slot)?;
        }

        self.inner.shutting_down.store(false, Ordering::Release);
        tracing::info!(device = %id, "device queued");
        self.inner.queue.enqueue(id.clone());
        Ok(StartOutcome::Queued)
    }

    /// Asks a running device to pause at its next cycle boundary.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownDevice`], [`FleetError::DeviceBusy`] if
    /// it was never started, or the tester's transition error.
    pub fn request_pause(&self, id: &DeviceId) -> Result<(), FleetError> {
        let tester = self.started(id)?;
        tester.pause()?;
        Ok(())
    }

    /// Resumes a paused device.
    ///
    /// # Errors
    ///
    /// As [`FleetSupervisor::request_pause`].
    pub fn request_resume(&self, id: &DeviceId) -> Result<(), FleetError> {
        let tester = self.started(id)?;
        tester.resume()?;
        Ok(())
    }

    /// Stops a device and cancels any automatic restart it had pending.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownDevice`] or the tester's stop error.
    pub async fn request_stop(&self, id: &DeviceId, mode: StopMode) -> Result<RunState, FleetError> {
        let tester = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| FleetError::UnknownDevice { device: id.clone() })?;
            slot.auto_restart = false;
            slot.tester.clone()
        };
        let Some(current) = tester else {
            return Ok(RunState::Idle);
        };
        Ok(current.stop(mode).await?)
    }

    /// Stops every device concurrently and suppresses automatic restarts
    /// until the next operator start.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Stop`] listing every device that failed to stop.
    pub async fn stop_all(&self, mode: StopMode) -> Result<(), FleetError> {
        self.inner.shutting_down.store(true, Ordering::Release);
        let testers: Vec<Arc<DeviceTester>> = self
            .inner
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.tester.clone())
            .collect();

        let stops: Vec<_> = testers
            .into_iter()
            .map(|tester| {
                self.inner.runtime.spawn(async move {
                    let id = tester.device().id.clone();
                    tester.stop(mode).await.map(|_| ()).map_err(|err| (id, err))
                })
            })
            .collect();

        let mut failures = Vec::new();
        for stop in stops {
            match stop.await {
                Ok(Ok(())) => {}
                Ok(Err((id, err))) => {
                    tracing::warn!(device = %id, error = %err, "device failed to stop");
                    failures.push(err);
                }
                Err(err) => failures.push(TesterError::Worker {
                    device: DeviceId::from("<unknown>"),
                    message: err.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Stop { failures })
        }
    }

    /// Snapshot of one device.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownDevice`].
    pub fn status(&self, id: &DeviceId) -> Result<DeviceStatus, FleetError> {
        self.inner
            .slots
            .lock()
            .get(id)
            .map(DeviceSlot::status)
            .ok_or_else(|| FleetError::UnknownDevice { device: id.clone() })
    }

    /// Snapshots of every device, ordered by identifier.
    #[must_use]
    pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.inner
            .slots
            .lock()
            .values()
            .map(DeviceSlot::status)
            .collect()
    }

    /// Subscribes to every device notification from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Devices waiting in the start queue, head first.
    #[must_use]
    pub fn queued(&self) -> Vec<DeviceId> {
        self.inner.queue.waiting()
    }

    /// Returns `true` while any device is queued, running or paused, or is
    /// fatal with an automatic restart still to come.
    #[must_use]
    pub fn any_running(&self) -> bool {
        let shutting_down = self.inner.shutting_down.load(Ordering::Acquire);
        self.inner.slots.lock().values().any(|slot| {
            let state = slot.state();
            state.is_active()
                || (state == RunState::Fatal
                    && slot.restart_budget > 0
                    && slot.auto_restart
                    && !shutting_down)
        })
    }

    /// Polls every `poll` until no device is running.
    pub async fn wait_until_idle(&self, poll: Duration) {
        while self.any_running() {
            sleep(poll).await;
        }
    }

    fn started(&self, id: &DeviceId) -> Result<Arc<DeviceTester>, FleetError> {
        self.inner
            .tester(id)?
            .ok_or_else(|| FleetError::DeviceBusy {
                device: id.clone(),
                state: RunState::Idle,
            })
    }
}

impl std::fmt::Debug for FleetSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetSupervisor")
            .field("devices", &self.inner.slots.lock().len())
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}
