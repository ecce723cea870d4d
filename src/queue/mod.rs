//! Staggered launch of device test loops.
//!
//! Formatting and bulk-writing a device saturates the host's I/O, so the
//! fleet launches devices one at a time. The first entry enqueued while the
//! queue is idle launches immediately and arms a timer; every tick after that
//! launches at most one more entry. A tick that finds nothing queued disarms
//! the timer, so the next enqueue launches straight away.
//!
//! The timer only disarms on a tick, never on the launch that empties the
//! queue. After the last queued launch it stays armed for one more interval,
//! and an entry enqueued during that interval waits for the tick instead of
//! launching at once. Two launches are therefore always at least one
//! interval apart, even when the second device is queued late.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::sleep;

use crate::device::DeviceId;

/// Launches a queued device when its turn comes.
pub trait Launcher: Send + Sync + 'static {
    /// Starts `device`. Returns `false` when the device is no longer
    /// waiting (for example it was stopped while queued), in which case the
    /// queue moves on to the next entry within the same tick.
    fn launch(&self, device: &DeviceId) -> bool;
}

impl<L: Launcher> Launcher for Arc<L> {
    fn launch(&self, device: &DeviceId) -> bool {
        self.as_ref().launch(device)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<DeviceId>,
    timer_active: bool,
}

struct QueueInner<L> {
    launcher: L,
    interval: Duration,
    state: Mutex<QueueState>,
}

impl<L: Launcher> QueueInner<L> {
    /// Pops entries until one launches or the queue is empty. The lock is
    /// released before calling the launcher.
    fn launch_next(&self) {
        loop {
            let Some(next) = self.state.lock().entries.pop_front() else {
                return;
            };
            if self.launcher.launch(&next) {
                tracing::debug!(device = %next, "launched queued device");
                return;
            }
            tracing::debug!(device = %next, "skipped stale start queue entry");
        }
    }

    /// Handles one timer tick. Returns `false` once the timer disarms.
    fn tick(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.entries.is_empty() {
                state.timer_active = false;
                return false;
            }
        }
        self.launch_next();
        true
    }
}

async fn run_timer<L: Launcher>(inner: Arc<QueueInner<L>>) {
    loop {
        sleep(inner.interval).await;
        if !inner.tick() {
            break;
        }
    }
}

/// FIFO of devices waiting for their launch slot.
///
/// The timer remains armed for one interval after the queue empties; see
/// the module docs.
pub struct StartQueue<L: Launcher> {
    inner: Arc<QueueInner<L>>,
    runtime: Handle,
}

impl<L: Launcher> StartQueue<L> {
    /// Creates an idle queue that launches through `launcher` every
    /// `interval`, spawning its timer on `runtime`.
    #[must_use]
    pub fn new(launcher: L, interval: Duration, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                launcher,
                interval,
                state: Mutex::new(QueueState::default()),
            }),
            runtime,
        }
    }

    /// Time between launches.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Appends `device`. Launches it at once when no timer is running.
    pub fn enqueue(&self, device: DeviceId) {
        let launch_now = {
            let mut state = self.inner.state.lock();
            state.entries.push_back(device);
            !std::mem::replace(&mut state.timer_active, true)
        };
        if launch_now {
            self.inner.launch_next();
            self.runtime.spawn(run_timer(Arc::clone(&self.inner)));
        }
    }

    /// Snapshot of the devices still waiting, head first.
    #[must_use]
    pub fn waiting(&self) -> Vec<DeviceId> {
        self.inner.state.lock().entries.iter().cloned().collect()
    }

    /// Returns `true` while a launch timer is armed.
    #[must_use]
    pub fn timer_active(&self) -> bool {
        self.inner.state.lock().timer_active
    }
}

impl<L: Launcher> std::fmt::Debug for StartQueue<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StartQueue")
            .field("interval", &self.inner.interval)
            .field("entries", &state.entries)
            .field("timer_active", &state.timer_active)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
