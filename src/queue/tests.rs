//! Timer-driven tests for the start queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep};

use super::*;

const INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<(DeviceId, Instant)>>,
    stale: Mutex<HashSet<DeviceId>>,
}

impl RecordingLauncher {
    fn launched(&self) -> Vec<String> {
        self.launched
            .lock()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect()
    }

    fn mark_stale(&self, id: &str) {
        self.stale.lock().insert(DeviceId::from(id));
    }
}

impl Launcher for RecordingLauncher {
    fn launch(&self, device: &DeviceId) -> bool {
        if self.stale.lock().contains(device) {
            return false;
        }
        self.launched.lock().push((device.clone(), Instant::now()));
        true
    }
}

#[fixture]
fn launcher() -> Arc<RecordingLauncher> {
    Arc::new(RecordingLauncher::default())
}

fn queue(launcher: &Arc<RecordingLauncher>) -> StartQueue<Arc<RecordingLauncher>> {
    StartQueue::new(Arc::clone(launcher), INTERVAL, Handle::current())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn launches_one_device_per_tick(launcher: Arc<RecordingLauncher>) {
    let start = Instant::now();
    let queue = queue(&launcher);
    for id in ["a", "b", "c"] {
        queue.enqueue(DeviceId::from(id));
    }

    assert_eq!(launcher.launched(), vec!["a"]);

    sleep(INTERVAL / 2).await;
    assert_eq!(launcher.launched(), vec!["a"]);

    sleep(INTERVAL).await;
    assert_eq!(launcher.launched(), vec!["a", "b"]);

    sleep(INTERVAL).await;
    assert_eq!(launcher.launched(), vec!["a", "b", "c"]);

    let offsets: Vec<Duration> = launcher
        .launched
        .lock()
        .iter()
        .map(|(_, at)| at.duration_since(start))
        .collect();
    assert_eq!(offsets, vec![Duration::ZERO, INTERVAL, INTERVAL * 2]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stale_entries_are_skipped_within_the_same_tick(launcher: Arc<RecordingLauncher>) {
    launcher.mark_stale("b");
    let queue = queue(&launcher);
    for id in ["a", "b", "c"] {
        queue.enqueue(DeviceId::from(id));
    }

    sleep(INTERVAL + INTERVAL / 2).await;

    assert_eq!(launcher.launched(), vec!["a", "c"]);
    assert!(queue.waiting().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn entries_added_while_armed_wait_for_the_next_tick(launcher: Arc<RecordingLauncher>) {
    let queue = queue(&launcher);
    queue.enqueue(DeviceId::from("a"));
    sleep(INTERVAL / 4).await;

    queue.enqueue(DeviceId::from("b"));
    assert_eq!(launcher.launched(), vec!["a"]);
    assert_eq!(queue.waiting(), vec![DeviceId::from("b")]);

    sleep(INTERVAL).await;
    assert_eq!(launcher.launched(), vec!["a", "b"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn timer_disarms_once_the_queue_drains(launcher: Arc<RecordingLauncher>) {
    let queue = queue(&launcher);
    queue.enqueue(DeviceId::from("a"));
    assert!(queue.timer_active());

    sleep(INTERVAL * 2 + INTERVAL / 2).await;
    assert!(!queue.timer_active());

    queue.enqueue(DeviceId::from("b"));
    assert_eq!(launcher.launched(), vec!["a", "b"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn timer_stays_armed_for_one_interval_after_the_last_launch(
    launcher: Arc<RecordingLauncher>,
) {
    let start = Instant::now();
    let queue = queue(&launcher);
    queue.enqueue(DeviceId::from("a"));
    sleep(INTERVAL / 2).await;

    assert!(queue.waiting().is_empty());
    assert!(queue.timer_active());
    queue.enqueue(DeviceId::from("b"));
    assert_eq!(launcher.launched(), vec!["a"]);

    sleep(INTERVAL / 2 + Duration::from_secs(1)).await;
    assert_eq!(launcher.launched(), vec!["a", "b"]);
    let second = launcher
        .launched
        .lock()
        .last()
        .map(|(_, at)| at.duration_since(start));
    assert_eq!(second, Some(INTERVAL));

    sleep(INTERVAL).await;
    assert!(!queue.timer_active());
}
