//! Behavioural coverage for staggered launches, recovery and shutdown.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use flashsoak::test_support::{RecordingLog, ScriptedIo};
use flashsoak::{Device, DeviceId, FleetSupervisor, StopMode, TestSettings};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tokio::runtime::{Builder, Runtime};

const SOURCE: &str = "/reference";
const STAGGER: Duration = Duration::from_secs(120);
const POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct FleetContext {
    runtime: Rc<Runtime>,
    io: Arc<ScriptedIo>,
    fleet: RefCell<Option<FleetSupervisor>>,
}

impl FleetContext {
    fn new() -> Self {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap_or_else(|err| panic!("build test runtime: {err}"));
        let io = ScriptedIo::new();
        for name in ["alpha.bin", "beta.bin", "nested/gamma.bin"] {
            io.put(SOURCE, name, name.as_bytes());
            for root in ["/media/a", "/media/b"] {
                io.put(root, name, name.as_bytes());
            }
        }
        Self {
            runtime: Rc::new(runtime),
            io: Arc::new(io),
            fleet: RefCell::new(None),
        }
    }

    fn build_fleet(&self, recovery_attempts: u32, clean_start: bool) {
        let _entered = self.runtime.enter();
        let fleet = FleetSupervisor::new(self.io.clone(), STAGGER)
            .unwrap_or_else(|err| panic!("create fleet: {err}"));
        for (label, root) in [("a", "/media/a"), ("b", "/media/b")] {
            let settings = TestSettings::new(SOURCE, Arc::new(RecordingLog::new()))
                .with_recovery_attempts(recovery_attempts)
                .with_clean_start(clean_start);
            fleet
                .register(Device::new(label, root), settings)
                .unwrap_or_else(|err| panic!("register {label}: {err}"));
        }
        self.fleet.replace(Some(fleet));
    }

    fn fleet(&self) -> FleetSupervisor {
        self.fleet
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("test setup requires a fleet"))
    }
}

#[fixture]
fn fleet_context() -> FleetContext {
    FleetContext::new()
}

#[given("a fleet of two healthy devices")]
fn healthy_fleet(fleet_context: &FleetContext) {
    fleet_context.build_fleet(4, false);
}

#[given("a fleet whose formats always fail with \"{attempts}\" recovery attempts")]
fn failing_fleet(fleet_context: &FleetContext, attempts: u32) {
    fleet_context.io.fail_next_formats(u32::MAX);
    fleet_context.build_fleet(attempts, true);
}

#[when("device \"{label}\" is started")]
fn start_device(fleet_context: &FleetContext, label: String) {
    let _entered = fleet_context.runtime.enter();
    fleet_context
        .fleet()
        .request_start(&DeviceId::from(label.trim()))
        .unwrap_or_else(|err| panic!("start {label}: {err}"));
}

#[when("one stagger interval passes")]
fn stagger_passes(fleet_context: &FleetContext) {
    fleet_context
        .runtime
        .block_on(async { tokio::time::sleep(STAGGER + Duration::from_secs(1)).await });
}

#[when("the fleet settles")]
fn fleet_settles(fleet_context: &FleetContext) {
    let fleet = fleet_context.fleet();
    fleet_context.runtime.block_on(fleet.wait_until_idle(POLL));
}

#[when("all devices are stopped")]
fn stop_everything(fleet_context: &FleetContext) {
    let fleet = fleet_context.fleet();
    fleet_context
        .runtime
        .block_on(fleet.stop_all(StopMode::Graceful))
        .unwrap_or_else(|err| panic!("stop all: {err}"));
}

#[then("device \"{label}\" is \"{state}\"")]
fn device_is_in_state(fleet_context: &FleetContext, label: String, state: String) {
    let status = fleet_context
        .fleet()
        .status(&DeviceId::from(label.trim()))
        .unwrap_or_else(|err| panic!("status {label}: {err}"));
    assert_eq!(status.state.label(), state.trim(), "device {label}");
}

#[then("device \"{label}\" has restarted \"{count}\" times")]
fn device_restart_count(fleet_context: &FleetContext, label: String, count: u32) {
    let status = fleet_context
        .fleet()
        .status(&DeviceId::from(label.trim()))
        .unwrap_or_else(|err| panic!("status {label}: {err}"));
    assert_eq!(status.restarts, count);
    assert_eq!(status.restart_budget, 0);
}

#[then("no device is running")]
fn nothing_running(fleet_context: &FleetContext) {
    assert!(!fleet_context.fleet().any_running());
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Devices launch one stagger interval apart"
)]
fn scenario_staggered_launch(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "A device that keeps failing exhausts its restart budget"
)]
fn scenario_restart_budget(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Stopping every device suppresses further work"
)]
fn scenario_stop_everything(fleet_context: FleetContext) {
    let _ = fleet_context;
}
