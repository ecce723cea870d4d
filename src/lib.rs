//! Core library for the Flashsoak removable-drive soak tester.
//!
//! Each device under test runs an independent loop that formats it, copies
//! a reference dataset onto it and then verifies every file over and over,
//! rewriting the whole dataset on a fixed period. A [`FleetSupervisor`]
//! staggers launches through a [`StartQueue`], routes operator commands and
//! restarts devices that hit the fatal error threshold while their restart
//! budget lasts.

pub mod config;
pub mod device;
pub mod events;
pub mod fleet;
pub mod log;
pub mod manifest;
pub mod queue;
pub mod settings;
pub mod state;
pub mod test_support;
pub mod tester;

pub use config::{ConfigError, FormatterKind, SoakConfig};
pub use device::{
    CommandFormatter, CommandOutput, CommandRunner, Device, DeviceError, DeviceId, DeviceIo,
    DeviceParseError, FormatOptions, Formatter, FsDeviceIo, ProcessCommandRunner, WipeFormatter,
};
pub use events::{DeviceEvent, HealthStatus, Notification};
pub use fleet::{DeviceStatus, FleetError, FleetSupervisor, StartOutcome};
pub use log::{EventLog, TracingLog};
pub use manifest::{Manifest, ManifestError};
pub use queue::{Launcher, StartQueue};
pub use settings::{RetryPolicy, TestSettings};
pub use state::{ERROR_THRESHOLD, Phase, RunState};
pub use tester::{DeviceTester, StopMode, TesterError};
