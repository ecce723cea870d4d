//! Configuration loading via `ortho-config`.
//!
//! [`SoakConfig`] merges defaults, `flashsoak.toml` and `FLASHSOAK_*`
//! environment variables. The binary applies its own flags on top and then
//! turns the result into per-device [`TestSettings`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::device::Device;
use crate::log::EventLog;
use crate::settings::{RetryPolicy, TestSettings};

/// Soak-test settings shared by every device in a run.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLASHSOAK",
    discovery(
        app_name = "flashsoak",
        env_var = "FLASHSOAK_CONFIG_PATH",
        config_file_name = "flashsoak.toml",
        dotfile_name = ".flashsoak.toml",
        project_file_name = "flashsoak.toml"
    )
)]
pub struct SoakConfig {
    /// Reference dataset copied onto every device. Required, either here or
    /// through `--source`.
    pub source_dir: Option<String>,
    /// Seconds between forced format-and-rewrite cycles. Defaults to three
    /// hours.
    #[ortho_config(default = 10_800)]
    pub rewrite_period_secs: u64,
    /// Automatic restarts allowed after a device goes fatal.
    #[ortho_config(default = 4)]
    pub recovery_attempts: u32,
    /// Format and rewrite before the first verify pass.
    #[ortho_config(default = false)]
    pub clean_start: bool,
    /// Seconds between staggered device launches.
    #[ortho_config(default = 1_800)]
    pub stagger_interval_secs: u64,
    /// Milliseconds between checks while a device is paused.
    #[ortho_config(default = 1_000)]
    pub pause_poll_ms: u64,
    /// Milliseconds of pacing between verify cycles.
    #[ortho_config(default = 10)]
    pub cycle_delay_ms: u64,
    /// Seconds a stop request waits for a worker before giving up.
    #[ortho_config(default = 30)]
    pub stop_timeout_secs: u64,
    /// Maximum attempts per rewrite. Unset retries until success or stop.
    pub rewrite_retry_limit: Option<u32>,
    /// Milliseconds to wait after a failed rewrite attempt.
    #[ortho_config(default = 0)]
    pub rewrite_retry_backoff_ms: u64,
    /// Formatting strategy: `command` runs `format_bin`, `wipe` empties the
    /// mount root.
    #[ortho_config(default = "command".to_owned())]
    pub formatter: String,
    /// Formatter executable used by the `command` strategy. It receives the
    /// block node as its last argument while the mount root is still in use,
    /// so on rigs that keep the volume mounted point this at a wrapper that
    /// unmounts, formats and remounts the node.
    #[ortho_config(default = "mkfs.vfat".to_owned())]
    pub format_bin: String,
    /// Request quick formats instead of full surface checks.
    #[ortho_config(default = true)]
    pub quick_format: bool,
}

/// How devices are formatted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormatterKind {
    /// Run an external `mkfs`-style program against the block node.
    Command,
    /// Delete everything under the mount root.
    Wipe,
}

impl FromStr for FormatterKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "command" => Ok(Self::Command),
            "wipe" => Ok(Self::Wipe),
            other => Err(ConfigError::Invalid(format!(
                "unknown formatter '{other}': expected 'command' or 'wipe' \
                 (FLASHSOAK_FORMATTER or formatter in flashsoak.toml)"
            ))),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set {} or add {} to flashsoak.toml",
            self.env_var, self.toml_key
        )
    }
}

impl SoakConfig {
    fn require_text(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.is_none_or(|text| text.trim().is_empty()) {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("flashsoak")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for absent required values and
    /// [`ConfigError::Invalid`] for out-of-range ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_text(
            self.source_dir.as_deref(),
            &FieldMetadata::new(
                "reference dataset directory",
                "FLASHSOAK_SOURCE_DIR",
                "source_dir",
            ),
        )?;
        Self::require_positive(
            self.rewrite_period_secs,
            &FieldMetadata::new(
                "rewrite period",
                "FLASHSOAK_REWRITE_PERIOD_SECS",
                "rewrite_period_secs",
            ),
        )?;
        Self::require_positive(
            self.pause_poll_ms,
            &FieldMetadata::new("pause poll interval", "FLASHSOAK_PAUSE_POLL_MS", "pause_poll_ms"),
        )?;
        Self::require_positive(
            self.stop_timeout_secs,
            &FieldMetadata::new(
                "stop timeout",
                "FLASHSOAK_STOP_TIMEOUT_SECS",
                "stop_timeout_secs",
            ),
        )?;
        if self.formatter_kind()? == FormatterKind::Command {
            Self::require_text(
                Some(&self.format_bin),
                &FieldMetadata::new("formatter program", "FLASHSOAK_FORMAT_BIN", "format_bin"),
            )?;
        }
        Ok(())
    }

    /// Checks that every device carries what the formatting strategy needs.
    /// The `command` strategy formats the block node, so each device must be
    /// given as `LABEL=ROOT@NODE`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first device without a
    /// node, or the strategy parse error.
    pub fn check_devices(&self, devices: &[Device]) -> Result<(), ConfigError> {
        if self.formatter_kind()? != FormatterKind::Command {
            return Ok(());
        }
        match devices.iter().find(|device| device.node.is_none()) {
            Some(device) => Err(ConfigError::Invalid(format!(
                "device {id} has no block device node for the command formatter; \
                 pass --device {id}={root}@NODE or set FLASHSOAK_FORMATTER=wipe \
                 (formatter = \"wipe\" in flashsoak.toml)",
                id = device.id,
                root = device.root,
            ))),
            None => Ok(()),
        }
    }

    /// Parsed formatting strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown strategy name.
    pub fn formatter_kind(&self) -> Result<FormatterKind, ConfigError> {
        self.formatter.parse()
    }

    /// Interval between staggered launches.
    #[must_use]
    pub const fn stagger_interval(&self) -> Duration {
        Duration::from_secs(self.stagger_interval_secs)
    }

    /// Retry policy applied to rewrites and manifest rebuilds.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            limit: self.rewrite_retry_limit,
            backoff: Duration::from_millis(self.rewrite_retry_backoff_ms),
        }
    }

    /// Builds per-device settings logging to `log`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn settings_for(&self, log: Arc<dyn EventLog>) -> Result<TestSettings, ConfigError> {
        self.validate()?;
        let source = self.source_dir.as_deref().unwrap_or_default().trim();
        Ok(TestSettings::new(Utf8PathBuf::from(source), log)
            .with_rewrite_period(Duration::from_secs(self.rewrite_period_secs))
            .with_recovery_attempts(self.recovery_attempts)
            .with_clean_start(self.clean_start)
            .with_quick_format(self.quick_format)
            .with_retry(self.retry_policy())
            .with_pause_poll(Duration::from_millis(self.pause_poll_ms))
            .with_cycle_delay(Duration::from_millis(self.cycle_delay_ms))
            .with_stop_timeout(Duration::from_secs(self.stop_timeout_secs)))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A configuration value is out of range or unrecognised.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
