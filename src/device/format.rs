//! Formatting strategies and the command runner abstraction behind them.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::process::Command;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

use super::{Device, DeviceError, IGNORED_DIRECTORIES};

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeviceError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeviceError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| DeviceError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Options passed to a formatter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormatOptions {
    /// Volume label to apply, if any.
    pub volume_label: Option<String>,
    /// Quick format (no surface scan).
    pub quick: bool,
}

impl FormatOptions {
    /// Builds options for `device`.
    #[must_use]
    pub fn for_device(device: &Device, quick: bool) -> Self {
        Self {
            volume_label: device.volume_label.clone(),
            quick,
        }
    }
}

/// Blocking format operation. Runs on the blocking thread pool.
pub trait Formatter: Send + Sync + fmt::Debug + 'static {
    /// Formats `device`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Format`] when the device could not be
    /// formatted, or [`DeviceError::Spawn`] when a helper program could not
    /// be started.
    fn format(&self, device: &Device, options: &FormatOptions) -> Result<(), DeviceError>;
}

/// Formats block devices through an external `mkfs`-style program.
///
/// The program receives `-n LABEL` when a volume label is set, `-c` for a
/// full format with bad-block checking, and finally the device node. Devices
/// without a node are refused up front by
/// [`SoakConfig::check_devices`](crate::SoakConfig::check_devices).
///
/// The node is formatted in place. Most `mkfs` tools refuse a mounted node,
/// and afterwards the dataset is copied to the mount root, so rigs that keep
/// volumes mounted should configure a wrapper program that unmounts, formats
/// and remounts the node.
#[derive(Clone, Debug)]
pub struct CommandFormatter<R: CommandRunner> {
    program: String,
    runner: R,
}

impl CommandFormatter<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(program: impl Into<String>) -> Self {
        Self::new(program, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> CommandFormatter<R> {
    /// Creates a formatter invoking `program` through `runner`.
    #[must_use]
    pub fn new(program: impl Into<String>, runner: R) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    /// Builds the argument vector for `node`.
    #[must_use]
    pub fn build_args(node: &str, options: &FormatOptions) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(label) = &options.volume_label {
            args.push(OsString::from("-n"));
            args.push(OsString::from(label));
        }
        if !options.quick {
            args.push(OsString::from("-c"));
        }
        args.push(OsString::from(node));
        args
    }

    fn render_command(&self, args: &[OsString]) -> String {
        let mut parts = vec![shell_escape::escape(self.program.as_str().into()).into_owned()];
        parts.extend(
            args.iter()
                .map(|arg| shell_escape::escape(arg.to_string_lossy()).into_owned()),
        );
        parts.join(" ")
    }
}

impl<R: CommandRunner + 'static> Formatter for CommandFormatter<R> {
    fn format(&self, device: &Device, options: &FormatOptions) -> Result<(), DeviceError> {
        let node = device.node.as_deref().ok_or_else(|| DeviceError::Format {
            label: device.id.to_string(),
            message: String::from("no block device node configured"),
        })?;

        let args = Self::build_args(node, options);
        tracing::debug!(device = %device.id, command = %self.render_command(&args), "formatting");
        let output = self.runner.run(&self.program, &args)?;
        if output.is_success() {
            return Ok(());
        }

        let status = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(DeviceError::Format {
            label: device.id.to_string(),
            message: format!("{} exited with {status}: {}", self.program, output.stderr.trim()),
        })
    }
}

/// Empties the mount root instead of formatting a block device.
///
/// Used for directory-backed rigs where no block node is available.
#[derive(Clone, Copy, Debug, Default)]
pub struct WipeFormatter;

impl Formatter for WipeFormatter {
    fn format(&self, device: &Device, _options: &FormatOptions) -> Result<(), DeviceError> {
        wipe_root(&device.root).map_err(|err| DeviceError::Format {
            label: device.id.to_string(),
            message: err.to_string(),
        })
    }
}

fn wipe_root(root: &Utf8Path) -> io::Result<()> {
    let dir = Dir::open_ambient_dir(root, ambient_authority())?;
    for entry in dir.entries()? {
        let item = entry?;
        let name = item.file_name()?;
        if IGNORED_DIRECTORIES.contains(&name.as_str()) {
            continue;
        }
        if item.file_type()?.is_dir() {
            dir.remove_dir_all(&name)?;
        } else {
            dir.remove_file(&name)?;
        }
    }
    Ok(())
}
