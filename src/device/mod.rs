//! Removable volume handles and the I/O collaborator the test loop drives.
//!
//! The engine never touches the file system itself. Everything it needs from
//! a device (listing, byte comparison, bulk copy, formatting, readiness) goes
//! through [`DeviceIo`], which keeps the state machine testable against an
//! in-memory fake and lets the binary choose how a volume is formatted.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;

mod format;
mod fs;

pub use format::{
    CommandFormatter, CommandOutput, CommandRunner, FormatOptions, Formatter,
    ProcessCommandRunner, WipeFormatter,
};
pub use fs::FsDeviceIo;

/// Directories created by host operating systems that are never part of the
/// dataset and are ignored when listing or sanity-checking a device.
pub const IGNORED_DIRECTORIES: [&str; 2] = ["System Volume Information", "lost+found"];

/// Stable identifier for a device within a fleet.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle identifying a mounted removable volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    /// Fleet-unique label.
    pub id: DeviceId,
    /// Mount point of the volume.
    pub root: Utf8PathBuf,
    /// Block device node handed to the formatter, when known.
    pub node: Option<String>,
    /// Volume label applied when formatting.
    pub volume_label: Option<String>,
}

impl Device {
    /// Creates a device handle with no block node or volume label.
    #[must_use]
    pub fn new(id: impl Into<DeviceId>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            node: None,
            volume_label: None,
        }
    }

    /// Attaches the block device node used for formatting.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Sets the volume label applied on format.
    #[must_use]
    pub fn with_volume_label(mut self, label: impl Into<String>) -> Self {
        self.volume_label = Some(label.into());
        self
    }
}

/// Errors raised when parsing a `LABEL=ROOT[@NODE]` device specification.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DeviceParseError {
    /// The device string has no `=` separator.
    #[error("invalid device '{0}': expected LABEL=ROOT[@NODE]")]
    Malformed(String),
    /// The label part is empty.
    #[error("invalid device '{0}': label must not be empty")]
    EmptyLabel(String),
    /// The root part is empty.
    #[error("invalid device '{0}': mount root must not be empty")]
    EmptyRoot(String),
}

impl FromStr for Device {
    type Err = DeviceParseError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (raw_label, rest) = spec
            .split_once('=')
            .ok_or_else(|| DeviceParseError::Malformed(spec.to_owned()))?;
        let label = raw_label.trim();
        if label.is_empty() {
            return Err(DeviceParseError::EmptyLabel(spec.to_owned()));
        }

        let (raw_root, node) = match rest.rsplit_once('@') {
            Some((before, after)) if !after.trim().is_empty() => (before, Some(after.trim())),
            _ => (rest, None),
        };
        let root = raw_root.trim();
        if root.is_empty() {
            return Err(DeviceParseError::EmptyRoot(spec.to_owned()));
        }

        let mut device = Self::new(label, root).with_volume_label(label);
        device.node = node.map(str::to_owned);
        Ok(device)
    }
}

/// Errors raised by device collaborators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeviceError {
    /// The device is not mounted or not accessible.
    #[error("device {label} is not ready")]
    NotReady {
        /// Device label.
        label: String,
    },
    /// A file-system operation failed.
    #[error("I/O failure on {path}: {message}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Error text reported by the operating system.
        message: String,
    },
    /// A directory entry is not valid UTF-8.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
    /// The formatter reported failure.
    #[error("formatting {label} failed: {message}")]
    Format {
        /// Device label.
        label: String,
        /// Formatter diagnostic.
        message: String,
    },
    /// An external program could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Error text reported by the operating system.
        message: String,
    },
}

impl DeviceError {
    pub(crate) fn io(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Future returned by device operations.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeviceError>> + Send + 'a>>;

/// Device and file-system operations used by the test loop.
///
/// Paths returned by listing operations are relative to the listed root and
/// always use `/` as the separator.
pub trait DeviceIo: Send + Sync + fmt::Debug {
    /// Reports whether the device is mounted and accessible.
    fn is_ready<'a>(&'a self, device: &'a Device) -> IoFuture<'a, bool>;

    /// Lists regular files under `root` recursively, skipping
    /// [`IGNORED_DIRECTORIES`].
    fn list_files<'a>(&'a self, root: &'a Utf8Path) -> IoFuture<'a, Vec<String>>;

    /// Lists the names of directories directly under `root`, skipping
    /// [`IGNORED_DIRECTORIES`].
    fn root_directories<'a>(&'a self, root: &'a Utf8Path) -> IoFuture<'a, Vec<String>>;

    /// Returns `true` when both files hold identical bytes.
    fn compare<'a>(&'a self, left: &'a Utf8Path, right: &'a Utf8Path) -> IoFuture<'a, bool>;

    /// Mirrors the directory tree of `source` under `target`, then copies
    /// every file, overwriting existing ones. Returns the number of files
    /// copied.
    fn copy_tree<'a>(&'a self, source: &'a Utf8Path, target: &'a Utf8Path)
    -> IoFuture<'a, usize>;

    /// Formats the device.
    fn format<'a>(&'a self, device: &'a Device, quick: bool) -> IoFuture<'a, ()>;
}

#[cfg(test)]
mod tests;
