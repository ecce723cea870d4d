//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};

use crate::device::{Device, DeviceError, DeviceIo, IGNORED_DIRECTORIES, IoFuture};
use crate::log::EventLog;

/// Severity of a captured log record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    /// Recorded through [`EventLog::info`].
    Info,
    /// Recorded through [`EventLog::error`].
    Error,
    /// Recorded through [`EventLog::exception`].
    Exception,
}

/// A single captured log record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Exception detail, if any.
    pub detail: Option<String>,
}

/// [`EventLog`] that keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingLog {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all records so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Counts records at `level` whose message contains `needle`.
    #[must_use]
    pub fn count(&self, level: LogLevel, needle: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.level == level && record.message.contains(needle))
            .count()
    }

    /// Returns `true` when any message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| record.message.contains(needle))
    }

    fn push(&self, level: LogLevel, message: &str, detail: Option<&str>) {
        self.records.lock().push(LogRecord {
            level,
            message: message.to_owned(),
            detail: detail.map(str::to_owned),
        });
    }
}

impl EventLog for RecordingLog {
    fn info(&self, _timestamp: SystemTime, message: &str) {
        self.push(LogLevel::Info, message, None);
    }

    fn error(&self, _timestamp: SystemTime, message: &str) {
        self.push(LogLevel::Error, message, None);
    }

    fn exception(&self, _timestamp: SystemTime, message: &str, detail: &str) {
        self.push(LogLevel::Exception, message, Some(detail));
    }
}

/// Counts of operations performed through a [`ScriptedIo`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IoCalls {
    /// `list_files` calls.
    pub listings: usize,
    /// `compare` calls.
    pub compares: usize,
    /// `copy_tree` calls.
    pub copies: usize,
    /// `format` calls.
    pub formats: usize,
}

#[derive(Debug, Default)]
struct Volume {
    files: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
}

#[derive(Debug)]
struct Faults {
    ready: bool,
    listing_failures: BTreeMap<Utf8PathBuf, u32>,
    compare_failures: BTreeSet<String>,
    hang_compares: bool,
    format_failures: u32,
    held_format: Option<usize>,
    noop_formats: bool,
    copy_failures: u32,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            ready: true,
            listing_failures: BTreeMap::new(),
            compare_failures: BTreeSet::new(),
            hang_compares: false,
            format_failures: 0,
            held_format: None,
            noop_formats: false,
            copy_failures: 0,
        }
    }
}

/// In-memory [`DeviceIo`] with fault injection.
///
/// Each mounted root holds a flat map of `/`-separated relative paths to
/// file contents. Paths handed to `compare` are resolved against the
/// longest matching mounted root.
#[derive(Debug, Default)]
pub struct ScriptedIo {
    volumes: Mutex<BTreeMap<Utf8PathBuf, Volume>>,
    faults: Mutex<Faults>,
    listings: AtomicUsize,
    compares: AtomicUsize,
    copies: AtomicUsize,
    formats: AtomicUsize,
    format_gate: Notify,
}

impl ScriptedIo {
    /// Creates an implementation with nothing mounted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts an empty volume at `root` if none is mounted.
    pub fn mount(&self, root: impl Into<Utf8PathBuf>) {
        self.volumes.lock().entry(root.into()).or_default();
    }

    /// Writes `contents` at `relative` under `root`, mounting it if needed.
    pub fn put(&self, root: impl Into<Utf8PathBuf>, relative: &str, contents: &[u8]) {
        self.volumes
            .lock()
            .entry(root.into())
            .or_default()
            .files
            .insert(relative.to_owned(), contents.to_vec());
    }

    /// Deletes `relative` under `root`.
    pub fn remove(&self, root: &str, relative: &str) {
        if let Some(volume) = self.volumes.lock().get_mut(Utf8Path::new(root)) {
            volume.files.remove(relative);
        }
    }

    /// Flips the first byte of `relative` under `root` (or appends one to an
    /// empty file).
    pub fn corrupt(&self, root: &str, relative: &str) {
        if let Some(bytes) = self
            .volumes
            .lock()
            .get_mut(Utf8Path::new(root))
            .and_then(|volume| volume.files.get_mut(relative))
        {
            match bytes.first_mut() {
                Some(first) => *first ^= 0xFF,
                None => bytes.push(0),
            }
        }
    }

    /// Adds an empty directory directly under `root`.
    pub fn add_directory(&self, root: impl Into<Utf8PathBuf>, name: &str) {
        self.volumes
            .lock()
            .entry(root.into())
            .or_default()
            .directories
            .insert(name.to_owned());
    }

    /// Returns the sorted file list under `root`.
    #[must_use]
    pub fn files(&self, root: &str) -> Vec<String> {
        self.volumes
            .lock()
            .get(Utf8Path::new(root))
            .map(|volume| volume.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sets the readiness reported for every device.
    pub fn set_ready(&self, ready: bool) {
        self.faults.lock().ready = ready;
    }

    /// Makes the next `times` listings of `root` fail.
    pub fn fail_listing(&self, root: impl Into<Utf8PathBuf>, times: u32) {
        self.faults.lock().listing_failures.insert(root.into(), times);
    }

    /// Makes every comparison involving `relative` raise an I/O error.
    pub fn fail_compare(&self, relative: &str) {
        self.faults
            .lock()
            .compare_failures
            .insert(relative.to_owned());
    }

    /// Makes comparisons never complete.
    pub fn hang_compares(&self, hang: bool) {
        self.faults.lock().hang_compares = hang;
    }

    /// Makes the next `times` formats fail.
    pub fn fail_next_formats(&self, times: u32) {
        self.faults.lock().format_failures = times;
    }

    /// Blocks the `number`th format call (counting from one) until
    /// [`ScriptedIo::release_format`] is called. The call still counts
    /// towards [`IoCalls::formats`] while it waits.
    pub fn hold_format(&self, number: usize) {
        self.faults.lock().held_format = Some(number);
    }

    /// Lets a held format continue.
    pub fn release_format(&self) {
        self.format_gate.notify_one();
    }

    /// Makes formats report success without touching the volume.
    pub fn noop_formats(&self, noop: bool) {
        self.faults.lock().noop_formats = noop;
    }

    /// Makes the next `times` tree copies fail.
    pub fn fail_next_copies(&self, times: u32) {
        self.faults.lock().copy_failures = times;
    }

    /// Returns operation counts so far.
    #[must_use]
    pub fn calls(&self) -> IoCalls {
        IoCalls {
            listings: self.listings.load(Ordering::Acquire),
            compares: self.compares.load(Ordering::Acquire),
            copies: self.copies.load(Ordering::Acquire),
            formats: self.formats.load(Ordering::Acquire),
        }
    }

    fn missing(path: &Utf8Path) -> DeviceError {
        DeviceError::Io {
            path: path.to_string(),
            message: String::from("no such file or directory"),
        }
    }

    fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, DeviceError> {
        let volumes = self.volumes.lock();
        volumes
            .iter()
            .filter_map(|(root, volume)| {
                path.strip_prefix(root)
                    .ok()
                    .map(|relative| (root.as_str().len(), volume, relative))
            })
            .max_by_key(|(depth, _, _)| *depth)
            .and_then(|(_, volume, relative)| volume.files.get(relative.as_str()).cloned())
            .ok_or_else(|| Self::missing(path))
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }
}

impl DeviceIo for ScriptedIo {
    fn is_ready<'a>(&'a self, _device: &'a Device) -> IoFuture<'a, bool> {
        let ready = self.faults.lock().ready;
        Box::pin(async move { Ok(ready) })
    }

    fn list_files<'a>(&'a self, root: &'a Utf8Path) -> IoFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.listings.fetch_add(1, Ordering::AcqRel);
            let failed = self
                .faults
                .lock()
                .listing_failures
                .get_mut(root)
                .is_some_and(Self::take_fault);
            if failed {
                return Err(DeviceError::Io {
                    path: root.to_string(),
                    message: String::from("scripted listing failure"),
                });
            }
            self.volumes
                .lock()
                .get(root)
                .map(|volume| volume.files.keys().cloned().collect())
                .ok_or_else(|| Self::missing(root))
        })
    }

    fn root_directories<'a>(&'a self, root: &'a Utf8Path) -> IoFuture<'a, Vec<String>> {
        Box::pin(async move {
            let volumes = self.volumes.lock();
            let volume = volumes.get(root).ok_or_else(|| Self::missing(root))?;
            let mut names: BTreeSet<String> = volume.directories.clone();
            names.extend(
                volume
                    .files
                    .keys()
                    .filter_map(|path| path.split_once('/').map(|(top, _)| top.to_owned())),
            );
            Ok(names
                .into_iter()
                .filter(|name| !IGNORED_DIRECTORIES.contains(&name.as_str()))
                .collect())
        })
    }

    fn compare<'a>(&'a self, left: &'a Utf8Path, right: &'a Utf8Path) -> IoFuture<'a, bool> {
        Box::pin(async move {
            self.compares.fetch_add(1, Ordering::AcqRel);
            let (hang, failing) = {
                let faults = self.faults.lock();
                let failing = faults
                    .compare_failures
                    .iter()
                    .any(|relative| right.ends_with(relative) || left.ends_with(relative));
                (faults.hang_compares, failing)
            };
            if hang {
                std::future::pending::<()>().await;
            }
            if failing {
                return Err(DeviceError::Io {
                    path: right.to_string(),
                    message: String::from("scripted read failure"),
                });
            }
            Ok(self.read(left)? == self.read(right)?)
        })
    }

    fn copy_tree<'a>(
        &'a self,
        source: &'a Utf8Path,
        target: &'a Utf8Path,
    ) -> IoFuture<'a, usize> {
        Box::pin(async move {
            self.copies.fetch_add(1, Ordering::AcqRel);
            if Self::take_fault(&mut self.faults.lock().copy_failures) {
                return Err(DeviceError::Io {
                    path: target.to_string(),
                    message: String::from("scripted write failure"),
                });
            }
            let mut volumes = self.volumes.lock();
            let (files, directories) = volumes
                .get(source)
                .map(|volume| (volume.files.clone(), volume.directories.clone()))
                .ok_or_else(|| Self::missing(source))?;
            let copied = files.len();
            let destination = volumes.entry(target.to_path_buf()).or_default();
            destination.files.extend(files);
            destination.directories.extend(directories);
            Ok(copied)
        })
    }

    fn format<'a>(&'a self, device: &'a Device, _quick: bool) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let number = self.formats.fetch_add(1, Ordering::AcqRel).saturating_add(1);
            let held = self.faults.lock().held_format == Some(number);
            if held {
                self.format_gate.notified().await;
            }
            let noop = {
                let mut faults = self.faults.lock();
                if Self::take_fault(&mut faults.format_failures) {
                    return Err(DeviceError::Format {
                        label: device.id.to_string(),
                        message: String::from("scripted format failure"),
                    });
                }
                faults.noop_formats
            };
            if !noop {
                let mut volumes = self.volumes.lock();
                let volume = volumes.entry(device.root.clone()).or_default();
                volume.files.clear();
                volume
                    .directories
                    .retain(|name| IGNORED_DIRECTORIES.contains(&name.as_str()));
            }
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
