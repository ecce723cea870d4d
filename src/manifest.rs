//! Files expected on a device and whether each is still believed intact.

use std::collections::HashMap;

use camino::Utf8Path;
use thiserror::Error;

use crate::device::{DeviceError, DeviceIo};

/// Errors raised while rebuilding a manifest.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ManifestError {
    /// The reference dataset could not be listed.
    #[error("source directory {path} is unavailable: {source}")]
    SourceUnavailable {
        /// Directory that failed to list.
        path: String,
        /// Underlying collaborator failure.
        source: DeviceError,
    },
}

/// Map from source-relative path to its validity flag.
///
/// Owned by a single device worker and never shared across devices.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Manifest {
    entries: HashMap<String, bool>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the manifest and repopulates it with every regular file under
    /// `source`, all marked valid. Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::SourceUnavailable`] when `source` cannot be
    /// listed; the manifest is left empty in that case.
    pub async fn rebuild(
        &mut self,
        io: &dyn DeviceIo,
        source: &Utf8Path,
    ) -> Result<usize, ManifestError> {
        self.entries.clear();
        let files = io
            .list_files(source)
            .await
            .map_err(|err| ManifestError::SourceUnavailable {
                path: source.to_string(),
                source: err,
            })?;
        self.entries
            .extend(files.into_iter().map(|path| (path, true)));
        Ok(self.entries.len())
    }

    /// Marks `path` invalid. Unknown paths are ignored.
    pub fn mark_invalid(&mut self, path: &str) {
        if let Some(flag) = self.entries.get_mut(path) {
            *flag = false;
        }
    }

    /// Returns the flag for `path`, or `None` if it is not tracked.
    #[must_use]
    pub fn is_valid(&self, path: &str) -> Option<bool> {
        self.entries.get(path).copied()
    }

    /// Snapshot of the paths still marked valid, sorted for stable
    /// iteration. Later changes to the manifest do not affect it.
    #[must_use]
    pub fn valid_entries(&self) -> Vec<String> {
        let mut valid: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, valid)| **valid)
            .map(|(path, _)| path.clone())
            .collect();
        valid.sort();
        valid
    }

    /// Number of entries still marked valid.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.entries.values().filter(|valid| **valid).count()
    }

    /// Total number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over every entry and its flag in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries
            .iter()
            .map(|(path, valid)| (path.as_str(), *valid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedIo;
    use rstest::rstest;

    fn source_io() -> ScriptedIo {
        let io = ScriptedIo::new();
        io.put("/src", "a.bin", b"a");
        io.put("/src", "dir/b.bin", b"b");
        io.put("/src", "dir/c.bin", b"c");
        io
    }

    #[rstest]
    #[tokio::test]
    async fn rebuild_tracks_every_source_file_as_valid() {
        let io = source_io();
        let mut manifest = Manifest::new();

        let count = manifest
            .rebuild(&io, Utf8Path::new("/src"))
            .await
            .expect("rebuild");

        assert_eq!(count, 3);
        assert_eq!(manifest.valid_entries(), vec!["a.bin", "dir/b.bin", "dir/c.bin"]);
    }

    #[rstest]
    #[tokio::test]
    async fn rebuild_discards_previous_flags() {
        let io = source_io();
        let mut manifest = Manifest::new();
        manifest
            .rebuild(&io, Utf8Path::new("/src"))
            .await
            .expect("rebuild");
        manifest.mark_invalid("a.bin");

        manifest
            .rebuild(&io, Utf8Path::new("/src"))
            .await
            .expect("rebuild");

        assert_eq!(manifest.is_valid("a.bin"), Some(true));
        assert_eq!(manifest.valid_count(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn unavailable_source_leaves_manifest_empty() {
        let io = source_io();
        let mut manifest = Manifest::new();
        manifest
            .rebuild(&io, Utf8Path::new("/src"))
            .await
            .expect("rebuild");

        let err = manifest
            .rebuild(&io, Utf8Path::new("/missing"))
            .await
            .expect_err("missing source");

        assert!(matches!(err, ManifestError::SourceUnavailable { .. }));
        assert!(manifest.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn mark_invalid_is_idempotent_and_ignores_unknown_paths() {
        let io = source_io();
        let mut manifest = Manifest::new();
        manifest
            .rebuild(&io, Utf8Path::new("/src"))
            .await
            .expect("rebuild");

        manifest.mark_invalid("dir/b.bin");
        manifest.mark_invalid("dir/b.bin");
        manifest.mark_invalid("not/tracked");

        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.valid_count(), 2);
        assert_eq!(manifest.is_valid("dir/b.bin"), Some(false));
        assert_eq!(manifest.is_valid("not/tracked"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn valid_entries_is_a_snapshot() {
        let io = source_io();
        let mut manifest = Manifest::new();
        manifest
            .rebuild(&io, Utf8Path::new("/src"))
            .await
            .expect("rebuild");

        let snapshot = manifest.valid_entries();
        for path in &snapshot {
            manifest.mark_invalid(path);
        }

        assert_eq!(snapshot.len(), 3);
        assert_eq!(manifest.valid_count(), 0);
    }
}
