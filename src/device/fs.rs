//! [`DeviceIo`] over the local file system.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::format::{FormatOptions, Formatter};
use super::{Device, DeviceError, DeviceIo, IGNORED_DIRECTORIES, IoFuture};

const COMPARE_CHUNK: u64 = 1024 * 1024;

/// Local file-system implementation of [`DeviceIo`].
#[derive(Debug)]
pub struct FsDeviceIo<F: Formatter> {
    formatter: Arc<F>,
}

impl<F: Formatter> FsDeviceIo<F> {
    /// Creates an implementation that formats with `formatter`.
    #[must_use]
    pub fn new(formatter: F) -> Self {
        Self {
            formatter: Arc::new(formatter),
        }
    }
}

#[derive(Debug, Default)]
struct Tree {
    directories: Vec<String>,
    files: Vec<String>,
}

async fn walk(root: &Utf8Path) -> Result<Tree, DeviceError> {
    let mut tree = Tree::default();
    let mut pending = vec![String::new()];

    while let Some(relative) = pending.pop() {
        let dir = if relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&relative)
        };
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| DeviceError::io(&dir, &err))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| DeviceError::io(&dir, &err))?
        {
            let name = entry
                .file_name()
                .into_string()
                .map_err(|raw| DeviceError::NonUtf8Path {
                    path: raw.to_string_lossy().into_owned(),
                })?;
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| DeviceError::io(&dir.join(&name), &err))?;
            let child = if relative.is_empty() {
                name.clone()
            } else {
                format!("{relative}/{name}")
            };

            if file_type.is_dir() {
                if relative.is_empty() && IGNORED_DIRECTORIES.contains(&name.as_str()) {
                    continue;
                }
                tree.directories.push(child.clone());
                pending.push(child);
            } else if file_type.is_file() {
                tree.files.push(child);
            }
        }
    }

    tree.directories.sort();
    tree.files.sort();
    Ok(tree)
}

async fn same_contents(left: &Utf8Path, right: &Utf8Path) -> Result<bool, DeviceError> {
    let left_len = fs::metadata(left)
        .await
        .map_err(|err| DeviceError::io(left, &err))?
        .len();
    let right_len = fs::metadata(right)
        .await
        .map_err(|err| DeviceError::io(right, &err))?
        .len();
    if left_len != right_len {
        return Ok(false);
    }

    let mut left_file = fs::File::open(left)
        .await
        .map_err(|err| DeviceError::io(left, &err))?;
    let mut right_file = fs::File::open(right)
        .await
        .map_err(|err| DeviceError::io(right, &err))?;

    let mut left_buf = Vec::new();
    let mut right_buf = Vec::new();
    let mut remaining = left_len;
    while remaining > 0 {
        let chunk = remaining.min(COMPARE_CHUNK);
        let len = usize::try_from(chunk).map_err(|err| DeviceError::Io {
            path: left.to_string(),
            message: err.to_string(),
        })?;
        left_buf.resize(len, 0);
        right_buf.resize(len, 0);
        left_file
            .read_exact(&mut left_buf)
            .await
            .map_err(|err| DeviceError::io(left, &err))?;
        right_file
            .read_exact(&mut right_buf)
            .await
            .map_err(|err| DeviceError::io(right, &err))?;
        if left_buf != right_buf {
            return Ok(false);
        }
        remaining -= chunk;
    }
    Ok(true)
}

async fn mirror(source: &Utf8Path, target: &Utf8Path) -> Result<usize, DeviceError> {
    let tree = walk(source).await?;
    for relative in &tree.directories {
        let dir: Utf8PathBuf = target.join(relative);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| DeviceError::io(&dir, &err))?;
    }
    for relative in &tree.files {
        let from = source.join(relative);
        let to = target.join(relative);
        fs::copy(&from, &to)
            .await
            .map_err(|err| DeviceError::io(&to, &err))?;
    }
    Ok(tree.files.len())
}

impl<F: Formatter> DeviceIo for FsDeviceIo<F> {
    fn is_ready<'a>(&'a self, device: &'a Device) -> IoFuture<'a, bool> {
        Box::pin(async move {
            Ok(fs::metadata(&device.root)
                .await
                .is_ok_and(|meta| meta.is_dir()))
        })
    }

    fn list_files<'a>(&'a self, root: &'a Utf8Path) -> IoFuture<'a, Vec<String>> {
        Box::pin(async move { Ok(walk(root).await?.files) })
    }

    fn root_directories<'a>(&'a self, root: &'a Utf8Path) -> IoFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut entries = fs::read_dir(root)
                .await
                .map_err(|err| DeviceError::io(root, &err))?;
            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| DeviceError::io(root, &err))?
            {
                let is_dir = entry
                    .file_type()
                    .await
                    .map_err(|err| DeviceError::io(root, &err))?
                    .is_dir();
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_dir && !IGNORED_DIRECTORIES.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn compare<'a>(&'a self, left: &'a Utf8Path, right: &'a Utf8Path) -> IoFuture<'a, bool> {
        Box::pin(same_contents(left, right))
    }

    fn copy_tree<'a>(
        &'a self,
        source: &'a Utf8Path,
        target: &'a Utf8Path,
    ) -> IoFuture<'a, usize> {
        Box::pin(mirror(source, target))
    }

    fn format<'a>(&'a self, device: &'a Device, quick: bool) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let formatter = Arc::clone(&self.formatter);
            let target = device.clone();
            let options = FormatOptions::for_device(device, quick);
            tokio::task::spawn_blocking(move || formatter.format(&target, &options))
                .await
                .map_err(|err| DeviceError::Format {
                    label: device.id.to_string(),
                    message: err.to_string(),
                })?
        })
    }
}
