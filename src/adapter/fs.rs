use std::{
    collections::VecDeque,
    ffi::{OsStr, OsString},
    fmt::Display,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Maps paths relative to the local root onto the remote tree.
///
/// Remote paths always use `/`, whatever the local separator is.
#[derive(Debug, Clone)]
pub struct RemotePathMapping {
    local_root: PathBuf,
    remote_root: String,
}

impl RemotePathMapping {
    pub fn new(local_root: &Path, remote_root: &str) -> Self {
        let trimmed = remote_root.trim_end_matches('/');
        let remote_root = if trimmed.is_empty() { "/" } else { trimmed };

        Self {
            local_root: local_root.to_path_buf(),
            remote_root: remote_root.to_string(),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// `""` maps to the remote root itself.
    pub fn remote_dir(&self, relative_dir: &Path) -> String {
        let relative = to_remote_relative(relative_dir);
        if relative.is_empty() {
            self.remote_root.clone()
        } else {
            self.join_remote(&self.remote_root, &relative)
        }
    }

    /// Only the remote side goes through a lossy UTF-8 conversion; the local path keeps the
    /// name's original bytes.
    pub fn transfer_unit(
        &self,
        relative_dir: &Path,
        file_name: impl AsRef<OsStr>,
    ) -> TransferUnit {
        let file_name = file_name.as_ref();
        let remote_name = file_name.to_string_lossy();
        TransferUnit {
            local_source: self.local_root.join(relative_dir).join(file_name),
            remote_dest: self.join_remote(&self.remote_dir(relative_dir), &remote_name),
            path_name: relative_dir.join(file_name),
        }
    }

    fn join_remote(&self, base: &str, relative: &str) -> String {
        if base.ends_with('/') {
            format!("{base}{relative}")
        } else {
            format!("{base}/{relative}")
        }
    }
}

fn to_remote_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().replace('\\', "/")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// One file to upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferUnit {
    pub local_source: PathBuf,
    pub remote_dest: String,
    pub path_name: PathBuf,
}

impl Display for TransferUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} -> {})",
            self.path_name.display(),
            self.local_source.display(),
            self.remote_dest
        )
    }
}

/// A directory and the regular files directly inside it, in name order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryBatch {
    pub relative_dir: PathBuf,
    pub files: Vec<OsString>,
}

#[derive(Debug, Error)]
#[error("could not read {}: {message}", display_path(.path.as_deref()))]
pub struct WalkError {
    pub path: Option<PathBuf>,
    pub message: String,
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|path| path.display().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

impl From<walkdir::Error> for WalkError {
    fn from(err: walkdir::Error) -> Self {
        Self {
            path: err.path().map(Path::to_path_buf),
            message: err
                .io_error()
                .map(|io| io.to_string())
                .unwrap_or_else(|| err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WalkOptions {
    pub follow_links: bool,
}

/// Walks `local_root`, yielding every directory before its descendants.
pub fn walk(local_root: &Path, options: WalkOptions) -> TreeWalk {
    // Files sort ahead of subdirectories, so a directory's files arrive right after it.
    let entries = WalkDir::new(local_root)
        .follow_links(options.follow_links)
        .sort_by(|a, b| {
            a.file_type()
                .is_dir()
                .cmp(&b.file_type().is_dir())
                .then_with(|| a.file_name().cmp(b.file_name()))
        })
        .into_iter();

    TreeWalk {
        root: local_root.to_path_buf(),
        entries,
        current: None,
        pending_errors: VecDeque::new(),
    }
}

pub struct TreeWalk {
    root: PathBuf,
    entries: walkdir::IntoIter,
    current: Option<DirectoryBatch>,
    pending_errors: VecDeque<WalkError>,
}

impl TreeWalk {
    fn relative(&self, entry: &DirEntry) -> PathBuf {
        entry
            .path()
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| entry.path().to_path_buf())
    }
}

impl Iterator for TreeWalk {
    type Item = Result<DirectoryBatch, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_errors.pop_front() {
            return Some(Err(err));
        }

        loop {
            let entry = match self.entries.next() {
                None => return self.current.take().map(Ok),
                Some(Err(err)) => {
                    let err = WalkError::from(err);
                    if self.current.is_none() {
                        return Some(Err(err));
                    }
                    self.pending_errors.push_back(err);
                    continue;
                }
                Some(Ok(entry)) => entry,
            };

            let file_type = entry.file_type();

            if file_type.is_dir() {
                let batch = DirectoryBatch {
                    relative_dir: self.relative(&entry),
                    files: Vec::new(),
                };
                if let Some(finished) = self.current.replace(batch) {
                    return Some(Ok(finished));
                }
                continue;
            }

            if !file_type.is_file() {
                tracing::warn!(path = %entry.path().display(), "skipping entry that is not a regular file");
                continue;
            }

            match self.current.as_mut() {
                Some(batch) => batch.files.push(entry.file_name().to_os_string()),
                None => {
                    return Some(Err(WalkError {
                        path: Some(entry.path().to_path_buf()),
                        message: "not a directory".to_string(),
                    }))
                }
            }
        }
    }
}
