//! Structure-preserving tree copy.

use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use filetime::FileTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    atomic::{copy_file_atomic, OverwritePolicy},
    rules::{ExcludeRules, PermissionRules},
    walk::{walk_tree, EntryKind, TreeEntry},
};
use crate::{
    guard::{ManagedPath, PathGuard},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    #[default]
    PreserveSource,
    CopyTime,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub overwrite: bool,
    pub timestamps: TimestampPolicy,
    pub exclude: ExcludeRules,
    pub permissions: PermissionRules,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub files_copied: usize,
    pub files_skipped: usize,
    pub bytes_copied: u64,
    pub errors: usize,
    pub error_list: Vec<CopyFailure>,
}

impl CopyReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// Cooperative cancellation flag, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct TreeCopier {
    guard: PathGuard,
    options: CopyOptions,
}

impl TreeCopier {
    pub fn new(guard: PathGuard, options: CopyOptions) -> Self {
        Self { guard, options }
    }

    pub fn options(&self) -> &CopyOptions {
        &self.options
    }

    pub fn copy(&self, source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<CopyReport> {
        self.copy_with_progress(source, dest, None, None)
    }

    /// Copy every file under `source` to the same relative location under
    /// `dest`. `progress` receives `(index, total, relative_path)` after each
    /// file; `cancel` is polled before each file.
    pub fn copy_with_progress(
        &self,
        source: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        mut progress: Option<&mut dyn FnMut(usize, usize, &str)>,
        cancel: Option<&CancelToken>,
    ) -> Result<CopyReport> {
        let source = self.guard.validate(source)?;
        let dest = self.guard.validate(dest)?;
        if !source.as_path().is_dir() {
            return Err(Error::Validation(format!("copy source {source} is not a directory")).into());
        }
        fs::create_dir_all(dest.as_path())?;

        let entries = walk_tree(source.as_path(), Some(&self.options.exclude))?;
        // progress counts regular files only; symlinks are skipped
        let total = entries.iter().filter(|e| e.is_file()).count();
        let mut report = CopyReport::default();
        let mut index = 0usize;

        for entry in &entries {
            match entry.kind {
                EntryKind::Dir => {
                    let target = self.guard.validate_within(&dest, &entry.relative)?;
                    fs::create_dir_all(target.as_path())?;
                    continue;
                }
                EntryKind::Symlink => {
                    debug!(path = %entry.key(), "skipping symlink in copy source");
                    report.files_skipped += 1;
                    continue;
                }
                EntryKind::File => {}
            }

            if cancel.is_some_and(CancelToken::is_cancelled) {
                warn!(files_copied = report.files_copied, "tree copy cancelled");
                return Err(Error::Cancelled(report.files_copied).into());
            }

            index += 1;
            match self.copy_entry(&dest, entry) {
                Ok(bytes) => {
                    report.files_copied += 1;
                    report.bytes_copied += bytes;
                }
                Err(err) => {
                    let copy_error = matches!(err.downcast_ref::<Error>(), Some(Error::Copy { .. }));
                    if !(self.options.continue_on_error && copy_error) {
                        return Err(err);
                    }
                    warn!(path = %entry.key(), error = %err, "file copy failed; continuing");
                    report.errors += 1;
                    report.error_list.push(CopyFailure {
                        path: entry.key(),
                        reason: format!("{err:#}"),
                    });
                }
            }

            if let Some(cb) = progress.as_deref_mut() {
                cb(index, total, &entry.key());
            }
        }

        info!(
            files_copied = report.files_copied,
            files_skipped = report.files_skipped,
            bytes = report.bytes_copied,
            errors = report.errors,
            "tree copy finished"
        );
        Ok(report)
    }

    fn copy_entry(&self, dest_root: &ManagedPath, entry: &TreeEntry) -> Result<u64> {
        let target = self.guard.validate_within(dest_root, &entry.relative)?;
        let mode = self
            .options
            .permissions
            .target_mode(&entry.relative, entry.mode);
        let mtime = match self.options.timestamps {
            TimestampPolicy::PreserveSource => entry.modified.map(FileTime::from_system_time),
            TimestampPolicy::CopyTime => None,
        };
        let policy = if self.options.overwrite {
            OverwritePolicy::Replace
        } else {
            OverwritePolicy::Refuse
        };

        copy_file_atomic(&entry.absolute, target.as_path(), mode, mtime, policy)
            .map_err(|err| into_copy_error(err, entry.key()))
    }
}

/// Per-file I/O failures become `Error::Copy` so they can be collected;
/// everything else passes through untouched.
fn into_copy_error(err: anyhow::Error, path: String) -> anyhow::Error {
    let err = match err.downcast::<Error>() {
        Ok(Error::Io(io)) => {
            return Error::Copy {
                path,
                reason: io.to_string(),
            }
            .into()
        }
        Ok(other) => return other.into(),
        Err(err) => err,
    };
    match err.downcast::<std::io::Error>() {
        Ok(io) => Error::Copy {
            path,
            reason: io.to_string(),
        }
        .into(),
        Err(err) => err,
    }
}
