//! Point-in-time snapshots of a directory tree and their restoration.

use std::{
    collections::HashSet,
    fs::{self, DirBuilder},
    os::unix::fs::{symlink, DirBuilderExt},
    path::{Path, PathBuf},
};

use chrono::Utc;
use filetime::FileTime;
use tracing::{debug, info, warn};

use super::{
    retention::RetentionPolicy,
    snapshot::{BackupSnapshot, FileEntry, SNAPSHOT_MANIFEST, SNAPSHOT_SCHEMA_VERSION},
};
use crate::{
    fs::{copy_file_atomic, sha256_file, walk_tree, write_atomic, EntryKind, OverwritePolicy},
    guard::{validate_file_name, ManagedPath, PathGuard},
    logging::{log_vault_failure, log_vault_operation, redact_path, VaultIoSnapshot},
    Error, Result,
};

const SNAPSHOT_ATTEMPTS: u32 = 2;
const BACKUP_INFIX: &str = ".backup-";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Remove files that appeared after the snapshot was taken.
    pub prune_new: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub snapshot_id: String,
    pub files_restored: usize,
    pub directories_restored: usize,
    pub bytes: u64,
    pub pruned: usize,
}

#[derive(Debug, Clone)]
pub struct BackupVault {
    guard: PathGuard,
    backup_parent: Option<PathBuf>,
    caller: String,
}

impl BackupVault {
    pub fn new(guard: PathGuard) -> Self {
        Self {
            guard,
            backup_parent: None,
            caller: "plugup".to_string(),
        }
    }

    /// Store snapshots under `parent` instead of next to the source tree.
    pub fn with_backup_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.backup_parent = Some(parent.into());
        self
    }

    /// Identity recorded with every audit event.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Copy `source_root` into a new owner-only backup directory.
    ///
    /// Directory creation and copy form one unit: the copy is staged in a
    /// hidden directory that only becomes the snapshot through a final
    /// rename. A failed attempt is discarded and retried once.
    pub fn snapshot(&self, source_root: impl AsRef<Path>) -> Result<BackupSnapshot> {
        let source = self.guard.validate(source_root)?;
        if !source.as_path().is_dir() {
            return Err(Error::Backup(format!("snapshot source {source} is not a directory")).into());
        }
        let name = source_name(&source)?;
        let parent = self.parent_for(&source)?;

        let mut last_error = None;
        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            match self.try_snapshot(&source, &parent, &name) {
                Ok(snapshot) => {
                    log_vault_operation(
                        "snapshot",
                        &snapshot.id,
                        &self.caller,
                        VaultIoSnapshot {
                            files: snapshot.file_count(),
                            directories: snapshot.directories.len(),
                            bytes: snapshot.total_bytes(),
                        },
                    );
                    return Ok(snapshot);
                }
                Err(err) => {
                    if matches!(err.downcast_ref::<Error>(), Some(Error::SecurityViolation(_))) {
                        return Err(err);
                    }
                    log_vault_failure("snapshot", &self.caller, attempt, &format!("{err:#}"));
                    last_error = Some(err);
                }
            }
        }

        let reason = last_error
            .map(|err| format!("{err:#}"))
            .unwrap_or_else(|| "unknown failure".into());
        Err(Error::Backup(format!("snapshot of {source} failed after retry: {reason}")).into())
    }

    fn try_snapshot(&self, source: &ManagedPath, parent: &ManagedPath, name: &str) -> Result<BackupSnapshot> {
        fs::create_dir_all(parent.as_path())?;
        let created_at = Utc::now();
        let base_id = created_at.format("%Y%m%dT%H%M%S%.6fZ").to_string();

        let mut id = base_id.clone();
        let mut counter = 1;
        while parent.as_path().join(backup_dir_name(name, &id)).exists() {
            id = format!("{base_id}-{counter}");
            counter += 1;
        }

        let final_root = self
            .guard
            .validate_within(parent, backup_dir_name(name, &id))?;
        let staging = self.guard.validate_within(
            parent,
            format!(".{}{PARTIAL_SUFFIX}", backup_dir_name(name, &id)),
        )?;
        if staging.as_path().exists() {
            fs::remove_dir_all(staging.as_path())?;
        }
        create_private_dir(staging.as_path())?;

        let mut snapshot = BackupSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            id,
            source_root: source.as_path().to_path_buf(),
            backup_root: final_root.as_path().to_path_buf(),
            created_at,
            caller: self.caller.clone(),
            files: Vec::new(),
            directories: Vec::new(),
        };

        if let Err(err) = fill_staging(source.as_path(), staging.as_path(), &mut snapshot) {
            if let Err(cleanup) = fs::remove_dir_all(staging.as_path()) {
                warn!(error = %cleanup, "failed to discard partial snapshot");
            }
            return Err(err);
        }

        if let Err(err) = fs::rename(staging.as_path(), final_root.as_path()) {
            let _ = fs::remove_dir_all(staging.as_path());
            return Err(err.into());
        }

        Ok(snapshot)
    }

    /// Overwrite the snapshot's source tree with the snapshot contents.
    /// Running it twice leaves the same result as running it once.
    pub fn restore(&self, snapshot: &BackupSnapshot, options: RestoreOptions) -> Result<RestoreSummary> {
        let backup = self.guard.validate(&snapshot.backup_root)?;
        if !backup.as_path().is_dir() {
            return Err(Error::Backup(format!("backup {} no longer exists", snapshot.id)).into());
        }
        let on_disk = BackupSnapshot::load(backup.as_path())?;
        if on_disk.id != snapshot.id {
            return Err(Error::Backup(format!(
                "backup directory holds snapshot {} instead of {}",
                on_disk.id, snapshot.id
            ))
            .into());
        }

        let target = self.guard.validate(&snapshot.source_root)?;
        fs::create_dir_all(target.as_path())?;

        let mut summary = RestoreSummary {
            snapshot_id: snapshot.id.clone(),
            ..RestoreSummary::default()
        };

        // Resolve every destination and check every backup copy before the
        // first write, so a refused entry never leaves a half-restored tree.
        let mut dirs = Vec::with_capacity(snapshot.directories.len());
        for dir in &snapshot.directories {
            dirs.push(self.guard.validate_entry_within(&target, dir)?);
        }
        for entry in &snapshot.files {
            self.guard.validate_entry_within(&target, &entry.path)?;
            if entry.link_target.is_none() {
                verify_backup_copy(backup.as_path(), entry)?;
            }
        }

        for dest in &dirs {
            if dest.as_path().symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(dest.as_path())?;
            }
            fs::create_dir_all(dest.as_path())?;
            summary.directories_restored += 1;
        }

        // Directories may have been put back in place of links above, so
        // file destinations are resolved again.
        for entry in &snapshot.files {
            let dest = self.guard.validate_entry_within(&target, &entry.path)?;
            clear_conflicting(dest.as_path(), entry)?;
            if let Some(parent) = dest.as_path().parent() {
                fs::create_dir_all(parent)?;
            }

            if let Some(link_target) = &entry.link_target {
                if dest.as_path().symlink_metadata().is_ok() {
                    fs::remove_file(dest.as_path())?;
                }
                symlink(link_target, dest.as_path())?;
            } else {
                let src = backup.as_path().join(&entry.path);
                let mtime = fs::metadata(&src)
                    .ok()
                    .map(|m| FileTime::from_last_modification_time(&m));
                summary.bytes +=
                    copy_file_atomic(&src, dest.as_path(), entry.mode, mtime, OverwritePolicy::Replace)
                        .map_err(|err| Error::Backup(format!("restoring {} failed: {err:#}", entry.path)))?;
            }
            summary.files_restored += 1;
        }

        if options.prune_new {
            summary.pruned = prune_unknown(target.as_path(), snapshot)?;
        }

        log_vault_operation(
            "restore",
            &snapshot.id,
            &self.caller,
            VaultIoSnapshot {
                files: summary.files_restored,
                directories: summary.directories_restored,
                bytes: summary.bytes,
            },
        );
        Ok(summary)
    }

    /// Snapshots of `source_root`, newest first.
    pub fn list(&self, source_root: impl AsRef<Path>) -> Result<Vec<BackupSnapshot>> {
        let source = self.guard.validate(source_root)?;
        let name = source_name(&source)?;
        let parent = self.parent_for(&source)?;
        let prefix = format!("{name}{BACKUP_INFIX}");

        let mut snapshots = Vec::new();
        let read_dir = match fs::read_dir(parent.as_path()) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(err) => return Err(err.into()),
        };
        for dirent in read_dir {
            let dirent = dirent?;
            let file_name = dirent.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with(&prefix) || !dirent.file_type()?.is_dir() {
                continue;
            }
            match BackupSnapshot::load(&dirent.path()) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => debug!(dir = %file_name, error = %err, "ignoring unreadable backup"),
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    pub fn load(&self, source_root: impl AsRef<Path>, id: &str) -> Result<BackupSnapshot> {
        self.list(source_root)?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::Backup(format!("snapshot {id} not found")).into())
    }

    /// Delete the snapshots `policy` marks as expired and return their ids.
    pub fn prune(&self, source_root: impl AsRef<Path>, policy: &RetentionPolicy) -> Result<Vec<String>> {
        let snapshots = self.list(source_root)?;
        let mut removed = Vec::new();
        for snapshot in policy.expired(&snapshots, Utc::now()) {
            let root = self.guard.validate(&snapshot.backup_root)?;
            fs::remove_dir_all(root.as_path())?;
            log_vault_operation(
                "prune",
                &snapshot.id,
                &self.caller,
                VaultIoSnapshot {
                    files: snapshot.file_count(),
                    directories: snapshot.directories.len(),
                    bytes: snapshot.total_bytes(),
                },
            );
            removed.push(snapshot.id.clone());
        }
        info!(removed = removed.len(), policy = ?policy, "backup prune finished");
        Ok(removed)
    }

    fn parent_for(&self, source: &ManagedPath) -> Result<ManagedPath> {
        match &self.backup_parent {
            Some(parent) => self.guard.validate(parent),
            None => {
                let parent = source
                    .as_path()
                    .parent()
                    .ok_or_else(|| Error::Backup("snapshot source has no parent directory".into()))?;
                self.guard.validate(parent)
            }
        }
    }
}

fn source_name(source: &ManagedPath) -> Result<String> {
    let name = source
        .as_path()
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("{source} has no usable directory name")))?;
    Ok(validate_file_name(name)?.to_string())
}

fn backup_dir_name(name: &str, id: &str) -> String {
    format!("{name}{BACKUP_INFIX}{id}")
}

fn create_private_dir(path: &Path) -> Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    Ok(())
}

/// Copy the source tree into `staging` and record it in `snapshot`.
fn fill_staging(source: &Path, staging: &Path, snapshot: &mut BackupSnapshot) -> Result<()> {
    // The source may have vanished since validation.
    match fs::symlink_metadata(source) {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            return Err(Error::Backup(format!(
                "snapshot source {} disappeared before copy",
                redact_path(source)
            ))
            .into())
        }
    }

    for entry in walk_tree(source, None)? {
        let key = entry.key();
        if key == SNAPSHOT_MANIFEST {
            warn!("source tree carries a snapshot manifest; not copied");
            continue;
        }
        let staged = staging.join(&entry.relative);
        match entry.kind {
            EntryKind::Dir => {
                create_private_dir(&staged)?;
                snapshot.directories.push(key);
            }
            EntryKind::Symlink => {
                let link_target = fs::read_link(&entry.absolute)?;
                symlink(&link_target, &staged)?;
                snapshot.files.push(FileEntry {
                    path: key,
                    size: 0,
                    mode: entry.mode,
                    sha256: None,
                    link_target: Some(link_target),
                });
            }
            EntryKind::File => {
                let mtime = entry.modified.map(FileTime::from_system_time);
                let size =
                    copy_file_atomic(&entry.absolute, &staged, 0o600, mtime, OverwritePolicy::Refuse)?;
                snapshot.files.push(FileEntry {
                    path: key,
                    size,
                    mode: entry.mode,
                    sha256: Some(sha256_file(&staged)?),
                    link_target: None,
                });
            }
        }
    }

    let manifest = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(&staging.join(SNAPSHOT_MANIFEST), &manifest, Some(0o600))?;
    Ok(())
}

/// Make room for a restored entry when the tree changed shape since the
/// snapshot: a directory where a file used to be, or a symlink where a
/// regular file used to be. Links are removed, never written through.
fn clear_conflicting(dest: &Path, entry: &FileEntry) -> Result<()> {
    match dest.symlink_metadata() {
        Ok(meta) if meta.is_dir() => {
            debug!(path = %entry.path, "replacing directory with restored file");
            fs::remove_dir_all(dest)?;
        }
        Ok(meta) if meta.file_type().is_symlink() && entry.link_target.is_none() => {
            debug!(path = %entry.path, "replacing symlink with restored file");
            fs::remove_file(dest)?;
        }
        _ => {}
    }
    Ok(())
}

/// The backup copy of `entry` must still hash to what was recorded.
fn verify_backup_copy(backup_root: &Path, entry: &FileEntry) -> Result<()> {
    let Some(expected) = &entry.sha256 else {
        return Ok(());
    };
    let actual = sha256_file(&backup_root.join(&entry.path))
        .map_err(|err| Error::Backup(format!("backup copy of {} is unreadable: {err:#}", entry.path)))?;
    if &actual != expected {
        return Err(Error::Backup(format!("backup copy of {} is corrupt", entry.path)).into());
    }
    Ok(())
}

/// Remove everything under `target` the snapshot does not know about.
fn prune_unknown(target: &Path, snapshot: &BackupSnapshot) -> Result<usize> {
    let files: HashSet<&str> = snapshot.files.iter().map(|f| f.path.as_str()).collect();
    let dirs: HashSet<&str> = snapshot.directories.iter().map(String::as_str).collect();
    let mut removed = 0;

    // children before parents
    for entry in walk_tree(target, None)?.into_iter().rev() {
        let key = entry.key();
        match entry.kind {
            EntryKind::Dir => {
                if !dirs.contains(key.as_str()) && !has_kept_descendant(&key, &files) {
                    if fs::read_dir(&entry.absolute)?.next().is_none() {
                        fs::remove_dir(&entry.absolute)?;
                        removed += 1;
                    }
                }
            }
            EntryKind::File | EntryKind::Symlink => {
                if !files.contains(key.as_str()) {
                    fs::remove_file(&entry.absolute)?;
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

fn has_kept_descendant(dir: &str, files: &HashSet<&str>) -> bool {
    let prefix = format!("{dir}/");
    files.iter().any(|f| f.starts_with(&prefix))
}
