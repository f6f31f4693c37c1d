//! Advisory update lock keyed on the target directory.
//!
//! Only one `update()` may run against a target at a time. The lock is an
//! `flock`-style exclusive lock on `.<target-name>.update.lock` next to the
//! target, held for the whole call; the file also carries a JSON marker that
//! says who holds it.

use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    guard::{validate_file_name, ManagedPath, PathGuard},
    Error, Result,
};

pub const LOCK_FILE_SUFFIX: &str = ".update.lock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockMarker {
    pub run_id: Uuid,
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockMarker {
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&data).ok())
    }

    pub fn is_owner_alive(&self) -> bool {
        pid_alive(self.owner_pid)
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct UpdateLock {
    file: File,
    path: PathBuf,
    marker: LockMarker,
}

impl UpdateLock {
    /// Take the lock for `target` without blocking. Fails with
    /// `Error::LockHeld` when another process owns it.
    pub fn acquire(guard: &PathGuard, target: &ManagedPath, run_id: Uuid) -> Result<Self> {
        let path = lock_path_for(guard, target)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|err| {
                if err.raw_os_error() == Some(libc::ELOOP) {
                    Error::SecurityViolation(format!("update lock for {target} is a symlink"))
                } else {
                    Error::Io(err)
                }
            })?;

        if let Err(err) = file.try_lock_exclusive() {
            let holder = LockMarker::read(&path).ok().flatten();
            warn!(
                target_dir = %target,
                holder_pid = holder.as_ref().map(|m| m.owner_pid),
                holder_alive = holder.as_ref().map(LockMarker::is_owner_alive),
                error = %err,
                "update lock busy"
            );
            let detail = match holder {
                Some(m) => format!("update {} by pid {} in progress", m.run_id, m.owner_pid),
                None => "another update is in progress".to_string(),
            };
            return Err(Error::LockHeld(detail).into());
        }

        let marker = LockMarker {
            run_id,
            owner_pid: std::process::id(),
            started_at: Utc::now(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&serde_json::to_vec_pretty(&marker)?)?;
        file.sync_all()?;
        info!(target_dir = %target, run_id = %run_id, "update lock acquired");

        Ok(Self { file, path, marker })
    }

    pub fn marker(&self) -> &LockMarker {
        &self.marker
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        // Clear the marker before unlocking so a stale marker never outlives
        // the lock. The file itself stays; removing it would race a waiter.
        let _ = self.file.set_len(0);
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(error = %err, "update lock release failed; closing handle releases it");
        }
    }
}

fn lock_path_for(guard: &PathGuard, target: &ManagedPath) -> Result<PathBuf> {
    let name = target
        .as_path()
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("{target} has no usable directory name")))?;
    let name = validate_file_name(name)?;
    let parent = target
        .as_path()
        .parent()
        .ok_or_else(|| Error::Validation(format!("{target} has no parent directory")))?;
    let parent = guard.validate(parent)?;
    Ok(guard
        .validate_entry_within(&parent, format!(".{name}{LOCK_FILE_SUFFIX}"))?
        .into_path_buf())
}

fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Linux-only: rely on /proc/<pid> presence to detect liveness
    Path::new("/proc").join(pid.to_string()).exists()
}
