//! Single-file operations that complete or fail as a unit: data lands in a
//! temporary file next to the destination and is renamed into place.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use filetime::FileTime;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::{logging::redact_path, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// Fail with a copy error if the destination already exists.
    #[default]
    Refuse,
    Replace,
}

fn temp_in_parent(dest: &Path) -> Result<NamedTempFile> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent", redact_path(dest))))?;
    fs::create_dir_all(parent)?;
    Ok(NamedTempFile::new_in(parent)?)
}

fn persist(temp: NamedTempFile, dest: &Path, policy: OverwritePolicy) -> Result<()> {
    let result = match policy {
        OverwritePolicy::Replace => temp.persist(dest),
        OverwritePolicy::Refuse => temp.persist_noclobber(dest),
    };
    result.map_err(|err| {
        if err.error.kind() == io::ErrorKind::AlreadyExists {
            Error::Copy {
                path: redact_path(dest),
                reason: "destination exists and overwrite is disabled".into(),
            }
        } else {
            Error::Io(err.error)
        }
    })?;
    Ok(())
}

/// Write `contents` to `dest` atomically. `mode` defaults to owner-only.
pub fn write_atomic(dest: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let mut temp = temp_in_parent(dest)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode.unwrap_or(0o600)))?;
    persist(temp, dest, OverwritePolicy::Replace)
}

/// Copy one regular file. Permissions and modification time are applied to
/// the temporary file before it is renamed, so a reader never observes a
/// half-configured destination.
pub fn copy_file_atomic(
    src: &Path,
    dest: &Path,
    mode: u32,
    mtime: Option<FileTime>,
    policy: OverwritePolicy,
) -> Result<u64> {
    if policy == OverwritePolicy::Refuse && dest.symlink_metadata().is_ok() {
        return Err(Error::Copy {
            path: redact_path(dest),
            reason: "destination exists and overwrite is disabled".into(),
        }
        .into());
    }

    let mut reader = fs::File::open(src)?;
    let mut temp = temp_in_parent(dest)?;
    let bytes = io::copy(&mut reader, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode & 0o7777))?;
    if let Some(mtime) = mtime {
        filetime::set_file_mtime(temp.path(), mtime)?;
    }
    persist(temp, dest, policy)?;
    Ok(bytes)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
