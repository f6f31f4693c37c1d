use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{logging::redact_path, Error, Result};

/// Manifest stored at the root of every backup directory.
pub const SNAPSHOT_MANIFEST: &str = ".plugup-snapshot.json";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path with `/` separators.
    pub path: String,
    pub size: u64,
    /// Permission bits of the source file.
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
}

impl FileEntry {
    pub fn is_symlink(&self) -> bool {
        self.link_target.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub schema_version: u32,
    pub id: String,
    pub source_root: PathBuf,
    pub backup_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub caller: String,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub directories: Vec<String>,
}

impl BackupSnapshot {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn find(&self, relative: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == relative)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.backup_root.join(SNAPSHOT_MANIFEST)
    }

    pub fn load(backup_root: &Path) -> Result<Self> {
        let path = backup_root.join(SNAPSHOT_MANIFEST);
        let contents = fs::read(&path).map_err(|err| {
            Error::Backup(format!(
                "snapshot manifest unreadable in {}: {err}",
                redact_path(backup_root)
            ))
        })?;
        let snapshot: BackupSnapshot = serde_json::from_slice(&contents).map_err(|err| {
            Error::Backup(format!(
                "snapshot manifest corrupt in {}: {err}",
                redact_path(backup_root)
            ))
        })?;
        if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(Error::Backup(format!(
                "snapshot {} uses unsupported schema version {}",
                snapshot.id, snapshot.schema_version
            ))
            .into());
        }
        Ok(snapshot)
    }
}
