//! Normalized tree walk.
//!
//! Produces one sorted stream of entries per tree. Symlinks are reported as
//! such and never followed.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::rules::ExcludeRules;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub relative: PathBuf,
    pub absolute: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub modified: Option<SystemTime>,
}

impl TreeEntry {
    /// `/`-separated relative path used as the key in manifests and reports.
    pub fn key(&self) -> String {
        relative_key(&self.relative)
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Render a relative path with `/` separators regardless of platform.
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `root` and return every entry below it, sorted by path. Directories
/// matched by `exclude` are pruned together with their subtree; excluded
/// files are dropped.
pub fn walk_tree(root: &Path, exclude: Option<&ExcludeRules>) -> Result<Vec<TreeEntry>> {
    if !root.is_dir() {
        return Err(Error::Validation(format!(
            "{} is not a directory",
            crate::logging::redact_path(root)
        ))
        .into());
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match (exclude, entry.path().strip_prefix(root)) {
            (Some(rules), Ok(rel)) => !rules.is_excluded(rel),
            _ => true,
        });

    for entry in walker {
        let entry = entry.map_err(|err| {
            let io = err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("tree walk failed"));
            Error::Io(io)
        })?;

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::Validation("walked outside the tree root".into()))?
            .to_path_buf();
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            // sockets, fifos and devices have no place in a plugin tree
            continue;
        };

        entries.push(TreeEntry {
            absolute: entry.path().to_path_buf(),
            relative,
            kind,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mode: meta.permissions().mode() & 0o7777,
            modified: meta.modified().ok(),
        });
    }

    Ok(entries)
}
