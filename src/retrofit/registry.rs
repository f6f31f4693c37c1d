//! Lookup table of pristine plugin defaults.
//!
//! Built once from the release the installation was created from and shared
//! read-only with whoever needs to tell user customizations apart from
//! untouched defaults.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use serde::Serialize;

use crate::{
    backup::BackupSnapshot,
    fs::{sha256_file, walk_tree, EntryKind},
    guard::PathGuard,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    /// Byte-identical to the shipped default.
    Pristine,
    /// Shipped by the plugin but changed by the user.
    Modified,
    /// Not part of the shipped defaults at all.
    UserAdded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PristineRegistry {
    hashes: Arc<BTreeMap<String, String>>,
}

impl PristineRegistry {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            hashes: Arc::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Hash every regular file of a pristine release tree.
    pub fn from_tree(guard: &PathGuard, root: impl AsRef<Path>) -> Result<Self> {
        let root = guard.validate(root)?;
        let mut hashes = BTreeMap::new();
        for entry in walk_tree(root.as_path(), None)? {
            if entry.kind == EntryKind::File {
                hashes.insert(entry.key(), sha256_file(&entry.absolute)?);
            }
        }
        Ok(Self {
            hashes: Arc::new(hashes),
        })
    }

    /// Reuse the hashes recorded by a snapshot of a pristine install.
    pub fn from_snapshot(snapshot: &BackupSnapshot) -> Self {
        Self::from_entries(
            snapshot
                .files
                .iter()
                .filter_map(|f| f.sha256.clone().map(|h| (f.path.clone(), h))),
        )
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.hashes.contains_key(relative)
    }

    pub fn hash_of(&self, relative: &str) -> Option<&str> {
        self.hashes.get(relative).map(String::as_str)
    }

    pub fn classify(&self, relative: &str, sha256: &str) -> FileOrigin {
        match self.hashes.get(relative) {
            Some(expected) if expected == sha256 => FileOrigin::Pristine,
            Some(_) => FileOrigin::Modified,
            None => FileOrigin::UserAdded,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.hashes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
