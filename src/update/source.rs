//! Version sources: where installed and available version strings come from.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{logging::redact_path, Error, Result};

/// Version files are tiny; anything larger is not one.
const MAX_VERSION_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginVersion {
    pub name: String,
    pub version: String,
}

impl PluginVersion {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Supplies `{name, version}`. Lookups that go over the network belong to
/// the implementor, including their timeouts.
pub trait VersionSource: Send + Sync {
    fn fetch(&self) -> Result<PluginVersion>;
}

/// A version known up front.
#[derive(Debug, Clone)]
pub struct StaticVersion(pub PluginVersion);

impl VersionSource for StaticVersion {
    fn fetch(&self) -> Result<PluginVersion> {
        Ok(self.0.clone())
    }
}

/// Reads `{name, version, ...}` from a JSON file, typically the plugin's own
/// metadata file inside an installed or released tree.
#[derive(Debug, Clone)]
pub struct ManifestVersion {
    path: PathBuf,
}

impl ManifestVersion {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_tree(root: &Path, relative: &str) -> Self {
        Self::new(root.join(relative))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionSource for ManifestVersion {
    fn fetch(&self) -> Result<PluginVersion> {
        let file = fs::File::open(&self.path).map_err(|err| {
            Error::Validation(format!(
                "version file {} unreadable: {err}",
                redact_path(&self.path)
            ))
        })?;
        let mut contents = Vec::new();
        file.take(MAX_VERSION_FILE_BYTES + 1)
            .read_to_end(&mut contents)?;
        if contents.len() as u64 > MAX_VERSION_FILE_BYTES {
            return Err(Error::Validation(format!(
                "version file {} is oversized",
                redact_path(&self.path)
            ))
            .into());
        }
        serde_json::from_slice(&contents).map_err(|err| {
            Error::Validation(format!(
                "version file {} is malformed: {err}",
                redact_path(&self.path)
            ))
            .into()
        })
    }
}
