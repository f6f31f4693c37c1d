//! Install manifest: an explicit `{version, total_files, files: [{path, size}]}`
//! listing that can stand in for walking a live source tree.

use std::{
    collections::HashSet,
    fs,
    io::Read,
    path::{Component, Path},
};

use serde::{Deserialize, Serialize};

use crate::{fs::relative_key, logging::redact_path, Error, Result};

/// Manifests larger than this are refused before parsing.
pub const MAX_MANIFEST_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallManifest {
    pub version: String,
    pub total_files: usize,
    pub files: Vec<ManifestFile>,
}

impl InstallManifest {
    pub fn new(version: impl Into<String>, files: Vec<ManifestFile>) -> Self {
        Self {
            version: version.into(),
            total_files: files.len(),
            files,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mut contents = Vec::new();
        file.take(MAX_MANIFEST_BYTES + 1).read_to_end(&mut contents)?;
        if contents.len() as u64 > MAX_MANIFEST_BYTES {
            return Err(Error::Validation(format!(
                "manifest {} exceeds {MAX_MANIFEST_BYTES} bytes",
                redact_path(path)
            ))
            .into());
        }
        Self::from_slice(&contents)
    }

    pub fn from_slice(contents: &[u8]) -> Result<Self> {
        let manifest: InstallManifest = serde_json::from_slice(contents)
            .map_err(|err| Error::Validation(format!("malformed manifest: {err}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_files != self.files.len() {
            return Err(Error::Validation(format!(
                "manifest declares {} files but lists {}",
                self.total_files,
                self.files.len()
            ))
            .into());
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            check_manifest_path(&file.path)?;
            // "a.md" and "./a.md" name the same file
            let key = relative_key(Path::new(&file.path));
            if key.is_empty() {
                return Err(Error::Validation(format!("manifest path {:?} does not name a file", file.path)).into());
            }
            if !seen.insert(key) {
                return Err(Error::Validation(format!("duplicate manifest path {}", file.path)).into());
            }
        }
        Ok(())
    }
}

fn check_manifest_path(raw: &str) -> Result<()> {
    if raw.contains('\0') {
        return Err(Error::SecurityViolation("manifest path contains a null byte".into()).into());
    }
    let path = Path::new(raw);
    if raw.is_empty() || raw.ends_with('/') {
        return Err(Error::Validation(format!("manifest path {raw:?} does not name a file")).into());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::SecurityViolation(
                    "manifest path escapes the destination root".into(),
                )
                .into());
            }
        }
    }
    Ok(())
}
