//! Exclusion and permission rules as pure predicates over relative paths.

use std::path::{Component, Path};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::{Error, Result};

pub const DEFAULT_EXECUTABLE_DIRS: &[&str] = &["bin", "scripts", "hooks"];

/// Glob exclusions. Patterns containing `/` are matched against the whole
/// relative path (`**/cache/**`), all others against each path segment
/// (`*.pyc`, `node_modules`).
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    full: GlobSet,
    segment: GlobSet,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            full: GlobSet::empty(),
            segment: GlobSet::empty(),
        }
    }
}

impl ExcludeRules {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut full = GlobSetBuilder::new();
        let mut segment = GlobSetBuilder::new();
        let mut kept = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| Error::Validation(format!("invalid exclude pattern {pattern:?}: {err}")))?;
            if pattern.contains('/') {
                full.add(glob);
            } else {
                segment.add(glob);
            }
            kept.push(pattern.to_string());
        }

        Ok(Self {
            patterns: kept,
            full: full
                .build()
                .map_err(|err| Error::Validation(format!("invalid exclude patterns: {err}")))?,
            segment: segment
                .build()
                .map_err(|err| Error::Validation(format!("invalid exclude patterns: {err}")))?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        if self.full.is_match(super::walk::relative_key(relative)) {
            return true;
        }
        relative.components().any(|c| match c {
            Component::Normal(name) => self.segment.is_match(Path::new(name)),
            _ => false,
        })
    }
}

/// Decides the permission bits a copied file ends up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRules {
    executable_dirs: Vec<String>,
}

impl Default for PermissionRules {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTABLE_DIRS.iter().copied())
    }
}

impl PermissionRules {
    pub fn new<I, S>(executable_dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable_dirs: executable_dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// A file is an entry-point script when any directory above it carries
    /// one of the executable directory names.
    pub fn is_entry_point(&self, relative: &Path) -> bool {
        let Some(parent) = relative.parent() else {
            return false;
        };
        parent.components().any(|c| match c {
            Component::Normal(name) => self
                .executable_dirs
                .iter()
                .any(|dir| name.to_str() == Some(dir.as_str())),
            _ => false,
        })
    }

    /// Entry points gain execute bits wherever read bits are set; everything
    /// else keeps the source mode, so read-only sources stay read-only.
    pub fn target_mode(&self, relative: &Path, source_mode: u32) -> u32 {
        let mode = source_mode & 0o7777;
        if self.is_entry_point(relative) {
            mode | ((mode & 0o444) >> 2)
        } else {
            mode
        }
    }
}
