//! Path validation against an allow-list of roots.
//!
//! Every filesystem location the updater touches goes through [`PathGuard`]
//! first. A [`ManagedPath`] can only be obtained from the guard and is always
//! absolute, symlink-resolved and inside one of the allow-listed roots.

use std::{
    ffi::OsString,
    fmt,
    path::{Component, Path, PathBuf},
};

use crate::{
    logging::{log_path_rejected, redact_path},
    Error, Result,
};

pub mod name;

pub use name::validate_file_name;

pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 255;
const MAX_LINK_HOPS: usize = 40;

/// Directories that are never managed, whatever the allow-list says.
pub const SYSTEM_DIRS: &[&str] = &[
    "/etc",
    "/bin",
    "/sbin",
    "/usr",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/lib",
    "/lib64",
    "/var/lib",
    "/System",
    "/private/etc",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedPath {
    path: PathBuf,
    root: PathBuf,
}

impl ManagedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The allow-listed root this path was proven to live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_to_root(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(Path::new(""))
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for ManagedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ManagedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", redact_path(&self.path))
    }
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new<I, P>(allow_roots: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut roots = Vec::new();
        for root in allow_roots {
            let root = root.as_ref();
            check_raw(root)?;
            let canonical = root.canonicalize().map_err(|_| {
                reject_validation(root, "allow-list root does not exist")
            })?;
            if canonical.parent().is_none() || is_system_dir(&canonical) {
                return Err(reject_security(root, "allow-list root is a system directory"));
            }
            if !roots.contains(&canonical) {
                roots.push(canonical);
            }
        }

        if roots.is_empty() {
            return Err(Error::Validation("allow-list must contain at least one root".into()).into());
        }

        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve `path` and prove it lies inside the allow-list.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<ManagedPath> {
        let path = path.as_ref();
        check_raw(path)?;

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let resolved = resolve(&absolute)?;

        if is_system_dir(&resolved) {
            return Err(reject_security(path, "resolves into a system directory"));
        }

        let root = self
            .roots
            .iter()
            .filter(|root| resolved.starts_with(root))
            .max_by_key(|root| root.components().count())
            .ok_or_else(|| reject_security(path, "resolves outside the allow-list"))?;

        Ok(ManagedPath {
            root: root.clone(),
            path: resolved,
        })
    }

    /// Join a relative path onto an already managed directory and validate
    /// the result. Absolute or traversing `relative` values are rejected.
    pub fn validate_within(&self, base: &ManagedPath, relative: impl AsRef<Path>) -> Result<ManagedPath> {
        let relative = relative.as_ref();
        if relative.is_absolute() || relative.has_root() {
            return Err(reject_security(relative, "expected a relative path"));
        }
        check_raw(relative)?;
        self.validate(base.as_path().join(relative))
    }

    /// Like [`validate_within`](Self::validate_within), but the last
    /// component is never followed: only its parent is resolved. For entries
    /// that may themselves be symlinks and are replaced rather than written
    /// through.
    pub fn validate_entry_within(&self, base: &ManagedPath, relative: impl AsRef<Path>) -> Result<ManagedPath> {
        let relative = relative.as_ref();
        if relative.is_absolute() || relative.has_root() {
            return Err(reject_security(relative, "expected a relative path"));
        }
        check_raw(relative)?;
        let name = relative
            .file_name()
            .ok_or_else(|| reject_validation(relative, "has no file name"))?;
        let parent = match relative.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.validate_within(base, parent)?,
            _ => base.clone(),
        };
        Ok(ManagedPath {
            path: parent.path.join(name),
            root: parent.root,
        })
    }
}

/// Checks that need no filesystem access. Traversal segments are refused
/// here so that nothing is ever resolved for them.
fn check_raw(path: &Path) -> Result<()> {
    let raw = path.as_os_str();
    let text = raw.to_string_lossy();

    if text.contains('\0') {
        return Err(reject_security(path, "contains a null byte"));
    }
    if text.is_empty() {
        return Err(reject_validation(path, "empty path"));
    }
    if text.chars().any(char::is_control) {
        return Err(reject_validation(path, "contains control characters"));
    }
    if raw.len() > MAX_PATH_LEN {
        return Err(reject_validation(path, "path exceeds length limit"));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(reject_security(path, "contains a traversal segment"));
            }
            Component::Normal(name) if name.len() > MAX_NAME_LEN => {
                return Err(reject_validation(path, "path component exceeds length limit"));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Canonicalize the deepest existing ancestor and re-attach the missing tail.
/// A dangling symlink on the way is replaced by its target, so a missing
/// name never hides where the path would actually land.
fn resolve(absolute: &Path) -> Result<PathBuf> {
    let mut existing = absolute.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    let mut hops = 0usize;

    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for name in tail.iter().rev() {
                    canonical.push(name);
                }
                return Ok(canonical);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if existing.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return Err(reject_validation(absolute, "too many levels of symbolic links"));
                    }
                    let link_target = std::fs::read_link(&existing)?;
                    existing = match existing.parent() {
                        Some(parent) => parent.join(link_target),
                        None => link_target,
                    };
                    continue;
                }
                let name = existing
                    .file_name()
                    .ok_or_else(|| reject_validation(absolute, "no existing ancestor"))?
                    .to_os_string();
                tail.push(name);
                existing = existing
                    .parent()
                    .ok_or_else(|| reject_validation(absolute, "no existing ancestor"))?
                    .to_path_buf();
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub fn is_system_dir(path: &Path) -> bool {
    SYSTEM_DIRS.iter().any(|dir| path.starts_with(dir))
}

fn reject_security(path: &Path, reason: &str) -> anyhow::Error {
    log_path_rejected(path, reason);
    Error::SecurityViolation(format!("{} {reason}", redact_path(path))).into()
}

fn reject_validation(path: &Path, reason: &str) -> anyhow::Error {
    log_path_rejected(path, reason);
    Error::Validation(format!("{} {reason}", redact_path(path))).into()
}
