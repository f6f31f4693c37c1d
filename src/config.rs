//! Updater configuration file.
//!
//! A JSON document naming the roots the updater may touch and how it
//! copies, audits and retains backups. Critical files and the retention
//! policy have no defaults and must be spelled out.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    backup::{BackupVault, RetentionPolicy},
    coverage::{AuditOptions, DEFAULT_THRESHOLD},
    fs::{rules::DEFAULT_EXECUTABLE_DIRS, CopyOptions, ExcludeRules, PermissionRules},
    guard::PathGuard,
    logging::redact_path,
    update::{UpdateOrchestrator, DEFAULT_VERSION_FILE},
    Error, Result,
};

pub const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpdaterConfig {
    pub allow_roots: Vec<PathBuf>,
    pub install_root: PathBuf,
    pub release_root: PathBuf,
    /// Defaults to the install root's parent.
    #[serde(default)]
    pub backup_parent: Option<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_executable_dirs")]
    pub executable_dirs: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub check_sizes: bool,
    pub critical_files: Vec<String>,
    pub retention: RetentionPolicy,
    #[serde(default = "default_version_file")]
    pub version_file: String,
}

fn default_executable_dirs() -> Vec<String> {
    DEFAULT_EXECUTABLE_DIRS.iter().map(|d| d.to_string()).collect()
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_version_file() -> String {
    DEFAULT_VERSION_FILE.to_string()
}

impl UpdaterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mut contents = Vec::new();
        file.take(MAX_CONFIG_BYTES + 1).read_to_end(&mut contents)?;
        if contents.len() as u64 > MAX_CONFIG_BYTES {
            return Err(Error::Validation(format!(
                "config {} exceeds {MAX_CONFIG_BYTES} bytes",
                redact_path(path)
            ))
            .into());
        }
        Self::from_slice(&contents)
    }

    pub fn from_slice(contents: &[u8]) -> Result<Self> {
        let config: UpdaterConfig = serde_json::from_slice(contents)
            .map_err(|err| Error::Validation(format!("malformed config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allow_roots.is_empty() {
            return Err(Error::Validation("allow_roots must name at least one directory".into()).into());
        }
        if !self.threshold.is_finite() || !(0.0..=100.0).contains(&self.threshold) {
            return Err(Error::Validation(format!(
                "threshold {} must be between 0 and 100",
                self.threshold
            ))
            .into());
        }
        if self.version_file.trim().is_empty() {
            return Err(Error::Validation("version_file must not be empty".into()).into());
        }
        Ok(())
    }

    pub fn path_guard(&self) -> Result<PathGuard> {
        PathGuard::new(&self.allow_roots)
    }

    pub fn copy_options(&self) -> Result<CopyOptions> {
        Ok(CopyOptions {
            exclude: ExcludeRules::new(&self.exclude)?,
            permissions: PermissionRules::new(&self.executable_dirs),
            ..CopyOptions::default()
        })
    }

    pub fn audit_options(&self) -> AuditOptions {
        AuditOptions {
            threshold: self.threshold,
            check_sizes: self.check_sizes,
            critical: self.critical_files.clone(),
        }
    }

    pub fn vault(&self, guard: &PathGuard) -> BackupVault {
        let vault = BackupVault::new(guard.clone()).with_caller("update");
        match &self.backup_parent {
            Some(parent) => vault.with_backup_parent(parent),
            None => vault,
        }
    }

    /// An orchestrator wired from this config in copy mode; callers attach
    /// collaborators and a staged mode as needed.
    pub fn orchestrator(&self) -> Result<UpdateOrchestrator> {
        self.validate()?;
        let guard = self.path_guard()?;
        Ok(UpdateOrchestrator::new(guard.clone(), &self.install_root, &self.release_root)
            .with_version_file(self.version_file.clone())
            .with_vault(self.vault(&guard))
            .with_copy_options(self.copy_options()?)
            .with_audit(self.audit_options())
            .with_retention(self.retention))
    }
}
