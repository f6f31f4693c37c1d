//! End-to-end update of an installed plugin tree from a release tree.
//!
//! `update()` validates both roots, takes the per-target lock, compares
//! versions, snapshots the installation, applies the release, audits
//! coverage and re-reads the installed version. Anything that fails before
//! the snapshot is returned as an error with the tree untouched; anything
//! that fails after it is rolled back from the snapshot and reported through
//! an unsuccessful [`UpdateResult`].

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backup::{BackupSnapshot, BackupVault, RestoreOptions, RetentionPolicy},
    coverage::{AuditOptions, CoverageAuditor, CoverageReport, Expected},
    fs::{CopyOptions, TreeCopier},
    guard::{ManagedPath, PathGuard},
    logging::{AuditSink, AuditStatus, TracingAuditSink},
    retrofit::{Phase, PristineRegistry, RetrofitStateMachine},
    Error, Result,
};

pub mod lock;
pub mod migration;
pub mod source;
pub mod version;

pub use lock::{LockMarker, UpdateLock, LOCK_FILE_SUFFIX};
pub use migration::{ExecuteSummary, MigrationPlan, PlannedAction, StagedMigration, UPSTREAM_SUFFIX};
pub use source::{ManifestVersion, PluginVersion, StaticVersion, VersionSource};
pub use version::{compare, compare_str, Version, VersionDelta};

pub const DEFAULT_VERSION_FILE: &str = "plugin.json";

/// Asked before anything destructive when `skip_confirm` is off.
pub trait Confirm: Send + Sync {
    fn confirm(&self, versions: &VersionSummary) -> bool;
}

/// Downstream step that runs only after a successful update.
pub trait PostUpdateHook: Send + Sync {
    fn after_update(&self, result: &UpdateResult) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub skip_confirm: bool,
    pub auto_backup: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            skip_confirm: false,
            auto_backup: true,
        }
    }
}

/// How the release lands in the installation.
#[derive(Debug, Clone, Default)]
pub enum ApplyMode {
    /// Overwrite every release file in place.
    #[default]
    Copy,
    /// Phase-ordered migration that keeps user customizations, using the
    /// registry of pristine defaults the installation was created from.
    Staged(PristineRegistry),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionSummary {
    pub name: String,
    pub installed: String,
    pub available: String,
    pub delta: VersionDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub run_id: Uuid,
    pub success: bool,
    pub versions: VersionSummary,
    pub files_copied: usize,
    pub coverage_percent: Option<f64>,
    pub rollback_performed: bool,
    pub snapshot_id: Option<String>,
    pub message: String,
}

pub struct UpdateOrchestrator {
    guard: PathGuard,
    install_root: PathBuf,
    release_root: PathBuf,
    version_file: String,
    available: Option<Box<dyn VersionSource>>,
    vault: BackupVault,
    copy_options: CopyOptions,
    audit: AuditOptions,
    retention: Option<RetentionPolicy>,
    mode: ApplyMode,
    sink: Box<dyn AuditSink>,
    confirm: Option<Box<dyn Confirm>>,
    hook: Option<Box<dyn PostUpdateHook>>,
}

impl std::fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("install_root", &self.install_root)
            .field("release_root", &self.release_root)
            .field("version_file", &self.version_file)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl UpdateOrchestrator {
    /// The available version is read from the release tree's version file
    /// unless another source is supplied.
    pub fn new(guard: PathGuard, install_root: impl Into<PathBuf>, release_root: impl Into<PathBuf>) -> Self {
        Self {
            vault: BackupVault::new(guard.clone()).with_caller("update"),
            guard,
            install_root: install_root.into(),
            release_root: release_root.into(),
            version_file: DEFAULT_VERSION_FILE.to_string(),
            available: None,
            copy_options: CopyOptions::default(),
            audit: AuditOptions::default(),
            retention: None,
            mode: ApplyMode::Copy,
            sink: Box::new(TracingAuditSink),
            confirm: None,
            hook: None,
        }
    }

    pub fn with_version_file(mut self, relative: impl Into<String>) -> Self {
        self.version_file = relative.into();
        self
    }

    pub fn with_version_source(mut self, source: Box<dyn VersionSource>) -> Self {
        self.available = Some(source);
        self
    }

    pub fn with_vault(mut self, vault: BackupVault) -> Self {
        self.vault = vault;
        self
    }

    /// Exclusion and permission rules for the apply step. Overwriting is
    /// always on for updates.
    pub fn with_copy_options(mut self, options: CopyOptions) -> Self {
        self.copy_options = options;
        self
    }

    pub fn with_audit(mut self, audit: AuditOptions) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = Some(policy);
        self
    }

    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_confirm(mut self, confirm: Box<dyn Confirm>) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn with_post_update_hook(mut self, hook: Box<dyn PostUpdateHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn update(&self, options: UpdateOptions) -> Result<UpdateResult> {
        let run_id = Uuid::new_v4();
        self.emit(
            run_id,
            "update",
            AuditStatus::Started,
            json!({ "skip_confirm": options.skip_confirm, "auto_backup": options.auto_backup }),
        );

        let outcome = self.run(run_id, options);
        match &outcome {
            Ok(result) => {
                let status = if result.success {
                    AuditStatus::Succeeded
                } else {
                    AuditStatus::Failed
                };
                self.emit(run_id, "update", status, serde_json::to_value(result)?);
            }
            Err(err) => self.emit(run_id, "update", AuditStatus::Failed, json!({ "error": format!("{err:#}") })),
        }
        outcome
    }

    fn run(&self, run_id: Uuid, options: UpdateOptions) -> Result<UpdateResult> {
        let (install, release) = self.step(run_id, "validate_roots", || self.validate_roots())?;
        let _lock = self.step(run_id, "acquire_lock", || UpdateLock::acquire(&self.guard, &install, run_id))?;

        let versions = self.step(run_id, "check_versions", || self.check_versions(&install, &release))?;
        let mut result = UpdateResult {
            run_id,
            success: false,
            versions: versions.clone(),
            files_copied: 0,
            coverage_percent: None,
            rollback_performed: false,
            snapshot_id: None,
            message: String::new(),
        };

        match versions.delta {
            VersionDelta::Current => {
                result.success = true;
                result.message = format!("{} {} is already installed", versions.name, versions.installed);
                return Ok(result);
            }
            VersionDelta::DowngradeRisk => {
                result.message = format!(
                    "refusing to replace {} with older {}",
                    versions.installed, versions.available
                );
                warn!(installed = %versions.installed, available = %versions.available, "downgrade refused");
                return Ok(result);
            }
            VersionDelta::UpgradeAvailable => {}
        }

        if !options.skip_confirm {
            let confirm = self.confirm.as_ref().ok_or_else(|| {
                Error::Validation("confirmation required but no confirmer is configured".into())
            })?;
            if !confirm.confirm(&versions) {
                self.emit(run_id, "confirm", AuditStatus::Skipped, json!({ "declined": true }));
                result.message = "update declined".into();
                return Ok(result);
            }
        }

        let mut machine = match &self.mode {
            ApplyMode::Staged(_) => Some(self.step(run_id, "open_migration", || self.open_migration(&install))?),
            ApplyMode::Copy => None,
        };

        let snapshot = self.step(run_id, "snapshot", || match machine.as_mut() {
            // staged migrations always need one before EXECUTE
            Some(machine) => match machine.ensure_backup(&self.vault)? {
                Some(snapshot) => Ok(Some(snapshot)),
                None => machine.recorded_backup(),
            },
            None if options.auto_backup => Ok(Some(self.vault.snapshot(install.as_path())?)),
            None => Ok(None),
        })?;
        result.snapshot_id = snapshot.as_ref().map(|s| s.id.clone());

        let applied = self.step(run_id, "apply", || match (&self.mode, machine.as_mut()) {
            (ApplyMode::Staged(registry), Some(machine)) => self.apply_staged(registry, &install, &release, machine),
            _ => self.apply_copy(&install, &release),
        });
        match applied {
            Ok(files) => result.files_copied = files,
            Err(err) => {
                return Ok(self.fail(result, snapshot.as_ref(), machine.as_mut(), format!("apply failed: {err:#}")));
            }
        }

        match self.step(run_id, "verify_coverage", || self.audit_coverage(&install, &release)) {
            Ok(report) => {
                result.coverage_percent = Some(report.coverage_percent);
                if !report.is_safe() {
                    let reason = format!(
                        "coverage {:.2}% below threshold {:.2}% ({} critical missing)",
                        report.coverage_percent,
                        report.threshold,
                        report.critical_missing.len()
                    );
                    return Ok(self.fail(result, snapshot.as_ref(), machine.as_mut(), reason));
                }
            }
            Err(err) => {
                let reason = format!("coverage audit failed: {err:#}");
                return Ok(self.fail(result, snapshot.as_ref(), machine.as_mut(), reason));
            }
        }

        let reread = self.step(run_id, "verify_version", || {
            let installed = self.installed_version(&install)?;
            if installed.version != versions.available {
                return Err(Error::Validation(format!(
                    "installed version reads {} after update, expected {}",
                    installed.version, versions.available
                ))
                .into());
            }
            Ok(())
        });
        if let Err(err) = reread {
            return Ok(self.fail(result, snapshot.as_ref(), machine.as_mut(), format!("{err:#}")));
        }

        result.success = true;
        result.message = format!(
            "updated {} from {} to {}",
            versions.name, versions.installed, versions.available
        );
        info!(
            run_id = %run_id,
            files_copied = result.files_copied,
            snapshot = ?result.snapshot_id,
            "update finished"
        );

        if let Some(policy) = &self.retention {
            if let Err(err) = self.vault.prune(install.as_path(), policy) {
                warn!(error = %err, "backup retention failed; old snapshots kept");
            }
        }
        if let Some(hook) = &self.hook {
            if let Err(err) = self.step(run_id, "post_update_hook", || hook.after_update(&result)) {
                result.message = format!("{}; post-update hook failed: {err:#}", result.message);
            }
        }
        Ok(result)
    }

    fn validate_roots(&self) -> Result<(ManagedPath, ManagedPath)> {
        self.audit.validate()?;
        let install = self.guard.validate(&self.install_root)?;
        let release = self.guard.validate(&self.release_root)?;
        for (label, root) in [("install", &install), ("release", &release)] {
            if !root.as_path().is_dir() {
                return Err(Error::Validation(format!("{label} root {root} is not a directory")).into());
            }
        }
        if install.as_path().starts_with(release.as_path()) || release.as_path().starts_with(install.as_path()) {
            return Err(Error::Validation("install and release roots must not contain each other".into()).into());
        }
        Ok((install, release))
    }

    fn installed_version(&self, install: &ManagedPath) -> Result<PluginVersion> {
        let file = self.guard.validate_within(install, &self.version_file)?;
        ManifestVersion::new(file.into_path_buf()).fetch()
    }

    fn check_versions(&self, install: &ManagedPath, release: &ManagedPath) -> Result<VersionSummary> {
        let installed = self.installed_version(install)?;
        let available = match &self.available {
            Some(source) => source.fetch()?,
            None => {
                let file = self.guard.validate_within(release, &self.version_file)?;
                ManifestVersion::new(file.into_path_buf()).fetch()?
            }
        };
        if installed.name != available.name {
            return Err(Error::Validation(format!(
                "release is for {:?}, installation is {:?}",
                available.name, installed.name
            ))
            .into());
        }
        let delta = compare(&Version::parse(&installed.version)?, &Version::parse(&available.version)?);
        Ok(VersionSummary {
            name: installed.name,
            installed: installed.version,
            available: available.version,
            delta,
        })
    }

    /// A finished or never-started migration starts over with a fresh
    /// backup; one interrupted mid-way resumes with the backup it recorded.
    fn open_migration(&self, install: &ManagedPath) -> Result<RetrofitStateMachine> {
        let mut machine = RetrofitStateMachine::open(&self.guard, install.as_path())?;
        if machine.is_finished() || machine.state().completed_phases.is_empty() {
            machine.reset()?;
            machine.forget_backup()?;
        } else {
            info!(current_phase = %machine.state().current_phase, "resuming staged migration");
        }
        Ok(machine)
    }

    fn apply_copy(&self, install: &ManagedPath, release: &ManagedPath) -> Result<usize> {
        let options = CopyOptions {
            overwrite: true,
            continue_on_error: false,
            ..self.copy_options.clone()
        };
        let report = TreeCopier::new(self.guard.clone(), options).copy(release.as_path(), install.as_path())?;
        Ok(report.files_copied)
    }

    fn apply_staged(
        &self,
        registry: &PristineRegistry,
        install: &ManagedPath,
        release: &ManagedPath,
        machine: &mut RetrofitStateMachine,
    ) -> Result<usize> {
        let mut executor = StagedMigration::new(&self.guard, registry, install.as_path(), release.as_path())?
            .with_exclude(self.copy_options.exclude.clone())
            .with_permissions(self.copy_options.permissions.clone())
            .with_audit(self.audit.clone());
        machine.run_remaining(&mut executor)?;
        let summary: ExecuteSummary = match machine.artifact(Phase::Execute) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => ExecuteSummary::default(),
        };
        Ok(summary.files_copied + summary.staged_upstream)
    }

    fn audit_coverage(&self, install: &ManagedPath, release: &ManagedPath) -> Result<CoverageReport> {
        CoverageAuditor::new(self.guard.clone())
            .with_exclude(self.copy_options.exclude.clone())
            .validate(&Expected::Tree(release.as_path().to_path_buf()), install.as_path(), &self.audit)
    }

    /// Restore the snapshot after a failure past the destructive point.
    fn fail(
        &self,
        mut result: UpdateResult,
        snapshot: Option<&BackupSnapshot>,
        machine: Option<&mut RetrofitStateMachine>,
        reason: String,
    ) -> UpdateResult {
        warn!(run_id = %result.run_id, reason = %reason, "update failed; rolling back");
        result.success = false;
        result.message = reason;

        let Some(snapshot) = snapshot else {
            self.emit(result.run_id, "rollback", AuditStatus::Skipped, json!({ "reason": "no snapshot" }));
            result.message = format!("{}; no snapshot to roll back to", result.message);
            return result;
        };

        let restored = self.step(result.run_id, "rollback", || {
            self.vault.restore(snapshot, RestoreOptions { prune_new: true })
        });
        match restored {
            Ok(_) => {
                result.rollback_performed = true;
                if let Some(machine) = machine {
                    if let Err(err) = machine.reset() {
                        warn!(error = %err, "could not reset migration state after rollback");
                    }
                }
            }
            Err(err) => {
                result.message = format!(
                    "{}; rollback from {} failed: {err:#}",
                    result.message, snapshot.id
                );
            }
        }
        result
    }

    /// Run one pipeline step, bracketing it with audit records.
    fn step<T>(&self, run_id: Uuid, event: &str, work: impl FnOnce() -> Result<T>) -> Result<T> {
        self.emit(run_id, event, AuditStatus::Started, json!({}));
        match work() {
            Ok(value) => {
                self.emit(run_id, event, AuditStatus::Succeeded, json!({}));
                Ok(value)
            }
            Err(err) => {
                self.emit(run_id, event, AuditStatus::Failed, json!({ "error": format!("{err:#}") }));
                Err(err)
            }
        }
    }

    fn emit(&self, run_id: Uuid, event: &str, status: AuditStatus, mut details: serde_json::Value) {
        if let Some(map) = details.as_object_mut() {
            map.insert("run_id".into(), json!(run_id));
        }
        self.sink.record(event, status, &details);
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn release_root(&self) -> &Path {
        &self.release_root
    }
}
