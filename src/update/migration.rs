//! Built-in phase executor for staged updates.
//!
//! Each phase reads the artifacts of the phases before it from the
//! persisted state, so a resumed migration picks up exactly where the last
//! completed phase left off. Only EXECUTE touches the installed tree.

use std::{collections::BTreeMap, os::unix::fs::PermissionsExt, path::Path};

use filetime::FileTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    coverage::{AuditOptions, CoverageAuditor, Expected},
    fs::{copy_file_atomic, sha256_file, walk_tree, EntryKind, ExcludeRules, OverwritePolicy, PermissionRules, TreeEntry},
    guard::{validate_file_name, ManagedPath, PathGuard},
    retrofit::{FileOrigin, Phase, PhaseExecutor, PristineRegistry, RetrofitState},
    Error, Result,
};

/// Suffix for a release file staged next to a user-modified copy.
pub const UPSTREAM_SUFFIX: &str = ".upstream";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    /// Installed file -> sha256.
    pub installed: BTreeMap<String, String>,
    pub pristine: Vec<String>,
    pub modified: Vec<String>,
    pub user_added: Vec<String>,
    /// Shipped defaults the user removed.
    pub removed_defaults: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub add: Vec<String>,
    pub update: Vec<String>,
    pub unchanged: Vec<String>,
    /// User changed it, upstream did not; the user copy stays.
    pub preserve: Vec<String>,
    /// Both sides changed it, or upstream now ships a file the user created.
    pub conflict: Vec<String>,
    /// Installed defaults the new release no longer ships; left in place.
    pub obsolete: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    Copy { path: String },
    StageUpstream { path: String, staged: String },
    Keep { path: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub actions: Vec<PlannedAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub files_copied: usize,
    pub staged_upstream: usize,
    pub kept: usize,
    pub bytes: u64,
}

/// Drives ANALYZE through VERIFY for one install/release pair.
#[derive(Debug)]
pub struct StagedMigration<'a> {
    guard: &'a PathGuard,
    registry: &'a PristineRegistry,
    install: ManagedPath,
    release: ManagedPath,
    exclude: ExcludeRules,
    permissions: PermissionRules,
    audit: AuditOptions,
}

impl<'a> StagedMigration<'a> {
    pub fn new(
        guard: &'a PathGuard,
        registry: &'a PristineRegistry,
        install: impl AsRef<Path>,
        release: impl AsRef<Path>,
    ) -> Result<Self> {
        Ok(Self {
            guard,
            registry,
            install: guard.validate(install)?,
            release: guard.validate(release)?,
            exclude: ExcludeRules::default(),
            permissions: PermissionRules::default(),
            audit: AuditOptions::default(),
        })
    }

    pub fn with_exclude(mut self, exclude: ExcludeRules) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionRules) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_audit(mut self, audit: AuditOptions) -> Self {
        self.audit = audit;
        self
    }

    fn files(&self, root: &ManagedPath) -> Result<BTreeMap<String, TreeEntry>> {
        Ok(walk_tree(root.as_path(), Some(&self.exclude))?
            .into_iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| (e.key(), e))
            .collect())
    }

    fn analyze(&self) -> Result<Analysis> {
        let mut analysis = Analysis::default();
        for (key, entry) in self.files(&self.install)? {
            let hash = sha256_file(&entry.absolute)?;
            match self.registry.classify(&key, &hash) {
                FileOrigin::Pristine => analysis.pristine.push(key.clone()),
                FileOrigin::Modified => analysis.modified.push(key.clone()),
                FileOrigin::UserAdded => analysis.user_added.push(key.clone()),
            }
            analysis.installed.insert(key, hash);
        }
        analysis.removed_defaults = self
            .registry
            .iter()
            .map(|(path, _)| path)
            .filter(|path| !analysis.installed.contains_key(*path))
            .map(str::to_string)
            .collect();
        info!(
            pristine = analysis.pristine.len(),
            modified = analysis.modified.len(),
            user_added = analysis.user_added.len(),
            removed_defaults = analysis.removed_defaults.len(),
            "installed tree analyzed"
        );
        Ok(analysis)
    }

    fn assess(&self, analysis: &Analysis) -> Result<Assessment> {
        let release = self.files(&self.release)?;
        let mut assessment = Assessment::default();

        for (key, entry) in &release {
            let Some(installed_hash) = analysis.installed.get(key) else {
                assessment.add.push(key.clone());
                continue;
            };
            let release_hash = sha256_file(&entry.absolute)?;
            if &release_hash == installed_hash {
                assessment.unchanged.push(key.clone());
                continue;
            }
            match self.registry.classify(key, installed_hash) {
                FileOrigin::Pristine => assessment.update.push(key.clone()),
                FileOrigin::Modified if self.registry.hash_of(key) == Some(release_hash.as_str()) => {
                    assessment.preserve.push(key.clone())
                }
                FileOrigin::Modified | FileOrigin::UserAdded => assessment.conflict.push(key.clone()),
            }
        }

        assessment.obsolete = analysis
            .installed
            .keys()
            .filter(|key| !release.contains_key(*key) && self.registry.contains(key))
            .cloned()
            .collect();
        info!(
            add = assessment.add.len(),
            update = assessment.update.len(),
            preserve = assessment.preserve.len(),
            conflict = assessment.conflict.len(),
            obsolete = assessment.obsolete.len(),
            "release assessed"
        );
        Ok(assessment)
    }

    fn plan(&self, assessment: &Assessment) -> Result<MigrationPlan> {
        let mut actions = Vec::new();
        for path in assessment.add.iter().chain(&assessment.update) {
            actions.push(PlannedAction::Copy { path: path.clone() });
        }
        for path in &assessment.preserve {
            actions.push(PlannedAction::Keep { path: path.clone() });
        }
        for path in &assessment.conflict {
            actions.push(PlannedAction::StageUpstream {
                path: path.clone(),
                staged: upstream_name(path)?,
            });
        }
        actions.sort_by(|a, b| action_path(a).cmp(action_path(b)));
        Ok(MigrationPlan { actions })
    }

    fn execute(&self, plan: &MigrationPlan) -> Result<ExecuteSummary> {
        let mut summary = ExecuteSummary::default();
        for action in &plan.actions {
            match action {
                PlannedAction::Copy { path } => {
                    summary.bytes += self.install_release_file(path, path)?;
                    summary.files_copied += 1;
                }
                PlannedAction::StageUpstream { path, staged } => {
                    summary.bytes += self.install_release_file(path, staged)?;
                    summary.staged_upstream += 1;
                }
                PlannedAction::Keep { path } => {
                    debug!(path = %path, "keeping user copy");
                    summary.kept += 1;
                }
            }
        }
        info!(
            files_copied = summary.files_copied,
            staged_upstream = summary.staged_upstream,
            kept = summary.kept,
            "migration plan applied"
        );
        Ok(summary)
    }

    /// Copy `release/<from>` to `install/<to>`. Replacing is safe to repeat,
    /// which is what a resumed EXECUTE does.
    fn install_release_file(&self, from: &str, to: &str) -> Result<u64> {
        let src = self.guard.validate_within(&self.release, from)?;
        let dest = self.guard.validate_within(&self.install, to)?;
        let meta = src.as_path().symlink_metadata()?;
        if !meta.file_type().is_file() {
            return Err(Error::Validation(format!("release entry {from} is not a regular file")).into());
        }
        let mode = self
            .permissions
            .target_mode(Path::new(from), meta.permissions().mode());
        let mtime = FileTime::from_last_modification_time(&meta);
        copy_file_atomic(src.as_path(), dest.as_path(), mode, Some(mtime), OverwritePolicy::Replace)
    }

    fn verify(&self) -> Result<serde_json::Value> {
        let auditor = CoverageAuditor::new(self.guard.clone()).with_exclude(self.exclude.clone());
        let report = auditor.validate(
            &Expected::Tree(self.release.as_path().to_path_buf()),
            self.install.as_path(),
            &self.audit,
        )?;
        if !report.is_safe() {
            return Err(Error::Validation(format!(
                "coverage {:.2}% below threshold {:.2}% ({} critical missing)",
                report.coverage_percent,
                report.threshold,
                report.critical_missing.len()
            ))
            .into());
        }
        Ok(serde_json::to_value(&report)?)
    }
}

impl PhaseExecutor for StagedMigration<'_> {
    fn run(&mut self, phase: Phase, state: &RetrofitState) -> Result<serde_json::Value> {
        match phase {
            Phase::Analyze => Ok(serde_json::to_value(self.analyze()?)?),
            Phase::Assess => {
                let analysis: Analysis = artifact(state, Phase::Analyze)?;
                Ok(serde_json::to_value(self.assess(&analysis)?)?)
            }
            Phase::Plan => {
                let assessment: Assessment = artifact(state, Phase::Assess)?;
                Ok(serde_json::to_value(self.plan(&assessment)?)?)
            }
            Phase::Execute => {
                let plan: MigrationPlan = artifact(state, Phase::Plan)?;
                Ok(serde_json::to_value(self.execute(&plan)?)?)
            }
            Phase::Verify => self.verify(),
            Phase::NotStarted | Phase::Complete => {
                Err(Error::State(format!("{phase} has no migration work")).into())
            }
        }
    }
}

fn artifact<T: DeserializeOwned>(state: &RetrofitState, phase: Phase) -> Result<T> {
    let value = state
        .artifacts
        .get(&phase)
        .ok_or_else(|| Error::State(format!("{phase} artifact is missing")))?;
    serde_json::from_value(value.clone())
        .map_err(|err| Error::State(format!("{phase} artifact is unreadable: {err}")).into())
}

fn action_path(action: &PlannedAction) -> &str {
    match action {
        PlannedAction::Copy { path }
        | PlannedAction::StageUpstream { path, .. }
        | PlannedAction::Keep { path } => path,
    }
}

/// `dir/name.ext` -> `dir/name.ext.upstream`, with the new file name
/// checked like any other name this crate creates.
fn upstream_name(relative: &str) -> Result<String> {
    let (dir, name) = match relative.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, relative),
    };
    let staged = format!("{name}{UPSTREAM_SUFFIX}");
    validate_file_name(&staged)?;
    Ok(match dir {
        Some(dir) => format!("{dir}/{staged}"),
        None => staged,
    })
}
