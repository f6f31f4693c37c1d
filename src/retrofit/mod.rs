//! Phase-ordered retrofit workflow for staged migrations.
//!
//! The state lives in a file next to the target directory and is rewritten
//! after every mutation, so an interrupted retrofit resumes from the last
//! completed phase. Completion is idempotent; resuming never repeats a
//! completed phase.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    backup::{BackupSnapshot, BackupVault},
    guard::{validate_file_name, ManagedPath, PathGuard},
    Error, Result,
};

pub mod phase;
pub mod registry;
pub mod state;

pub use phase::{Phase, SUBSTANTIVE_PHASES};
pub use registry::{FileOrigin, PristineRegistry};
pub use state::{RetrofitState, CORRUPT_STATE_SUFFIX, STATE_SCHEMA_VERSION};

use state::{load_or_recover, Loaded};

const STATE_FILE_SUFFIX: &str = ".retrofit-state.json";

/// Work performed for each substantive phase. The returned JSON is stored
/// as the phase artifact.
pub trait PhaseExecutor {
    fn run(&mut self, phase: Phase, state: &RetrofitState) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    AlreadyComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrofitStatus {
    pub current_phase: Phase,
    pub completed_phases: Vec<Phase>,
    pub remaining_phases: Vec<Phase>,
    pub progress_percent: f64,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RetrofitStateMachine {
    target: ManagedPath,
    state_path: PathBuf,
    state: RetrofitState,
    recovered_from: Option<PathBuf>,
}

impl RetrofitStateMachine {
    /// Load the state for `target`, creating it on first use. A state file
    /// that cannot be trusted is archived and replaced with a fresh one.
    pub fn open(guard: &PathGuard, target: impl AsRef<Path>) -> Result<Self> {
        let target = guard.validate(target)?;
        let state_path = state_path_for(guard, &target)?;

        let (state, recovered_from, needs_save) = match load_or_recover(&state_path)? {
            Loaded::Existing(state) => (state, None, false),
            Loaded::Missing => (RetrofitState::fresh(), None, true),
            Loaded::Recovered { archived } => (RetrofitState::fresh(), Some(archived), true),
        };

        let mut machine = Self {
            target,
            state_path,
            state,
            recovered_from,
        };
        if needs_save {
            machine.persist()?;
        }
        info!(
            target_dir = %machine.target,
            current_phase = %machine.state.current_phase,
            completed = machine.state.completed_phases.len(),
            "retrofit state loaded"
        );
        Ok(machine)
    }

    pub fn state(&self) -> &RetrofitState {
        &self.state
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn target(&self) -> &ManagedPath {
        &self.target
    }

    /// Where a corrupt state file was archived during `open`, if it was.
    pub fn recovered_from(&self) -> Option<&Path> {
        self.recovered_from.as_deref()
    }

    pub fn artifact(&self, phase: Phase) -> Option<&serde_json::Value> {
        self.state.artifacts.get(&phase)
    }

    pub fn check_prerequisites(&self, phase: Phase) -> Result<()> {
        if phase == Phase::NotStarted {
            return Err(Error::State("NOT_STARTED is not an executable phase".into()).into());
        }
        let missing = self.state.missing_prerequisites(phase);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|p| p.as_str()).collect();
            return Err(Error::State(format!(
                "{phase} requires completed phases: {}",
                names.join(", ")
            ))
            .into());
        }
        Ok(())
    }

    /// Run `work` for `phase` once its prerequisites are complete, store its
    /// artifact and mark the phase complete. An already completed phase is
    /// skipped so a resumed retrofit never repeats work.
    pub fn execute_phase<F>(&mut self, phase: Phase, work: F) -> Result<PhaseOutcome>
    where
        F: FnOnce(&RetrofitState) -> Result<serde_json::Value>,
    {
        self.check_prerequisites(phase)?;
        if phase == Phase::Execute && self.state.backup_path.is_none() {
            return Err(Error::State("EXECUTE requires a recorded backup".into()).into());
        }
        if self.state.is_completed(phase) {
            return Ok(PhaseOutcome::AlreadyComplete);
        }

        self.state.current_phase = phase;
        self.persist()?;
        info!(phase = %phase, "retrofit phase started");

        let artifact = match work(&self.state) {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(phase = %phase, error = %err, "retrofit phase failed");
                return Err(err);
            }
        };
        self.state.artifacts.insert(phase, artifact);
        self.complete_phase(phase)?;
        Ok(PhaseOutcome::Completed)
    }

    /// Mark `phase` complete and advance to the next phase. Re-marking a
    /// completed phase is a no-op; returns whether anything changed.
    pub fn complete_phase(&mut self, phase: Phase) -> Result<bool> {
        self.check_prerequisites(phase)?;
        if self.state.is_completed(phase) {
            return Ok(false);
        }

        self.state.completed_phases.insert(phase);
        self.state.current_phase = phase.next().unwrap_or(Phase::Complete);
        self.persist()?;
        info!(
            phase = %phase,
            next = %self.state.current_phase,
            progress = self.progress_percent(),
            "retrofit phase completed"
        );
        Ok(true)
    }

    /// Drive `executor` through every outstanding phase, then mark the
    /// retrofit complete.
    pub fn run_remaining(&mut self, executor: &mut dyn PhaseExecutor) -> Result<RetrofitStatus> {
        for phase in SUBSTANTIVE_PHASES {
            self.execute_phase(phase, |state| executor.run(phase, state))?;
        }
        self.complete_phase(Phase::Complete)?;
        Ok(self.get_status())
    }

    pub fn record_backup(&mut self, snapshot: &BackupSnapshot) -> Result<()> {
        self.state.backup_path = Some(snapshot.backup_root.clone());
        self.state.backup_id = Some(snapshot.id.clone());
        self.persist()
    }

    /// Snapshot the target unless a usable backup is already recorded. A
    /// resumed retrofit keeps the backup taken before its first EXECUTE, not
    /// one of a half-migrated tree.
    pub fn ensure_backup(&mut self, vault: &BackupVault) -> Result<Option<BackupSnapshot>> {
        if let Some(path) = &self.state.backup_path {
            if path.is_dir() {
                return Ok(None);
            }
            warn!(target_dir = %self.target, "recorded backup is gone; taking a new one");
        }
        let snapshot = vault.snapshot(self.target.as_path())?;
        self.record_backup(&snapshot)?;
        Ok(Some(snapshot))
    }

    /// The snapshot recorded for this retrofit, read back from its backup
    /// directory.
    pub fn recorded_backup(&self) -> Result<Option<BackupSnapshot>> {
        match &self.state.backup_path {
            Some(path) => Ok(Some(BackupSnapshot::load(path)?)),
            None => Ok(None),
        }
    }

    /// Drop the recorded backup so the next EXECUTE needs a fresh one. The
    /// backup directory itself is left to retention.
    pub fn forget_backup(&mut self) -> Result<()> {
        if self.state.backup_path.is_none() && self.state.backup_id.is_none() {
            return Ok(());
        }
        self.state.backup_path = None;
        self.state.backup_id = None;
        self.persist()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.state.completed_phases.clear();
        self.state.artifacts.clear();
        self.state.current_phase = Phase::NotStarted;
        self.persist()?;
        info!(target_dir = %self.target, "retrofit state reset");
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_completed(Phase::Complete)
    }

    pub fn get_status(&self) -> RetrofitStatus {
        RetrofitStatus {
            current_phase: self.state.current_phase,
            completed_phases: self.state.completed_phases.iter().copied().collect(),
            remaining_phases: SUBSTANTIVE_PHASES
                .iter()
                .copied()
                .filter(|p| !self.state.is_completed(*p))
                .collect(),
            progress_percent: self.progress_percent(),
            backup_path: self.state.backup_path.clone(),
        }
    }

    fn progress_percent(&self) -> f64 {
        100.0 * self.state.substantive_completed() as f64 / SUBSTANTIVE_PHASES.len() as f64
    }

    fn persist(&mut self) -> Result<()> {
        self.state.save(&self.state_path)
    }
}

/// The state file sits next to the target: `.<target-name>.retrofit-state.json`.
fn state_path_for(guard: &PathGuard, target: &ManagedPath) -> Result<PathBuf> {
    let name = target
        .as_path()
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("{target} has no usable directory name")))?;
    let file_name = state_file_name(name)?;
    let parent = target
        .as_path()
        .parent()
        .ok_or_else(|| Error::Validation(format!("{target} has no parent directory")))?;
    let parent = guard.validate(parent)?;
    Ok(guard
        .validate_within(&parent, file_name)?
        .into_path_buf())
}

pub fn state_file_name(target_name: &str) -> Result<String> {
    Ok(format!(".{}{STATE_FILE_SUFFIX}", validate_file_name(target_name)?))
}
