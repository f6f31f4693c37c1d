//! Persisted retrofit state and its on-disk recovery rules.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::phase::{Phase, SUBSTANTIVE_PHASES};
use crate::{fs::write_atomic, logging::redact_path, Result};

pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const CORRUPT_STATE_SUFFIX: &str = ".backup";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrofitState {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    pub current_phase: Phase,
    pub completed_phases: BTreeSet<Phase>,
    #[serde(default)]
    pub artifacts: BTreeMap<Phase, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub metadata: StateMetadata,
}

fn legacy_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl RetrofitState {
    pub fn fresh() -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            current_phase: Phase::NotStarted,
            completed_phases: BTreeSet::new(),
            artifacts: BTreeMap::new(),
            backup_path: None,
            backup_id: None,
            metadata: StateMetadata {
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn is_completed(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    pub fn missing_prerequisites(&self, phase: Phase) -> Vec<Phase> {
        phase
            .prerequisites()
            .iter()
            .copied()
            .filter(|p| !self.is_completed(*p))
            .collect()
    }

    pub fn substantive_completed(&self) -> usize {
        SUBSTANTIVE_PHASES
            .iter()
            .filter(|p| self.is_completed(**p))
            .count()
    }

    /// A state that breaks the ordering invariant was not written by us.
    fn is_consistent(&self) -> bool {
        self.schema_version <= STATE_SCHEMA_VERSION
            && !self.completed_phases.contains(&Phase::NotStarted)
            && self
                .completed_phases
                .iter()
                .all(|p| self.missing_prerequisites(*p).is_empty())
    }

    pub(crate) fn save(&mut self, path: &Path) -> Result<()> {
        self.metadata.updated_at = Utc::now();
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data, Some(0o600))
    }
}

/// Outcome of reading a state file.
#[derive(Debug)]
pub(crate) enum Loaded {
    Existing(RetrofitState),
    Missing,
    /// The file could not be trusted and was moved to `archived`.
    Recovered { archived: PathBuf },
}

pub(crate) fn load_or_recover(path: &Path) -> Result<Loaded> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(err) => return Err(err.into()),
    };

    match serde_json::from_slice::<RetrofitState>(&bytes) {
        Ok(state) if state.is_consistent() => Ok(Loaded::Existing(state)),
        Ok(_) => {
            let archived = archive(path)?;
            warn!(
                state_file = %redact_path(path),
                archived = %redact_path(&archived),
                "retrofit state violates phase ordering; archived and reinitialized"
            );
            Ok(Loaded::Recovered { archived })
        }
        Err(err) => {
            let archived = archive(path)?;
            warn!(
                state_file = %redact_path(path),
                archived = %redact_path(&archived),
                error = %err,
                "retrofit state unreadable; archived and reinitialized"
            );
            Ok(Loaded::Recovered { archived })
        }
    }
}

fn archive(path: &Path) -> Result<PathBuf> {
    let with_suffix = |infix: &str| {
        let mut name = path.as_os_str().to_owned();
        name.push(infix);
        name.push(CORRUPT_STATE_SUFFIX);
        PathBuf::from(name)
    };
    let mut archived = with_suffix("");
    if archived.exists() {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        archived = with_suffix(&format!(".{stamp}"));
    }
    fs::rename(path, &archived)?;
    Ok(archived)
}
