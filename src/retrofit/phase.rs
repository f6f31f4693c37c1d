use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Retrofit phases in their strict order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    NotStarted,
    Analyze,
    Assess,
    Plan,
    Execute,
    Verify,
    Complete,
}

/// The phases that carry work; progress is measured against these.
pub const SUBSTANTIVE_PHASES: [Phase; 5] = [
    Phase::Analyze,
    Phase::Assess,
    Phase::Plan,
    Phase::Execute,
    Phase::Verify,
];

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::NotStarted,
        Phase::Analyze,
        Phase::Assess,
        Phase::Plan,
        Phase::Execute,
        Phase::Verify,
        Phase::Complete,
    ];

    pub fn prerequisites(self) -> &'static [Phase] {
        match self {
            Phase::NotStarted | Phase::Analyze => &[],
            Phase::Assess => &SUBSTANTIVE_PHASES[..1],
            Phase::Plan => &SUBSTANTIVE_PHASES[..2],
            Phase::Execute => &SUBSTANTIVE_PHASES[..3],
            Phase::Verify => &SUBSTANTIVE_PHASES[..4],
            Phase::Complete => &SUBSTANTIVE_PHASES,
        }
    }

    pub fn next(self) -> Option<Phase> {
        let idx = Phase::ALL.iter().position(|p| *p == self)?;
        Phase::ALL.get(idx + 1).copied()
    }

    pub fn is_substantive(self) -> bool {
        SUBSTANTIVE_PHASES.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::NotStarted => "NOT_STARTED",
            Phase::Analyze => "ANALYZE",
            Phase::Assess => "ASSESS",
            Phase::Plan => "PLAN",
            Phase::Execute => "EXECUTE",
            Phase::Verify => "VERIFY",
            Phase::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::State(format!("unknown phase {s:?}")).into())
    }
}
