use std::{collections::BTreeMap, fmt::Write as _};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Group key for files that sit directly in the destination root.
pub const ROOT_GROUP: &str = "(root)";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeMismatch {
    pub path: String,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageReport {
    pub total_expected: usize,
    pub total_found: usize,
    pub total_missing: usize,
    /// Missing paths grouped by their top-level directory.
    pub missing: BTreeMap<String, Vec<String>>,
    pub extra: Vec<String>,
    pub extra_files: usize,
    pub coverage_percent: f64,
    pub size_mismatches: Vec<SizeMismatch>,
    pub critical_missing: Vec<String>,
    pub status: CoverageStatus,
    pub threshold: f64,
}

/// Process exit codes for a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationExit {
    Complete = 0,
    BelowThreshold = 1,
    CouldNotRun = 2,
}

impl ValidationExit {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.status == CoverageStatus::Complete
    }

    /// Complete by percentage and no critical file missing. A near-complete
    /// install that lacks a critical file is not safe.
    pub fn is_safe(&self) -> bool {
        self.is_complete() && self.critical_missing.is_empty()
    }

    pub fn missing_paths(&self) -> impl Iterator<Item = &str> {
        self.missing.values().flatten().map(String::as_str)
    }

    pub fn exit_code(&self) -> ValidationExit {
        if self.is_safe() {
            ValidationExit::Complete
        } else {
            ValidationExit::BelowThreshold
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Hierarchical human-readable report.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let status = match self.status {
            CoverageStatus::Complete => "COMPLETE",
            CoverageStatus::Incomplete => "INCOMPLETE",
        };
        let _ = writeln!(
            out,
            "Coverage: {:.2}% ({}/{} files) [{status}, threshold {:.2}%]",
            self.coverage_percent, self.total_found, self.total_expected, self.threshold
        );

        if !self.critical_missing.is_empty() {
            let _ = writeln!(out, "Critical files missing ({}):", self.critical_missing.len());
            for path in &self.critical_missing {
                let _ = writeln!(out, "  ! {path}");
            }
        }

        if self.total_missing > 0 {
            let _ = writeln!(out, "Missing files ({}):", self.total_missing);
            for (group, paths) in &self.missing {
                let _ = writeln!(out, "  {group}/ ({})", paths.len());
                for path in paths {
                    let _ = writeln!(out, "    - {path}");
                }
            }
        }

        if !self.size_mismatches.is_empty() {
            let _ = writeln!(out, "Size mismatches ({}):", self.size_mismatches.len());
            for m in &self.size_mismatches {
                let _ = writeln!(out, "  ~ {} (expected {} bytes, found {})", m.path, m.expected, m.actual);
            }
        }

        if !self.extra.is_empty() {
            let _ = writeln!(out, "Extra files ({}):", self.extra.len());
            for path in &self.extra {
                let _ = writeln!(out, "  + {path}");
            }
        }

        out
    }
}

/// Exit code for a validation attempt, including runs that could not start.
pub fn exit_code_for(result: &Result<CoverageReport>) -> ValidationExit {
    match result {
        Ok(report) => report.exit_code(),
        Err(_) => ValidationExit::CouldNotRun,
    }
}

pub(crate) fn group_of(path: &str) -> &str {
    match path.split_once('/') {
        Some((top, _)) => top,
        None => ROOT_GROUP,
    }
}
