//! Completeness auditing of an installed tree against the expected file set.
//!
//! The expected set comes from walking a source tree or from an
//! [`InstallManifest`]; the present set comes from walking the destination.
//! Symbolic links never count as present, so a tree of links cannot spoof a
//! complete install.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use tracing::info;

use crate::{
    fs::{relative_key, walk_tree, EntryKind, ExcludeRules},
    guard::PathGuard,
    Error, Result,
};

pub mod manifest;
pub mod report;

pub use manifest::{InstallManifest, ManifestFile, MAX_MANIFEST_BYTES};
pub use report::{exit_code_for, CoverageReport, CoverageStatus, SizeMismatch, ValidationExit};

pub const DEFAULT_THRESHOLD: f64 = 100.0;

/// Where the expected file set comes from.
#[derive(Debug, Clone)]
pub enum Expected {
    Tree(PathBuf),
    Manifest(InstallManifest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditOptions {
    pub threshold: f64,
    pub check_sizes: bool,
    /// Relative paths whose absence makes an install unsafe regardless of
    /// the overall percentage.
    pub critical: Vec<String>,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            check_sizes: false,
            critical: Vec::new(),
        }
    }
}

impl AuditOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err(Error::Validation(format!(
                "coverage threshold {} must be between 0 and 100",
                self.threshold
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CoverageAuditor {
    guard: PathGuard,
    exclude: ExcludeRules,
}

impl CoverageAuditor {
    pub fn new(guard: PathGuard) -> Self {
        Self {
            guard,
            exclude: ExcludeRules::default(),
        }
    }

    /// Ignore excluded paths on both sides, matching what a copy with the
    /// same rules would have produced.
    pub fn with_exclude(mut self, exclude: ExcludeRules) -> Self {
        self.exclude = exclude;
        self
    }

    /// Compare the expected file set with what is present under `dest_root`.
    /// Read-only; two runs over an unchanged tree produce identical reports.
    pub fn validate(
        &self,
        expected: &Expected,
        dest_root: impl AsRef<Path>,
        options: &AuditOptions,
    ) -> Result<CoverageReport> {
        options.validate()?;
        let dest = self.guard.validate(dest_root)?;
        if !dest.as_path().is_dir() {
            return Err(Error::Validation(format!("destination {dest} does not exist")).into());
        }

        let expected_set = self.expected_files(expected)?;
        let present: BTreeMap<String, u64> = walk_tree(dest.as_path(), Some(&self.exclude))?
            .into_iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| (e.key(), e.size))
            .collect();

        let report = compute_report(&expected_set, &present, options);
        info!(
            total_expected = report.total_expected,
            total_found = report.total_found,
            coverage = report.coverage_percent,
            status = ?report.status,
            critical_missing = report.critical_missing.len(),
            "coverage audit finished"
        );
        Ok(report)
    }

    fn expected_files(&self, expected: &Expected) -> Result<BTreeMap<String, u64>> {
        match expected {
            Expected::Tree(root) => {
                let root = self.guard.validate(root)?;
                Ok(walk_tree(root.as_path(), Some(&self.exclude))?
                    .into_iter()
                    .filter(|e| e.kind == EntryKind::File)
                    .map(|e| (e.key(), e.size))
                    .collect())
            }
            Expected::Manifest(manifest) => {
                manifest.validate()?;
                Ok(manifest
                    .files
                    .iter()
                    .map(|f| (relative_key(Path::new(&f.path)), f.size))
                    .collect())
            }
        }
    }
}

/// Pure coverage computation over the two file sets.
pub fn compute_report(
    expected: &BTreeMap<String, u64>,
    present: &BTreeMap<String, u64>,
    options: &AuditOptions,
) -> CoverageReport {
    let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut size_mismatches = Vec::new();
    let mut total_found = 0usize;

    for (path, &expected_size) in expected {
        match present.get(path) {
            Some(&actual) => {
                total_found += 1;
                if options.check_sizes && actual != expected_size {
                    size_mismatches.push(SizeMismatch {
                        path: path.clone(),
                        expected: expected_size,
                        actual,
                    });
                }
            }
            None => missing
                .entry(report::group_of(path).to_string())
                .or_default()
                .push(path.clone()),
        }
    }

    let extra: Vec<String> = present
        .keys()
        .filter(|path| !expected.contains_key(*path))
        .cloned()
        .collect();

    let critical_missing: Vec<String> = options
        .critical
        .iter()
        .map(|c| relative_key(Path::new(c)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|c| !present.contains_key(c))
        .collect();

    let total_expected = expected.len();
    let coverage_percent = if total_expected == 0 {
        100.0
    } else {
        100.0 * total_found as f64 / total_expected as f64
    };
    let status = if coverage_percent >= options.threshold {
        CoverageStatus::Complete
    } else {
        CoverageStatus::Incomplete
    };

    CoverageReport {
        total_expected,
        total_found,
        total_missing: total_expected - total_found,
        missing,
        extra_files: extra.len(),
        extra,
        coverage_percent,
        size_mismatches,
        critical_missing,
        status,
        threshold: options.threshold,
    }
}
