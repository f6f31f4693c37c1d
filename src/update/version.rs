//! Release version parsing and ordering.
//!
//! Ordering is numeric on `major.minor.patch`. A release without a
//! pre-release tag outranks the same base version carrying one, and two
//! tagged builds of the same base compare their tags lexicographically.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let text = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        // build metadata never participates in ordering
        let text = text.split_once('+').map_or(text, |(head, _)| head);
        let (base, pre) = match text.split_once('-') {
            Some((base, pre)) if !pre.is_empty() => (base, Some(pre.to_string())),
            Some(_) => return Err(invalid(raw, "empty pre-release tag")),
            None => (text, None),
        };

        let mut parts = base.split('.');
        let mut next = |label: &str| -> Result<u64> {
            let part = parts
                .next()
                .ok_or_else(|| invalid(raw, &format!("missing {label} component")))?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(raw, &format!("{label} component is not numeric")));
            }
            part.parse::<u64>()
                .map_err(|_| invalid(raw, &format!("{label} component out of range")))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(invalid(raw, "too many components"));
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    pub fn base(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

fn invalid(raw: &str, reason: &str) -> anyhow::Error {
    Error::Validation(format!("invalid version {raw:?}: {reason}")).into()
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base().cmp(&other.base()).then_with(|| match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionDelta {
    UpgradeAvailable,
    Current,
    /// The available release ranks below what is installed.
    DowngradeRisk,
}

pub fn compare(installed: &Version, available: &Version) -> VersionDelta {
    match installed.cmp(available) {
        Ordering::Less => VersionDelta::UpgradeAvailable,
        Ordering::Equal => VersionDelta::Current,
        Ordering::Greater => VersionDelta::DowngradeRisk,
    }
}

/// Parse both strings and compare them.
pub fn compare_str(installed: &str, available: &str) -> Result<VersionDelta> {
    Ok(compare(&Version::parse(installed)?, &Version::parse(available)?))
}
