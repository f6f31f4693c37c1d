use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::BackupSnapshot;

const MAX_AGE_SECONDS: u64 = (i64::MAX / 1000) as u64;

/// How many snapshots survive a prune. Callers choose explicitly; there is
/// no implied default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    KeepAll,
    KeepLast { count: usize },
    MaxAge { seconds: u64 },
}

impl RetentionPolicy {
    /// Snapshots to delete. `snapshots` must be ordered newest first.
    pub fn expired<'a>(
        &self,
        snapshots: &'a [BackupSnapshot],
        now: DateTime<Utc>,
    ) -> Vec<&'a BackupSnapshot> {
        match *self {
            RetentionPolicy::KeepAll => Vec::new(),
            RetentionPolicy::KeepLast { count } => snapshots.iter().skip(count).collect(),
            RetentionPolicy::MaxAge { seconds } => {
                // chrono panics on durations beyond i64::MAX milliseconds
                let max_age = Duration::seconds(seconds.min(MAX_AGE_SECONDS) as i64);
                snapshots
                    .iter()
                    .filter(|s| now.signed_duration_since(s.created_at) > max_age)
                    .collect()
            }
        }
    }
}
