use thiserror::Error;

pub mod backup;
pub mod config;
pub mod coverage;
pub mod fs;
pub mod guard;
pub mod logging;
pub mod retrofit;
pub mod update;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    /// Path escapes the allow-list, resolves through a symlink to a foreign
    /// location, or names a forbidden segment. Never retried.
    #[error("security violation: {0}")]
    SecurityViolation(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("backup failed: {0}")]
    Backup(String),
    #[error("invalid state transition: {0}")]
    State(String),
    #[error("copy failed for {path}: {reason}")]
    Copy { path: String, reason: String },
    #[error("update lock held: {0}")]
    LockHeld(String),
    #[error("operation cancelled after {0} files")]
    Cancelled(usize),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller can fix its input (or wait) and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::LockHeld(_) | Error::Cancelled(_) | Error::Io(_)
        )
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, Error::SecurityViolation(_))
    }
}

/// Classify an `anyhow` error produced by this crate.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.downcast_ref::<Error>()
}
