//! Logging initialization using `tracing` and `tracing-subscriber`, plus the
//! audit sink used to report update steps.

use std::path::Path;

use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Target used for every audit record so they can be filtered independently.
pub const AUDIT_TARGET: &str = "plugup::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

/// Render a path for logs and error messages without disclosing where it
/// lives on the system: only the final component survives.
pub fn redact_path(path: &Path) -> String {
    match path.file_name() {
        Some(name) => format!(".../{}", name.to_string_lossy()),
        None => "<root>".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Succeeded => "succeeded",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
        }
    }
}

/// Receiver for `(event_name, status, structured_details)` audit records.
///
/// Details must never carry file contents or secrets; paths are expected to
/// be relative or redacted before they get here.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &str, status: AuditStatus, details: &serde_json::Value);
}

/// Default sink: forwards audit records to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &str, status: AuditStatus, details: &serde_json::Value) {
        match status {
            AuditStatus::Failed => error!(
                target: AUDIT_TARGET,
                event,
                status = status.as_str(),
                details = %details,
                "audit"
            ),
            _ => info!(
                target: AUDIT_TARGET,
                event,
                status = status.as_str(),
                details = %details,
                "audit"
            ),
        }
    }
}

/// Emit the audit record for a rejected path. `reason` must already be
/// sanitized.
pub fn log_path_rejected(path: &Path, reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "path_rejected",
        path = %redact_path(path),
        reason,
        "path_rejected"
    );
}

/// Counters describing a snapshot or restore, emitted without content.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultIoSnapshot {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

pub fn log_vault_operation(operation: &str, snapshot_id: &str, caller: &str, io: VaultIoSnapshot) {
    info!(
        target: AUDIT_TARGET,
        event = operation,
        snapshot_id,
        caller,
        files = io.files,
        directories = io.directories,
        bytes = io.bytes,
        "vault_operation"
    );
}

pub fn log_vault_failure(operation: &str, caller: &str, attempt: u32, reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = operation,
        caller,
        attempt,
        reason,
        "vault_operation_failed"
    );
}
