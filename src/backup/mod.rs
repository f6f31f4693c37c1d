//! Backup vault.
//!
//! Takes owner-only snapshots of an installation before anything destructive
//! happens and restores them on rollback. Each snapshot lives in a sibling
//! directory named after its timestamp id and carries its own manifest.

pub mod retention;
pub mod snapshot;
pub mod vault;

pub use retention::RetentionPolicy;
pub use snapshot::{BackupSnapshot, FileEntry, SNAPSHOT_MANIFEST};
pub use vault::{BackupVault, RestoreOptions, RestoreSummary};
