//! Filesystem helpers shared by the vault, the copier and the auditor.
//!
//! Provides a single normalized tree walk, pure exclusion/permission
//! predicates over its entries, atomic single-file writes and the
//! structure-preserving [`copier::TreeCopier`].

pub mod atomic;
pub mod copier;
pub mod rules;
pub mod walk;

pub use atomic::{copy_file_atomic, sha256_file, write_atomic, OverwritePolicy};
pub use copier::{CancelToken, CopyFailure, CopyOptions, CopyReport, TimestampPolicy, TreeCopier};
pub use rules::{ExcludeRules, PermissionRules};
pub use walk::{relative_key, walk_tree, EntryKind, TreeEntry};
