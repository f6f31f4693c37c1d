//! Validation for names that are used to derive a filename.
//!
//! No shell is ever invoked with these names; rejecting metacharacters keeps
//! derived files safe to handle with external tooling anyway.

use std::path::Path;

use super::MAX_NAME_LEN;
use crate::{logging::log_path_rejected, Error, Result};

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '!', '~', '\'',
    '"', '\\',
];

pub fn validate_file_name(name: &str) -> Result<&str> {
    if name.contains('\0') {
        log_path_rejected(Path::new("<name>"), "null byte in file name");
        return Err(Error::SecurityViolation("file name contains a null byte".into()).into());
    }

    let reason = if name.is_empty() {
        Some("file name is empty")
    } else if name == "." || name == ".." {
        Some("file name is a relative directory reference")
    } else if name.contains('/') {
        Some("file name contains a path separator")
    } else if name.len() > MAX_NAME_LEN {
        Some("file name exceeds length limit")
    } else if name.chars().any(char::is_control) {
        Some("file name contains control characters")
    } else if name
        .chars()
        .any(|c| c.is_whitespace() || SHELL_METACHARACTERS.contains(&c))
    {
        Some("file name contains shell metacharacters")
    } else {
        None
    };

    match reason {
        Some(reason) => {
            log_path_rejected(Path::new(name), reason);
            Err(Error::Validation(reason.into()).into())
        }
        None => Ok(name),
    }
}
