//! Input validation applied before a task or schedule is ever persisted.
//!
//! Kept as pure functions over primitive types so the CLI layer and the
//! delegation handler can both call them without sharing a request
//! struct, and so each rule is trivially unit-testable.

use crate::error::SupervisorError;

pub const MIN_BUFFER_BYTES: i64 = 1024;
pub const MAX_BUFFER_BYTES: i64 = 1 << 30;
pub const MIN_TIMEOUT_MS: i64 = 1_000;
pub const MAX_TIMEOUT_MS: i64 = 24 * 60 * 60 * 1000;
pub const MAX_BRANCH_NAME_LEN: usize = 100;

/// Working directories must be absolute and free of `..` traversal.
pub fn validate_working_directory(path: &str) -> Result<(), SupervisorError> {
    if !path.starts_with('/') {
        return Err(SupervisorError::InvalidInput(format!(
            "working directory must be absolute: {path}"
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(SupervisorError::InvalidInput(format!(
            "working directory must not contain '..': {path}"
        )));
    }
    Ok(())
}

/// Sanitize a user-supplied branch name: replace disallowed characters
/// with `-`, trim leading/trailing `-`, and cap the length.
pub fn sanitize_branch_name(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_BRANCH_NAME_LEN).collect();
    truncated.trim_matches('-').to_string()
}

pub fn validate_buffer_size(bytes: i64) -> Result<(), SupervisorError> {
    if !(MIN_BUFFER_BYTES..=MAX_BUFFER_BYTES).contains(&bytes) {
        return Err(SupervisorError::InvalidInput(format!(
            "max_output_buffer must be between {MIN_BUFFER_BYTES} and {MAX_BUFFER_BYTES} bytes, got {bytes}"
        )));
    }
    Ok(())
}

pub fn validate_timeout_ms(ms: i64) -> Result<(), SupervisorError> {
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) {
        return Err(SupervisorError::InvalidInput(format!(
            "timeout must be between {MIN_TIMEOUT_MS}ms and {MAX_TIMEOUT_MS}ms, got {ms}"
        )));
    }
    Ok(())
}
