//! The closed error taxonomy surfaced by the supervisor.
//!
//! Every fallible operation in `dispatchd-core` either returns a
//! [`SupervisorError`] directly or wraps one behind `anyhow::Error` at a
//! boundary (CLI commands, the HTTP status endpoint). Handlers match on
//! [`ErrorKind`] to decide whether a failure is retryable.

use thiserror::Error;

/// A closed classification of failure used for retry and reporting
/// decisions. Kept separate from [`SupervisorError`] so call sites can
/// match on kind without depending on the exact variant shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The agent process could not be spawned at all (binary missing, exec
    /// permission denied, etc).
    SpawnFailed,
    /// The process ran past its configured timeout and was killed.
    Timeout,
    /// The process exited with a non-zero status.
    NonZeroExit,
    /// The process's stdout could not be parsed as the expected JSON
    /// envelope.
    MalformedOutput,
    /// A git worktree or container workspace operation failed.
    WorkspaceFailed,
    /// A durable-store operation failed (I/O, constraint violation).
    StoreFailed,
    /// A dependency of this task resolved to a failed or cancelled state.
    DependencyFailed,
    /// The task or schedule was cancelled by an operator.
    Cancelled,
    /// Input failed validation before a task was ever queued.
    InvalidInput,
    /// An internal invariant was violated; indicates a bug rather than an
    /// environmental failure.
    Internal,
}

impl ErrorKind {
    /// Whether a task that failed with this kind should be eligible for
    /// automatic retry. Cancellation and validation failures never are.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Cancelled | ErrorKind::InvalidInput | ErrorKind::Internal
        )
    }
}

/// Top-level error type for the supervisor's core logic.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("agent process timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("agent process exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("agent output could not be parsed as JSON: {0}")]
    MalformedOutput(String),

    #[error("workspace operation failed: {0}")]
    WorkspaceFailed(#[source] anyhow::Error),

    #[error("durable store operation failed: {0}")]
    StoreFailed(#[source] anyhow::Error),

    #[error("dependency {depends_on} did not resolve successfully")]
    DependencyFailed { depends_on: uuid::Uuid },

    #[error("task was cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::SpawnFailed(_) => ErrorKind::SpawnFailed,
            SupervisorError::Timeout { .. } => ErrorKind::Timeout,
            SupervisorError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            SupervisorError::MalformedOutput(_) => ErrorKind::MalformedOutput,
            SupervisorError::WorkspaceFailed(_) => ErrorKind::WorkspaceFailed,
            SupervisorError::StoreFailed(_) => ErrorKind::StoreFailed,
            SupervisorError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            SupervisorError::Cancelled => ErrorKind::Cancelled,
            SupervisorError::InvalidInput(_) => ErrorKind::InvalidInput,
            SupervisorError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!SupervisorError::Cancelled.kind().is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = SupervisorError::Timeout { timeout_ms: 1000 };
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn invalid_input_is_not_retryable() {
        let err = SupervisorError::InvalidInput("bad prompt".into());
        assert!(!err.kind().is_retryable());
    }
}
