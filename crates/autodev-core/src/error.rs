//! Orchestrator error taxonomy.
//!
//! Every handler failure is converted into an [`OrchestratorError`] before
//! the task is failed; the code ends up as the `[CODE]` prefix of the task's
//! `last_error` and in the FAILED event metadata.

use std::fmt;

/// Classified failure causes. `recoverable()` says whether the FIX loop may
/// still rescue the task (until its attempt budget runs out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Driver invoked in a status the handler does not accept.
    InvalidState,
    /// A field required by the current phase is absent.
    MissingField,
    /// The planner estimated XL complexity.
    ComplexityTooHigh,
    /// The coder produced a diff over the line cap.
    DiffTooLarge,
    /// The diff validator rejected the diff structurally.
    InvalidDiff,
    /// The project typecheck failed against the applied diff.
    TypecheckFailed,
    /// A pre- or post-diff project command failed.
    CommandFailed,
    /// A child subtask failed, failing the orchestrated parent.
    SubtaskFailed,
    /// The attempt budget is exhausted.
    MaxAttemptsReached,
    /// Fallback wrapper for unexpected errors.
    UnknownError,
}

impl ErrorCode {
    /// Whether the failure leaves the task eligible for another attempt.
    pub fn recoverable(self) -> bool {
        matches!(
            self,
            Self::InvalidDiff | Self::TypecheckFailed | Self::CommandFailed
        )
    }

    /// The bracketed tag used in `last_error` strings.
    pub fn tag(self) -> &'static str {
        match self {
            Self::InvalidState => "INVALID_STATE",
            Self::MissingField => "MISSING_FIELD",
            Self::ComplexityTooHigh => "COMPLEXITY_TOO_HIGH",
            Self::DiffTooLarge => "DIFF_TOO_LARGE",
            Self::InvalidDiff => "INVALID_DIFF",
            Self::TypecheckFailed => "TYPECHECK_FAILED",
            Self::CommandFailed => "COMMAND_FAILED",
            Self::SubtaskFailed => "SUBTASK_FAILED",
            Self::MaxAttemptsReached => "MAX_ATTEMPTS_REACHED",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A classified orchestrator failure.
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct OrchestratorError {
    pub code: ErrorCode,
    pub message: String,
}

impl OrchestratorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn recoverable(&self) -> bool {
        self.code.recoverable()
    }

    /// Wrap an arbitrary error as UNKNOWN_ERROR.
    pub fn unknown(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnknownError, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_bracketed_code() {
        let err = OrchestratorError::new(ErrorCode::MaxAttemptsReached, "attempt 3 of 3");
        assert_eq!(err.to_string(), "[MAX_ATTEMPTS_REACHED] attempt 3 of 3");
    }

    #[test]
    fn recoverability_partition() {
        let recoverable = [
            ErrorCode::InvalidDiff,
            ErrorCode::TypecheckFailed,
            ErrorCode::CommandFailed,
        ];
        let terminal = [
            ErrorCode::InvalidState,
            ErrorCode::MissingField,
            ErrorCode::ComplexityTooHigh,
            ErrorCode::DiffTooLarge,
            ErrorCode::SubtaskFailed,
            ErrorCode::MaxAttemptsReached,
        ];
        for code in recoverable {
            assert!(code.recoverable(), "{code} should be recoverable");
        }
        for code in terminal {
            assert!(!code.recoverable(), "{code} should not be recoverable");
        }
    }
}
