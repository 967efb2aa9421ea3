//! Learning store collaborator interface.
//!
//! The engine records failure modes and fix patterns, and the planner and
//! fixer pull prior knowledge back in. The backing store is external; the
//! default wiring is a no-op.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::ErrorCode;

/// A previously-learned fix pattern matched against an error.
#[derive(Debug, Clone)]
pub struct FixPattern {
    pub error_snippet: String,
    pub fix_description: String,
}

/// Operations the engine performs against the learning backend.
#[async_trait]
pub trait LearningStore: Send + Sync {
    /// Known failure modes for an issue kind in a repo, as prompt-ready
    /// advice strings.
    async fn known_failure_modes(&self, repo: &str, issue_kind: &str) -> Result<Vec<String>>;

    /// Repo conventions above the given confidence threshold.
    async fn conventions(&self, repo: &str, min_confidence: f32) -> Result<Vec<String>>;

    /// Fix patterns whose recorded error resembles `error`.
    async fn similar_fixes(&self, error: &str) -> Result<Vec<FixPattern>>;

    /// Record a terminal failure with an avoidance strategy.
    async fn record_failure(
        &self,
        repo: &str,
        issue_kind: &str,
        error: &str,
        avoidance: &str,
    ) -> Result<()>;

    /// Record a fix that made a previously-failing test run pass.
    async fn record_fix_pattern(&self, repo: &str, error: &str, fix_description: &str)
    -> Result<()>;
}

/// No-op learning store used when `ENABLE_LEARNING` is off or no backend is
/// wired up.
pub struct NoopLearning;

#[async_trait]
impl LearningStore for NoopLearning {
    async fn known_failure_modes(&self, _repo: &str, _kind: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn conventions(&self, _repo: &str, _min_confidence: f32) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn similar_fixes(&self, _error: &str) -> Result<Vec<FixPattern>> {
        Ok(Vec::new())
    }

    async fn record_failure(
        &self,
        _repo: &str,
        _kind: &str,
        _error: &str,
        _avoidance: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn record_fix_pattern(&self, _repo: &str, _error: &str, _fix: &str) -> Result<()> {
        Ok(())
    }
}

/// Rough issue classification used to key failure modes.
pub fn issue_kind(title: &str, body: &str) -> &'static str {
    let haystack = format!("{} {}", title.to_lowercase(), body.to_lowercase());
    if haystack.contains("bug") || haystack.contains("fix") || haystack.contains("crash") {
        "bug"
    } else if haystack.contains("refactor") || haystack.contains("clean") {
        "refactor"
    } else if haystack.contains("test") {
        "test"
    } else if haystack.contains("doc") {
        "docs"
    } else {
        "feature"
    }
}

/// Derive an avoidance strategy from the terminal error code, recorded with
/// the failure so the planner can warn future attempts.
pub fn avoidance_strategy(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::ComplexityTooHigh => {
            "break the issue into smaller issues before labeling it for automation"
        }
        ErrorCode::DiffTooLarge => "scope the plan to fewer files and smaller changes",
        ErrorCode::InvalidDiff => "regenerate the diff with strict unified-diff formatting",
        ErrorCode::TypecheckFailed => "inspect type errors in target files before writing the diff",
        ErrorCode::CommandFailed => "verify project commands locally before relying on them",
        ErrorCode::SubtaskFailed => "review subtask dependency ordering in the breakdown",
        ErrorCode::MaxAttemptsReached => {
            "escalate to a human earlier when repeated CI failures show no progress"
        }
        ErrorCode::InvalidState | ErrorCode::MissingField => {
            "audit orchestrator bookkeeping; this failure indicates an engine bug"
        }
        ErrorCode::UnknownError => "inspect the event log for the unclassified error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_kind_classification() {
        assert_eq!(issue_kind("Fix crash on startup", ""), "bug");
        assert_eq!(issue_kind("Refactor config loader", ""), "refactor");
        assert_eq!(issue_kind("Add dark mode", "users want it"), "feature");
        assert_eq!(issue_kind("Improve docs", ""), "docs");
    }

    #[tokio::test]
    async fn noop_store_returns_empty() {
        let store = NoopLearning;
        assert!(store.known_failure_modes("a/b", "bug").await.unwrap().is_empty());
        assert!(store.similar_fixes("boom").await.unwrap().is_empty());
        store
            .record_failure("a/b", "bug", "err", "avoid")
            .await
            .unwrap();
    }
}
