//! GitHub collaborator interface.
//!
//! The engine talks to GitHub exclusively through [`GithubClient`]; the
//! orchestrator never issues HTTP itself. [`http::HttpGithub`] is the real
//! implementation; tests substitute an in-memory fake.

pub mod http;

use anyhow::Result;
use async_trait::async_trait;

/// A GitHub issue, as much of it as the engine needs.
#[derive(Debug, Clone)]
pub struct Issue {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// A pull request the engine created or updated.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
    pub title: String,
}

/// Aggregated CI outcome for a branch head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiConclusion {
    /// All check runs completed successfully.
    Success,
    /// At least one check run failed, timed out, or was cancelled.
    Failure,
    /// Check runs exist but have not all completed.
    Pending,
    /// The repository has no check runs for this ref.
    None,
}

/// Operations the engine needs from GitHub.
///
/// Object-safe so the orchestrator can hold `Arc<dyn GithubClient>`.
#[async_trait]
pub trait GithubClient: Send + Sync {
    /// The repository's default branch name.
    async fn default_branch(&self, repo: &str) -> Result<String>;

    async fn get_issue(&self, repo: &str, number: i64) -> Result<Issue>;

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool>;

    /// Create `branch` pointing at the head of `from_branch`.
    async fn create_branch(&self, repo: &str, branch: &str, from_branch: &str) -> Result<()>;

    /// Repo-relative paths of all source files at the branch head.
    async fn list_files(&self, repo: &str, branch: &str) -> Result<Vec<String>>;

    /// File contents at the branch head, `None` when the path is absent.
    async fn get_file(&self, repo: &str, branch: &str, path: &str) -> Result<Option<String>>;

    /// Apply a unified diff as a commit on `branch`. Returns the commit sha.
    async fn apply_diff(
        &self,
        repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<String>;

    /// Aggregated check-run conclusion for the branch head.
    async fn ci_conclusion(&self, repo: &str, branch: &str) -> Result<CiConclusion>;

    async fn create_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;

    async fn update_pull_request_body(&self, repo: &str, number: i64, body: &str) -> Result<()>;

    /// Comment on an issue or pull request (GitHub treats both the same).
    async fn comment_on_issue(&self, repo: &str, number: i64, body: &str) -> Result<()>;

    async fn add_labels(&self, repo: &str, number: i64, labels: &[String]) -> Result<()>;

    /// Whether the pull request has been merged.
    async fn pr_merged(&self, repo: &str, number: i64) -> Result<bool>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn GithubClient) {}
};
