//! REST-backed [`GithubClient`] implementation.
//!
//! Read operations and PR/issue mutations go through the GitHub REST API.
//! Diff application is git-based: a shallow clone in a scoped directory,
//! `git apply`, commit, push. The engine validates diff shape elsewhere;
//! here the diff is opaque.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;

use crate::diff::full::run_with_timeout;

use super::{CiConclusion, GithubClient, Issue, PullRequest};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "autodev-engine";

pub struct HttpGithub {
    client: reqwest::Client,
    token: String,
    subprocess_timeout: Duration,
}

impl HttpGithub {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            subprocess_timeout: Duration::from_secs(300),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{API_BASE}{path}"))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{what} failed (status {status}): {}", self.scrub(&body));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("{what} returned a malformed body"))
    }

    fn scrub(&self, text: &str) -> String {
        if self.token.is_empty() {
            text.to_owned()
        } else {
            text.replace(self.token.as_str(), "***")
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<LabelResponse>,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: i64,
    html_url: String,
    title: String,
}

#[async_trait]
impl GithubClient for HttpGithub {
    async fn default_branch(&self, repo: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, &format!("/repos/{repo}"))
            .send()
            .await
            .context("failed to fetch repository")?;
        let parsed: RepoResponse = self.expect_json(response, "fetch repository").await?;
        Ok(parsed.default_branch)
    }

    async fn get_issue(&self, repo: &str, number: i64) -> Result<Issue> {
        let response = self
            .request(reqwest::Method::GET, &format!("/repos/{repo}/issues/{number}"))
            .send()
            .await
            .context("failed to fetch issue")?;
        let parsed: IssueResponse = self.expect_json(response, "fetch issue").await?;
        Ok(Issue {
            number: parsed.number,
            title: parsed.title,
            body: parsed.body.unwrap_or_default(),
            labels: parsed.labels.into_iter().map(|l| l.name).collect(),
        })
    }

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/git/ref/heads/{branch}"),
            )
            .send()
            .await
            .context("failed to check branch")?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("branch check failed (status {status}): {}", self.scrub(&body))
            }
        }
    }

    async fn create_branch(&self, repo: &str, branch: &str, from_branch: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/git/ref/heads/{from_branch}"),
            )
            .send()
            .await
            .context("failed to resolve base branch")?;
        let base: RefResponse = self.expect_json(response, "resolve base branch").await?;

        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{repo}/git/refs"))
            .json(&json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": base.object.sha,
            }))
            .send()
            .await
            .context("failed to create branch")?;
        let _: serde_json::Value = self.expect_json(response, "create branch").await?;
        Ok(())
    }

    async fn list_files(&self, repo: &str, branch: &str) -> Result<Vec<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/git/trees/{branch}?recursive=1"),
            )
            .send()
            .await
            .context("failed to list repository tree")?;
        let parsed: TreeResponse = self.expect_json(response, "list repository tree").await?;
        Ok(parsed
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| e.path)
            .collect())
    }

    async fn get_file(&self, repo: &str, branch: &str, path: &str) -> Result<Option<String>> {
        // The raw media type skips base64 decoding entirely.
        let response = self
            .client
            .get(format!("{API_BASE}/repos/{repo}/contents/{path}"))
            .query(&[("ref", branch)])
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github.raw")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("failed to fetch file contents")?;
        match response.status().as_u16() {
            200 => Ok(Some(response.text().await.context("failed to read file body")?)),
            404 => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!(
                    "fetch file {path} failed (status {status}): {}",
                    self.scrub(&body)
                )
            }
        }
    }

    async fn apply_diff(
        &self,
        repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<String> {
        let workdir = tempfile::Builder::new()
            .prefix("autodev-apply-")
            .tempdir()
            .context("failed to create apply workspace")?;
        let checkout = workdir.path().join("repo");

        let url = format!("https://x-access-token:{}@github.com/{repo}.git", self.token);

        let mut clone = Command::new("git");
        clone
            .args(["clone", "--depth", "1", "--branch", branch, &url])
            .arg(&checkout);
        let out = run_with_timeout(clone, None, self.subprocess_timeout).await?;
        if !out.success {
            bail!("clone for apply failed: {}", self.scrub(&out.stderr));
        }

        let mut apply = Command::new("git");
        apply
            .args(["apply", "--whitespace=nowarn", "-"])
            .current_dir(&checkout);
        let out = run_with_timeout(apply, Some(diff), self.subprocess_timeout).await?;
        if !out.success {
            bail!("git apply failed: {}", self.scrub(&out.stderr));
        }

        for args in [
            vec!["config", "user.email", "autodev@localhost"],
            vec!["config", "user.name", "autodev"],
            vec!["add", "-A"],
        ] {
            let mut cmd = Command::new("git");
            cmd.args(&args).current_dir(&checkout);
            let out = run_with_timeout(cmd, None, self.subprocess_timeout).await?;
            if !out.success {
                bail!("git {} failed: {}", args.join(" "), self.scrub(&out.stderr));
            }
        }

        let mut commit = Command::new("git");
        commit
            .args(["commit", "-m", commit_message])
            .current_dir(&checkout);
        let out = run_with_timeout(commit, None, self.subprocess_timeout).await?;
        if !out.success {
            bail!("git commit failed: {}", self.scrub(&out.stderr));
        }

        let mut push = Command::new("git");
        push.args(["push", "origin", branch]).current_dir(&checkout);
        let out = run_with_timeout(push, None, self.subprocess_timeout).await?;
        if !out.success {
            bail!("git push failed: {}", self.scrub(&out.stderr));
        }

        let mut rev = Command::new("git");
        rev.args(["rev-parse", "HEAD"]).current_dir(&checkout);
        let out = run_with_timeout(rev, None, self.subprocess_timeout).await?;
        Ok(out.stdout.trim().to_owned())
    }

    async fn ci_conclusion(&self, repo: &str, branch: &str) -> Result<CiConclusion> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/commits/{branch}/check-runs"),
            )
            .send()
            .await
            .context("failed to fetch check runs")?;
        let parsed: CheckRunsResponse = self.expect_json(response, "fetch check runs").await?;

        if parsed.check_runs.is_empty() {
            return Ok(CiConclusion::None);
        }
        if parsed.check_runs.iter().any(|r| r.status != "completed") {
            return Ok(CiConclusion::Pending);
        }
        let failed = parsed.check_runs.iter().any(|r| {
            matches!(
                r.conclusion.as_deref(),
                Some("failure") | Some("timed_out") | Some("cancelled") | Some("action_required")
            )
        });
        Ok(if failed {
            CiConclusion::Failure
        } else {
            CiConclusion::Success
        })
    }

    async fn create_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{repo}/pulls"))
            .json(&json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
            }))
            .send()
            .await
            .context("failed to create pull request")?;
        let parsed: PullResponse = self.expect_json(response, "create pull request").await?;
        Ok(PullRequest {
            number: parsed.number,
            url: parsed.html_url,
            title: parsed.title,
        })
    }

    async fn update_pull_request_body(&self, repo: &str, number: i64, body: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::PATCH, &format!("/repos/{repo}/pulls/{number}"))
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("failed to update pull request")?;
        let _: serde_json::Value = self.expect_json(response, "update pull request").await?;
        Ok(())
    }

    async fn comment_on_issue(&self, repo: &str, number: i64, body: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{number}/comments"),
            )
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("failed to comment on issue")?;
        let _: serde_json::Value = self.expect_json(response, "comment on issue").await?;
        Ok(())
    }

    async fn add_labels(&self, repo: &str, number: i64, labels: &[String]) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{number}/labels"),
            )
            .json(&json!({ "labels": labels }))
            .send()
            .await
            .context("failed to add labels")?;
        let _: serde_json::Value = self.expect_json(response, "add labels").await?;
        Ok(())
    }

    async fn pr_merged(&self, repo: &str, number: i64) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/pulls/{number}/merge"),
            )
            .send()
            .await
            .context("failed to check PR merge state")?;
        match response.status().as_u16() {
            204 => Ok(true),
            404 => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!(
                    "merge check failed (status {status}): {}",
                    self.scrub(&body)
                )
            }
        }
    }
}
