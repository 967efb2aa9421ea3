//! In-memory GitHub fake for integration tests.
//!
//! Single-repo semantics: file contents are keyed by path only, branches by
//! name. CI conclusions come from a scriptable queue (the last queued value
//! repeats once the queue drains; an empty queue means success).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;

use autodev_core::github::{CiConclusion, GithubClient, Issue, PullRequest};

#[derive(Default)]
pub struct FakeGithub {
    pub issues: Mutex<HashMap<i64, Issue>>,
    pub files: Mutex<HashMap<String, String>>,
    pub branches: Mutex<HashSet<String>>,
    pub ci_queue: Mutex<Vec<CiConclusion>>,
    pub applied_diffs: Mutex<Vec<(String, String)>>,
    pub prs: Mutex<Vec<PullRequest>>,
    pub pr_bodies: Mutex<HashMap<i64, String>>,
    pub comments: Mutex<Vec<(i64, String)>>,
    pub labels: Mutex<Vec<(i64, Vec<String>)>>,
    pub merged_prs: Mutex<HashSet<i64>>,
    next_pr_number: AtomicI64,
}

impl FakeGithub {
    pub fn new() -> Self {
        let fake = Self {
            next_pr_number: AtomicI64::new(100),
            ..Default::default()
        };
        fake.files
            .lock()
            .unwrap()
            .insert("src/a.ts".to_owned(), "const a = 1;\nexport { a };\n".to_owned());
        fake
    }

    pub fn add_issue(&self, number: i64, title: &str, body: &str) {
        self.issues.lock().unwrap().insert(
            number,
            Issue {
                number,
                title: title.to_owned(),
                body: body.to_owned(),
                labels: vec![],
            },
        );
    }

    /// Script the CI conclusions returned by successive `ci_conclusion`
    /// calls. The last entry repeats; an empty script means success.
    pub fn script_ci(&self, conclusions: &[CiConclusion]) {
        *self.ci_queue.lock().unwrap() = conclusions.to_vec();
    }

    pub fn mark_merged(&self, pr_number: i64) {
        self.merged_prs.lock().unwrap().insert(pr_number);
    }

    pub fn pr_count(&self) -> usize {
        self.prs.lock().unwrap().len()
    }
}

#[async_trait]
impl GithubClient for FakeGithub {
    async fn default_branch(&self, _repo: &str) -> Result<String> {
        Ok("main".to_owned())
    }

    async fn get_issue(&self, _repo: &str, number: i64) -> Result<Issue> {
        match self.issues.lock().unwrap().get(&number) {
            Some(issue) => Ok(issue.clone()),
            None => bail!("issue #{number} not found"),
        }
    }

    async fn branch_exists(&self, _repo: &str, branch: &str) -> Result<bool> {
        Ok(self.branches.lock().unwrap().contains(branch))
    }

    async fn create_branch(&self, _repo: &str, branch: &str, _from: &str) -> Result<()> {
        self.branches.lock().unwrap().insert(branch.to_owned());
        Ok(())
    }

    async fn list_files(&self, _repo: &str, _branch: &str) -> Result<Vec<String>> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    async fn get_file(&self, _repo: &str, _branch: &str, path: &str) -> Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn apply_diff(
        &self,
        _repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<String> {
        if !self.branches.lock().unwrap().contains(branch) {
            bail!("branch {branch} does not exist");
        }
        let mut applied = self.applied_diffs.lock().unwrap();
        applied.push((diff.to_owned(), commit_message.to_owned()));
        Ok(format!("sha{:07}", applied.len()))
    }

    async fn ci_conclusion(&self, _repo: &str, _branch: &str) -> Result<CiConclusion> {
        let mut queue = self.ci_queue.lock().unwrap();
        if queue.is_empty() {
            return Ok(CiConclusion::Success);
        }
        if queue.len() == 1 {
            return Ok(queue[0]);
        }
        Ok(queue.remove(0))
    }

    async fn create_pull_request(
        &self,
        _repo: &str,
        _head: &str,
        _base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let number = self.next_pr_number.fetch_add(1, Ordering::SeqCst);
        let pr = PullRequest {
            number,
            url: format!("https://github.com/acme/web/pull/{number}"),
            title: title.to_owned(),
        };
        self.prs.lock().unwrap().push(pr.clone());
        self.pr_bodies
            .lock()
            .unwrap()
            .insert(number, body.to_owned());
        Ok(pr)
    }

    async fn update_pull_request_body(
        &self,
        _repo: &str,
        number: i64,
        body: &str,
    ) -> Result<()> {
        self.pr_bodies
            .lock()
            .unwrap()
            .insert(number, body.to_owned());
        Ok(())
    }

    async fn comment_on_issue(&self, _repo: &str, number: i64, body: &str) -> Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((number, body.to_owned()));
        Ok(())
    }

    async fn add_labels(&self, _repo: &str, number: i64, labels: &[String]) -> Result<()> {
        self.labels
            .lock()
            .unwrap()
            .push((number, labels.to_vec()));
        Ok(())
    }

    async fn pr_merged(&self, _repo: &str, number: i64) -> Result<bool> {
        Ok(self.merged_prs.lock().unwrap().contains(&number))
    }
}
