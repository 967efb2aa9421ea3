//! Single-task driver.
//!
//! `process` executes exactly one step for a task: read the status, pick the
//! action, run the handler, persist the outcome. Every failure funnels
//! through [`Orchestrator::fail_task`], every phase completion emits a
//! `TaskEvent`, and a terminal task is a no-op.
//!
//! Phase handlers live in [`phases`]; breakdown and subtask orchestration in
//! [`subtasks`].

mod phases;
mod subtasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::{EventType, Task, TaskStatus};
use autodev_db::queries::events::{self, NewTaskEvent};
use autodev_db::queries::tasks as task_db;

use crate::config::EngineConfig;
use crate::error::{ErrorCode, OrchestratorError};
use crate::foreman::Foreman;
use crate::github::{CiConclusion, GithubClient};
use crate::learning::{self, LearningStore};
use crate::linear::LinearClient;
use crate::llm::ProviderRegistry;
use crate::state::{self, NextAction, store};

/// The single-task driver. All collaborators are explicit dependencies;
/// nothing global beyond the configuration loaded at startup.
pub struct Orchestrator {
    pool: PgPool,
    llm: Arc<ProviderRegistry>,
    github: Arc<dyn GithubClient>,
    linear: Option<Arc<dyn LinearClient>>,
    learning: Arc<dyn LearningStore>,
    foreman: Foreman,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        llm: Arc<ProviderRegistry>,
        github: Arc<dyn GithubClient>,
        linear: Option<Arc<dyn LinearClient>>,
        learning: Arc<dyn LearningStore>,
        config: EngineConfig,
    ) -> Self {
        let foreman = Foreman::new(
            config.credentials.github_token.clone(),
            config.foreman_max_attempts,
        );
        Self {
            pool,
            llm,
            github,
            linear,
            learning,
            foreman,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn linear(&self) -> Option<&Arc<dyn LinearClient>> {
        self.linear.as_ref()
    }

    pub fn github(&self) -> &Arc<dyn GithubClient> {
        &self.github
    }

    /// Execute exactly one step for the task. Idempotent on terminal
    /// statuses: the input comes back unchanged and no events are emitted.
    pub async fn process(&self, task: Task) -> Result<Task> {
        if state::is_terminal(task.status) {
            return Ok(task);
        }

        let task_id = task.id;
        let action = self.decide(&task);

        tracing::info!(
            task_id = %task_id,
            repo = %task.repo,
            issue = task.issue_number,
            status = %task.status,
            action = ?action,
            "processing task step"
        );

        let result = match action {
            NextAction::Plan => self.handle_plan(task).await,
            NextAction::Breakdown => self.handle_breakdown(task).await,
            NextAction::Orchestrate => self.handle_orchestrate(task).await,
            NextAction::Code => self.handle_code(task).await,
            NextAction::Test => self.handle_test(task).await,
            NextAction::Fix => self.handle_fix(task).await,
            NextAction::Reflect => self.handle_reflect(task).await,
            NextAction::Replan => self.handle_replan(task).await,
            NextAction::Review => self.handle_review(task).await,
            NextAction::OpenPr => self.handle_open_pr(task).await,
            NextAction::Wait => self.handle_waiting(task).await,
            // Terminal actions are unreachable past the guard above.
            NextAction::Done | NextAction::Failed => return Ok(task),
        };

        match result {
            Ok(task) => Ok(task),
            Err(err) => {
                let classified = match err.downcast::<OrchestratorError>() {
                    Ok(orch_err) => orch_err,
                    Err(other) => OrchestratorError::unknown(format!("{other:#}")),
                };
                self.fail_task(task_id, classified).await
            }
        }
    }

    /// Refine the pure `next_action` with task fields: a PLANNING_DONE task
    /// whose complexity demands decomposition goes to breakdown instead of
    /// straight to coding. Subtasks and already-orchestrated tasks never
    /// decompose again.
    fn decide(&self, task: &Task) -> NextAction {
        use autodev_db::models::Complexity;

        let action = state::next_action(task.status);
        if action == NextAction::Code
            && task.status == TaskStatus::PlanningDone
            && matches!(
                task.estimated_complexity,
                Some(Complexity::M) | Some(Complexity::L)
            )
            && !task.is_subtask()
            && task.orchestration_state.is_none()
        {
            return NextAction::Breakdown;
        }
        action
    }

    /// Resume paths for waiting statuses. TESTING polls CI once;
    /// WAITING_HUMAN completes the task when its PR has merged. Everything
    /// else returns unchanged -- the in-flight operation owns the task.
    async fn handle_waiting(&self, task: Task) -> Result<Task> {
        match task.status {
            TaskStatus::Testing => self.check_ci_once(task).await,
            TaskStatus::WaitingHuman => self.check_pr_merged(task).await,
            _ => Ok(task),
        }
    }

    async fn check_pr_merged(&self, task: Task) -> Result<Task> {
        let Some(pr_number) = task.pr_number else {
            return Ok(task);
        };
        if !self.github.pr_merged(&task.repo, pr_number).await? {
            return Ok(task);
        }

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::WaitingHuman,
            TaskStatus::Completed,
        )
        .await?;
        self.emit(
            NewTaskEvent {
                output_summary: Some(format!("PR #{pr_number} merged")),
                ..NewTaskEvent::new(task.id, EventType::Completed, "orchestrator")
            },
        )
        .await?;

        tracing::info!(task_id = %task.id, pr = pr_number, "task completed on PR merge");
        self.reload(task.id).await
    }

    /// One non-blocking CI check for a task parked in TESTING.
    async fn check_ci_once(&self, task: Task) -> Result<Task> {
        match self.github.ci_conclusion(&task.repo, self.branch_of(&task)?).await? {
            CiConclusion::Pending => Ok(task),
            CiConclusion::Success | CiConclusion::None => self.tests_passed(task).await,
            CiConclusion::Failure => self.tests_failed(task, "CI reported a failing conclusion").await,
        }
    }

    /// Manual or webhook-driven review rejection of a task awaiting a
    /// human. Increments the attempt counter and routes the feedback into
    /// the next CODE pass.
    pub async fn reject_with_feedback(&self, task: Task, feedback: &str) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::WaitingHuman],
            &[("pr_number", task.pr_number.is_some())],
        )?;

        let attempts = task_db::increment_attempts(&self.pool, task.id).await?;
        if attempts >= task.max_attempts {
            let err = OrchestratorError::new(
                ErrorCode::MaxAttemptsReached,
                format!("attempt {attempts} of {} after human rejection", task.max_attempts),
            );
            return self.fail_task(task.id, err).await;
        }

        task_db::set_last_error(&self.pool, task.id, feedback).await?;
        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::WaitingHuman,
            TaskStatus::ReviewRejected,
        )
        .await?;

        self.emit(NewTaskEvent {
            input_summary: Some(feedback.to_owned()),
            metadata: serde_json::json!({"source": "human", "verdict": "REQUEST_CHANGES"}),
            ..NewTaskEvent::new(task.id, EventType::Reviewed, "human")
        })
        .await?;

        self.reload(task.id).await
    }

    // -----------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------

    /// Guard a handler: wrong status or a missing required field is a
    /// non-recoverable bookkeeping failure.
    fn validate_task(
        &self,
        task: &Task,
        expected: &[TaskStatus],
        required_fields: &[(&str, bool)],
    ) -> Result<(), OrchestratorError> {
        if !expected.contains(&task.status) {
            return Err(OrchestratorError::new(
                ErrorCode::InvalidState,
                format!(
                    "task {} has status {}, expected one of {:?}",
                    task.id,
                    task.status,
                    expected.iter().map(|s| s.to_string()).collect::<Vec<_>>()
                ),
            ));
        }
        for (name, present) in required_fields {
            if !present {
                return Err(OrchestratorError::new(
                    ErrorCode::MissingField,
                    format!("task {} is missing required field {name}", task.id),
                ));
            }
        }
        Ok(())
    }

    /// The only path to FAILED: set status and `last_error`, emit the FAILED
    /// event, feed the learning store, and optionally comment on the issue.
    pub(crate) async fn fail_task(
        &self,
        task_id: Uuid,
        err: OrchestratorError,
    ) -> Result<Task> {
        let task = self
            .reload(task_id)
            .await
            .with_context(|| format!("failing task {task_id}"))?;

        tracing::warn!(
            task_id = %task_id,
            code = %err.code,
            recoverable = err.recoverable(),
            "task failed terminally: {}",
            err.message
        );

        store::apply_failure(&self.pool, task_id, task.status).await?;
        task_db::set_last_error(&self.pool, task_id, &err.to_string()).await?;

        self.emit(NewTaskEvent {
            output_summary: Some(err.message.clone()),
            metadata: serde_json::json!({
                "code": err.code.tag(),
                "recoverable": err.recoverable(),
                "status_at_failure": task.status.to_string(),
            }),
            ..NewTaskEvent::new(task_id, EventType::Failed, "orchestrator")
        })
        .await?;

        if self.config.enable_learning {
            let kind = learning::issue_kind(&task.title, &task.body);
            let avoidance = learning::avoidance_strategy(err.code);
            if let Err(e) = self
                .learning
                .record_failure(&task.repo, kind, &err.message, avoidance)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "failed to record failure mode");
            }
        }

        if self.config.comment_on_failure {
            let body = format!(
                "Automated development of this issue failed.\n\n\
                 **Error:** `{}`\n\nThe task's event log has the full history.",
                err
            );
            if let Err(e) = self
                .github
                .comment_on_issue(&task.repo, task.issue_number, &body)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "failed to comment on issue");
            }
        }

        self.reload(task_id).await
    }

    /// Recoverable setback from a CODE/FIX phase: record the error, burn an
    /// attempt, and route to TESTS_FAILED so the next step is a FIX pass.
    /// Exhausting the attempt budget here is terminal.
    ///
    /// No direct edge exists from the in-flight coding statuses to
    /// TESTS_FAILED, so the reroute walks the legal path through
    /// CODING_DONE and TESTING.
    pub(crate) async fn recoverable_setback(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        code: ErrorCode,
        message: String,
    ) -> Result<Task> {
        let task = self.reload(task_id).await?;
        let attempts = task_db::increment_attempts(&self.pool, task_id).await?;
        if attempts >= task.max_attempts {
            let err = OrchestratorError::new(
                ErrorCode::MaxAttemptsReached,
                format!("attempt {attempts} of {}: {message}", task.max_attempts),
            );
            return self.fail_task(task_id, err).await;
        }

        let err = OrchestratorError::new(code, message);
        task_db::set_last_error(&self.pool, task_id, &err.to_string()).await?;

        store::apply_path(
            &self.pool,
            task_id,
            &[
                from,
                TaskStatus::CodingDone,
                TaskStatus::Testing,
                TaskStatus::TestsFailed,
            ],
        )
        .await?;

        tracing::info!(
            task_id = %task_id,
            code = %err.code,
            attempt = attempts,
            "recoverable setback, routing to fix"
        );

        self.reload(task_id).await
    }

    pub(crate) async fn emit(&self, event: NewTaskEvent) -> Result<()> {
        events::insert_event(&self.pool, &event).await?;
        Ok(())
    }

    pub(crate) async fn reload(&self, task_id: Uuid) -> Result<Task> {
        task_db::get_task(&self.pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} disappeared"))
    }

    pub(crate) fn branch_of<'a>(&self, task: &'a Task) -> Result<&'a str> {
        task.branch_name.as_deref().ok_or_else(|| {
            OrchestratorError::new(
                ErrorCode::MissingField,
                format!("task {} has no branch", task.id),
            )
            .into()
        })
    }
}

/// Branch naming: `auto/<issue>-<slug(title)>`.
pub fn branch_name_for(issue_number: i64, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("auto/{issue_number}")
    } else {
        format!("auto/{issue_number}-{slug}")
    }
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    slug.trim_end_matches('-').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_slugged() {
        assert_eq!(
            branch_name_for(7, "Add dark mode toggle!"),
            "auto/7-add-dark-mode-toggle"
        );
        assert_eq!(branch_name_for(12, "???"), "auto/12");
    }

    #[test]
    fn slug_caps_length() {
        let long = "a".repeat(100);
        assert!(slugify(&long).len() <= 40);
    }
}
