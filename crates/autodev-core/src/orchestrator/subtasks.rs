//! Decomposition of M/L issues and inline subtask orchestration.
//!
//! Breakdown stores the subtask graph on the parent task; each ORCHESTRATE
//! invocation then advances exactly one subtask (the job runner calls again
//! while work remains). Once every subtask completes, the diffs are
//! aggregated in execution order and applied as a single commit, and the
//! parent skips straight to TESTS_PASSED.

use anyhow::Result;

use autodev_db::models::{
    EventType, OrchestrationState, SubtaskState, SubtaskStatus, Task, TaskStatus,
};
use autodev_db::queries::events::NewTaskEvent;
use autodev_db::queries::patches;
use autodev_db::queries::tasks as task_db;

use crate::agents::breakdown::{self, BreakdownInput};
use crate::agents::coder::{self, CoderInput};
use crate::context;
use crate::diff::quick_validate;
use crate::error::{ErrorCode, OrchestratorError};
use crate::policy;
use crate::state::store;

use super::Orchestrator;

impl Orchestrator {
    // =================================================================
    // BREAKDOWN
    // =================================================================

    pub(super) async fn handle_breakdown(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::PlanningDone],
            &[
                ("definition_of_done", task.definition_of_done.is_some()),
                ("plan", task.plan.is_some()),
            ],
        )?;
        if task.is_subtask() {
            return Err(OrchestratorError::new(
                ErrorCode::InvalidState,
                "a subtask may not be decomposed again",
            )
            .into());
        }

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::PlanningDone,
            TaskStatus::BreakingDown,
        )
        .await?;

        let input = BreakdownInput {
            issue_title: task.title.clone(),
            issue_body: task.body.clone(),
            definition_of_done: task.definition_of_done().to_vec(),
            plan: task.plan_steps().to_vec(),
            target_files: task.target_files().to_vec(),
        };
        let outcome = breakdown::run(&self.llm, policy::breakdown_model(), &input).await?;
        let output = outcome.output;

        if output.subtasks.is_empty() {
            return Err(OrchestratorError::new(
                ErrorCode::UnknownError,
                "breakdown produced no subtasks",
            )
            .into());
        }

        let execution_order = if output.execution_order.is_empty() {
            output.subtasks.iter().map(|s| s.id.clone()).collect()
        } else {
            output.execution_order
        };

        let state = OrchestrationState {
            subtasks: output
                .subtasks
                .into_iter()
                .map(|def| SubtaskState {
                    def,
                    status: SubtaskStatus::Pending,
                    diff: None,
                    error: None,
                })
                .collect(),
            execution_order,
            parallel_groups: output.parallel_groups,
        };
        task_db::set_orchestration_state(&self.pool, task.id, &state).await?;

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::BreakingDown,
            TaskStatus::BreakdownDone,
        )
        .await?;

        self.emit(NewTaskEvent {
            output_summary: Some(format!("{} subtasks", state.subtasks.len())),
            tokens_used: Some(outcome.tokens),
            duration_ms: Some(outcome.duration_ms),
            metadata: serde_json::json!({
                "phase": "breakdown",
                "model": outcome.model,
                "execution_order": state.execution_order,
            }),
            ..NewTaskEvent::new(task.id, EventType::Planned, breakdown::AGENT_NAME)
        })
        .await?;

        self.reload(task.id).await
    }

    // =================================================================
    // ORCHESTRATE
    // =================================================================

    pub(super) async fn handle_orchestrate(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::BreakdownDone, TaskStatus::Orchestrating],
            &[("orchestration_state", task.orchestration_state.is_some())],
        )?;

        if task.status == TaskStatus::BreakdownDone {
            store::apply_transition(
                &self.pool,
                task.id,
                TaskStatus::BreakdownDone,
                TaskStatus::Orchestrating,
            )
            .await?;
        }
        let task = self.reload(task.id).await?;
        let mut state = task
            .orchestration_state
            .as_ref()
            .expect("validated above")
            .0
            .clone();

        if state.all_completed() {
            return self.finish_orchestration(&task, &state).await;
        }

        // A failed subtask fails the parent.
        if let Some(failed) = state
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::Failed)
        {
            return Err(OrchestratorError::new(
                ErrorCode::SubtaskFailed,
                format!(
                    "subtask {} ({}) failed: {}",
                    failed.def.id,
                    failed.def.title,
                    failed.error.as_deref().unwrap_or("unknown error")
                ),
            )
            .into());
        }

        // Pick the next pending subtask whose dependencies are satisfied,
        // honoring the execution order.
        let ready_id = state
            .execution_order
            .iter()
            .find(|id| {
                let Some(sub) = state.subtask(id) else {
                    return false;
                };
                sub.status == SubtaskStatus::Pending
                    && sub.def.depends_on.iter().all(|dep| {
                        state
                            .subtask(dep)
                            .map(|d| d.status == SubtaskStatus::Completed)
                            .unwrap_or(false)
                    })
            })
            .cloned();

        let Some(ready_id) = ready_id else {
            return Err(OrchestratorError::new(
                ErrorCode::SubtaskFailed,
                "no subtask is ready: dependency cycle or dangling dependency in breakdown",
            )
            .into());
        };

        self.process_subtask(&task, &mut state, &ready_id).await?;
        task_db::set_orchestration_state(&self.pool, task.id, &state).await?;

        // Self-edge: records activity without leaving ORCHESTRATING. The
        // job runner keeps invoking while subtasks remain.
        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::Orchestrating,
            TaskStatus::Orchestrating,
        )
        .await?;

        self.reload(task.id).await
    }

    /// Run the coder once for one subtask, inline.
    async fn process_subtask(
        &self,
        task: &Task,
        state: &mut OrchestrationState,
        subtask_id: &str,
    ) -> Result<()> {
        let index = state
            .subtasks
            .iter()
            .position(|s| s.def.id == subtask_id)
            .expect("ready id comes from the state");

        state.subtasks[index].status = SubtaskStatus::InProgress;
        task_db::set_orchestration_state(&self.pool, task.id, state).await?;

        let def = state.subtasks[index].def.clone();
        tracing::info!(
            task_id = %task.id,
            subtask = %def.id,
            title = %def.title,
            "processing subtask"
        );

        let default_branch = self.github.default_branch(&task.repo).await?;
        let files =
            context::fetch_files(&self.github, &task.repo, &default_branch, &def.target_files)
                .await?;

        let input = CoderInput {
            definition_of_done: def.acceptance_criteria.clone(),
            plan: vec![def.description.clone()],
            target_files: def.target_files.clone(),
            file_contents: context::render_context(&files, 12_000),
            previous_diff: None,
            last_error: None,
        };

        let selection = policy::select(def.complexity, self.config.effort, 0);
        let result = coder::run(&self.llm, selection.model(), &input).await;

        match result {
            Ok(outcome) => {
                let report = quick_validate(&outcome.output.diff);
                if report.valid() {
                    state.subtasks[index].status = SubtaskStatus::Completed;
                    state.subtasks[index].diff = Some(outcome.output.diff);
                } else {
                    state.subtasks[index].status = SubtaskStatus::Failed;
                    state.subtasks[index].error = Some(report.error_text());
                }
            }
            Err(err) => {
                state.subtasks[index].status = SubtaskStatus::Failed;
                state.subtasks[index].error = Some(format!("{err:#}"));
            }
        }

        Ok(())
    }

    /// Every subtask is done: aggregate diffs in execution order, create the
    /// branch, apply, and jump to TESTS_PASSED (subtask diffs were already
    /// validated individually).
    async fn finish_orchestration(
        &self,
        task: &Task,
        state: &OrchestrationState,
    ) -> Result<Task> {
        let mut aggregated = String::new();
        for id in &state.execution_order {
            let Some(sub) = state.subtask(id) else {
                continue;
            };
            let Some(diff) = &sub.diff else { continue };
            aggregated.push_str(&format!("# subtask {}: {}\n", sub.def.id, sub.def.title));
            aggregated.push_str(diff);
            if !diff.ends_with('\n') {
                aggregated.push('\n');
            }
        }

        if aggregated.is_empty() {
            return Err(OrchestratorError::new(
                ErrorCode::SubtaskFailed,
                "orchestration completed with no diffs to aggregate",
            )
            .into());
        }

        let branch = self.ensure_branch(task).await?;
        let commit_message = format!("feat: {} (#{})", task.title, task.issue_number);
        let sha = self
            .github
            .apply_diff(&task.repo, &branch, &aggregated, &commit_message)
            .await?;
        patches::insert_patch(&self.pool, task.id, &aggregated, Some(&sha)).await?;
        task_db::set_coding_outputs(&self.pool, task.id, &aggregated, &commit_message).await?;

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::Orchestrating,
            TaskStatus::TestsPassed,
        )
        .await?;

        self.emit(NewTaskEvent {
            output_summary: Some(commit_message),
            metadata: serde_json::json!({
                "phase": "orchestrate",
                "subtasks": state.subtasks.len(),
            }),
            ..NewTaskEvent::new(task.id, EventType::Coded, "orchestrator")
        })
        .await?;

        self.reload(task.id).await
    }
}
