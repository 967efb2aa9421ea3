//! Phase handlers: plan, code, test, fix, reflect, replan, review, open-PR.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use autodev_db::models::{CommandOrder, Complexity, EventType, Task, TaskStatus};
use autodev_db::queries::events::NewTaskEvent;
use autodev_db::queries::patches;
use autodev_db::queries::tasks as task_db;

use crate::agents::coder::{self, CoderInput};
use crate::agents::fixer::{self, FixerInput};
use crate::agents::planner::{self, PlannerInput, PlannerOutput};
use crate::agents::reflection::{self, ReflectionDecision, ReflectionInput};
use crate::agents::reviewer::{self, ReviewerInput, Verdict};
use crate::agents::AgentOutcome;
use crate::config::ConsensusStrategy;
use crate::context;
use crate::diff::full::FullValidator;
use crate::diff::{diff_stats, quick_validate};
use crate::error::{ErrorCode, OrchestratorError};
use crate::learning;
use crate::policy::{self, ModelTier};
use crate::runner::consensus::{self, ConsensusResult, DiffOutput, ReviewerVote};
use crate::runner::{run_candidates, AgentCandidate};
use crate::state::store;

use super::{branch_name_for, Orchestrator};

const CI_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Failures at or beyond this attempt trigger a reflection pass instead of
/// another blind fix.
const REFLECT_AFTER_ATTEMPTS: i32 = 2;
const CONTEXT_CHARS_PER_FILE: usize = 12_000;

/// A diff produced by the coder or fixer, single- or multi-agent.
struct GeneratedDiff {
    diff: String,
    commit_message: String,
    model: String,
    tokens: i64,
    duration_ms: i64,
}

enum DiffDisposition {
    Applied,
    /// A recoverable problem rerouted the task to TESTS_FAILED; the updated
    /// task is inside.
    Setback(Task),
}

impl Orchestrator {
    // =================================================================
    // PLAN
    // =================================================================

    pub(super) async fn handle_plan(&self, task: Task) -> Result<Task> {
        self.validate_task(&task, &[TaskStatus::New], &[])?;
        store::apply_transition(&self.pool, task.id, TaskStatus::New, TaskStatus::Planning)
            .await?;

        let outcome = self.run_planner(&task, None).await?;

        if outcome.output.estimated_complexity == Complexity::Xl {
            return Err(OrchestratorError::new(
                ErrorCode::ComplexityTooHigh,
                "planner estimated XL complexity; this issue must be split manually",
            )
            .into());
        }

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::Planning,
            TaskStatus::PlanningDone,
        )
        .await?;

        self.emit(NewTaskEvent {
            input_summary: Some(task.title.clone()),
            output_summary: Some(outcome.output.plan.join("; ")),
            tokens_used: Some(outcome.tokens),
            duration_ms: Some(outcome.duration_ms),
            metadata: serde_json::json!({
                "model": outcome.model,
                "complexity": outcome.output.estimated_complexity,
                "target_files": outcome.output.target_files,
            }),
            ..NewTaskEvent::new(task.id, EventType::Planned, planner::AGENT_NAME)
        })
        .await?;

        self.reload(task.id).await
    }

    /// Run the planner and persist its outputs. Shared by PLAN and REPLAN;
    /// the latter passes the failure context of the abandoned attempt.
    async fn run_planner(
        &self,
        task: &Task,
        failure_context: Option<&str>,
    ) -> Result<AgentOutcome<PlannerOutput>> {
        let default_branch = self.github.default_branch(&task.repo).await?;
        let all_files = self.github.list_files(&task.repo, &default_branch).await?;

        let targets: Vec<String> = if task.target_files().is_empty() {
            context::default_targets(&all_files, 5)
        } else {
            task.target_files().to_vec()
        };
        let files =
            context::fetch_files(&self.github, &task.repo, &default_branch, &targets).await?;
        let repo_context = context::render_context(&files, CONTEXT_CHARS_PER_FILE);

        let mut body = task.body.clone();
        if self.config.enable_learning {
            let kind = learning::issue_kind(&task.title, &task.body);
            let modes = self
                .learning
                .known_failure_modes(&task.repo, kind)
                .await
                .unwrap_or_default();
            if !modes.is_empty() {
                body.push_str("\n\n## Known failure modes to avoid\n");
                for mode in modes {
                    body.push_str(&format!("- {mode}\n"));
                }
            }
            let conventions = self
                .learning
                .conventions(&task.repo, 0.7)
                .await
                .unwrap_or_default();
            if !conventions.is_empty() {
                body.push_str("\n## Repository conventions\n");
                for convention in conventions {
                    body.push_str(&format!("- {convention}\n"));
                }
            }
        }
        if let Some(ctx) = failure_context {
            body.push_str(&format!(
                "\n\n## Previous attempt failed\nThe earlier plan did not survive testing:\n{ctx}"
            ));
        }

        let input = PlannerInput {
            issue_title: task.title.clone(),
            issue_body: body,
            repo_context,
        };
        let outcome = planner::run(&self.llm, policy::planner_model(), &input).await?;

        let mut target_files = outcome.output.target_files.clone();
        if self.config.expand_imports && !target_files.is_empty() {
            let related = context::expand_imports(
                &self.github,
                &task.repo,
                &default_branch,
                &all_files,
                &target_files,
                self.config.import_depth,
                self.config.max_related_files,
            )
            .await?;
            if !related.is_empty() {
                tracing::info!(
                    task_id = %task.id,
                    related = related.len(),
                    "import expansion added related files"
                );
                target_files.extend(related);
            }
        }

        task_db::set_planning_outputs(
            &self.pool,
            task.id,
            &outcome.output.definition_of_done,
            &outcome.output.plan,
            &target_files,
            outcome.output.multi_file_plan.as_deref(),
            outcome.output.estimated_complexity,
            outcome.output.commands.as_deref(),
            outcome.output.command_order,
        )
        .await?;

        Ok(outcome)
    }

    // =================================================================
    // CODE
    // =================================================================

    pub(super) async fn handle_code(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::PlanningDone, TaskStatus::ReviewRejected],
            &[
                ("definition_of_done", task.definition_of_done.is_some()),
                ("plan", task.plan.is_some()),
                ("target_files", !task.target_files().is_empty()),
            ],
        )?;
        store::apply_transition(&self.pool, task.id, task.status, TaskStatus::Coding).await?;
        self.run_code_inline(task.id).await
    }

    /// The coding pass proper; entered with status already CODING.
    pub(super) async fn run_code_inline(&self, task_id: Uuid) -> Result<Task> {
        let task = self.reload(task_id).await?;
        let branch = self.ensure_branch(&task).await?;

        let files =
            context::fetch_files(&self.github, &task.repo, &branch, task.target_files()).await?;
        let input = CoderInput {
            definition_of_done: task.definition_of_done().to_vec(),
            plan: task.plan_steps().to_vec(),
            target_files: task.target_files().to_vec(),
            file_contents: context::render_context(&files, CONTEXT_CHARS_PER_FILE),
            previous_diff: task.current_diff.clone(),
            last_error: task.last_error.clone(),
        };

        let generated = self.generate_code(&task, &input).await?;

        // Pre-diff project commands.
        let commands: Vec<String> = task.commands.as_ref().map(|j| j.0.clone()).unwrap_or_default();
        if task.command_order == Some(CommandOrder::BeforeDiff) && !commands.is_empty() {
            if let Some(task) = self
                .run_phase_commands(task_id, &task.repo, &branch, &commands, TaskStatus::Coding)
                .await?
            {
                return Ok(task);
            }
        }

        let applied = self
            .validate_and_apply(
                task_id,
                &task.repo,
                &branch,
                &generated,
                TaskStatus::Coding,
            )
            .await?;
        if let DiffDisposition::Setback(task) = applied {
            return Ok(task);
        }

        // Post-diff project commands.
        if task.command_order == Some(CommandOrder::AfterDiff) && !commands.is_empty() {
            if let Some(task) = self
                .run_phase_commands(task_id, &task.repo, &branch, &commands, TaskStatus::Coding)
                .await?
            {
                return Ok(task);
            }
        }

        store::apply_transition(&self.pool, task_id, TaskStatus::Coding, TaskStatus::CodingDone)
            .await?;

        self.emit(NewTaskEvent {
            output_summary: Some(generated.commit_message.clone()),
            tokens_used: Some(generated.tokens),
            duration_ms: Some(generated.duration_ms),
            metadata: serde_json::json!({
                "model": generated.model,
                "diff_lines": diff_stats(&generated.diff).total_lines,
            }),
            ..NewTaskEvent::new(task_id, EventType::Coded, coder::AGENT_NAME)
        })
        .await?;

        self.reload(task_id).await
    }

    pub(super) async fn ensure_branch(&self, task: &Task) -> Result<String> {
        let branch = task
            .branch_name
            .clone()
            .unwrap_or_else(|| branch_name_for(task.issue_number, &task.title));

        if !self.github.branch_exists(&task.repo, &branch).await? {
            let default_branch = self.github.default_branch(&task.repo).await?;
            self.github
                .create_branch(&task.repo, &branch, &default_branch)
                .await?;
            tracing::info!(task_id = %task.id, branch = %branch, "created working branch");
        }
        if task.branch_name.as_deref() != Some(branch.as_str()) {
            task_db::set_branch(&self.pool, task.id, &branch).await?;
        }
        Ok(branch)
    }

    /// Run pre/post-diff commands. A failure is a recoverable
    /// COMMAND_FAILED setback; returns the rerouted task in that case.
    async fn run_phase_commands(
        &self,
        task_id: Uuid,
        repo: &str,
        branch: &str,
        commands: &[String],
        from: TaskStatus,
    ) -> Result<Option<Task>> {
        match self.foreman.run_commands(repo, branch, commands).await {
            Ok(outcome) if outcome.passed => Ok(None),
            Ok(outcome) => {
                let task = self
                    .recoverable_setback(task_id, from, ErrorCode::CommandFailed, outcome.output)
                    .await?;
                Ok(Some(task))
            }
            Err(err) => {
                let task = self
                    .recoverable_setback(
                        task_id,
                        from,
                        ErrorCode::CommandFailed,
                        format!("{err:#}"),
                    )
                    .await?;
                Ok(Some(task))
            }
        }
    }

    /// Shared validate-then-apply path for coder and fixer diffs.
    ///
    /// Oversized diffs are terminal; structural or compile rejections burn
    /// an attempt and reroute to TESTS_FAILED for a FIX pass.
    async fn validate_and_apply(
        &self,
        task_id: Uuid,
        repo: &str,
        branch: &str,
        generated: &GeneratedDiff,
        from: TaskStatus,
    ) -> Result<DiffDisposition> {
        let stats = diff_stats(&generated.diff);
        if stats.total_lines > self.config.max_diff_lines {
            return Err(OrchestratorError::new(
                ErrorCode::DiffTooLarge,
                format!(
                    "diff is {} lines, cap is {}",
                    stats.total_lines, self.config.max_diff_lines
                ),
            )
            .into());
        }

        let report = quick_validate(&generated.diff);
        if !report.valid() {
            let task = self
                .recoverable_setback(task_id, from, ErrorCode::InvalidDiff, report.error_text())
                .await?;
            return Ok(DiffDisposition::Setback(task));
        }

        if self.config.validate_diff {
            let validator =
                FullValidator::new(self.config.credentials.github_token.clone());
            let full = validator.validate(repo, branch, &generated.diff).await?;
            if !full.valid() {
                let task = self
                    .recoverable_setback(
                        task_id,
                        from,
                        ErrorCode::TypecheckFailed,
                        full.error_text(),
                    )
                    .await?;
                return Ok(DiffDisposition::Setback(task));
            }
        }

        let sha = self
            .github
            .apply_diff(repo, branch, &generated.diff, &generated.commit_message)
            .await?;
        patches::insert_patch(&self.pool, task_id, &generated.diff, Some(&sha)).await?;
        task_db::set_coding_outputs(
            &self.pool,
            task_id,
            &generated.diff,
            &generated.commit_message,
        )
        .await?;

        Ok(DiffDisposition::Applied)
    }

    /// Run the coder, single or multi-candidate per configuration.
    async fn generate_code(&self, task: &Task, input: &CoderInput) -> Result<GeneratedDiff> {
        let complexity = task.estimated_complexity.unwrap_or(Complexity::S);
        let selection =
            policy::select(complexity, self.config.effort, task.attempt_count as u32);
        if selection.tier == ModelTier::Decompose {
            // decide() routes M/L parents to breakdown before coding; a
            // subtask can still carry an L estimate from a sloppy breakdown.
            tracing::warn!(task_id = %task.id, "decompose-tier selection in coder; using quality model");
        }

        let ma = &self.config.multi_agent;
        let multi = ma.enabled
            && selection.use_multi_agent
            && ma.coder_count >= 2
            && !ma.coder_models.is_empty();

        if !multi {
            let outcome = coder::run(&self.llm, selection.model(), input).await?;
            return Ok(GeneratedDiff {
                diff: outcome.output.diff,
                commit_message: outcome.output.commit_message,
                model: outcome.model,
                tokens: outcome.tokens,
                duration_ms: outcome.duration_ms,
            });
        }

        let models: Vec<String> = ma.coder_models.iter().take(ma.coder_count).cloned().collect();
        let registry = Arc::clone(&self.llm);
        let candidate_input = input.clone();
        let candidates = run_candidates(&models, ma.timeout, move |model| {
            let registry = Arc::clone(&registry);
            let input = candidate_input.clone();
            async move { coder::run(&registry, &model, &input).await }
        })
        .await;

        let result = self
            .run_consensus(task, candidates, &input.file_contents, &input.definition_of_done, &input.plan)
            .await?;

        let winner = result
            .winner()
            .output
            .clone()
            .expect("consensus winner always has output");
        let (tokens, duration_ms) = (result.total_tokens, result.total_duration_ms);
        let model = result.winner().model.clone();

        self.emit_consensus_event(task.id, &result).await?;

        Ok(GeneratedDiff {
            diff: winner.diff,
            commit_message: winner.commit_message,
            model,
            tokens,
            duration_ms,
        })
    }

    /// Apply the configured consensus strategy to a candidate set.
    async fn run_consensus<T>(
        &self,
        task: &Task,
        candidates: Vec<AgentCandidate<T>>,
        file_contents: &str,
        definition_of_done: &[String],
        plan: &[String],
    ) -> Result<ConsensusResult<T>>
    where
        T: DiffOutput + Clone + Send + 'static,
    {
        match self.config.multi_agent.consensus_strategy {
            ConsensusStrategy::Score => consensus::select_by_score(candidates),
            ConsensusStrategy::Reviewer => {
                let mut votes: Vec<Option<ReviewerVote>> = Vec::with_capacity(candidates.len());
                for candidate in &candidates {
                    let Some(output) = &candidate.output else {
                        votes.push(None);
                        continue;
                    };
                    let input = ReviewerInput {
                        definition_of_done: definition_of_done.to_vec(),
                        plan: plan.to_vec(),
                        diff: output.diff().to_owned(),
                        file_contents: file_contents.to_owned(),
                        tests_passed: false,
                    };
                    match reviewer::run(&self.llm, policy::reviewer_model(), &input).await {
                        Ok(outcome) => votes.push(Some(ReviewerVote {
                            verdict: outcome.output.verdict,
                            score: outcome.output.score.unwrap_or(0.5),
                            comments: outcome.output.comments,
                        })),
                        Err(err) => {
                            tracing::warn!(
                                task_id = %task.id,
                                candidate = candidate.index,
                                error = %err,
                                "reviewer vote failed; candidate falls back to heuristic"
                            );
                            votes.push(None);
                        }
                    }
                }
                consensus::select_by_reviewer(candidates, votes)
            }
        }
    }

    async fn emit_consensus_event<T>(
        &self,
        task_id: Uuid,
        result: &ConsensusResult<T>,
    ) -> Result<()> {
        let mut metadata = result.provenance();
        metadata["report"] = serde_json::Value::String(result.render_report());
        self.emit(NewTaskEvent {
            output_summary: Some(result.reason.clone()),
            tokens_used: Some(result.total_tokens),
            duration_ms: Some(result.total_duration_ms),
            metadata,
            ..NewTaskEvent::new(task_id, EventType::ConsensusDecision, "consensus")
        })
        .await
    }

    // =================================================================
    // TEST
    // =================================================================

    pub(super) async fn handle_test(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::CodingDone],
            &[("branch_name", task.branch_name.is_some())],
        )?;
        store::apply_transition(&self.pool, task.id, TaskStatus::CodingDone, TaskStatus::Testing)
            .await?;
        let task = self.reload(task.id).await?;
        let branch = self.branch_of(&task)?.to_owned();

        // Local foreman pass before falling back to CI.
        if self.config.use_foreman {
            let commands: Vec<String> =
                task.commands.as_ref().map(|j| j.0.clone()).unwrap_or_default();
            if !commands.is_empty() {
                match self.foreman.run_tests(&task.repo, &branch, &commands).await {
                    Ok(outcome) if outcome.passed => return self.tests_passed(task).await,
                    Ok(outcome) => return self.tests_failed(task, &outcome.output).await,
                    Err(err) => {
                        tracing::warn!(
                            task_id = %task.id,
                            error = %err,
                            "foreman unavailable; deferring to CI"
                        );
                    }
                }
            }
        }

        // CI wait loop with a bounded deadline; a still-pending conclusion
        // parks the task in TESTING for the check_run webhook to wake.
        let deadline = tokio::time::Instant::now() + self.config.ci_wait_timeout;
        loop {
            match self.github.ci_conclusion(&task.repo, &branch).await? {
                crate::github::CiConclusion::Success | crate::github::CiConclusion::None => {
                    return self.tests_passed(task).await;
                }
                crate::github::CiConclusion::Failure => {
                    return self
                        .tests_failed(task, "CI reported a failing conclusion for the branch")
                        .await;
                }
                crate::github::CiConclusion::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::info!(
                            task_id = %task.id,
                            "CI still pending at deadline; parking task in testing"
                        );
                        return self.reload(task.id).await;
                    }
                    tokio::time::sleep(CI_POLL_INTERVAL).await;
                }
            }
        }
    }

    pub(super) async fn tests_passed(&self, task: Task) -> Result<Task> {
        if self.config.enable_learning {
            if let Some(error) = &task.error_before_fix {
                let description = task
                    .commit_message
                    .clone()
                    .unwrap_or_else(|| "fix applied".to_owned());
                if let Err(e) = self
                    .learning
                    .record_fix_pattern(&task.repo, error, &description)
                    .await
                {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to record fix pattern");
                }
            }
        }

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::Testing,
            TaskStatus::TestsPassed,
        )
        .await?;
        self.emit(NewTaskEvent {
            output_summary: Some("tests passed".to_owned()),
            metadata: serde_json::json!({"passed": true}),
            ..NewTaskEvent::new(task.id, EventType::Tested, "orchestrator")
        })
        .await?;
        self.reload(task.id).await
    }

    pub(super) async fn tests_failed(&self, task: Task, error: &str) -> Result<Task> {
        let attempts = task_db::increment_attempts(&self.pool, task.id).await?;
        if attempts >= task.max_attempts {
            let err = OrchestratorError::new(
                ErrorCode::MaxAttemptsReached,
                format!("attempt {attempts} of {}: {error}", task.max_attempts),
            );
            return self.fail_task(task.id, err).await;
        }

        task_db::set_last_error(&self.pool, task.id, error).await?;
        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::Testing,
            TaskStatus::TestsFailed,
        )
        .await?;
        self.emit(NewTaskEvent {
            output_summary: Some(crate::llm::truncate(error, 500)),
            metadata: serde_json::json!({"passed": false, "attempt": attempts}),
            ..NewTaskEvent::new(task.id, EventType::Tested, "orchestrator")
        })
        .await?;
        self.reload(task.id).await
    }

    // =================================================================
    // FIX / REFLECT / REPLAN
    // =================================================================

    pub(super) async fn handle_fix(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::TestsFailed],
            &[
                ("branch_name", task.branch_name.is_some()),
                ("last_error", task.last_error.is_some()),
            ],
        )?;

        if task.attempt_count >= REFLECT_AFTER_ATTEMPTS {
            store::apply_transition(
                &self.pool,
                task.id,
                TaskStatus::TestsFailed,
                TaskStatus::Reflecting,
            )
            .await?;
            return self.reload(task.id).await;
        }

        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::TestsFailed,
            TaskStatus::Fixing,
        )
        .await?;
        self.run_fix_inline(task.id).await
    }

    /// The fix pass proper; entered with status already FIXING.
    async fn run_fix_inline(&self, task_id: Uuid) -> Result<Task> {
        let task = self.reload(task_id).await?;
        let branch = self.branch_of(&task)?.to_owned();
        let last_error = task.last_error.clone().unwrap_or_default();

        // Capture the pre-fix error; a later green test run records the fix
        // pattern against it.
        task_db::set_error_before_fix(&self.pool, task_id, &last_error).await?;

        let files =
            context::fetch_files(&self.github, &task.repo, &branch, task.target_files()).await?;

        let mut error_logs = last_error;
        if self.config.enable_learning {
            let patterns = self
                .learning
                .similar_fixes(&error_logs)
                .await
                .unwrap_or_default();
            if !patterns.is_empty() {
                error_logs.push_str("\n\n## Fixes that worked for similar errors\n");
                for pattern in patterns {
                    error_logs.push_str(&format!("- {}\n", pattern.fix_description));
                }
            }
        }

        let input = FixerInput {
            definition_of_done: task.definition_of_done().to_vec(),
            plan: task.plan_steps().to_vec(),
            current_diff: task.current_diff.clone().unwrap_or_default(),
            error_logs,
            file_contents: context::render_context(&files, CONTEXT_CHARS_PER_FILE),
        };

        let generated = self.generate_fix(&task, &input).await?;

        let applied = self
            .validate_and_apply(task_id, &task.repo, &branch, &generated, TaskStatus::Fixing)
            .await?;
        if let DiffDisposition::Setback(task) = applied {
            return Ok(task);
        }

        store::apply_transition(&self.pool, task_id, TaskStatus::Fixing, TaskStatus::CodingDone)
            .await?;

        self.emit(NewTaskEvent {
            output_summary: Some(generated.commit_message.clone()),
            tokens_used: Some(generated.tokens),
            duration_ms: Some(generated.duration_ms),
            metadata: serde_json::json!({
                "model": generated.model,
                "attempt": task.attempt_count,
            }),
            ..NewTaskEvent::new(task_id, EventType::Fixed, fixer::AGENT_NAME)
        })
        .await?;

        self.reload(task_id).await
    }

    /// Run the fixer, single or multi-candidate. The model tier escalates
    /// with the attempt counter.
    async fn generate_fix(&self, task: &Task, input: &FixerInput) -> Result<GeneratedDiff> {
        let selection = policy::select_fixer(task.attempt_count as u32);

        let ma = &self.config.multi_agent;
        let multi = ma.enabled && ma.fixer_count >= 2 && !ma.fixer_models.is_empty();

        if !multi {
            let outcome = fixer::run(&self.llm, selection.model(), input).await?;
            return Ok(GeneratedDiff {
                diff: outcome.output.diff,
                commit_message: outcome.output.commit_message,
                model: outcome.model,
                tokens: outcome.tokens,
                duration_ms: outcome.duration_ms,
            });
        }

        let models: Vec<String> = ma.fixer_models.iter().take(ma.fixer_count).cloned().collect();
        let registry = Arc::clone(&self.llm);
        let candidate_input = input.clone();
        let candidates = run_candidates(&models, ma.timeout, move |model| {
            let registry = Arc::clone(&registry);
            let input = candidate_input.clone();
            async move { fixer::run(&registry, &model, &input).await }
        })
        .await;

        let result = self
            .run_consensus(
                task,
                candidates,
                &input.file_contents,
                &input.definition_of_done,
                &input.plan,
            )
            .await?;

        let winner = result
            .winner()
            .output
            .clone()
            .expect("consensus winner always has output");
        let (tokens, duration_ms) = (result.total_tokens, result.total_duration_ms);
        let model = result.winner().model.clone();

        self.emit_consensus_event(task.id, &result).await?;

        Ok(GeneratedDiff {
            diff: winner.diff,
            commit_message: winner.commit_message,
            model,
            tokens,
            duration_ms,
        })
    }

    pub(super) async fn handle_reflect(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::Reflecting],
            &[("last_error", task.last_error.is_some())],
        )?;

        let input = ReflectionInput {
            definition_of_done: task.definition_of_done().to_vec(),
            plan: task.plan_steps().to_vec(),
            attempt_count: task.attempt_count,
            error_history: task.last_error.clone().unwrap_or_default(),
        };
        let outcome = reflection::run(&self.llm, policy::reflection_model(), &input).await?;

        tracing::info!(
            task_id = %task.id,
            decision = ?outcome.output.decision,
            "reflection: {}",
            outcome.output.reasoning
        );

        match outcome.output.decision {
            ReflectionDecision::Replan => {
                store::apply_transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reflecting,
                    TaskStatus::Replanning,
                )
                .await?;
                self.reload(task.id).await
            }
            ReflectionDecision::Fix => {
                store::apply_transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reflecting,
                    TaskStatus::Fixing,
                )
                .await?;
                self.run_fix_inline(task.id).await
            }
        }
    }

    pub(super) async fn handle_replan(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::Replanning],
            &[("last_error", task.last_error.is_some())],
        )?;

        let failure_context = task.last_error.clone().unwrap_or_default();
        let outcome = self.run_planner(&task, Some(&failure_context)).await?;

        if outcome.output.estimated_complexity == Complexity::Xl {
            return Err(OrchestratorError::new(
                ErrorCode::ComplexityTooHigh,
                "replanning estimated XL complexity",
            )
            .into());
        }

        self.emit(NewTaskEvent {
            output_summary: Some(outcome.output.plan.join("; ")),
            tokens_used: Some(outcome.tokens),
            duration_ms: Some(outcome.duration_ms),
            metadata: serde_json::json!({"phase": "replan", "model": outcome.model}),
            ..NewTaskEvent::new(task.id, EventType::Planned, planner::AGENT_NAME)
        })
        .await?;

        store::apply_transition(&self.pool, task.id, TaskStatus::Replanning, TaskStatus::Coding)
            .await?;
        self.run_code_inline(task.id).await
    }

    // =================================================================
    // REVIEW
    // =================================================================

    pub(super) async fn handle_review(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::TestsPassed],
            &[
                ("branch_name", task.branch_name.is_some()),
                ("current_diff", task.current_diff.is_some()),
            ],
        )?;
        store::apply_transition(
            &self.pool,
            task.id,
            TaskStatus::TestsPassed,
            TaskStatus::Reviewing,
        )
        .await?;

        let branch = self.branch_of(&task)?.to_owned();
        let files =
            context::fetch_files(&self.github, &task.repo, &branch, task.target_files()).await?;

        let input = ReviewerInput {
            definition_of_done: task.definition_of_done().to_vec(),
            plan: task.plan_steps().to_vec(),
            diff: task.current_diff.clone().unwrap_or_default(),
            file_contents: context::render_context(&files, CONTEXT_CHARS_PER_FILE),
            tests_passed: true,
        };
        let outcome = reviewer::run(&self.llm, policy::reviewer_model(), &input).await?;
        let review = &outcome.output;

        self.emit(NewTaskEvent {
            output_summary: Some(review.summary.clone()),
            tokens_used: Some(outcome.tokens),
            duration_ms: Some(outcome.duration_ms),
            metadata: serde_json::json!({
                "verdict": review.verdict,
                "comments": review.comments,
                "model": outcome.model,
            }),
            ..NewTaskEvent::new(task.id, EventType::Reviewed, reviewer::AGENT_NAME)
        })
        .await?;

        match review.verdict {
            // NEEDS_DISCUSSION proceeds to a PR: a human sees the diff there
            // anyway, and it does not burn an attempt.
            Verdict::Approve | Verdict::NeedsDiscussion => {
                store::apply_transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reviewing,
                    TaskStatus::ReviewApproved,
                )
                .await?;
                self.reload(task.id).await
            }
            Verdict::RequestChanges => {
                let attempts = task_db::increment_attempts(&self.pool, task.id).await?;
                if attempts >= task.max_attempts {
                    let err = OrchestratorError::new(
                        ErrorCode::MaxAttemptsReached,
                        format!(
                            "attempt {attempts} of {}: review requested changes",
                            task.max_attempts
                        ),
                    );
                    return self.fail_task(task.id, err).await;
                }

                let mut feedback = review.summary.clone();
                if let Some(changes) = &review.suggested_changes {
                    feedback.push_str("\nSuggested changes:\n");
                    for change in changes {
                        feedback.push_str(&format!("- {change}\n"));
                    }
                }
                task_db::set_last_error(&self.pool, task.id, &feedback).await?;
                store::apply_transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reviewing,
                    TaskStatus::ReviewRejected,
                )
                .await?;
                self.reload(task.id).await
            }
        }
    }

    // =================================================================
    // OPEN_PR
    // =================================================================

    pub(super) async fn handle_open_pr(&self, task: Task) -> Result<Task> {
        self.validate_task(
            &task,
            &[TaskStatus::ReviewApproved],
            &[("branch_name", task.branch_name.is_some())],
        )?;
        let branch = self.branch_of(&task)?.to_owned();
        let body = self.render_pr_body(&task).await?;

        if let Some(pr_number) = task.pr_number {
            // Re-approved after rejection: refresh the existing PR.
            self.github
                .update_pull_request_body(&task.repo, pr_number, &body)
                .await?;
            self.github
                .comment_on_issue(
                    &task.repo,
                    pr_number,
                    "New changes pushed after review feedback.",
                )
                .await?;

            self.emit(NewTaskEvent {
                output_summary: task.pr_url.clone(),
                metadata: serde_json::json!({"updated": true, "pr_number": pr_number}),
                ..NewTaskEvent::new(task.id, EventType::PrOpened, "orchestrator")
            })
            .await?;
        } else {
            let base = self.github.default_branch(&task.repo).await?;
            let title = format!("{} (#{})", task.title, task.issue_number);
            let pr = self
                .github
                .create_pull_request(&task.repo, &branch, &base, &title, &body)
                .await?;

            self.github
                .add_labels(
                    &task.repo,
                    pr.number,
                    &["auto-dev".to_owned(), "ready-for-human-review".to_owned()],
                )
                .await?;
            self.github
                .comment_on_issue(
                    &task.repo,
                    task.issue_number,
                    &format!("Opened pull request {} for this issue.", pr.url),
                )
                .await?;

            task_db::set_pr_outputs(&self.pool, task.id, pr.number, &pr.url, &pr.title).await?;

            self.emit(NewTaskEvent {
                output_summary: Some(pr.url.clone()),
                metadata: serde_json::json!({"pr_number": pr.number}),
                ..NewTaskEvent::new(task.id, EventType::PrOpened, "orchestrator")
            })
            .await?;
        }

        store::apply_path(
            &self.pool,
            task.id,
            &[
                TaskStatus::ReviewApproved,
                TaskStatus::PrCreated,
                TaskStatus::WaitingHuman,
            ],
        )
        .await?;

        self.reload(task.id).await
    }

    /// PR body: definition of done, plan, modified files, and any
    /// multi-agent consensus reports recorded along the way.
    async fn render_pr_body(&self, task: &Task) -> Result<String> {
        let mut body = format!(
            "Automated implementation of #{}.\n\n## Definition of done\n",
            task.issue_number
        );
        for item in task.definition_of_done() {
            body.push_str(&format!("- [x] {item}\n"));
        }
        body.push_str("\n## Plan\n");
        for (i, step) in task.plan_steps().iter().enumerate() {
            body.push_str(&format!("{}. {step}\n", i + 1));
        }
        body.push_str("\n## Modified files\n");
        for file in task.target_files() {
            body.push_str(&format!("- `{file}`\n"));
        }

        let events =
            autodev_db::queries::events::list_for_task(&self.pool, task.id).await?;
        for event in events
            .iter()
            .filter(|e| e.event_type == EventType::ConsensusDecision)
        {
            if let Some(report) = event.metadata.get("report").and_then(|r| r.as_str()) {
                body.push_str("\n");
                body.push_str(report);
            }
        }

        Ok(body)
    }
}
