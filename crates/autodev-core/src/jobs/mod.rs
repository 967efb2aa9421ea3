//! Batch job runner.
//!
//! Drives a job's tasks to completion with bounded parallelism: batches of
//! up to `max_parallel` per-task drivers, each looping the orchestrator
//! until its task reaches COMPLETED, FAILED, or WAITING_HUMAN. Batches
//! settle fully before the next begins; the job summary is refreshed after
//! every batch; cancellation is observed between batches and before every
//! individual task step.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::{JobStatus, JobSummary, TaskStatus};
use autodev_db::queries::jobs as job_db;
use autodev_db::queries::tasks as task_db;

use crate::orchestrator::Orchestrator;
use crate::state;

/// Runner knobs, independent of engine configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub max_parallel: usize,
    /// When false, the first failed task stops the job.
    pub continue_on_error: bool,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            continue_on_error: true,
        }
    }
}

/// Final outcome of one task within a job.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub final_status: TaskStatus,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    /// A created PR awaiting human review counts as success.
    pub fn succeeded(&self) -> bool {
        matches!(
            self.final_status,
            TaskStatus::Completed | TaskStatus::WaitingHuman
        )
    }
}

/// What a finished run produced.
#[derive(Debug)]
pub struct JobRunResult {
    pub status: JobStatus,
    pub summary: JobSummary,
    pub outcomes: Vec<TaskOutcome>,
}

pub struct JobRunner {
    pool: PgPool,
    orchestrator: Arc<Orchestrator>,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn new(pool: PgPool, orchestrator: Arc<Orchestrator>, config: JobRunnerConfig) -> Self {
        Self {
            pool,
            orchestrator,
            config,
        }
    }

    /// Run the job to completion (or cancellation) and persist the final
    /// status and summary.
    pub async fn run(&self, job_id: Uuid) -> Result<JobRunResult> {
        let job = job_db::get_job(&self.pool, job_id)
            .await?
            .with_context(|| format!("job {job_id} not found"))?;

        let moved = job_db::transition_status(
            &self.pool,
            job_id,
            JobStatus::Pending,
            JobStatus::Running,
        )
        .await?;
        if moved == 0 && job.status != JobStatus::Running {
            bail!("job {job_id} is not pending (status {})", job.status);
        }

        tracing::info!(
            job_id = %job_id,
            repo = %job.repo,
            tasks = job.task_ids.len(),
            max_parallel = self.config.max_parallel,
            "job started"
        );

        let total = job.task_ids.len() as i64;
        let mut queue: std::collections::VecDeque<Uuid> = job.task_ids.iter().copied().collect();
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(job.task_ids.len());
        let mut cancelled = false;

        while !queue.is_empty() {
            // Cancellation check between batches.
            let current = job_db::get_job(&self.pool, job_id)
                .await?
                .with_context(|| format!("job {job_id} disappeared mid-run"))?;
            if current.status == JobStatus::Cancelled {
                cancelled = true;
                break;
            }

            let batch: Vec<Uuid> = (0..self.config.max_parallel)
                .filter_map(|_| queue.pop_front())
                .collect();

            let mut handles = Vec::with_capacity(batch.len());
            for task_id in batch {
                let pool = self.pool.clone();
                let orchestrator = Arc::clone(&self.orchestrator);
                handles.push(tokio::spawn(async move {
                    drive_task(pool, orchestrator, job_id, task_id).await
                }));
            }

            // Settle the whole batch; one failure never cancels its peers.
            for handle in handles {
                match handle.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(join_err) => {
                        tracing::error!(job_id = %job_id, error = %join_err, "task driver panicked");
                        outcomes.push(TaskOutcome {
                            task_id: Uuid::nil(),
                            final_status: TaskStatus::Failed,
                            pr_url: None,
                            error: Some(format!("task driver panicked: {join_err}")),
                        });
                    }
                }
            }

            let summary = summarize(total, &outcomes);
            job_db::update_summary(&self.pool, job_id, &summary).await?;

            if !self.config.continue_on_error && outcomes.iter().any(|o| !o.succeeded()) {
                tracing::warn!(job_id = %job_id, "stopping job on first failure");
                break;
            }
        }

        // Re-check: cancellation may have landed during the final batch.
        if !cancelled {
            let current = job_db::get_job(&self.pool, job_id).await?;
            cancelled = matches!(current.map(|j| j.status), Some(JobStatus::Cancelled));
        }

        let summary = summarize(total, &outcomes);
        let status = final_status(cancelled, &outcomes);

        if cancelled {
            // The row already says cancelled; just record the summary.
            job_db::update_summary(&self.pool, job_id, &summary).await?;
        } else {
            job_db::finish_job(&self.pool, job_id, status, &summary).await?;
        }

        tracing::info!(
            job_id = %job_id,
            status = %status,
            completed = summary.completed,
            failed = summary.failed,
            "job finished"
        );

        Ok(JobRunResult {
            status,
            summary,
            outcomes,
        })
    }
}

/// Summary invariant: completed + failed + in_progress = total, and
/// prs_created only counts successes.
fn summarize(total: i64, outcomes: &[TaskOutcome]) -> JobSummary {
    let completed = outcomes.iter().filter(|o| o.succeeded()).count() as i64;
    let failed = outcomes.iter().filter(|o| !o.succeeded()).count() as i64;
    JobSummary {
        total,
        completed,
        failed,
        in_progress: total - completed - failed,
        prs_created: outcomes
            .iter()
            .filter(|o| o.succeeded())
            .filter_map(|o| o.pr_url.clone())
            .collect(),
    }
}

/// Derive the job's final status from its outcomes.
fn final_status(cancelled: bool, outcomes: &[TaskOutcome]) -> JobStatus {
    if cancelled {
        return JobStatus::Cancelled;
    }
    if outcomes.is_empty() {
        return JobStatus::Failed;
    }
    let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
    if succeeded == outcomes.len() {
        JobStatus::Completed
    } else if succeeded == 0 {
        JobStatus::Failed
    } else {
        JobStatus::Partial
    }
}

/// Loop the orchestrator over one task until it reaches a resting state.
///
/// Stops on: terminal status, WAITING_HUMAN, a waiting status that made no
/// progress (parked on an external operation), or observed job
/// cancellation. Any unhandled error marks the task FAILED.
async fn drive_task(
    pool: PgPool,
    orchestrator: Arc<Orchestrator>,
    job_id: Uuid,
    task_id: Uuid,
) -> TaskOutcome {
    loop {
        // Cancellation check before each step.
        match job_db::get_job(&pool, job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                return outcome_from_db(&pool, task_id, None).await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "job reload failed mid-drive");
            }
        }

        let task = match task_db::get_task(&pool, task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return TaskOutcome {
                    task_id,
                    final_status: TaskStatus::Failed,
                    pr_url: None,
                    error: Some("task not found".to_owned()),
                };
            }
            Err(err) => {
                return TaskOutcome {
                    task_id,
                    final_status: TaskStatus::Failed,
                    pr_url: None,
                    error: Some(format!("task load failed: {err:#}")),
                };
            }
        };

        if state::is_terminal(task.status) || task.status == TaskStatus::WaitingHuman {
            return outcome_from_db(&pool, task_id, None).await;
        }

        let status_before = task.status;
        match orchestrator.process(task).await {
            Ok(after) => {
                if state::is_terminal(after.status) || after.status == TaskStatus::WaitingHuman {
                    return outcome_from_db(&pool, task_id, None).await;
                }
                // Parked on an external operation (e.g. CI pending): the
                // webhook will re-drive; do not busy-loop here.
                if after.status == status_before && state::is_waiting(after.status) {
                    return outcome_from_db(&pool, task_id, None).await;
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(task_id = %task_id, error = %message, "unhandled driver error");
                let _ = task_db::set_last_error(&pool, task_id, &message).await;
                let _ = task_db::force_status(&pool, task_id, TaskStatus::Failed).await;
                return outcome_from_db(&pool, task_id, Some(message)).await;
            }
        }
    }
}

async fn outcome_from_db(pool: &PgPool, task_id: Uuid, error: Option<String>) -> TaskOutcome {
    match task_db::get_task(pool, task_id).await {
        Ok(Some(task)) => TaskOutcome {
            task_id,
            final_status: task.status,
            pr_url: task.pr_url,
            error: error.or(task.last_error),
        },
        _ => TaskOutcome {
            task_id,
            final_status: TaskStatus::Failed,
            pr_url: None,
            error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: TaskStatus, pr: Option<&str>) -> TaskOutcome {
        TaskOutcome {
            task_id: Uuid::new_v4(),
            final_status: status,
            pr_url: pr.map(str::to_owned),
            error: None,
        }
    }

    #[test]
    fn waiting_human_counts_as_success() {
        assert!(outcome(TaskStatus::WaitingHuman, None).succeeded());
        assert!(outcome(TaskStatus::Completed, None).succeeded());
        assert!(!outcome(TaskStatus::Failed, None).succeeded());
        assert!(!outcome(TaskStatus::Testing, None).succeeded());
    }

    #[test]
    fn summary_invariant_holds() {
        let outcomes = vec![
            outcome(TaskStatus::WaitingHuman, Some("https://p/1")),
            outcome(TaskStatus::Failed, None),
        ];
        let summary = summarize(3, &outcomes);
        assert_eq!(summary.total, 3);
        assert_eq!(
            summary.completed + summary.failed + summary.in_progress,
            summary.total
        );
        assert_eq!(summary.in_progress, 1);
        assert_eq!(summary.prs_created.len(), 1);
        assert!(summary.prs_created.len() as i64 <= summary.completed);
    }

    #[test]
    fn final_status_derivation() {
        let ok = outcome(TaskStatus::WaitingHuman, None);
        let bad = outcome(TaskStatus::Failed, None);

        assert_eq!(final_status(true, &[ok.clone()]), JobStatus::Cancelled);
        assert_eq!(final_status(false, &[]), JobStatus::Failed);
        assert_eq!(
            final_status(false, &[ok.clone(), ok.clone()]),
            JobStatus::Completed
        );
        assert_eq!(
            final_status(false, &[bad.clone(), bad.clone()]),
            JobStatus::Failed
        );
        assert_eq!(final_status(false, &[ok, bad]), JobStatus::Partial);
    }
}
