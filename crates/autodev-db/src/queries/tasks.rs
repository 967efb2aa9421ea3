//! Database query functions for the `tasks` table.
//!
//! Status updates use optimistic locking: the UPDATE's WHERE clause pins the
//! expected current status, and a zero row count signals a lock failure that
//! callers surface as an error.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{
    CommandOrder, Complexity, FilePlan, OrchestrationState, Task, TaskStatus,
};

/// Fields for a new task row. Everything else is server-generated.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub repo: &'a str,
    pub issue_number: i64,
    pub title: &'a str,
    pub body: &'a str,
    pub max_attempts: i32,
    pub linear_issue_id: Option<&'a str>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status, attempt_count, timestamps).
///
/// Fails on a `(repo, issue_number)` conflict; use [`find_by_repo_issue`]
/// first for idempotent creation.
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (repo, issue_number, title, body, max_attempts, linear_issue_id) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.repo)
    .bind(new.issue_number)
    .bind(new.title)
    .bind(new.body)
    .bind(new.max_attempts)
    .bind(new.linear_issue_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Find a task by its `(repo, issue_number)` identity.
pub async fn find_by_repo_issue(
    pool: &PgPool,
    repo: &str,
    issue_number: i64,
) -> Result<Option<Task>> {
    let task =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 AND issue_number = $2")
            .bind(repo)
            .bind(issue_number)
            .fetch_optional(pool)
            .await
            .context("failed to find task by repo and issue")?;

    Ok(task)
}

/// Find a task by the pull request it opened.
pub async fn find_by_pr_number(
    pool: &PgPool,
    repo: &str,
    pr_number: i64,
) -> Result<Option<Task>> {
    let task =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 AND pr_number = $2")
            .bind(repo)
            .bind(pr_number)
            .fetch_optional(pool)
            .await
            .context("failed to find task by PR number")?;

    Ok(task)
}

/// List all tasks that have not reached a terminal status, oldest first.
pub async fn list_active(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status NOT IN ('completed', 'failed') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active tasks")?;

    Ok(tasks)
}

/// List all tasks for a repo currently in the given status.
pub async fn list_by_status_for_repo(
    pool: &PgPool,
    repo: &str,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE repo = $1 AND status = $2 ORDER BY created_at ASC",
    )
    .bind(repo)
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Returns the number of rows affected (0 means the current status did not
/// match `from`).
pub async fn transition_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Force a task into a status regardless of its current one.
///
/// Only the terminal failure path uses this (any non-terminal status may
/// transition to `failed`).
pub async fn force_status(pool: &PgPool, task_id: Uuid, to: TaskStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(to)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to force task status")?;

    Ok(result.rows_affected())
}

/// Store planner outputs on a task.
#[allow(clippy::too_many_arguments)]
pub async fn set_planning_outputs(
    pool: &PgPool,
    task_id: Uuid,
    definition_of_done: &[String],
    plan: &[String],
    target_files: &[String],
    multi_file_plan: Option<&[FilePlan]>,
    estimated_complexity: Complexity,
    commands: Option<&[String]>,
    command_order: Option<CommandOrder>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET \
             definition_of_done = $1, \
             plan = $2, \
             target_files = $3, \
             multi_file_plan = $4, \
             estimated_complexity = $5, \
             commands = $6, \
             command_order = $7, \
             updated_at = NOW() \
         WHERE id = $8",
    )
    .bind(Json(definition_of_done))
    .bind(Json(plan))
    .bind(target_files)
    .bind(multi_file_plan.map(Json))
    .bind(estimated_complexity)
    .bind(commands.map(Json))
    .bind(command_order)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to store planning outputs")?;

    Ok(result.rows_affected())
}

/// Replace the task's target file list (import expansion).
pub async fn set_target_files(pool: &PgPool, task_id: Uuid, files: &[String]) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET target_files = $1, updated_at = NOW() WHERE id = $2")
            .bind(files)
            .bind(task_id)
            .execute(pool)
            .await
            .context("failed to update target files")?;

    Ok(result.rows_affected())
}

/// Record the working branch for a task.
pub async fn set_branch(pool: &PgPool, task_id: Uuid, branch: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET branch_name = $1, updated_at = NOW() WHERE id = $2")
            .bind(branch)
            .bind(task_id)
            .execute(pool)
            .await
            .context("failed to record branch name")?;

    Ok(result.rows_affected())
}

/// Store coder outputs (the current diff and its commit message).
pub async fn set_coding_outputs(
    pool: &PgPool,
    task_id: Uuid,
    diff: &str,
    commit_message: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET current_diff = $1, commit_message = $2, updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(diff)
    .bind(commit_message)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to store coding outputs")?;

    Ok(result.rows_affected())
}

/// Store pull request outputs.
pub async fn set_pr_outputs(
    pool: &PgPool,
    task_id: Uuid,
    pr_number: i64,
    pr_url: &str,
    pr_title: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET pr_number = $1, pr_url = $2, pr_title = $3, updated_at = NOW() \
         WHERE id = $4",
    )
    .bind(pr_number)
    .bind(pr_url)
    .bind(pr_title)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to store PR outputs")?;

    Ok(result.rows_affected())
}

/// Record an error string on the task without touching its status.
pub async fn set_last_error(pool: &PgPool, task_id: Uuid, error: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET last_error = $1, updated_at = NOW() WHERE id = $2")
            .bind(error)
            .bind(task_id)
            .execute(pool)
            .await
            .context("failed to record last error")?;

    Ok(result.rows_affected())
}

/// Capture the pre-fix error text (fed to the learning store when a later
/// test run passes).
pub async fn set_error_before_fix(pool: &PgPool, task_id: Uuid, error: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET error_before_fix = $1, updated_at = NOW() WHERE id = $2")
            .bind(error)
            .bind(task_id)
            .execute(pool)
            .await
            .context("failed to record error before fix")?;

    Ok(result.rows_affected())
}

/// Increment the attempt counter and return the new value.
pub async fn increment_attempts(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE tasks SET attempt_count = attempt_count + 1, updated_at = NOW() \
         WHERE id = $1 \
         RETURNING attempt_count",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to increment attempt count")?;

    Ok(row.0)
}

/// Store orchestration state and flag the task as orchestrated.
pub async fn set_orchestration_state(
    pool: &PgPool,
    task_id: Uuid,
    state: &OrchestrationState,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET orchestration_state = $1, is_orchestrated = TRUE, updated_at = NOW() \
         WHERE id = $2",
    )
    .bind(Json(state))
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to store orchestration state")?;

    Ok(result.rows_affected())
}
