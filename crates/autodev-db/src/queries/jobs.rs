//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Job, JobStatus, JobSummary};

/// Insert a new pending job over the given task ids.
pub async fn insert_job(pool: &PgPool, repo: &str, task_ids: &[Uuid]) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (repo, task_ids) VALUES ($1, $2) RETURNING *",
    )
    .bind(repo)
    .bind(task_ids)
    .fetch_one(pool)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// Recent jobs, newest first, with offset pagination.
pub async fn list_recent(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list jobs")?;

    Ok(jobs)
}

/// Atomically transition a job between statuses (optimistic lock on `from`).
pub async fn transition_status(
    pool: &PgPool,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(job_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition job status")?;

    Ok(result.rows_affected())
}

/// Persist the derived final status and summary of a finished run.
pub async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    summary: &JobSummary,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = $1, summary = $2, updated_at = NOW() WHERE id = $3",
    )
    .bind(status)
    .bind(Json(summary))
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to finish job")?;

    Ok(result.rows_affected())
}

/// Update the running summary after a batch settles.
pub async fn update_summary(pool: &PgPool, job_id: Uuid, summary: &JobSummary) -> Result<u64> {
    let result =
        sqlx::query("UPDATE jobs SET summary = $1, updated_at = NOW() WHERE id = $2")
            .bind(Json(summary))
            .bind(job_id)
            .execute(pool)
            .await
            .context("failed to update job summary")?;

    Ok(result.rows_affected())
}

/// Cancel a job that has not yet finished.
///
/// Returns the number of rows affected (0 when the job is already terminal
/// or absent).
pub async fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', updated_at = NOW() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to cancel job")?;

    Ok(result.rows_affected())
}
