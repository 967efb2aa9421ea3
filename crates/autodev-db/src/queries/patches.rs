//! Database query functions for the `patches` audit table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Patch;

/// Record an applied diff. `commit_sha` is the commit the application
/// produced on the working branch.
pub async fn insert_patch(
    pool: &PgPool,
    task_id: Uuid,
    diff: &str,
    commit_sha: Option<&str>,
) -> Result<Patch> {
    let patch = sqlx::query_as::<_, Patch>(
        "INSERT INTO patches (task_id, diff, commit_sha, applied_at) \
         VALUES ($1, $2, $3, NOW()) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(diff)
    .bind(commit_sha)
    .fetch_one(pool)
    .await
    .context("failed to insert patch")?;

    Ok(patch)
}

/// All patches applied for one task, oldest first.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Patch>> {
    let patches = sqlx::query_as::<_, Patch>(
        "SELECT * FROM patches WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list patches for task")?;

    Ok(patches)
}
