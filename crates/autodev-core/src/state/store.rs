//! DB-backed application of validated state transitions.
//!
//! Validates the edge against the pure table, then executes the update with
//! optimistic locking: the UPDATE pins the expected current status, and a
//! zero row count means another writer got there first.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::TaskStatus;
use autodev_db::queries::tasks as db;

use super::{can_transition, is_terminal};

/// Execute a state transition with optimistic locking.
///
/// Returns an error if:
/// - The transition is not a valid edge.
/// - The current status in the database does not match `from`
///   (optimistic lock failure).
/// - The task does not exist.
pub async fn apply_transition(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<()> {
    if !can_transition(from, to) {
        bail!(
            "invalid state transition: {} -> {} for task {}",
            from,
            to,
            task_id
        );
    }

    let rows = db::transition_status(pool, task_id, from, to)
        .await
        .with_context(|| {
            format!(
                "failed to transition task {} from {} to {}",
                task_id, from, to
            )
        })?;

    if rows == 0 {
        // Either the task does not exist or the status did not match.
        let task = db::get_task(pool, task_id).await?;
        match task {
            None => bail!("task {} not found", task_id),
            Some(t) => bail!(
                "optimistic lock failed: task {} has status {}, expected {}",
                task_id,
                t.status,
                from
            ),
        }
    }

    Ok(())
}

/// Force a task into FAILED from any non-terminal status.
///
/// The only status write that bypasses the `from` pin; the edge itself
/// (any non-terminal -> failed) is still validated.
pub async fn apply_failure(pool: &PgPool, task_id: Uuid, current: TaskStatus) -> Result<()> {
    if is_terminal(current) && current != TaskStatus::Failed {
        bail!(
            "cannot fail task {}: status {} is terminal",
            task_id,
            current
        );
    }

    let rows = db::force_status(pool, task_id, TaskStatus::Failed).await?;
    if rows == 0 {
        bail!("task {} not found", task_id);
    }

    Ok(())
}

/// Walk a multi-edge path, applying each hop with optimistic locking.
///
/// Used where a handler's outcome lands several edges away (the diff
/// validation reroute walks CODING -> CODING_DONE -> TESTING -> TESTS_FAILED
/// because no direct edge exists).
pub async fn apply_path(pool: &PgPool, task_id: Uuid, path: &[TaskStatus]) -> Result<()> {
    for pair in path.windows(2) {
        apply_transition(pool, task_id, pair[0], pair[1]).await?;
    }
    Ok(())
}
