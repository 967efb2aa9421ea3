//! Database query functions for the append-only `task_events` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EventType, TaskEvent};

/// Fields for a new event row.
#[derive(Debug, Clone)]
pub struct NewTaskEvent {
    pub task_id: Uuid,
    pub event_type: EventType,
    pub agent: String,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
}

impl NewTaskEvent {
    /// A minimal event with only type and agent attribution.
    pub fn new(task_id: Uuid, event_type: EventType, agent: impl Into<String>) -> Self {
        Self {
            task_id,
            event_type,
            agent: agent.into(),
            input_summary: None,
            output_summary: None,
            tokens_used: None,
            duration_ms: None,
            metadata: serde_json::json!({}),
        }
    }
}

/// Append an event. Events are never mutated afterwards.
pub async fn insert_event(pool: &PgPool, new: &NewTaskEvent) -> Result<TaskEvent> {
    let event = sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events \
             (task_id, event_type, agent, input_summary, output_summary, \
              tokens_used, duration_ms, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.event_type)
    .bind(&new.agent)
    .bind(&new.input_summary)
    .bind(&new.output_summary)
    .bind(new.tokens_used)
    .bind(new.duration_ms)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert task event")?;

    Ok(event)
}

/// All events for one task, in emission order.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list events for task")?;

    Ok(events)
}

/// All events for a set of tasks (job aggregation), in emission order.
pub async fn list_for_tasks(pool: &PgPool, task_ids: &[Uuid]) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = ANY($1) ORDER BY id ASC",
    )
    .bind(task_ids)
    .fetch_all(pool)
    .await
    .context("failed to list events for tasks")?;

    Ok(events)
}

/// Events with id greater than `after_id`, oldest first, capped at `limit`.
///
/// Drives the server-sent event stream: the streamer remembers the last id
/// it delivered and tails from there.
pub async fn events_after(pool: &PgPool, after_id: i64, limit: i64) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE id > $1 ORDER BY id ASC LIMIT $2",
    )
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to tail task events")?;

    Ok(events)
}

/// Summed token usage across all events for one task.
pub async fn token_usage_for_task(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(tokens_used), 0) FROM task_events WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to sum token usage")?;

    Ok(row.0)
}
