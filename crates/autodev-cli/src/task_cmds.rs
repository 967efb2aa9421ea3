//! `autodev task` subcommands.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_core::config::EngineConfig;
use autodev_db::models::TaskStatus;
use autodev_db::queries::{events, tasks as task_db};

use crate::serve_cmd::build_orchestrator;
use crate::TaskCommands;

pub async fn run_task_command(command: TaskCommands, pool: &PgPool) -> Result<()> {
    match command {
        TaskCommands::Show { task_id } => show_task(pool, &task_id).await,
        TaskCommands::Process { task_id } => process_task(pool, &task_id).await,
        TaskCommands::Reject { task_id, feedback } => {
            reject_task(pool, &task_id, &feedback).await
        }
    }
}

fn parse_id(task_id: &str) -> Result<Uuid> {
    Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))
}

async fn show_task(pool: &PgPool, task_id: &str) -> Result<()> {
    let id = parse_id(task_id)?;
    let task = task_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task {} ({}#{})", task.id, task.repo, task.issue_number);
    println!("  title:    {}", task.title);
    println!("  status:   {}", task.status);
    println!("  attempts: {}/{}", task.attempt_count, task.max_attempts);
    if let Some(complexity) = task.estimated_complexity {
        println!("  complexity: {complexity}");
    }
    if let Some(branch) = &task.branch_name {
        println!("  branch:   {branch}");
    }
    if let Some(url) = &task.pr_url {
        println!("  pr:       {url}");
    }
    if let Some(error) = &task.last_error {
        println!("  last error: {error}");
    }

    let events = events::list_for_task(pool, id).await?;
    println!("\nEvents ({}):", events.len());
    for event in events {
        let tokens = event
            .tokens_used
            .map(|t| format!(" [{t} tok]"))
            .unwrap_or_default();
        println!(
            "  {} {:<20} {}{}",
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.event_type.to_string(),
            event.agent,
            tokens
        );
    }

    Ok(())
}

async fn process_task(pool: &PgPool, task_id: &str) -> Result<()> {
    let id = parse_id(task_id)?;
    let task = task_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    let before = task.status;
    let orchestrator = build_orchestrator(pool.clone(), EngineConfig::from_env())?;
    let task = orchestrator.process(task).await?;

    println!("Task {}: {} -> {}", task.id, before, task.status);
    Ok(())
}

async fn reject_task(pool: &PgPool, task_id: &str, feedback: &str) -> Result<()> {
    let id = parse_id(task_id)?;
    let task = task_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if task.status != TaskStatus::WaitingHuman {
        bail!(
            "task {task_id} is not waiting for human review (status: {})",
            task.status
        );
    }

    let orchestrator = build_orchestrator(pool.clone(), EngineConfig::from_env())?;
    let task = orchestrator.reject_with_feedback(task, feedback).await?;
    let task = orchestrator.process(task).await?;

    println!("Task {} rejected; now {}", task.id, task.status);
    Ok(())
}
