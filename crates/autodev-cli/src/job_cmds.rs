//! `autodev job` subcommands.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_core::config::EngineConfig;
use autodev_core::jobs::{JobRunner, JobRunnerConfig};
use autodev_db::models::EventType;
use autodev_db::queries::{events, jobs as job_db, tasks as task_db};

use crate::serve_cmd::{build_orchestrator, is_valid_repo};
use crate::JobCommands;

pub async fn run_job_command(command: JobCommands, pool: &PgPool) -> Result<()> {
    match command {
        JobCommands::Create { repo, issues } => create_job(pool, &repo, &issues).await,
        JobCommands::Run {
            job_id,
            max_parallel,
            stop_on_error,
        } => run_job(pool, &job_id, max_parallel, stop_on_error).await,
        JobCommands::Show { job_id } => show_job(pool, job_id.as_deref()).await,
        JobCommands::Cancel { job_id } => cancel_job(pool, &job_id).await,
    }
}

fn parse_id(job_id: &str) -> Result<Uuid> {
    Uuid::parse_str(job_id).with_context(|| format!("invalid job ID: {job_id}"))
}

async fn create_job(pool: &PgPool, repo: &str, issues: &str) -> Result<()> {
    if !is_valid_repo(repo) {
        bail!("Invalid repo format. Expected: owner/repo");
    }

    let issue_numbers: Vec<i64> = issues
        .split(',')
        .map(|s| s.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .context("issues must be comma-separated integers")?;
    if issue_numbers.is_empty() || issue_numbers.len() > 10 {
        bail!("between 1 and 10 issue numbers are required");
    }
    if issue_numbers.iter().any(|n| *n <= 0) {
        bail!("issue numbers must be positive");
    }

    let orchestrator = build_orchestrator(pool.clone(), EngineConfig::from_env())?;

    let mut task_ids = Vec::with_capacity(issue_numbers.len());
    for number in &issue_numbers {
        if let Some(existing) = task_db::find_by_repo_issue(pool, repo, *number).await? {
            println!("  issue #{number}: existing task {}", existing.id);
            task_ids.push(existing.id);
            continue;
        }

        let issue = orchestrator.github().get_issue(repo, *number).await?;
        let task = task_db::insert_task(
            pool,
            &task_db::NewTask {
                repo,
                issue_number: issue.number,
                title: &issue.title,
                body: &issue.body,
                max_attempts: orchestrator.config().default_max_attempts,
                linear_issue_id: None,
            },
        )
        .await?;
        events::insert_event(
            pool,
            &events::NewTaskEvent {
                input_summary: Some(task.title.clone()),
                metadata: serde_json::json!({"source": "cli"}),
                ..events::NewTaskEvent::new(task.id, EventType::Created, "cli")
            },
        )
        .await?;
        println!("  issue #{number}: created task {}", task.id);
        task_ids.push(task.id);
    }

    let job = job_db::insert_job(pool, repo, &task_ids).await?;
    println!("Job {} created with {} task(s).", job.id, task_ids.len());
    println!("Run it with: autodev job run {}", job.id);
    Ok(())
}

async fn run_job(
    pool: &PgPool,
    job_id: &str,
    max_parallel: usize,
    stop_on_error: bool,
) -> Result<()> {
    let id = parse_id(job_id)?;
    let orchestrator = build_orchestrator(pool.clone(), EngineConfig::from_env())?;

    let runner = JobRunner::new(
        pool.clone(),
        Arc::clone(&orchestrator),
        JobRunnerConfig {
            max_parallel,
            continue_on_error: !stop_on_error,
        },
    );

    let result = runner.run(id).await?;

    println!("Job {} finished: {}", id, result.status);
    println!(
        "  completed: {}  failed: {}  in progress: {}",
        result.summary.completed, result.summary.failed, result.summary.in_progress
    );
    for url in &result.summary.prs_created {
        println!("  PR: {url}");
    }
    Ok(())
}

async fn show_job(pool: &PgPool, job_id: Option<&str>) -> Result<()> {
    let Some(job_id) = job_id else {
        let jobs = job_db::list_recent(pool, 20, 0).await?;
        if jobs.is_empty() {
            println!("No jobs found.");
            return Ok(());
        }
        for job in jobs {
            println!(
                "{}  {:<10} {}  {} task(s)",
                job.id,
                job.status.to_string(),
                job.repo,
                job.task_ids.len()
            );
        }
        return Ok(());
    };

    let id = parse_id(job_id)?;
    let job = job_db::get_job(pool, id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    println!("Job {} ({})", job.id, job.repo);
    println!("  status: {}", job.status);
    if let Some(summary) = &job.summary {
        println!(
            "  completed: {}  failed: {}  in progress: {}",
            summary.0.completed, summary.0.failed, summary.0.in_progress
        );
    }
    println!("\nTasks:");
    for task_id in &job.task_ids {
        match task_db::get_task(pool, *task_id).await? {
            Some(task) => println!(
                "  {}  {:<16} #{:<5} {}",
                task.id,
                task.status.to_string(),
                task.issue_number,
                task.title
            ),
            None => println!("  {task_id}  (missing)"),
        }
    }
    Ok(())
}

async fn cancel_job(pool: &PgPool, job_id: &str) -> Result<()> {
    let id = parse_id(job_id)?;
    let rows = job_db::cancel_job(pool, id).await?;
    if rows == 0 {
        bail!("job {job_id} not found or already finished");
    }
    println!("Job {job_id} cancelled.");
    Ok(())
}
