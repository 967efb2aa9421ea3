//! HTTP surface: webhook ingress, REST API, and the event stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use autodev_core::config::EngineConfig;
use autodev_core::jobs::{JobRunner, JobRunnerConfig};
use autodev_core::learning::NoopLearning;
use autodev_core::linear::{HttpLinear, LinearClient};
use autodev_core::llm::anthropic::AnthropicProvider;
use autodev_core::llm::openai::OpenAiProvider;
use autodev_core::llm::openrouter::OpenRouterProvider;
use autodev_core::llm::ProviderRegistry;
use autodev_core::github::http::HttpGithub;
use autodev_core::orchestrator::Orchestrator;
use autodev_db::models::{JobStatus, TaskStatus};
use autodev_db::queries::{events, jobs as job_db, tasks as task_db};

use crate::webhook;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Arc<Orchestrator>,
    pub webhook_secret: Option<String>,
    pub job_runner_config: JobRunnerConfig,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/github", post(webhook::handle_webhook))
        .route("/api/health", get(health))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/process", post(process_task))
        .route("/api/tasks/{id}/reject", post(reject_task))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/events", get(job_events))
        .route("/api/jobs/{id}/run", post(run_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/review/pending", get(review_pending))
        .route("/api/logs/stream", get(logs_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Build the production orchestrator from environment configuration.
pub fn build_orchestrator(pool: PgPool, config: EngineConfig) -> Result<Arc<Orchestrator>> {
    let mut registry = ProviderRegistry::new();
    if let Some(key) = config.credentials.anthropic_api_key.clone() {
        registry.register(Arc::new(AnthropicProvider::new(key)));
    }
    if let Some(key) = config.credentials.openai_api_key.clone() {
        registry.register(Arc::new(OpenAiProvider::new(key)));
    }
    if let Some(key) = config.credentials.openrouter_api_key.clone() {
        registry.register(Arc::new(OpenRouterProvider::new(key)));
    }
    if registry.list().is_empty() {
        anyhow::bail!(
            "no LLM provider configured; set at least one of ANTHROPIC_API_KEY, \
             OPENAI_API_KEY, OPENROUTER_API_KEY"
        );
    }

    let github_token = config
        .credentials
        .github_token
        .clone()
        .context("GITHUB_TOKEN is required")?;
    let github = Arc::new(HttpGithub::new(github_token));

    let linear: Option<Arc<dyn LinearClient>> = config
        .credentials
        .linear_api_key
        .clone()
        .map(|key| Arc::new(HttpLinear::new(key)) as Arc<dyn LinearClient>);

    Ok(Arc::new(Orchestrator::new(
        pool,
        Arc::new(registry),
        github,
        linear,
        Arc::new(NoopLearning),
        config,
    )))
}

pub async fn run_serve(
    pool: PgPool,
    bind: &str,
    port: u16,
    webhook_secret: Option<String>,
) -> Result<()> {
    let config = EngineConfig::from_env();
    let orchestrator = build_orchestrator(pool.clone(), config)?;

    if webhook_secret.is_none() {
        tracing::warn!("no webhook secret configured; signature verification is DISABLED");
    }

    let state = AppState {
        pool,
        orchestrator,
        webhook_secret,
        job_runner_config: JobRunnerConfig::default(),
    };

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("autodev serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("autodev serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// `owner/repo`, both sides limited to `[A-Za-z0-9_.-]`.
pub fn is_valid_repo(repo: &str) -> bool {
    let Some((owner, name)) = repo.split_once('/') else {
        return false;
    };
    let part_ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    };
    part_ok(owner) && part_ok(name)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> axum::response::Response {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn list_tasks(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_active(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "tasks": tasks })).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    let events = events::list_for_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "task": task, "events": events })).into_response())
}

async fn process_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    let task = state
        .orchestrator
        .process(task)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    feedback: String,
}

async fn reject_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if task.status != TaskStatus::WaitingHuman {
        return Err(AppError::bad_request(
            "Task is not waiting for human review",
        ));
    }

    let task = state
        .orchestrator
        .reject_with_feedback(task, &body.feedback)
        .await
        .map_err(AppError::internal)?;

    // Re-drive immediately: the rejection feedback goes straight into a
    // fresh CODE pass.
    let task = state
        .orchestrator
        .process(task)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobBody {
    repo: String,
    issue_numbers: Vec<i64>,
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobBody>,
) -> Result<axum::response::Response, AppError> {
    if !is_valid_repo(&body.repo) {
        return Err(AppError::bad_request(
            "Invalid repo format. Expected: owner/repo",
        ));
    }
    if body.issue_numbers.is_empty() {
        return Err(AppError::bad_request("issueNumbers must be a non-empty array"));
    }
    if body.issue_numbers.len() > 10 {
        return Err(AppError::bad_request(
            "issueNumbers must contain at most 10 issues",
        ));
    }
    if body.issue_numbers.iter().any(|n| *n <= 0) {
        return Err(AppError::bad_request(
            "issueNumbers must be positive integers",
        ));
    }

    let mut task_ids = Vec::with_capacity(body.issue_numbers.len());
    for issue_number in &body.issue_numbers {
        // Idempotent on (repo, issue): reuse an existing task.
        if let Some(existing) =
            task_db::find_by_repo_issue(&state.pool, &body.repo, *issue_number)
                .await
                .map_err(AppError::internal)?
        {
            task_ids.push(existing.id);
            continue;
        }

        let issue = state
            .orchestrator
            .github()
            .get_issue(&body.repo, *issue_number)
            .await
            .map_err(|e| AppError::bad_request(format!("issue #{issue_number}: {e:#}")))?;

        let task = task_db::insert_task(
            &state.pool,
            &task_db::NewTask {
                repo: &body.repo,
                issue_number: issue.number,
                title: &issue.title,
                body: &issue.body,
                max_attempts: state.orchestrator.config().default_max_attempts,
                linear_issue_id: None,
            },
        )
        .await
        .map_err(AppError::internal)?;

        events::insert_event(
            &state.pool,
            &events::NewTaskEvent {
                input_summary: Some(task.title.clone()),
                metadata: json!({"source": "job"}),
                ..events::NewTaskEvent::new(
                    task.id,
                    autodev_db::models::EventType::Created,
                    "job-api",
                )
            },
        )
        .await
        .map_err(AppError::internal)?;

        task_ids.push(task.id);
    }

    let job = job_db::insert_job(&state.pool, &body.repo, &task_ids)
        .await
        .map_err(AppError::internal)?;

    Ok((StatusCode::CREATED, Json(json!({ "job": job }))).into_response())
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<axum::response::Response, AppError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    let jobs = job_db::list_recent(&state.pool, limit, (page - 1) * limit)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "jobs": jobs, "page": page, "limit": limit })).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let job = job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    let mut tasks = Vec::with_capacity(job.task_ids.len());
    for task_id in &job.task_ids {
        if let Some(task) = task_db::get_task(&state.pool, *task_id)
            .await
            .map_err(AppError::internal)?
        {
            tasks.push(task);
        }
    }

    Ok(Json(json!({ "job": job, "tasks": tasks })).into_response())
}

async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let job = job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    let events = events::list_for_tasks(&state.pool, &job.task_ids)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({ "events": events })).into_response())
}

async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let job = job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    if job.status != JobStatus::Pending {
        return Err(AppError::bad_request(format!(
            "Job is not pending (status: {})",
            job.status
        )));
    }

    // Processing is asynchronous; progress is visible via GET /api/jobs/:id.
    let runner = JobRunner::new(
        state.pool.clone(),
        Arc::clone(&state.orchestrator),
        state.job_runner_config.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = runner.run(id).await {
            tracing::error!(job_id = %id, error = %format!("{e:#}"), "job run failed");
        }
    });

    Ok(Json(json!({ "ok": true, "job_id": id, "started": true })).into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let job = job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    if job.status.is_terminal() {
        return Err(AppError::bad_request(format!(
            "Job already finished (status: {})",
            job.status
        )));
    }

    job_db::cancel_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({ "ok": true, "job_id": id, "status": "cancelled" })).into_response())
}

async fn review_pending(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let Some(linear) = state.orchestrator.linear() else {
        return Err(AppError::service_unavailable("Linear integration disabled"));
    };

    let issues = linear
        .pending_review()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "issues": issues })).into_response())
}

/// Server-sent event stream of the task event log, tailed from the DB.
async fn logs_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let pool = state.pool.clone();
    let stream = async_stream::stream! {
        let mut last_id = 0i64;
        loop {
            match events::events_after(&pool, last_id, 100).await {
                Ok(batch) => {
                    for event in batch {
                        last_id = event.id;
                        if let Ok(data) = serde_json::to_string(&event) {
                            yield Ok(Event::default().data(data));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "event stream query failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
