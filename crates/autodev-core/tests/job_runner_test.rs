//! Batch job runner tests: partial failure, summary invariants, stop-on-
//! error, and cancellation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use autodev_core::config::EngineConfig;
use autodev_core::jobs::{JobRunner, JobRunnerConfig};
use autodev_core::learning::NoopLearning;
use autodev_core::llm::{Completion, CompletionRequest, LlmError, Provider, ProviderRegistry};
use autodev_core::orchestrator::Orchestrator;
use autodev_db::models::{JobStatus, Task, TaskStatus};
use autodev_db::queries::{jobs as job_db, tasks as task_db};
use autodev_test_utils::{create_test_db, drop_test_db, stub_registry, FakeGithub, StubLlm};

const XL_PLAN: &str = r#"{
    "definitionOfDone": ["too big"],
    "plan": ["no"],
    "targetFiles": ["src/a.ts"],
    "estimatedComplexity": "XL"
}"#;

async fn seed_task(pool: &PgPool, issue: i64, title: &str) -> Task {
    task_db::insert_task(
        pool,
        &task_db::NewTask {
            repo: "acme/web",
            issue_number: issue,
            title,
            body: "body",
            max_attempts: 3,
            linear_issue_id: None,
        },
    )
    .await
    .unwrap()
}

fn test_config() -> EngineConfig {
    EngineConfig {
        validate_diff: false,
        comment_on_failure: false,
        ..EngineConfig::default()
    }
}

fn orchestrator(
    pool: &PgPool,
    registry: Arc<ProviderRegistry>,
    github: Arc<FakeGithub>,
) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        pool.clone(),
        registry,
        github,
        None,
        Arc::new(NoopLearning),
        test_config(),
    ))
}

#[tokio::test]
async fn partial_failure_yields_partial_status() {
    let (pool, db_name) = create_test_db().await;
    let (registry, llm) = stub_registry();
    let github = Arc::new(FakeGithub::new());

    // Task 2's planner estimates XL, which fails that task terminally.
    llm.script_for("planner", "Break everything", XL_PLAN);

    let t1 = seed_task(&pool, 1, "Add a button").await;
    let t2 = seed_task(&pool, 2, "Break everything").await;
    let t3 = seed_task(&pool, 3, "Add a label").await;
    let job = job_db::insert_job(&pool, "acme/web", &[t1.id, t2.id, t3.id])
        .await
        .unwrap();

    let runner = JobRunner::new(
        pool.clone(),
        orchestrator(&pool, registry, github.clone()),
        JobRunnerConfig {
            max_parallel: 2,
            continue_on_error: true,
        },
    );
    let result = runner.run(job.id).await.unwrap();

    assert_eq!(result.status, JobStatus::Partial);
    assert_eq!(result.summary.total, 3);
    assert_eq!(result.summary.completed, 2);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.in_progress, 0);
    assert_eq!(result.summary.prs_created.len(), 2);

    // The persisted job matches the returned result.
    let stored = job_db::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Partial);
    let summary = stored.summary.unwrap().0;
    assert_eq!(
        summary.completed + summary.failed + summary.in_progress,
        summary.total
    );

    let failed = task_db::get_task(&pool, t2.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn all_successes_complete_the_job() {
    let (pool, db_name) = create_test_db().await;
    let (registry, _llm) = stub_registry();
    let github = Arc::new(FakeGithub::new());

    let t1 = seed_task(&pool, 1, "One").await;
    let t2 = seed_task(&pool, 2, "Two").await;
    let job = job_db::insert_job(&pool, "acme/web", &[t1.id, t2.id])
        .await
        .unwrap();

    let runner = JobRunner::new(
        pool.clone(),
        orchestrator(&pool, registry, github.clone()),
        JobRunnerConfig::default(),
    );
    let result = runner.run(job.id).await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.summary.completed, 2);
    assert_eq!(result.summary.prs_created.len(), 2);
    assert_eq!(github.pr_count(), 2);

    // Both tasks rest at WAITING_HUMAN -- a created PR counts as success.
    for id in [t1.id, t2.id] {
        let task = task_db::get_task(&pool, id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::WaitingHuman);
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stop_on_error_leaves_remaining_tasks_untouched() {
    let (pool, db_name) = create_test_db().await;
    let (registry, llm) = stub_registry();
    let github = Arc::new(FakeGithub::new());

    llm.script_for("planner", "Bad first", XL_PLAN);

    let t1 = seed_task(&pool, 1, "Bad first").await;
    let t2 = seed_task(&pool, 2, "Never reached").await;
    let job = job_db::insert_job(&pool, "acme/web", &[t1.id, t2.id])
        .await
        .unwrap();

    let runner = JobRunner::new(
        pool.clone(),
        orchestrator(&pool, registry, github),
        JobRunnerConfig {
            max_parallel: 1,
            continue_on_error: false,
        },
    );
    let result = runner.run(job.id).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.in_progress, 1, "second task never started");

    let untouched = task_db::get_task(&pool, t2.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::New);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ===========================================================================
// Cancellation
// ===========================================================================

/// Wraps the stub: the first completion call cancels the job, then
/// delegates. The driver must observe the cancellation before the next
/// task step.
struct CancelOnFirstCall {
    inner: StubLlm,
    pool: PgPool,
    job_id: Mutex<Option<Uuid>>,
    fired: Mutex<bool>,
}

#[async_trait]
impl Provider for CancelOnFirstCall {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError> {
        let fire = {
            let mut fired = self.fired.lock().unwrap();
            !std::mem::replace(&mut *fired, true)
        };
        if fire {
            let job_id = self.job_id.lock().unwrap().expect("job id set");
            job_db::cancel_job(&self.pool, job_id)
                .await
                .expect("cancel job");
        }
        self.inner.complete(req).await
    }
}

#[tokio::test]
async fn cancellation_stops_further_task_steps() {
    let (pool, db_name) = create_test_db().await;
    let github = Arc::new(FakeGithub::new());

    let cancelling = Arc::new(CancelOnFirstCall {
        inner: StubLlm::new("anthropic"),
        pool: pool.clone(),
        job_id: Mutex::new(None),
        fired: Mutex::new(false),
    });
    let mut registry = ProviderRegistry::new();
    registry.register(cancelling.clone());
    registry.register(Arc::new(StubLlm::new("openai")));

    let t1 = seed_task(&pool, 1, "First").await;
    let t2 = seed_task(&pool, 2, "Second").await;
    let job = job_db::insert_job(&pool, "acme/web", &[t1.id, t2.id])
        .await
        .unwrap();
    *cancelling.job_id.lock().unwrap() = Some(job.id);

    let runner = JobRunner::new(
        pool.clone(),
        orchestrator(&pool, Arc::new(registry), github.clone()),
        JobRunnerConfig {
            max_parallel: 1,
            continue_on_error: true,
        },
    );
    let result = runner.run(job.id).await.unwrap();

    assert_eq!(result.status, JobStatus::Cancelled);
    let stored = job_db::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);

    // The first task finished its in-flight step (planning) but was not
    // driven further; the second was never started.
    let first = task_db::get_task(&pool, t1.id).await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::PlanningDone);
    let second = task_db::get_task(&pool, t2.id).await.unwrap().unwrap();
    assert_eq!(second.status, TaskStatus::New);
    assert_eq!(github.pr_count(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn running_a_cancelled_job_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    let (registry, _llm) = stub_registry();
    let github = Arc::new(FakeGithub::new());

    let t1 = seed_task(&pool, 1, "One").await;
    let job = job_db::insert_job(&pool, "acme/web", &[t1.id]).await.unwrap();
    job_db::cancel_job(&pool, job.id).await.unwrap();

    let runner = JobRunner::new(
        pool.clone(),
        orchestrator(&pool, registry, github),
        JobRunnerConfig::default(),
    );
    let result = runner.run(job.id).await;
    assert!(result.is_err(), "a cancelled job cannot be started");

    // No task steps ran.
    let task = task_db::get_task(&pool, t1.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::New);

    pool.close().await;
    drop_test_db(&db_name).await;
}
