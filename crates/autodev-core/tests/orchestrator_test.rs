//! End-to-end orchestrator tests against a real Postgres, a scripted LLM,
//! and an in-memory GitHub.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use autodev_core::config::{EngineConfig, MultiAgentConfig};
use autodev_core::github::CiConclusion;
use autodev_core::learning::NoopLearning;
use autodev_core::orchestrator::Orchestrator;
use autodev_core::state;
use autodev_db::models::{EventType, Task, TaskStatus};
use autodev_db::queries::events::{self, NewTaskEvent};
use autodev_db::queries::tasks as task_db;
use autodev_test_utils::{create_test_db, drop_test_db, stub_registry, FakeGithub, StubLlm};

// ===========================================================================
// Harness
// ===========================================================================

struct Harness {
    pool: PgPool,
    db_name: String,
    github: Arc<FakeGithub>,
    llm: Arc<StubLlm>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(customize: impl FnOnce(&mut EngineConfig)) -> Self {
        let (pool, db_name) = create_test_db().await;
        let (registry, llm) = stub_registry();
        let github = Arc::new(FakeGithub::new());

        let mut config = EngineConfig {
            // The full validator shells out to git; structural validation
            // plus the fake's apply is enough here.
            validate_diff: false,
            ..EngineConfig::default()
        };
        customize(&mut config);

        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            registry,
            github.clone(),
            None,
            Arc::new(NoopLearning),
            config,
        ));

        Self {
            pool,
            db_name,
            github,
            llm,
            orchestrator,
        }
    }

    async fn create_task(&self, issue: i64, title: &str) -> Task {
        let task = task_db::insert_task(
            &self.pool,
            &task_db::NewTask {
                repo: "acme/web",
                issue_number: issue,
                title,
                body: "as described in the issue",
                max_attempts: 3,
                linear_issue_id: None,
            },
        )
        .await
        .unwrap();
        events::insert_event(
            &self.pool,
            &NewTaskEvent::new(task.id, EventType::Created, "test"),
        )
        .await
        .unwrap();
        task
    }

    /// Drive a task the way the job runner does: step until it rests.
    async fn drive(&self, mut task: Task) -> Task {
        for _ in 0..30 {
            if state::is_terminal(task.status) || task.status == TaskStatus::WaitingHuman {
                return task;
            }
            let before = task.status;
            task = self.orchestrator.process(task).await.expect("process step");
            if task.status == before && state::is_waiting(task.status) {
                return task;
            }
        }
        panic!("task did not settle within 30 steps (status {})", task.status);
    }

    async fn event_types(&self, task_id: Uuid) -> Vec<EventType> {
        events::list_for_task(&self.pool, task_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    async fn finish(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn count(types: &[EventType], wanted: EventType) -> usize {
    types.iter().filter(|t| **t == wanted).count()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn happy_path_xs_reaches_waiting_human() {
    let h = Harness::new().await;
    let task = h.create_task(7, "Add dark mode toggle").await;

    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::WaitingHuman);
    assert_eq!(task.attempt_count, 0);
    assert!(task.pr_url.is_some(), "pr_url must be set");
    assert!(task.branch_name.as_deref().unwrap().starts_with("auto/7-"));
    assert_eq!(h.github.pr_count(), 1);

    // Labels and the issue comment went out with the PR.
    let labels = h.github.labels.lock().unwrap().clone();
    assert!(labels.iter().any(|(_, l)| l.contains(&"auto-dev".to_owned())));
    let comments = h.github.comments.lock().unwrap().clone();
    assert!(comments.iter().any(|(n, body)| *n == 7 && body.contains("pull request")));

    let types = h.event_types(task.id).await;
    assert_eq!(
        types,
        vec![
            EventType::Created,
            EventType::Planned,
            EventType::Coded,
            EventType::Tested,
            EventType::Reviewed,
            EventType::PrOpened,
        ]
    );

    h.finish().await;
}

#[tokio::test]
async fn fix_loop_recovers_from_one_ci_failure() {
    let h = Harness::new().await;
    h.github
        .script_ci(&[CiConclusion::Failure, CiConclusion::Success]);

    let task = h.create_task(8, "Fix login crash").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::WaitingHuman);
    assert_eq!(task.attempt_count, 1);

    let types = h.event_types(task.id).await;
    assert_eq!(count(&types, EventType::Fixed), 1, "exactly one FIXED event");
    assert_eq!(count(&types, EventType::Tested), 2, "one failed, one passed");
    assert_eq!(count(&types, EventType::PrOpened), 1);

    h.finish().await;
}

#[tokio::test]
async fn attempt_exhaustion_fails_terminally() {
    let h = Harness::new().await;
    h.github.script_ci(&[CiConclusion::Failure]);

    let task = h.create_task(9, "Flaky forever").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let last_error = task.last_error.expect("last_error must be recorded");
    assert!(
        last_error.starts_with("[MAX_ATTEMPTS_REACHED]"),
        "got: {last_error}"
    );
    assert_eq!(task.attempt_count, 3);

    let types = h.event_types(task.id).await;
    assert_eq!(count(&types, EventType::Completed), 0);
    assert_eq!(count(&types, EventType::Failed), 1);

    // COMMENT_ON_FAILURE is on by default: the issue got a comment.
    let comments = h.github.comments.lock().unwrap().clone();
    assert!(comments.iter().any(|(n, body)| *n == 9 && body.contains("failed")));

    h.finish().await;
}

#[tokio::test]
async fn review_rejection_feedback_reruns_code() {
    let h = Harness::new().await;
    let task = h.create_task(10, "Rename things").await;
    let task = h.drive(task).await;
    assert_eq!(task.status, TaskStatus::WaitingHuman);

    let task = h
        .orchestrator
        .reject_with_feedback(task, "rename var")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::ReviewRejected);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("rename var"));

    // The next step is a fresh CODE pass carrying the feedback.
    let task = h.orchestrator.process(task).await.unwrap();
    assert_eq!(task.status, TaskStatus::CodingDone);

    let types = h.event_types(task.id).await;
    assert_eq!(count(&types, EventType::Coded), 2);

    h.finish().await;
}

#[tokio::test]
async fn terminal_tasks_are_idempotent_no_ops() {
    let h = Harness::new().await;
    h.github.script_ci(&[CiConclusion::Failure]);

    let task = h.create_task(11, "Will fail").await;
    let task = h.drive(task).await;
    assert_eq!(task.status, TaskStatus::Failed);

    let events_before = h.event_types(task.id).await.len();
    let updated_before = task.updated_at;

    let task = h.orchestrator.process(task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.updated_at, updated_before);
    assert_eq!(h.event_types(task.id).await.len(), events_before);

    h.finish().await;
}

#[tokio::test]
async fn xl_complexity_fails_terminally() {
    let h = Harness::new().await;
    h.llm.script(
        "planner",
        r#"{
            "definitionOfDone": ["everything"],
            "plan": ["rewrite the world"],
            "targetFiles": ["src/a.ts"],
            "estimatedComplexity": "XL"
        }"#,
    );

    let task = h.create_task(12, "Rewrite the whole system").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.last_error
            .as_deref()
            .unwrap()
            .starts_with("[COMPLEXITY_TOO_HIGH]")
    );

    h.finish().await;
}

#[tokio::test]
async fn invalid_diff_routes_through_fix() {
    let h = Harness::new().await;
    // First coder output is garbage; the fixer then produces a good diff.
    h.llm.script(
        "coder",
        r#"{"diff": "this is not a diff", "commitMessage": "feat: broken"}"#,
    );

    let task = h.create_task(13, "Small change").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::WaitingHuman);
    assert_eq!(task.attempt_count, 1, "validation failure burns an attempt");

    let types = h.event_types(task.id).await;
    assert_eq!(count(&types, EventType::Fixed), 1);

    h.finish().await;
}

#[tokio::test]
async fn waiting_human_completes_on_pr_merge() {
    let h = Harness::new().await;
    let task = h.create_task(14, "Mergeable").await;
    let task = h.drive(task).await;
    assert_eq!(task.status, TaskStatus::WaitingHuman);
    let pr_number = task.pr_number.unwrap();

    // Not merged yet: re-driving is a no-op.
    let task = h.orchestrator.process(task).await.unwrap();
    assert_eq!(task.status, TaskStatus::WaitingHuman);

    h.github.mark_merged(pr_number);
    let task = h.orchestrator.process(task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let types = h.event_types(task.id).await;
    assert_eq!(count(&types, EventType::Completed), 1);

    h.finish().await;
}

// ===========================================================================
// Breakdown and orchestration
// ===========================================================================

const MEDIUM_PLAN: &str = r#"{
    "definitionOfDone": ["both halves land"],
    "plan": ["first piece", "second piece"],
    "targetFiles": ["src/a.ts", "src/b.ts"],
    "estimatedComplexity": "M"
}"#;

#[tokio::test]
async fn medium_complexity_is_decomposed_and_orchestrated() {
    let h = Harness::new().await;
    h.llm.script("planner", MEDIUM_PLAN);

    let task = h.create_task(20, "Medium feature").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::WaitingHuman);
    assert!(task.is_orchestrated);

    let state = task.orchestration_state.as_ref().unwrap();
    assert_eq!(state.0.subtasks.len(), 2);
    assert!(state.0.all_completed());

    // The aggregated diff carries per-subtask headers in execution order.
    let diff = task.current_diff.as_deref().unwrap();
    let first = diff.find("# subtask sub-1").expect("sub-1 header");
    let second = diff.find("# subtask sub-2").expect("sub-2 header");
    assert!(first < second);

    h.finish().await;
}

#[tokio::test]
async fn subtask_failure_fails_the_parent() {
    let h = Harness::new().await;
    h.llm.script("planner", MEDIUM_PLAN);
    // The second subtask's coder emits a structurally broken diff.
    h.llm.script_for(
        "coder",
        "second piece",
        r#"{"diff": "garbage", "commitMessage": "feat: broken"}"#,
    );

    let task = h.create_task(21, "Medium feature with a bad half").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.last_error
            .as_deref()
            .unwrap()
            .starts_with("[SUBTASK_FAILED]")
    );

    h.finish().await;
}

// ===========================================================================
// Multi-agent consensus
// ===========================================================================

#[tokio::test]
async fn multi_agent_coding_records_consensus() {
    let h = Harness::with_config(|config| {
        config.multi_agent = MultiAgentConfig {
            enabled: true,
            coder_count: 2,
            fixer_count: 2,
            coder_models: vec![
                "claude-sonnet-4-5".to_owned(),
                "claude-haiku-4-5".to_owned(),
            ],
            fixer_models: vec![],
            consensus_strategy: autodev_core::config::ConsensusStrategy::Score,
            timeout: std::time::Duration::from_secs(30),
        };
    })
    .await;
    // Default planner complexity is XS, which never fans out; force S.
    h.llm.script(
        "planner",
        r#"{
            "definitionOfDone": ["done"],
            "plan": ["edit"],
            "targetFiles": ["src/a.ts"],
            "estimatedComplexity": "S"
        }"#,
    );

    let task = h.create_task(30, "Parallel candidates").await;
    let task = h.drive(task).await;

    assert_eq!(task.status, TaskStatus::WaitingHuman);
    assert_eq!(h.llm.calls_for("coder"), 2, "one coder call per model");

    let all = events::list_for_task(&h.pool, task.id).await.unwrap();
    let consensus: Vec<_> = all
        .iter()
        .filter(|e| e.event_type == EventType::ConsensusDecision)
        .collect();
    assert_eq!(consensus.len(), 1);
    let candidates = consensus[0].metadata["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(
        candidates
            .iter()
            .filter(|c| c["winner"] == serde_json::json!(true))
            .count(),
        1
    );

    // The consensus report lands in the PR body.
    let bodies = h.github.pr_bodies.lock().unwrap().clone();
    let body = bodies.values().next().unwrap();
    assert!(body.contains("Multi-agent consensus"));

    h.finish().await;
}
