//! Integration tests for the jobs, task_events, and patches tables.

use autodev_db::models::{EventType, JobStatus, JobSummary};
use autodev_db::queries::{events, jobs, patches, tasks};
use autodev_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

async fn seed_task(pool: &sqlx::PgPool, issue: i64) -> Uuid {
    tasks::insert_task(
        pool,
        &tasks::NewTask {
            repo: "acme/web",
            issue_number: issue,
            title: "task",
            body: "",
            max_attempts: 3,
            linear_issue_id: None,
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn job_lifecycle_and_summary() {
    let (pool, db_name) = create_test_db().await;

    let t1 = seed_task(&pool, 1).await;
    let t2 = seed_task(&pool, 2).await;

    let job = jobs::insert_job(&pool, "acme/web", &[t1, t2]).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.task_ids, vec![t1, t2]);

    let moved = jobs::transition_status(&pool, job.id, JobStatus::Pending, JobStatus::Running)
        .await
        .unwrap();
    assert_eq!(moved, 1);

    // Optimistic lock: the job is no longer pending.
    let moved = jobs::transition_status(&pool, job.id, JobStatus::Pending, JobStatus::Running)
        .await
        .unwrap();
    assert_eq!(moved, 0);

    let summary = JobSummary {
        total: 2,
        completed: 1,
        failed: 1,
        in_progress: 0,
        prs_created: vec!["https://github.com/acme/web/pull/5".to_owned()],
    };
    jobs::finish_job(&pool, job.id, JobStatus::Partial, &summary)
        .await
        .unwrap();

    let job = jobs::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Partial);
    let stored = job.summary.unwrap().0;
    assert_eq!(stored.completed + stored.failed + stored.in_progress, stored.total);
    assert_eq!(stored.prs_created.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_only_affects_unfinished_jobs() {
    let (pool, db_name) = create_test_db().await;

    let t1 = seed_task(&pool, 1).await;
    let job = jobs::insert_job(&pool, "acme/web", &[t1]).await.unwrap();

    assert_eq!(jobs::cancel_job(&pool, job.id).await.unwrap(), 1);
    // Already cancelled: no-op.
    assert_eq!(jobs::cancel_job(&pool, job.id).await.unwrap(), 0);

    let job = jobs::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_recent_pages_newest_first() {
    let (pool, db_name) = create_test_db().await;

    for i in 0..3 {
        let t = seed_task(&pool, 100 + i).await;
        jobs::insert_job(&pool, "acme/web", &[t]).await.unwrap();
    }

    let first_page = jobs::list_recent(&pool, 2, 0).await.unwrap();
    assert_eq!(first_page.len(), 2);
    let second_page = jobs::list_recent(&pool, 2, 2).await.unwrap();
    assert_eq!(second_page.len(), 1);
    assert!(first_page[0].created_at >= second_page[0].created_at);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn events_are_ordered_and_tailable() {
    let (pool, db_name) = create_test_db().await;

    let task_id = seed_task(&pool, 1).await;

    for (event_type, agent) in [
        (EventType::Created, "webhook"),
        (EventType::Planned, "planner"),
        (EventType::Coded, "coder"),
    ] {
        events::insert_event(
            &pool,
            &events::NewTaskEvent {
                tokens_used: Some(100),
                ..events::NewTaskEvent::new(task_id, event_type, agent)
            },
        )
        .await
        .unwrap();
    }

    let all = events::list_for_task(&pool, task_id).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].event_type, EventType::Created);
    assert_eq!(all[2].event_type, EventType::Coded);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    // Tail from the middle.
    let tail = events::events_after(&pool, all[0].id, 10).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].event_type, EventType::Planned);

    let tokens = events::token_usage_for_task(&pool, task_id).await.unwrap();
    assert_eq!(tokens, 300);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn patches_accumulate_per_task() {
    let (pool, db_name) = create_test_db().await;

    let task_id = seed_task(&pool, 1).await;

    patches::insert_patch(&pool, task_id, "--- a/x\n+++ b/x\n", Some("abc1234"))
        .await
        .unwrap();
    patches::insert_patch(&pool, task_id, "--- a/y\n+++ b/y\n", None)
        .await
        .unwrap();

    let all = patches::list_for_task(&pool, task_id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].commit_sha.as_deref(), Some("abc1234"));
    assert!(all[0].applied_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}
