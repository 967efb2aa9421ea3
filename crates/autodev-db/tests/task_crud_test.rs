//! Integration tests for the tasks table: CRUD, the unique issue identity,
//! and the optimistic-locking status updates.

use autodev_db::models::{CommandOrder, Complexity, TaskStatus};
use autodev_db::queries::tasks as db;
use autodev_test_utils::{create_test_db, drop_test_db};

fn new_task<'a>(issue_number: i64) -> db::NewTask<'a> {
    db::NewTask {
        repo: "acme/web",
        issue_number,
        title: "Add dark mode",
        body: "Users want a dark mode toggle.",
        max_attempts: 3,
        linear_issue_id: None,
    }
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task(7)).await.unwrap();
    assert_eq!(task.status, TaskStatus::New);
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.max_attempts, 3);
    assert!(!task.is_orchestrated);

    let fetched = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.title, "Add dark mode");

    let by_issue = db::find_by_repo_issue(&pool, "acme/web", 7)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_issue.id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn repo_issue_identity_is_unique() {
    let (pool, db_name) = create_test_db().await;

    db::insert_task(&pool, &new_task(7)).await.unwrap();
    let duplicate = db::insert_task(&pool, &new_task(7)).await;
    assert!(duplicate.is_err(), "duplicate (repo, issue) must be rejected");

    // Same issue number in a different repo is fine.
    let other = db::NewTask {
        repo: "acme/api",
        ..new_task(7)
    };
    db::insert_task(&pool, &other).await.unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn status_transition_uses_optimistic_locking() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task(1)).await.unwrap();

    let rows = db::transition_status(&pool, task.id, TaskStatus::New, TaskStatus::Planning)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // The task is no longer NEW, so the same transition affects zero rows.
    let rows = db::transition_status(&pool, task.id, TaskStatus::New, TaskStatus::Planning)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let current = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Planning);
    assert!(current.updated_at >= task.updated_at);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn planning_outputs_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task(2)).await.unwrap();

    let dod = vec!["toggle renders".to_owned(), "state persists".to_owned()];
    let plan = vec!["edit component".to_owned()];
    let targets = vec!["src/App.tsx".to_owned(), "src/theme.ts".to_owned()];
    let commands = vec!["npm install".to_owned()];

    db::set_planning_outputs(
        &pool,
        task.id,
        &dod,
        &plan,
        &targets,
        None,
        Complexity::S,
        Some(&commands),
        Some(CommandOrder::BeforeDiff),
    )
    .await
    .unwrap();

    let task = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.definition_of_done(), dod.as_slice());
    assert_eq!(task.plan_steps(), plan.as_slice());
    assert_eq!(task.target_files(), targets.as_slice());
    assert_eq!(task.estimated_complexity, Some(Complexity::S));
    assert_eq!(task.command_order, Some(CommandOrder::BeforeDiff));
    assert_eq!(task.commands.as_ref().unwrap().0, commands);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn attempts_and_errors_accumulate() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task(3)).await.unwrap();

    assert_eq!(db::increment_attempts(&pool, task.id).await.unwrap(), 1);
    assert_eq!(db::increment_attempts(&pool, task.id).await.unwrap(), 2);

    db::set_last_error(&pool, task.id, "[INVALID_DIFF] hunk mismatch")
        .await
        .unwrap();
    db::set_error_before_fix(&pool, task.id, "test failure log")
        .await
        .unwrap();

    let task = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.attempt_count, 2);
    assert!(task.last_error.unwrap().starts_with("[INVALID_DIFF]"));
    assert_eq!(task.error_before_fix.as_deref(), Some("test failure log"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn coding_and_pr_outputs_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task(4)).await.unwrap();

    db::set_branch(&pool, task.id, "auto/4-add-dark-mode").await.unwrap();
    db::set_coding_outputs(&pool, task.id, "--- a/x\n+++ b/x\n", "feat: dark mode")
        .await
        .unwrap();
    db::set_pr_outputs(
        &pool,
        task.id,
        101,
        "https://github.com/acme/web/pull/101",
        "Add dark mode (#4)",
    )
    .await
    .unwrap();

    let task = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.branch_name.as_deref(), Some("auto/4-add-dark-mode"));
    assert_eq!(task.commit_message.as_deref(), Some("feat: dark mode"));
    assert_eq!(task.pr_number, Some(101));
    assert!(task.pr_url.unwrap().ends_with("/pull/101"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn status_listing_is_repo_scoped() {
    let (pool, db_name) = create_test_db().await;

    let a = db::insert_task(&pool, &new_task(10)).await.unwrap();
    let other = db::NewTask {
        repo: "acme/api",
        ..new_task(10)
    };
    let b = db::insert_task(&pool, &other).await.unwrap();

    db::force_status(&pool, a.id, TaskStatus::Testing).await.unwrap();
    db::force_status(&pool, b.id, TaskStatus::Testing).await.unwrap();

    let testing = db::list_by_status_for_repo(&pool, "acme/web", TaskStatus::Testing)
        .await
        .unwrap();
    assert_eq!(testing.len(), 1);
    assert_eq!(testing[0].id, a.id);

    let active = db::list_active(&pool).await.unwrap();
    assert_eq!(active.len(), 2);

    db::force_status(&pool, a.id, TaskStatus::Failed).await.unwrap();
    let active = db::list_active(&pool).await.unwrap();
    assert_eq!(active.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
