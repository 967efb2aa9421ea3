//! GitHub webhook ingress: signature verification and event handlers.
//!
//! Signature verification is HMAC-SHA256 over the raw request body,
//! compared in constant time against the `X-Hub-Signature-256` header.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use autodev_db::models::{EventType, TaskStatus};
use autodev_db::queries::events::{self, NewTaskEvent};
use autodev_db::queries::tasks as task_db;

use crate::serve_cmd::{AppError, AppState};

type HmacSha256 = Hmac<Sha256>;

/// The label that marks an issue for automated development.
pub const TRIGGER_LABEL: &str = "auto-dev";

/// Verify `sha256=<hex>` against the body using constant-time comparison.
///
/// The `hmac` crate's `verify_slice` is constant-time; everything before it
/// is format parsing that does not depend on secret data.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

// ---------------------------------------------------------------------------
// Payloads (only the fields the engine reads)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssuesEvent {
    action: String,
    issue: IssuePayload,
    #[serde(default)]
    label: Option<Label>,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct CheckRunEvent {
    action: String,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Review {
    state: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    number: i64,
}

#[derive(Debug, Deserialize)]
struct PullRequestReviewEvent {
    action: String,
    review: Review,
    pull_request: PullRequestRef,
    repository: Repository,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// `POST /webhooks/github`
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, AppError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid signature"})),
            )
                .into_response());
        }
    }

    let event = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let response = match event.as_str() {
        "issues" => handle_issues(&state, &body).await?,
        "check_run" => handle_check_run(&state, &body).await?,
        "pull_request_review" => handle_pull_request_review(&state, &body).await?,
        other => {
            tracing::debug!(event = other, "ignoring webhook event");
            json!({"ok": true, "ignored": true})
        }
    };

    Ok(Json(response).into_response())
}

/// `issues.labeled` with the trigger label: idempotently create a task and
/// drive its first step.
async fn handle_issues(state: &AppState, body: &[u8]) -> Result<serde_json::Value, AppError> {
    let event: IssuesEvent =
        serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("bad payload: {e}")))?;

    let labeled = event.action == "labeled"
        && event
            .label
            .as_ref()
            .map(|l| l.name == TRIGGER_LABEL)
            .unwrap_or(false);
    if !labeled {
        return Ok(json!({"ok": true, "ignored": true}));
    }

    let repo = event.repository.full_name;
    let issue = event.issue;

    // Idempotent on (repo, issue).
    if let Some(existing) = task_db::find_by_repo_issue(&state.pool, &repo, issue.number)
        .await
        .map_err(AppError::internal)?
    {
        return Ok(json!({"ok": true, "task_id": existing.id, "created": false}));
    }

    let linear_issue_id = match state.orchestrator.linear() {
        Some(linear) => linear.link_issue(&issue.title).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Linear link failed");
            None
        }),
        None => None,
    };

    let task = task_db::insert_task(
        &state.pool,
        &task_db::NewTask {
            repo: &repo,
            issue_number: issue.number,
            title: &issue.title,
            body: issue.body.as_deref().unwrap_or(""),
            max_attempts: state.orchestrator.config().default_max_attempts,
            linear_issue_id: linear_issue_id.as_deref(),
        },
    )
    .await
    .map_err(AppError::internal)?;

    events::insert_event(
        &state.pool,
        &NewTaskEvent {
            input_summary: Some(task.title.clone()),
            metadata: json!({"source": "webhook", "label": TRIGGER_LABEL}),
            ..NewTaskEvent::new(task.id, EventType::Created, "webhook")
        },
    )
    .await
    .map_err(AppError::internal)?;

    tracing::info!(task_id = %task.id, repo = %repo, issue = issue.number, "task created");

    let processed = state
        .orchestrator
        .process(task.clone())
        .await
        .map_err(AppError::internal)?;

    Ok(json!({
        "ok": true,
        "task_id": task.id,
        "created": true,
        "status": processed.status,
    }))
}

/// `check_run.completed`: re-drive every TESTING task for the repo.
async fn handle_check_run(state: &AppState, body: &[u8]) -> Result<serde_json::Value, AppError> {
    let event: CheckRunEvent =
        serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("bad payload: {e}")))?;

    if event.action != "completed" {
        return Ok(json!({"ok": true, "ignored": true}));
    }

    let testing = task_db::list_by_status_for_repo(
        &state.pool,
        &event.repository.full_name,
        TaskStatus::Testing,
    )
    .await
    .map_err(AppError::internal)?;

    let mut processed = 0usize;
    for task in testing {
        let task_id = task.id;
        if let Err(e) = state.orchestrator.process(task).await {
            tracing::warn!(task_id = %task_id, error = %e, "check_run re-drive failed");
        } else {
            processed += 1;
        }
    }

    Ok(json!({"ok": true, "processed": processed}))
}

/// `pull_request_review` submitted with changes requested: feed the review
/// back into the pipeline.
async fn handle_pull_request_review(
    state: &AppState,
    body: &[u8],
) -> Result<serde_json::Value, AppError> {
    let event: PullRequestReviewEvent =
        serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("bad payload: {e}")))?;

    if event.action != "submitted" || event.review.state != "changes_requested" {
        return Ok(json!({"ok": true, "ignored": true}));
    }

    let Some(task) = task_db::find_by_pr_number(
        &state.pool,
        &event.repository.full_name,
        event.pull_request.number,
    )
    .await
    .map_err(AppError::internal)?
    else {
        return Ok(json!({"ok": true, "ignored": true, "reason": "no task for PR"}));
    };

    if task.status != TaskStatus::WaitingHuman {
        return Ok(json!({
            "ok": true,
            "ignored": true,
            "reason": format!("task status is {}", task.status),
        }));
    }
    if task.attempts_exhausted() {
        return Ok(json!({"ok": true, "ignored": true, "reason": "attempts exhausted"}));
    }

    let feedback = event
        .review
        .body
        .unwrap_or_else(|| "Reviewer requested changes.".to_owned());
    let task = state
        .orchestrator
        .reject_with_feedback(task, &feedback)
        .await
        .map_err(AppError::internal)?;

    // Re-drive: the next step is a fresh CODE pass with the feedback.
    let task = state
        .orchestrator
        .process(task)
        .await
        .map_err(AppError::internal)?;

    Ok(json!({"ok": true, "task_id": task.id, "status": task.status}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"action":"labeled"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &header));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let body = br#"{"action":"labeled"}"#;
        let header = sign("topsecret", body);
        assert!(!verify_signature("topsecret", br#"{"action":"opened"}"#, &header));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let header = sign("topsecret", body);
        assert!(!verify_signature("othersecret", body, &header));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(!verify_signature("s", b"body", ""));
        assert!(!verify_signature("s", b"body", "sha1=abcdef"));
        assert!(!verify_signature("s", b"body", "sha256=not-hex!"));
    }

    #[test]
    fn near_miss_signature_is_rejected() {
        let body = b"payload";
        let header = sign("topsecret", body);
        // Flip the last hex digit.
        let mut tampered = header.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(!verify_signature("topsecret", body, &tampered));
    }
}
