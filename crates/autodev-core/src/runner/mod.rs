//! Multi-candidate agent fan-out.
//!
//! Runs one agent task per model in parallel, each under its own timeout.
//! A timeout or failure yields an error candidate -- peers are never
//! aborted -- and all candidates come back so consensus can reason over
//! failures too.

pub mod consensus;

use std::future::Future;
use std::time::Duration;

use crate::agents::AgentOutcome;

/// One parallel attempt.
#[derive(Debug, Clone)]
pub struct AgentCandidate<T> {
    /// Position in the model list; ties in consensus break toward lower
    /// index.
    pub index: usize,
    pub model: String,
    pub output: Option<T>,
    pub error: Option<String>,
    pub tokens: i64,
    pub duration_ms: i64,
}

impl<T> AgentCandidate<T> {
    pub fn succeeded(&self) -> bool {
        self.output.is_some()
    }
}

/// Launch one task per model and collect every candidate in input order.
///
/// `run` receives the model name and returns the agent future. Each future
/// runs under `timeout`; an elapsed timeout produces an error candidate
/// without touching the others.
pub async fn run_candidates<T, F, Fut>(
    models: &[String],
    timeout: Duration,
    run: F,
) -> Vec<AgentCandidate<T>>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<AgentOutcome<T>>> + Send + 'static,
{
    let mut handles = Vec::with_capacity(models.len());
    for model in models {
        let fut = run(model.clone());
        handles.push((
            model.clone(),
            tokio::spawn(async move { tokio::time::timeout(timeout, fut).await }),
        ));
    }

    let mut candidates = Vec::with_capacity(handles.len());
    for (index, (model, handle)) in handles.into_iter().enumerate() {
        let candidate = match handle.await {
            Ok(Ok(Ok(outcome))) => AgentCandidate {
                index,
                model: outcome.model,
                output: Some(outcome.output),
                error: None,
                tokens: outcome.tokens,
                duration_ms: outcome.duration_ms,
            },
            Ok(Ok(Err(err))) => AgentCandidate {
                index,
                model,
                output: None,
                error: Some(format!("{err:#}")),
                tokens: 0,
                duration_ms: 0,
            },
            Ok(Err(_elapsed)) => AgentCandidate {
                index,
                model,
                output: None,
                error: Some(format!("timed out after {}s", timeout.as_secs())),
                tokens: 0,
                duration_ms: timeout.as_millis() as i64,
            },
            Err(join_err) => AgentCandidate {
                index,
                model,
                output: None,
                error: Some(format!("candidate task panicked: {join_err}")),
                tokens: 0,
                duration_ms: 0,
            },
        };
        candidates.push(candidate);
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(text: &str, tokens: i64) -> AgentOutcome<String> {
        AgentOutcome {
            output: text.to_owned(),
            model: "test-model".to_owned(),
            tokens,
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn collects_candidates_in_input_order() {
        let models = vec!["m0".to_string(), "m1".to_string(), "m2".to_string()];
        let candidates = run_candidates(&models, Duration::from_secs(5), |model| async move {
            // Finish out of order.
            if model == "m0" {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            Ok(outcome(&model, 10))
        })
        .await;

        assert_eq!(candidates.len(), 3);
        for (i, c) in candidates.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.succeeded());
        }
    }

    #[tokio::test]
    async fn failure_becomes_error_candidate_without_aborting_peers() {
        let models = vec!["good".to_string(), "bad".to_string()];
        let candidates = run_candidates(&models, Duration::from_secs(5), |model| async move {
            if model == "bad" {
                anyhow::bail!("provider exploded");
            }
            Ok(outcome("ok", 7))
        })
        .await;

        assert!(candidates[0].succeeded());
        assert!(!candidates[1].succeeded());
        assert!(candidates[1].error.as_deref().unwrap().contains("exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_error_candidate() {
        let models = vec!["slow".to_string(), "fast".to_string()];
        let candidates = run_candidates(&models, Duration::from_millis(50), |model| async move {
            if model == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(outcome("ok", 3))
        })
        .await;

        assert!(!candidates[0].succeeded());
        assert!(candidates[0].error.as_deref().unwrap().contains("timed out"));
        assert!(candidates[1].succeeded());
    }
}
