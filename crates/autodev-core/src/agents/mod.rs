//! Concrete phase agents.
//!
//! Each agent owns its system prompt, renders a typed input into the user
//! prompt, dispatches through the provider registry, and parses the JSON
//! reply leniently into a typed output. No inheritance: the shared pieces
//! are plain helpers, not a base class.

pub mod breakdown;
pub mod coder;
pub mod fixer;
pub mod planner;
pub mod reflection;
pub mod reviewer;

use std::time::Instant;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::llm::{CompletionRequest, ProviderRegistry};

/// A typed agent result with usage attribution for the event log.
#[derive(Debug, Clone)]
pub struct AgentOutcome<T> {
    pub output: T,
    pub model: String,
    pub tokens: i64,
    pub duration_ms: i64,
}

/// Dispatch a completion and parse its reply into `T` with JSON recovery.
pub(crate) async fn complete_json<T: DeserializeOwned>(
    registry: &ProviderRegistry,
    req: CompletionRequest,
) -> Result<AgentOutcome<T>> {
    let model = req.model.clone();
    let started = Instant::now();

    let completion = registry
        .complete(&req)
        .await
        .with_context(|| format!("completion via {model} failed"))?;

    let output = crate::llm::json::parse_lenient::<T>(&completion.text)
        .with_context(|| format!("agent reply from {model} was not recoverable JSON"))?;

    Ok(AgentOutcome {
        output,
        model,
        tokens: completion.total_tokens(),
        duration_ms: started.elapsed().as_millis() as i64,
    })
}

/// Render an ordered list as a numbered prompt section.
pub(crate) fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {item}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_renders_one_based() {
        let items = vec!["first".to_string(), "second".to_string()];
        assert_eq!(numbered(&items), "1. first\n2. second");
    }
}
