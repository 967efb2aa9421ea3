//! Reflection agent: after repeated failures, decides whether to keep
//! fixing or to throw the plan away and replan.

use anyhow::Result;
use serde::Deserialize;

use crate::llm::{CompletionRequest, ProviderRegistry};

use super::{AgentOutcome, complete_json, numbered};

pub const AGENT_NAME: &str = "reflection";

const SYSTEM_PROMPT: &str = "\
A coding task has failed its tests repeatedly. Decide whether the plan \
itself is wrong (REPLAN) or the implementation just needs another fix pass \
(FIX). Replanning is expensive; choose it only when the errors indicate the \
approach cannot work. Respond with a single JSON object and nothing else:
{
  \"decision\": \"REPLAN|FIX\",
  \"reasoning\": \"one paragraph\"
}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReflectionDecision {
    Replan,
    Fix,
}

#[derive(Debug, Clone)]
pub struct ReflectionInput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub attempt_count: i32,
    pub error_history: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionOutput {
    pub decision: ReflectionDecision,
    pub reasoning: String,
}

pub async fn run(
    registry: &ProviderRegistry,
    model: &str,
    input: &ReflectionInput,
) -> Result<AgentOutcome<ReflectionOutput>> {
    let user = format!(
        "## Definition of done\n{}\n\n## Plan\n{}\n\n## Failed attempts: {}\n\n## Error history\n{}",
        numbered(&input.definition_of_done),
        numbered(&input.plan),
        input.attempt_count,
        input.error_history,
    );
    let req = CompletionRequest::new(model, SYSTEM_PROMPT, user);
    complete_json(registry, req).await
}
