//! Fixer agent: repairs a diff that failed tests or validation.

use anyhow::Result;
use serde::Deserialize;

use crate::llm::{CompletionRequest, ProviderRegistry};

use super::{AgentOutcome, complete_json, numbered};

pub const AGENT_NAME: &str = "fixer";

const SYSTEM_PROMPT: &str = "\
You are debugging a failing change. You get the plan, the current diff, the \
error output, and the file contents at the branch head. Produce a corrected \
REPLACEMENT diff (not an incremental patch on top of the current one) that \
fixes the errors while still satisfying the definition of done. Respond with \
a single JSON object and nothing else:
{
  \"diff\": \"the corrected unified diff\",
  \"commitMessage\": \"conventional commit message\",
  \"fixDescription\": \"one sentence: what was wrong and what changed\"
}";

#[derive(Debug, Clone)]
pub struct FixerInput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub current_diff: String,
    /// Error logs, possibly enriched with similar fix patterns from the
    /// learning store.
    pub error_logs: String,
    pub file_contents: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixerOutput {
    pub diff: String,
    pub commit_message: String,
    #[serde(default)]
    pub fix_description: Option<String>,
}

pub fn render_user_prompt(input: &FixerInput) -> String {
    format!(
        "## Definition of done\n{}\n\n## Plan\n{}\n\n## Current diff\n{}\n\n\
         ## Error output\n{}\n\n## File contents at branch head\n\n{}",
        numbered(&input.definition_of_done),
        numbered(&input.plan),
        input.current_diff,
        input.error_logs,
        input.file_contents,
    )
}

pub async fn run(
    registry: &ProviderRegistry,
    model: &str,
    input: &FixerInput,
) -> Result<AgentOutcome<FixerOutput>> {
    let req = CompletionRequest::new(model, SYSTEM_PROMPT, render_user_prompt(input));
    complete_json(registry, req).await
}
