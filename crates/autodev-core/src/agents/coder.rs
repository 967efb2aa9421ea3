//! Coder agent: produces a unified diff implementing the plan.

use anyhow::Result;
use serde::Deserialize;

use crate::llm::{CompletionRequest, ProviderRegistry};

use super::{AgentOutcome, complete_json, numbered};

pub const AGENT_NAME: &str = "coder";

const SYSTEM_PROMPT: &str = "\
You are an expert software engineer implementing a planned change. Produce a \
clean unified diff against the provided file contents. Rules:
- Only touch the target files.
- The diff must be a valid unified diff: ---/+++ file headers with a/ and b/ \
prefixes, @@ hunk headers with correct line counts, one leading space for \
context lines.
- Never include merge conflict markers.
Respond with a single JSON object and nothing else:
{
  \"diff\": \"the unified diff\",
  \"commitMessage\": \"conventional commit message\",
  \"filesModified\": [\"paths\"],
  \"notes\": \"optional notes for the reviewer\"
}";

#[derive(Debug, Clone)]
pub struct CoderInput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub target_files: Vec<String>,
    pub file_contents: String,
    /// Set on retries: the previous diff and why it was rejected.
    pub previous_diff: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoderOutput {
    pub diff: String,
    pub commit_message: String,
    #[serde(default)]
    pub files_modified: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn render_user_prompt(input: &CoderInput) -> String {
    let mut user = format!(
        "## Definition of done\n{}\n\n## Plan\n{}\n\n## Target files\n{}\n\n## File contents\n\n{}",
        numbered(&input.definition_of_done),
        numbered(&input.plan),
        input.target_files.join("\n"),
        input.file_contents,
    );
    if let Some(prev) = &input.previous_diff {
        user.push_str(&format!("\n\n## Previous diff (rejected)\n{prev}"));
    }
    if let Some(err) = &input.last_error {
        user.push_str(&format!("\n\n## Why it was rejected\n{err}"));
    }
    user
}

pub async fn run(
    registry: &ProviderRegistry,
    model: &str,
    input: &CoderInput,
) -> Result<AgentOutcome<CoderOutput>> {
    let req = CompletionRequest::new(model, SYSTEM_PROMPT, render_user_prompt(input));
    complete_json(registry, req).await
}
