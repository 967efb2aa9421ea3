//! Breakdown agent: decomposes an M/L issue into ordered subtasks.

use anyhow::Result;
use serde::Deserialize;

use autodev_db::models::SubtaskDef;

use crate::llm::{CompletionRequest, ProviderRegistry};

use super::{AgentOutcome, complete_json, numbered};

pub const AGENT_NAME: &str = "breakdown";

const SYSTEM_PROMPT: &str = "\
You decompose a large issue into independent subtasks a coding agent can \
execute one at a time. Each subtask must be XS or S complexity, touch a \
small set of files, and name its dependencies by subtask id. Respond with a \
single JSON object and nothing else:
{
  \"subtasks\": [{
    \"id\": \"sub-1\",
    \"title\": \"...\",
    \"description\": \"...\",
    \"targetFiles\": [\"...\"],
    \"dependsOn\": [],
    \"acceptanceCriteria\": [\"...\"],
    \"complexity\": \"XS|S|M|L|XL\"
  }],
  \"executionOrder\": [\"sub-1\", \"sub-2\"],
  \"parallelGroups\": [[\"sub-2\", \"sub-3\"]]
}";

#[derive(Debug, Clone)]
pub struct BreakdownInput {
    pub issue_title: String,
    pub issue_body: String,
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub target_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownOutput {
    pub subtasks: Vec<SubtaskDef>,
    pub execution_order: Vec<String>,
    #[serde(default)]
    pub parallel_groups: Option<Vec<Vec<String>>>,
}

pub async fn run(
    registry: &ProviderRegistry,
    model: &str,
    input: &BreakdownInput,
) -> Result<AgentOutcome<BreakdownOutput>> {
    let user = format!(
        "## Issue: {}\n\n{}\n\n## Definition of done\n{}\n\n## Plan\n{}\n\n## Target files\n{}",
        input.issue_title,
        input.issue_body,
        numbered(&input.definition_of_done),
        numbered(&input.plan),
        input.target_files.join("\n"),
    );
    let req = CompletionRequest::new(model, SYSTEM_PROMPT, user);
    complete_json(registry, req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodev_db::models::Complexity;

    #[test]
    fn output_parses_from_wire_json() {
        let raw = r#"{
            "subtasks": [{
                "id": "sub-1",
                "title": "Add model",
                "description": "Define the model struct",
                "targetFiles": ["src/models.ts"],
                "dependsOn": [],
                "acceptanceCriteria": ["compiles"],
                "complexity": "XS"
            }],
            "executionOrder": ["sub-1"]
        }"#;
        let parsed: BreakdownOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.subtasks.len(), 1);
        assert_eq!(parsed.subtasks[0].complexity, Complexity::Xs);
        assert!(parsed.parallel_groups.is_none());
    }
}
