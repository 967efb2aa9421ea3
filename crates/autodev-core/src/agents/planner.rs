//! Planner agent: turns an issue plus repo context into a definition of
//! done, an ordered plan, target files, and a complexity estimate.

use anyhow::Result;
use serde::Deserialize;

use autodev_db::models::{CommandOrder, Complexity, FilePlan};

use crate::llm::{CompletionRequest, ProviderRegistry};

use super::{AgentOutcome, complete_json};

pub const AGENT_NAME: &str = "planner";

const SYSTEM_PROMPT: &str = "\
You are a senior software engineer planning the implementation of a GitHub \
issue. Study the issue and the repository context, then produce a precise, \
minimal plan. Respond with a single JSON object and nothing else:
{
  \"definitionOfDone\": [\"verifiable completion criteria, ordered\"],
  \"plan\": [\"implementation steps, ordered\"],
  \"targetFiles\": [\"repo-relative paths that must change\"],
  \"estimatedComplexity\": \"XS|S|M|L|XL\",
  \"risks\": [\"optional risks\"],
  \"multiFilePlan\": [{\"path\": \"...\", \"action\": \"create|modify|delete\", \"description\": \"...\"}],
  \"commands\": [\"optional project commands, e.g. npm install\"],
  \"commandOrder\": \"before_diff|after_diff\"
}
Estimate complexity honestly: XS is a one-file tweak, XL is a multi-system \
change that should not be attempted in one pass.";

#[derive(Debug, Clone)]
pub struct PlannerInput {
    pub issue_title: String,
    /// Issue body, possibly enriched with learned failure modes and repo
    /// conventions.
    pub issue_body: String,
    pub repo_context: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerOutput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    pub estimated_complexity: Complexity,
    #[serde(default)]
    pub risks: Option<Vec<String>>,
    #[serde(default)]
    pub multi_file_plan: Option<Vec<FilePlan>>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub command_order: Option<CommandOrder>,
}

pub async fn run(
    registry: &ProviderRegistry,
    model: &str,
    input: &PlannerInput,
) -> Result<AgentOutcome<PlannerOutput>> {
    let user = format!(
        "## Issue: {}\n\n{}\n\n## Repository context\n\n{}",
        input.issue_title, input.issue_body, input.repo_context
    );

    let req = CompletionRequest::new(model, SYSTEM_PROMPT, user);
    complete_json(registry, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_parses_from_wire_json() {
        let raw = r#"{
            "definitionOfDone": ["button renders"],
            "plan": ["edit component"],
            "targetFiles": ["src/a.ts"],
            "estimatedComplexity": "XS",
            "commands": ["npm install"],
            "commandOrder": "before_diff"
        }"#;
        let parsed: PlannerOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.estimated_complexity, Complexity::Xs);
        assert_eq!(parsed.command_order, Some(CommandOrder::BeforeDiff));
        assert!(parsed.risks.is_none());
    }
}
