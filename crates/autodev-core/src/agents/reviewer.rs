//! Reviewer agent: verdict on a diff before the PR opens. Also used to vote
//! on multi-agent candidates under the reviewer consensus strategy.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::llm::{CompletionRequest, ProviderRegistry};

use super::{AgentOutcome, complete_json, numbered};

pub const AGENT_NAME: &str = "reviewer";

const SYSTEM_PROMPT: &str = "\
You are a meticulous code reviewer. Judge whether the diff satisfies the \
definition of done without introducing defects. Tests already passed; focus \
on correctness, scope creep, and maintainability. Respond with a single JSON \
object and nothing else:
{
  \"verdict\": \"APPROVE|REQUEST_CHANGES|NEEDS_DISCUSSION\",
  \"summary\": \"one paragraph\",
  \"comments\": [\"specific file/line observations\"],
  \"suggestedChanges\": [\"optional concrete change requests\"],
  \"score\": 0.0
}
Score from 0.0 (reject) to 1.0 (exemplary).";

/// Review verdicts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    RequestChanges,
    NeedsDiscussion,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "APPROVE",
            Self::RequestChanges => "REQUEST_CHANGES",
            Self::NeedsDiscussion => "NEEDS_DISCUSSION",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ReviewerInput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub diff: String,
    pub file_contents: String,
    pub tests_passed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerOutput {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default)]
    pub comments: Vec<String>,
    #[serde(default)]
    pub suggested_changes: Option<Vec<String>>,
    #[serde(default)]
    pub score: Option<f64>,
}

pub async fn run(
    registry: &ProviderRegistry,
    model: &str,
    input: &ReviewerInput,
) -> Result<AgentOutcome<ReviewerOutput>> {
    let user = format!(
        "## Definition of done\n{}\n\n## Plan\n{}\n\n## Tests passed: {}\n\n\
         ## Diff under review\n{}\n\n## File contents\n\n{}",
        numbered(&input.definition_of_done),
        numbered(&input.plan),
        input.tests_passed,
        input.diff,
        input.file_contents,
    );
    let req = CompletionRequest::new(model, SYSTEM_PROMPT, user);
    complete_json(registry, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_wire_format() {
        assert_eq!(
            serde_json::from_str::<Verdict>("\"REQUEST_CHANGES\"").unwrap(),
            Verdict::RequestChanges
        );
        assert_eq!(
            serde_json::to_string(&Verdict::NeedsDiscussion).unwrap(),
            "\"NEEDS_DISCUSSION\""
        );
    }
}
