//! A scripted LLM provider for integration tests.
//!
//! Classifies each request by its system prompt and replies with either a
//! queued response for that agent kind or a sensible default. Never touches
//! the network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use autodev_core::llm::{Completion, CompletionRequest, LlmError, Provider};

/// A well-formed 4-line diff used by the default coder/fixer responses.
pub const STUB_DIFF: &str = "--- a/src/a.ts\\n+++ b/src/a.ts\\n@@ -1,2 +1,3 @@\\n const a = 1;\\n+const b = 2;\\n export { a };";

fn default_response(kind: &str) -> String {
    match kind {
        "planner" => r#"{
            "definitionOfDone": ["the change is implemented", "tests pass"],
            "plan": ["edit src/a.ts", "verify"],
            "targetFiles": ["src/a.ts"],
            "estimatedComplexity": "XS"
        }"#
        .to_owned(),
        "coder" => format!(
            r#"{{"diff": "{STUB_DIFF}", "commitMessage": "feat: add b constant", "filesModified": ["src/a.ts"]}}"#
        ),
        "fixer" => format!(
            r#"{{"diff": "{STUB_DIFF}", "commitMessage": "fix: correct b constant", "fixDescription": "adjusted the constant"}}"#
        ),
        "reviewer" => r#"{
            "verdict": "APPROVE",
            "summary": "Clean, minimal change that satisfies the definition of done.",
            "comments": [],
            "score": 0.9
        }"#
        .to_owned(),
        "breakdown" => format!(
            r#"{{
            "subtasks": [
                {{"id": "sub-1", "title": "first piece", "description": "do the first piece",
                 "targetFiles": ["src/a.ts"], "dependsOn": [], "acceptanceCriteria": ["works"],
                 "complexity": "XS"}},
                {{"id": "sub-2", "title": "second piece", "description": "do the second piece",
                 "targetFiles": ["src/b.ts"], "dependsOn": ["sub-1"], "acceptanceCriteria": ["works"],
                 "complexity": "XS"}}
            ],
            "executionOrder": ["sub-1", "sub-2"]
        }}"#
        ),
        "reflection" => r#"{"decision": "FIX", "reasoning": "The errors look shallow."}"#.to_owned(),
        _ => "{}".to_owned(),
    }
}

/// Map a system prompt to the agent kind it belongs to.
pub fn classify_system_prompt(system: &str) -> &'static str {
    if system.contains("planning the implementation") {
        "planner"
    } else if system.contains("implementing a planned change") {
        "coder"
    } else if system.contains("debugging a failing change") {
        "fixer"
    } else if system.contains("code reviewer") {
        "reviewer"
    } else if system.contains("decompose") {
        "breakdown"
    } else if system.contains("failed its tests repeatedly") {
        "reflection"
    } else {
        "unknown"
    }
}

pub struct StubLlm {
    provider_name: &'static str,
    scripted: Mutex<HashMap<&'static str, VecDeque<String>>>,
    /// (kind, user-prompt substring, response) matchers, checked before the
    /// FIFO queue. Not consumed; matching is stable under concurrency.
    matchers: Mutex<Vec<(&'static str, String, String)>>,
    /// Every request's (kind, model), in call order.
    pub calls: Mutex<Vec<(String, String)>>,
}

impl StubLlm {
    pub fn new(provider_name: &'static str) -> Self {
        Self {
            provider_name,
            scripted: Mutex::new(HashMap::new()),
            matchers: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response for an agent kind; consumed in FIFO order before
    /// the default kicks in.
    pub fn script(&self, kind: &'static str, response: impl Into<String>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(response.into());
    }

    /// Respond with `response` whenever a request of `kind` has a user
    /// prompt containing `needle`. Wins over queued responses, so tests can
    /// target one task among concurrently-driven peers.
    pub fn script_for(
        &self,
        kind: &'static str,
        needle: impl Into<String>,
        response: impl Into<String>,
    ) {
        self.matchers
            .lock()
            .unwrap()
            .push((kind, needle.into(), response.into()));
    }

    pub fn calls_for(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == kind)
            .count()
    }
}

#[async_trait]
impl Provider for StubLlm {
    fn name(&self) -> &str {
        self.provider_name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError> {
        let kind = classify_system_prompt(&req.system);
        self.calls
            .lock()
            .unwrap()
            .push((kind.to_owned(), req.model.clone()));

        let matched = self
            .matchers
            .lock()
            .unwrap()
            .iter()
            .find(|(k, needle, _)| *k == kind && req.user.contains(needle))
            .map(|(_, _, response)| response.clone());

        let scripted = matched.or_else(|| {
            self.scripted
                .lock()
                .unwrap()
                .get_mut(kind)
                .and_then(|queue| queue.pop_front())
        });

        Ok(Completion {
            text: scripted.unwrap_or_else(|| default_response(kind)),
            input_tokens: 120,
            output_tokens: 80,
        })
    }
}
