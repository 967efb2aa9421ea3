//! OpenAI Chat Completions adapter.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::anthropic::to_network_error;
use super::{classify_status, Completion, CompletionRequest, LlmError, Provider};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatResponse {
    pub choices: Vec<Choice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
pub(super) struct Choice {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Build the chat-completions request body shared by OpenAI and OpenRouter.
pub(super) fn chat_body(req: &CompletionRequest) -> serde_json::Value {
    let mut body = json!({
        "model": req.model,
        "max_completion_tokens": req.max_tokens,
        "temperature": req.temperature,
        "messages": [
            {"role": "system", "content": req.system},
            {"role": "user", "content": req.user},
        ],
    });
    if let Some(effort) = &req.reasoning_effort {
        body["reasoning_effort"] = json!(effort);
    }
    if let Some(tier) = &req.service_tier {
        body["service_tier"] = json!(tier);
    }
    body
}

/// Extract a [`Completion`] from a chat-completions response.
pub(super) fn chat_completion(provider: &str, parsed: ChatResponse) -> Result<Completion, LlmError> {
    let text = parsed
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(LlmError::EmptyCompletion {
            provider: provider.to_owned(),
        });
    }

    Ok(Completion {
        text,
        input_tokens: parsed.usage.prompt_tokens,
        output_tokens: parsed.usage.completion_tokens,
    })
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError> {
        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&chat_body(req))
            .send()
            .await
            .map_err(|e| to_network_error("openai", e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("openai", status, &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::Api {
            provider: "openai".into(),
            status,
            message: format!("malformed response body: {e}"),
        })?;

        chat_completion("openai", parsed)
    }
}
