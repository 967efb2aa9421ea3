//! OpenRouter adapter. Speaks the chat-completions dialect, so the body and
//! response handling are shared with the OpenAI adapter.

use async_trait::async_trait;

use super::anthropic::to_network_error;
use super::openai::{chat_body, chat_completion, ChatResponse};
use super::{classify_status, Completion, CompletionRequest, LlmError, Provider};

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError> {
        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&chat_body(req))
            .send()
            .await
            .map_err(|e| to_network_error("openrouter", e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("openrouter", status, &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::Api {
            provider: "openrouter".into(),
            status,
            message: format!("malformed response body: {e}"),
        })?;

        chat_completion("openrouter", parsed)
    }
}
