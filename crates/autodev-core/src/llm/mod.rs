//! LLM dispatch: a provider adapter trait, a registry that routes by model
//! id, and transient-failure retry with exponential backoff.

pub mod anthropic;
pub mod json;
pub mod openai;
pub mod openrouter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// One completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system: String,
    pub user: String,
    /// Passed through to providers that support it (OpenAI reasoning models).
    pub reasoning_effort: Option<String>,
    pub service_tier: Option<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 8192,
            temperature: 0.2,
            system: system.into(),
            user: user.into(),
            reasoning_effort: None,
            service_tier: None,
        }
    }
}

/// The text and usage a provider returned.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl Completion {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Errors from a provider call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("provider {provider} overloaded")]
    Overloaded { provider: String },

    #[error("request to {provider} timed out")]
    Timeout { provider: String },

    #[error("network error talking to {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("{provider} API error (status {status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("no provider registered for model {model} (wanted {provider})")]
    NoProvider { model: String, provider: String },

    #[error("missing credential for {provider}")]
    MissingCredential { provider: String },

    #[error("empty completion from {provider}")]
    EmptyCompletion { provider: String },
}

impl LlmError {
    /// Whether the failure is worth retrying.
    pub fn transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Overloaded { .. }
                | Self::Timeout { .. }
                | Self::Network { .. }
        )
    }
}

/// Adapter interface for LLM completion providers.
///
/// Object-safe so the registry can hold `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Routing name for this provider (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Execute one completion call. Implementations map HTTP-level failures
    /// into the [`LlmError`] taxonomy; they do not retry.
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// Map a model id to the provider that serves it.
///
/// `claude-*` goes to Anthropic, `gpt-*`/`o*` to OpenAI, and any
/// vendor-prefixed id (`vendor/model`) to OpenRouter.
pub fn route_model(model: &str) -> &'static str {
    if model.contains('/') {
        "openrouter"
    } else if model.starts_with("claude") {
        "anthropic"
    } else {
        "openai"
    }
}

/// Provider registry with model routing and retry.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    const MAX_ATTEMPTS: u32 = 3;
    const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its routing name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_owned(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    /// Registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Dispatch a completion to the provider that serves `req.model`,
    /// retrying transient failures up to 3 times with exponential backoff
    /// starting at 1 s (plus a little jitter to spread provider load).
    pub async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError> {
        let provider_name = route_model(&req.model);
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| LlmError::NoProvider {
                model: req.model.clone(),
                provider: provider_name.to_owned(),
            })?;

        let mut backoff = Self::INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match provider.complete(req).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.transient() && attempt < Self::MAX_ATTEMPTS => {
                    let jitter = Duration::from_millis(rand_jitter_ms());
                    tracing::warn!(
                        model = %req.model,
                        provider = provider_name,
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn rand_jitter_ms() -> u64 {
    use rand::Rng;
    rand::rng().random_range(0..250)
}

/// Decide whether an HTTP status is transient, and build the matching error.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> LlmError {
    match status {
        429 => LlmError::RateLimited {
            provider: provider.to_owned(),
        },
        500..=599 => LlmError::Overloaded {
            provider: provider.to_owned(),
        },
        _ if body.to_ascii_lowercase().contains("overloaded") => LlmError::Overloaded {
            provider: provider.to_owned(),
        },
        _ => LlmError::Api {
            provider: provider.to_owned(),
            status,
            message: truncate(body, 500),
        },
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
