//! Chat-completions client used for plans, configs and docs.
//!
//! Speaks the OpenAI-compatible `/chat/completions` wire format (Groq by
//! default). Returned text is untrusted; callers post-process it with
//! [`super::strip_code_fences`] / [`super::extract_json`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_LLM_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

/// Sampling options for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Overrides the client's default model.
    pub model: Option<String>,
    /// System message sent ahead of the prompt.
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            model: None,
            system: None,
            temperature,
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }
}

/// Text generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
}

/// Response from the completions API.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Completions API client.
pub struct LlmClient {
    api_key: String,
    endpoint: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            endpoint: DEFAULT_LLM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// Send a conversation and get the raw response.
    pub async fn chat(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<ApiResponse> {
        let body = ChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::remote(status.as_u16(), format!("completion API: {body}")));
        }

        let parsed: ApiResponse = resp.json().await?;
        if let Some(ref usage) = parsed.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion usage"
            );
        }
        Ok(parsed)
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system.as_ref() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        let model = options.model.as_deref().unwrap_or(&self.model);
        let resp = self
            .chat(&messages, model, options.temperature, options.max_tokens)
            .await?;
        resp.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::GenerationFormat("completion had no choices".into()))
    }
}
