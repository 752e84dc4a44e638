//! LLM backends used for AI synthesis

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Text completion backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Complete `prompt`, returning the generated text.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You condense advice for a coding agent about to run a tool. \
Reply with one or two short sentences, no preamble, no markdown.";

/// OpenAI-compatible chat-completions client
pub struct HttpLlmBackend {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl HttpLlmBackend {
    /// Build a client; the API key is read from the configured env var.
    pub fn new(config: LlmConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "LLM API key not set, requests will be unauthenticated"
            );
        }
        Self {
            client: reqwest::Client::new(),
            config,
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let payload = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut request = self.client.post(self.endpoint()).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Synthesis(format!("LLM returned HTTP {}", status)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Synthesis(format!("Failed to parse LLM response: {}", e)))?;

        body.choices
            .into_iter()
            .filter_map(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .find(|c| !c.is_empty())
            .ok_or_else(|| Error::Synthesis("LLM returned no content".to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}
