pub mod claude;
pub mod gemini;
pub mod openai;

use crate::config::{resolve_provider, AppSettings};
use crate::db::SqliteStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            delta: String::new(),
            done: true,
        }
    }
}

/// LLM backend selected from settings.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
    Gemini(gemini::GeminiConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn ollama(host: &str) -> Self {
        Provider::Ollama(openai::OpenAiConfig {
            api_key: String::new(),
            base_url: format!("{}/v1", host.trim_end_matches('/')),
        })
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat(config, request).await
            }
            Provider::Claude(config) => claude::chat(config, request).await,
            Provider::Gemini(config) => gemini::chat(config, request).await,
        }
    }

    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_chunk: impl Fn(StreamChunk) + Send,
    ) -> Result<String, LlmError> {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat_stream(config, request, on_chunk).await
            }
            Provider::Claude(config) => claude::chat_stream(config, request, on_chunk).await,
            Provider::Gemini(config) => gemini::chat_stream(config, request, on_chunk).await,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Model not configured: {0}")]
    Config(String),
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Something that turns a conversation into the assistant's next reply.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, LlmError>;

    /// Emits the reply fragment by fragment and returns the full text.
    async fn generate_stream(
        &self,
        messages: &[PromptMessage],
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String, LlmError>;
}

/// Generator that reads provider, model and system prompt from the settings
/// table on every call, so settings changes apply to the next message.
pub struct ConfiguredGenerator {
    store: Arc<SqliteStore>,
}

impl ConfiguredGenerator {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    fn prepare(&self, messages: &[PromptMessage]) -> Result<(Provider, ChatRequest), LlmError> {
        let settings =
            AppSettings::load(&self.store).map_err(|e| LlmError::Config(e.to_string()))?;
        let (provider, model) = resolve_provider(&settings.default_model, &settings)
            .map_err(|e| LlmError::Config(e.to_string()))?;

        let mut prompt = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = &settings.system_prompt {
            prompt.push(PromptMessage::new(Role::System, system.clone()));
        }
        prompt.extend_from_slice(messages);

        Ok((
            provider,
            ChatRequest {
                messages: prompt,
                model,
            },
        ))
    }
}

#[async_trait]
impl TextGenerator for ConfiguredGenerator {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        let (provider, request) = self.prepare(messages)?;
        provider.chat(&request).await
    }

    async fn generate_stream(
        &self,
        messages: &[PromptMessage],
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String, LlmError> {
        let (provider, request) = self.prepare(messages)?;
        provider.chat_stream(&request, on_chunk).await
    }
}

pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    Err(LlmError::Api {
        status,
        message: text,
    })
}

/// Pops every complete line from `buffer` and returns the payloads of the
/// `data:` lines among them. Lines are decoded only once complete, so a
/// character split across network reads stays intact; a trailing partial
/// line stays buffered.
pub(crate) fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        if let Some(data) = line.trim().strip_prefix("data:") {
            payloads.push(data.trim_start().to_string());
        }
    }
    payloads
}
