use super::{check_status, drain_sse_data, ChatRequest, LlmError, Role, StreamChunk};
use futures::StreamExt;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }

    fn blocked(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }
}

/// Gemini names the assistant role `model` and takes the system prompt
/// separately from the turns.
fn build_body(request: &ChatRequest) -> GenerateContentRequest {
    let system: Vec<Part> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| Part {
            text: m.content.clone(),
        })
        .collect();

    let contents = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| Content {
            parts: vec![Part {
                text: m.content.clone(),
            }],
            role: Some(match m.role {
                Role::Assistant => "model".to_string(),
                _ => "user".to_string(),
            }),
        })
        .collect();

    GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then_some(Content {
            parts: system,
            role: None,
        }),
    }
}

fn post(config: &GeminiConfig, request: &ChatRequest, method: &str) -> RequestBuilder {
    Client::new()
        .post(format!(
            "{}/models/{}:{}",
            config.base_url, request.model, method
        ))
        .header("Content-Type", "application/json")
        .header("x-goog-api-key", &config.api_key)
        .json(&build_body(request))
}

pub async fn chat(config: &GeminiConfig, request: &ChatRequest) -> Result<String, LlmError> {
    let resp = check_status(post(config, request, "generateContent").send().await?).await?;

    let data: GenerateContentResponse = resp.json().await?;
    if let Some(reason) = data.blocked() {
        return Err(LlmError::Parse(format!("Prompt blocked: {}", reason)));
    }

    Ok(data.text())
}

pub async fn chat_stream(
    config: &GeminiConfig,
    request: &ChatRequest,
    on_chunk: impl Fn(StreamChunk) + Send,
) -> Result<String, LlmError> {
    let resp = check_status(
        post(config, request, "streamGenerateContent")
            .query(&[("alt", "sse")])
            .send()
            .await?,
    )
    .await?;

    let mut full_content = String::new();
    let mut stream = resp.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        for data in drain_sse_data(&mut buffer) {
            let parsed = match serde_json::from_str::<GenerateContentResponse>(&data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("[gemini] ignoring unparsable stream event: {}", e);
                    continue;
                }
            };
            if let Some(reason) = parsed.blocked() {
                return Err(LlmError::Parse(format!("Prompt blocked: {}", reason)));
            }
            let text = parsed.text();
            if !text.is_empty() {
                full_content.push_str(&text);
                on_chunk(StreamChunk::delta(text));
            }
            if parsed
                .candidates
                .first()
                .is_some_and(|c| c.finish_reason.is_some())
            {
                on_chunk(StreamChunk::done());
                return Ok(full_content);
            }
        }
    }

    on_chunk(StreamChunk::done());
    Ok(full_content)
}
