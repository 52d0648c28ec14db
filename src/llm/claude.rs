use super::{check_status, drain_sse_data, ChatRequest, LlmError, Role, StreamChunk};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

const MAX_TOKENS: u32 = 4096;
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct ClaudeRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ClaudeMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ClaudeMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Deserialize)]
struct ClaudeContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClaudeStreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ClaudeDelta },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: ClaudeStreamError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ClaudeDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ClaudeStreamError {
    message: String,
}

/// System turns are joined into the top-level `system` field; the API only
/// accepts user and assistant turns in `messages`.
fn build_request<'a>(request: &'a ChatRequest, stream: bool) -> ClaudeRequest<'a> {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let messages = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| ClaudeMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect();

    ClaudeRequest {
        model: &request.model,
        max_tokens: MAX_TOKENS,
        messages,
        stream,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
    }
}

fn post(config: &ClaudeConfig, body: &ClaudeRequest<'_>) -> RequestBuilder {
    Client::new()
        .post(format!("{}/v1/messages", config.base_url))
        .header("Content-Type", "application/json")
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", API_VERSION)
        .json(body)
}

pub async fn chat(config: &ClaudeConfig, request: &ChatRequest) -> Result<String, LlmError> {
    let body = build_request(request, false);
    let resp = check_status(post(config, &body).send().await?).await?;

    let data: ClaudeResponse = resp.json().await?;
    let content = data
        .content
        .into_iter()
        .map(|c| c.text)
        .collect::<Vec<_>>()
        .concat();

    Ok(content)
}

pub async fn chat_stream(
    config: &ClaudeConfig,
    request: &ChatRequest,
    on_chunk: impl Fn(StreamChunk) + Send,
) -> Result<String, LlmError> {
    let body = build_request(request, true);
    let resp = check_status(post(config, &body).send().await?).await?;

    let mut full_content = String::new();
    let mut stream = resp.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        for data in drain_sse_data(&mut buffer) {
            let Ok(event) = serde_json::from_str::<ClaudeStreamEvent>(&data) else {
                continue;
            };
            match event {
                ClaudeStreamEvent::ContentBlockDelta { delta } => {
                    if let Some(text) = delta.text {
                        full_content.push_str(&text);
                        on_chunk(StreamChunk::delta(text));
                    }
                }
                ClaudeStreamEvent::MessageStop {} => {
                    on_chunk(StreamChunk::done());
                    return Ok(full_content);
                }
                ClaudeStreamEvent::Error { error } => {
                    return Err(LlmError::Parse(error.message));
                }
                ClaudeStreamEvent::Other => {}
            }
        }
    }

    on_chunk(StreamChunk::done());
    Ok(full_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PromptMessage;

    #[test]
    fn system_turns_move_to_system_field() {
        let request = ChatRequest {
            messages: vec![
                PromptMessage::new(Role::System, "be brief"),
                PromptMessage::new(Role::User, "hi"),
                PromptMessage::new(Role::Assistant, "hello"),
            ],
            model: "claude-x".into(),
        };
        let body = serde_json::to_value(build_request(&request, true)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn no_system_field_without_system_turns() {
        let request = ChatRequest {
            messages: vec![PromptMessage::new(Role::User, "hi")],
            model: "claude-x".into(),
        };
        let body = serde_json::to_value(build_request(&request, false)).unwrap();
        assert!(body.get("system").is_none());
    }
}
