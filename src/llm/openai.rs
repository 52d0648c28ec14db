use super::{check_status, drain_sse_data, ChatRequest, LlmError, StreamChunk};
use futures::StreamExt;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiReply,
}

#[derive(Deserialize)]
struct OpenAiReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

fn build_request(config: &OpenAiConfig, request: &ChatRequest, stream: bool) -> RequestBuilder {
    let body = OpenAiRequest {
        model: &request.model,
        messages: request
            .messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        stream,
    };

    let mut req = Client::new()
        .post(format!("{}/chat/completions", config.base_url))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }
    req
}

pub async fn chat(config: &OpenAiConfig, request: &ChatRequest) -> Result<String, LlmError> {
    let resp = check_status(build_request(config, request, false).send().await?).await?;

    let data: OpenAiResponse = resp.json().await?;
    let content = data
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(content)
}

pub async fn chat_stream(
    config: &OpenAiConfig,
    request: &ChatRequest,
    on_chunk: impl Fn(StreamChunk) + Send,
) -> Result<String, LlmError> {
    let resp = check_status(build_request(config, request, true).send().await?).await?;

    let mut full_content = String::new();
    let mut stream = resp.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        for data in drain_sse_data(&mut buffer) {
            if data == "[DONE]" {
                on_chunk(StreamChunk::done());
                return Ok(full_content);
            }

            let parsed = match serde_json::from_str::<OpenAiStreamResponse>(&data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("[openai] ignoring unparsable stream event: {}", e);
                    continue;
                }
            };
            if let Some(choice) = parsed.choices.first() {
                if let Some(content) = &choice.delta.content {
                    full_content.push_str(content);
                    on_chunk(StreamChunk::delta(content.clone()));
                }
                if choice.finish_reason.is_some() {
                    on_chunk(StreamChunk::done());
                    return Ok(full_content);
                }
            }
        }
    }

    on_chunk(StreamChunk::done());
    Ok(full_content)
}
