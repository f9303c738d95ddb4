use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use crate::context::{self, Role};
use crate::task::{EventSender, StreamTask, DEFAULT_CAPACITY};
use crate::{
    BackendKind, OpenAiRequest, ProviderError, StreamEvent, StreamResult, Transport,
    TransportRequest,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streams `/chat/completions` from an OpenAI-compatible endpoint.
pub struct OpenAiTransport {
    client: Client,
    task: StreamTask,
    capacity: usize,
}

impl OpenAiTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            task: StreamTask::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub(crate) fn chat_completions_url(endpoint: &str) -> String {
        let base = endpoint.trim();
        let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    pub(crate) fn build_messages(request: &OpenAiRequest) -> Vec<Value> {
        let mut messages: Vec<Value> = context::parse(&request.context)
            .into_iter()
            .filter(|block| !block.text.is_empty())
            .map(|block| json!({ "role": block.role.as_str(), "content": block.text }))
            .collect();

        let content = match &request.image_url {
            Some(url) => json!([
                { "type": "text", "text": request.prompt },
                { "type": "image_url", "image_url": { "url": url } },
            ]),
            None => json!(request.prompt),
        };
        messages.push(json!({ "role": Role::User.as_str(), "content": content }));
        messages
    }

    pub(crate) fn build_body(request: &OpenAiRequest) -> Value {
        json!({
            "model": request.model,
            "messages": Self::build_messages(request),
            "temperature": request.profile.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        })
    }

    async fn pump(response: reqwest::Response, tx: EventSender) {
        let mut chunks = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let (events, exhausted) = match chunks.next().await {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    (drain_sse_events(&mut buffer, false), false)
                }
                Some(Err(err)) => (vec![Err(ProviderError::StreamError(err.to_string()))], true),
                None => (drain_sse_events(&mut buffer, true), true),
            };

            for event in events {
                let terminal = matches!(event, Ok(StreamEvent::Done) | Err(_));
                if tx.send(event).await.is_err() || terminal {
                    return;
                }
            }
            if exhausted {
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for OpenAiTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAiCompatible
    }

    async fn send(&self, request: TransportRequest) -> Result<StreamResult, ProviderError> {
        let TransportRequest::OpenAi(request) = request else {
            return Err(ProviderError::InvalidRequest(
                "OpenAI transport received a Sydney request".to_string(),
            ));
        };

        let url = Self::chat_completions_url(&request.profile.endpoint);
        tracing::debug!(
            ask_id = %request.ask_id,
            backend = %request.profile.name,
            model = %request.model,
            "opening chat completion stream"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&request.profile.key)
            .header("Accept", "text/event-stream")
            .json(&Self::build_body(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        Ok(self
            .task
            .spawn(self.capacity, move |tx| Self::pump(response, tx)))
    }

    async fn cancel(&self) {
        self.task.cancel().await;
    }
}

fn classify_error_object(error: &Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let kind = error.get("type").and_then(Value::as_str).unwrap_or_default();

    if crate::provider::is_content_filter_message(code)
        || crate::provider::is_content_filter_message(kind)
    {
        ProviderError::ContentFiltered(message)
    } else if code.contains("rate_limit") || kind.contains("rate_limit") {
        ProviderError::RateLimit(message)
    } else if code == "invalid_api_key" || kind == "authentication_error" {
        ProviderError::AuthError(message)
    } else {
        ProviderError::ApiError(message)
    }
}

/// Events carried by one SSE `data:` payload.
pub(crate) fn parse_sse_data(data: &str) -> Vec<Result<StreamEvent, ProviderError>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done)];
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(%err, "skipping malformed SSE payload");
            return Vec::new();
        }
    };

    if let Some(error) = value.get("error") {
        return vec![Err(classify_error_object(error))];
    }

    let mut events = Vec::new();
    if let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        if let Some(text) = choice
            .pointer("/delta/content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            events.push(Ok(StreamEvent::TextDelta(text.to_string())));
        }
        if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
            events.push(Err(ProviderError::ContentFiltered(
                "response stopped by the provider's content filter".to_string(),
            )));
        }
    }

    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        events.push(Ok(StreamEvent::Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        }));
    }
    events
}

fn parse_sse_line(line: &str) -> Vec<Result<StreamEvent, ProviderError>> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim();
    if data.is_empty() {
        return Vec::new();
    }
    parse_sse_data(data)
}

/// Parses every complete line in `buffer`, leaving a partial tail in place
/// unless `flush_remainder` is set. Works on bytes so multi-byte characters
/// split across chunks survive.
pub(crate) fn drain_sse_events(
    buffer: &mut Vec<u8>,
    flush_remainder: bool,
) -> Vec<Result<StreamEvent, ProviderError>> {
    let mut events = Vec::new();

    while let Some(newline_idx) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline_idx).collect();
        events.extend(parse_sse_line(&String::from_utf8_lossy(&line)));
    }

    if flush_remainder && !buffer.is_empty() {
        let tail = std::mem::take(buffer);
        events.extend(parse_sse_line(&String::from_utf8_lossy(&tail)));
    }

    events
}
