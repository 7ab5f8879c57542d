//! REST client for the remote agent service.
//!
//! Streaming replies arrive as server-sent events; `SseDecoder` buffers raw body bytes
//! and yields complete `data:` payloads, which are mapped into `AgentChunk`s.

use crate::agent::{AgentId, AgentIdentity};
use crate::config::BackendConfig;
use crate::error::{matches_context_full, GatewayError};
use crate::service::{
    AgentChunk, AgentRequest, AgentResponse, AgentService, ChunkKind, ChunkStream,
};
use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DONE_MARKER: &str = "[DONE]";

/// Agent service reached over HTTP
pub struct HttpAgentService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    summarize_keep_messages: usize,
}

impl HttpAgentService {
    pub fn new(config: &BackendConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            summarize_keep_messages: config.summarize_keep_messages,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(map_http_error)?;
        check_status(response).await
    }
}

fn message_body(request: &AgentRequest, stream_tokens: bool) -> Value {
    let mut body = json!({ "messages": request.messages });
    if stream_tokens {
        body["stream_tokens"] = Value::Bool(true);
    }
    body
}

fn map_http_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Backend(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        GatewayError::Backend(format!("Connection error: {}", error))
    } else {
        GatewayError::Backend(format!("HTTP error: {}", error))
    }
}

/// Classify a non-success reply body
fn status_error(status: StatusCode, body: &str) -> GatewayError {
    if matches_context_full(body) {
        GatewayError::ContextFull(body.to_string())
    } else {
        GatewayError::Backend(format!("Request failed with status {}: {}", status, body))
    }
}

/// A missing agent counts as retired; any other failure status is an error
fn retire_outcome(status: StatusCode, body: &str) -> Result<(), GatewayError> {
    if status.is_success() || status == StatusCode::NOT_FOUND {
        Ok(())
    } else {
        Err(status_error(status, body))
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(status_error(status, &body))
}

fn as_provision_error(error: GatewayError) -> GatewayError {
    match error {
        GatewayError::Backend(message) | GatewayError::ContextFull(message) => {
            GatewayError::Provision(message)
        }
        other => other,
    }
}

/// Text of an assistant message; content is either a string or a list of text parts
fn text_content(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn error_text(message: &Value) -> String {
    message
        .get("error")
        .or_else(|| message.get("message"))
        .or_else(|| message.get("detail"))
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

fn stream_error(message: String) -> GatewayError {
    if matches_context_full(&message) {
        GatewayError::ContextFull(message)
    } else {
        GatewayError::Backend(message)
    }
}

/// Map one agent service message into a chunk. Control messages yield `None`.
pub(crate) fn chunk_from_message(message: &Value) -> Result<Option<AgentChunk>, GatewayError> {
    let message_type = message
        .get("message_type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let (kind, content) = match message_type {
        "assistant_message" => (ChunkKind::Assistant, text_content(message.get("content"))),
        "reasoning_message" => (
            ChunkKind::Reasoning,
            message
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "tool_call_message" => (
            ChunkKind::ToolCall,
            message
                .get("tool_call")
                .map(Value::to_string)
                .unwrap_or_default(),
        ),
        "tool_return_message" => (
            ChunkKind::ToolReturn,
            message
                .get("tool_return")
                .map(|value| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
        ),
        "usage_statistics" => (ChunkKind::Usage, message.to_string()),
        "error_message" | "error" => return Err(stream_error(error_text(message))),
        "stop_reason" => {
            if message.get("stop_reason").and_then(Value::as_str) == Some("error") {
                return Err(stream_error(error_text(message)));
            }
            return Ok(None);
        }
        _ => {
            // Unknown kinds only count when they carry plain content
            let content = text_content(message.get("content"));
            if content.is_empty() {
                return Ok(None);
            }
            (ChunkKind::Assistant, content)
        }
    };

    if content.is_empty() && kind != ChunkKind::Usage {
        return Ok(None);
    }
    Ok(Some(AgentChunk { kind, content }))
}

/// Incremental server-sent event decoder
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed body bytes, returning every completed event's data payload
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some((end, delimiter_len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + delimiter_len).collect();
            if let Some(payload) = event_data(&String::from_utf8_lossy(&event[..end])) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing event left without its blank-line terminator
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_data(&String::from_utf8_lossy(&rest))
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn event_data(event: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in event.lines() {
        if let Some(value) = line.trim_end_matches('\r').strip_prefix("data:") {
            let value = value.trim();
            data = Some(match data {
                Some(existing) => existing + "\n" + value,
                None => value.to_string(),
            });
        }
    }
    data.filter(|payload| !payload.is_empty())
}

struct SseState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn a streamed response body into a lazy chunk stream
pub(crate) fn sse_chunks<S, B>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
{
    let state = SseState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.pending.pop_front() {
                if payload == DONE_MARKER {
                    state.pending.clear();
                    state.done = true;
                    return None;
                }
                let parsed = serde_json::from_str::<Value>(&payload)
                    .map_err(|e| {
                        GatewayError::Backend(format!("Invalid stream event: {}; payload={}", e, payload))
                    })
                    .and_then(|message| chunk_from_message(&message));
                match parsed {
                    Ok(Some(chunk)) => return Some((Ok(chunk), state)),
                    Ok(None) => continue,
                    Err(error) => {
                        state.pending.clear();
                        state.done = true;
                        return Some((Err(error), state));
                    }
                }
            }

            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let payloads = state.decoder.push(bytes.as_ref());
                    state.pending.extend(payloads);
                }
                Some(Err(error)) => {
                    state.done = true;
                    return Some((Err(map_http_error(error)), state));
                }
                None => {
                    state.done = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    }))
}

/// New agent id from an import reply: either `{ "agent_ids": [..] }` or an agent state
fn imported_agent_id(reply: &Value) -> Option<AgentId> {
    reply
        .get("agent_ids")
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(Value::as_str)
        .or_else(|| reply.get("id").and_then(Value::as_str))
        .map(AgentId::from)
}

#[async_trait]
impl AgentService for HttpAgentService {
    async fn send(
        &self,
        agent: &AgentIdentity,
        request: &AgentRequest,
    ) -> Result<AgentResponse, GatewayError> {
        let url = self.url(&format!("agents/{}/messages", agent.id));
        let response = self
            .execute(self.client.post(&url).json(&message_body(request, false)))
            .await?;

        let reply: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Backend(format!("Failed to parse response: {}", e)))?;

        let mut chunks = Vec::new();
        if let Some(messages) = reply.get("messages").and_then(Value::as_array) {
            for message in messages {
                if let Some(chunk) = chunk_from_message(message)? {
                    chunks.push(chunk);
                }
            }
        }
        debug!(agent_id = %agent.id, chunks = chunks.len(), "Agent reply received");
        Ok(AgentResponse { chunks })
    }

    async fn send_streaming(
        &self,
        agent: &AgentIdentity,
        request: &AgentRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let url = self.url(&format!("agents/{}/messages/stream", agent.id));
        let response = self
            .execute(
                self.client
                    .post(&url)
                    .header("Accept", "text/event-stream")
                    .json(&message_body(request, true)),
            )
            .await?;
        Ok(sse_chunks(Box::pin(response.bytes_stream())))
    }

    async fn summarize(&self, agent: &AgentIdentity) -> Result<(), GatewayError> {
        let url = self.url(&format!("agents/{}/summarize", agent.id));
        self.execute(
            self.client
                .post(&url)
                .query(&[("max_message_length", self.summarize_keep_messages)]),
        )
        .await
        .map_err(|error| match error {
            GatewayError::ContextFull(message) => GatewayError::Backend(message),
            other => other,
        })?;
        Ok(())
    }

    async fn provision_clone(&self, source: &AgentIdentity) -> Result<AgentId, GatewayError> {
        let export_url = self.url(&format!("agents/{}/export", source.id));
        let exported = self
            .execute(self.client.get(&export_url))
            .await
            .map_err(as_provision_error)?
            .bytes()
            .await
            .map_err(|e| GatewayError::Provision(format!("Failed to read export: {}", e)))?;

        let part = Part::bytes(exported.to_vec())
            .file_name(format!("{}.af", source.id))
            .mime_str("application/json")
            .map_err(|e| GatewayError::Provision(e.to_string()))?;
        let form = Form::new().part("file", part);

        let reply: Value = self
            .execute(self.client.post(self.url("agents/import")).multipart(form))
            .await
            .map_err(as_provision_error)?
            .json()
            .await
            .map_err(|e| GatewayError::Provision(format!("Failed to parse import reply: {}", e)))?;

        imported_agent_id(&reply).ok_or_else(|| {
            GatewayError::Provision(format!("Import reply carried no agent id: {}", reply))
        })
    }

    async fn retire(&self, agent: &AgentIdentity) -> Result<(), GatewayError> {
        let url = self.url(&format!("agents/{}", agent.id));
        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .await
            .map_err(map_http_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(agent_id = %agent.id, "Agent already gone on retire");
        }
        let body = if status.is_success() || status == StatusCode::NOT_FOUND {
            String::new()
        } else {
            response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string())
        };
        retire_outcome(status, &body)
    }
}
