//! Inference client abstraction.
//!
//! [`InferenceClient`] sends one request and reports when each response chunk arrived. The
//! production implementation speaks the OpenAI-compatible HTTP API (with server-sent events for
//! streaming); [`MockInferenceClient`] plays back scripted timings for tests.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{EndpointConfig, EndpointKind};
use crate::error::{Error, RequestError, RequestErrorKind};
use crate::record::{ChunkKind, ResponseChunk};

/// One request to the inference endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub url: Url,
    pub kind: EndpointKind,
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<u64>,
    pub streaming: bool,
    pub api_key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub x_request_id: Uuid,
    pub x_correlation_id: Uuid,
}

/// Endpoint settings shared by every request of a run.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    url: Url,
    endpoint: EndpointConfig,
}

impl RequestTemplate {
    pub fn new(endpoint: &EndpointConfig) -> Result<Self, Error> {
        Ok(Self {
            url: endpoint.request_url()?,
            endpoint: endpoint.clone(),
        })
    }

    pub fn streams(&self) -> bool {
        self.endpoint.streams()
    }

    pub fn request(&self, prompt: String, max_tokens: Option<u64>) -> InferenceRequest {
        InferenceRequest {
            url: self.url.clone(),
            kind: self.endpoint.kind,
            model: self.endpoint.model.clone(),
            prompt,
            max_tokens,
            streaming: self.endpoint.streams(),
            api_key: self.endpoint.api_key.clone(),
            headers: self.endpoint.headers.clone(),
            x_request_id: Uuid::new_v4(),
            x_correlation_id: Uuid::new_v4(),
        }
    }
}

impl InferenceRequest {
    /// OpenAI-compatible JSON payload for the endpoint kind.
    pub fn body(&self) -> Value {
        let mut body = match self.kind {
            EndpointKind::Chat => json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": self.prompt }],
                "stream": self.streaming,
            }),
            EndpointKind::Completions => json!({
                "model": self.model,
                "prompt": self.prompt,
                "stream": self.streaming,
            }),
            EndpointKind::Embeddings => json!({
                "model": self.model,
                "input": self.prompt,
            }),
        };
        if self.kind.produces_tokens() {
            if let Some(max_tokens) = self.max_tokens {
                body["max_tokens"] = json!(max_tokens);
            }
            if self.streaming {
                body["stream_options"] = json!({ "include_usage": true });
            }
        }
        body
    }
}

/// Token usage reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    fn from_value(value: &Value) -> Option<Self> {
        let usage = value.get("usage").filter(|u| u.is_object())?;
        Some(Self {
            prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
            completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
            reasoning_tokens: usage
                .pointer("/completion_tokens_details/reasoning_tokens")
                .and_then(Value::as_u64),
        })
    }
}

/// A completed exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResponse {
    pub status: u16,
    pub chunks: Vec<ResponseChunk>,
    /// Accumulated output content
    pub text: String,
    /// Accumulated reasoning content
    pub reasoning_text: String,
    pub usage: Option<Usage>,
}

impl InferenceResponse {
    fn apply(&mut self, delta: Delta, perf_ns: u64) {
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        if !delta.has_choice {
            return;
        }
        let kind = match (&delta.content, &delta.reasoning) {
            (Some(c), _) if !c.is_empty() => ChunkKind::Content,
            (_, Some(r)) if !r.is_empty() => ChunkKind::Reasoning,
            _ => ChunkKind::Empty,
        };
        if let Some(reasoning) = delta.reasoning {
            self.reasoning_text.push_str(&reasoning);
        }
        if let Some(content) = delta.content {
            self.text.push_str(&content);
        }
        self.chunks.push(ResponseChunk { perf_ns, kind });
    }
}

/// Trait for sending inference requests.
///
/// Implementations must not enforce timeouts or cancellation themselves; the worker races
/// `send` against both and drops the future when either wins.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn send(
        &self,
        request: &InferenceRequest,
        clock: &Clock,
    ) -> Result<InferenceResponse, RequestError>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

#[derive(Clone, Default)]
pub struct ReqwestInferenceClient {
    client: reqwest::Client,
}

impl ReqwestInferenceClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InferenceClient for ReqwestInferenceClient {
    #[tracing::instrument(skip(self, request, clock), fields(x_request_id = %request.x_request_id, streaming = request.streaming))]
    async fn send(
        &self,
        request: &InferenceRequest,
        clock: &Clock,
    ) -> Result<InferenceResponse, RequestError> {
        let mut req = self
            .client
            .post(request.url.clone())
            .header("X-Request-ID", request.x_request_id.to_string())
            .header("X-Correlation-ID", request.x_correlation_id.to_string())
            .json(&request.body());
        if let Some(api_key) = request.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(api_key);
        }
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }

        let response = req.send().await.map_err(|e| {
            tracing::debug!(url = %request.url, error = %e, "Inference request failed");
            RequestError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::http(status.as_u16(), error_message(&body)));
        }

        let mut out = InferenceResponse {
            status: status.as_u16(),
            ..InferenceResponse::default()
        };

        if request.streaming {
            let mut parser = SseParser::default();
            let mut stream = response.bytes_stream();
            'stream: while let Some(bytes) = stream.next().await {
                let bytes = bytes?;
                let perf_ns = clock.perf_ns();
                for event in parser.push(&bytes) {
                    match event {
                        SseEvent::Done => break 'stream,
                        SseEvent::Data(payload) => {
                            out.apply(parse_payload(request.kind, &payload)?, perf_ns)
                        }
                    }
                }
            }
        } else {
            let body = response.text().await?;
            let perf_ns = clock.perf_ns();
            out.apply(parse_payload(request.kind, &body)?, perf_ns);
        }

        tracing::trace!(chunks = out.chunks.len(), "Inference response completed");
        Ok(out)
    }
}

/// Prefer the `error.message` of an OpenAI-style error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(512).collect())
}

enum SseEvent {
    Data(String),
    Done,
}

/// Incremental server-sent event splitter; only `data:` fields are of interest.
///
/// Bytes are buffered until a full line arrives, so characters split across reads decode
/// intact.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }
        events
    }
}

/// Content extracted from one response payload.
#[derive(Debug, Default, PartialEq)]
struct Delta {
    has_choice: bool,
    content: Option<String>,
    reasoning: Option<String>,
    usage: Option<Usage>,
}

fn parse_payload(kind: EndpointKind, payload: &str) -> Result<Delta, RequestError> {
    let value: Value = serde_json::from_str(payload).map_err(|e| {
        RequestError::new(
            RequestErrorKind::Protocol,
            format!("Invalid response payload: {e}"),
        )
    })?;
    if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
        return Err(RequestError::new(RequestErrorKind::Protocol, message));
    }

    let usage = Usage::from_value(&value);
    let text = |v: &Value, pointer: &str| v.pointer(pointer).and_then(Value::as_str).map(str::to_string);

    let delta = match kind {
        EndpointKind::Embeddings => Delta {
            has_choice: value.get("data").is_some(),
            usage,
            ..Delta::default()
        },
        EndpointKind::Chat | EndpointKind::Completions => match value.pointer("/choices/0") {
            None => Delta {
                usage,
                ..Delta::default()
            },
            Some(choice) => {
                let (content, reasoning) = if kind == EndpointKind::Completions {
                    (text(choice, "/text"), None)
                } else {
                    let message = choice.get("delta").or_else(|| choice.get("message"));
                    (
                        message.and_then(|m| text(m, "/content")),
                        message.and_then(|m| {
                            text(m, "/reasoning_content").or_else(|| text(m, "/reasoning"))
                        }),
                    )
                };
                Delta {
                    has_choice: true,
                    content,
                    reasoning,
                    usage,
                }
            }
        },
    };
    Ok(delta)
}

// ============================================================================
// Test/Mock implementation
// ============================================================================

/// Scripted response timing for [`MockInferenceClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    /// Delay before the first chunk
    pub ttft: Duration,
    /// Delay between later chunks
    pub chunk_gap: Duration,
    pub reasoning_chunks: usize,
    pub chunks: usize,
    pub usage: Option<Usage>,
    /// Fail with this error after `ttft`
    pub fail: Option<RequestError>,
    /// Never complete
    pub hang: bool,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self::streamed(4, Duration::from_millis(20), Duration::from_millis(5))
    }
}

impl MockResponse {
    pub fn streamed(chunks: usize, ttft: Duration, chunk_gap: Duration) -> Self {
        Self {
            ttft,
            chunk_gap,
            reasoning_chunks: 0,
            chunks,
            usage: None,
            fail: None,
            hang: false,
        }
    }

    pub fn failing(after: Duration, error: RequestError) -> Self {
        Self {
            fail: Some(error),
            ..Self::streamed(0, after, Duration::ZERO)
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::streamed(0, Duration::ZERO, Duration::ZERO)
        }
    }

    pub fn with_reasoning(mut self, chunks: usize) -> Self {
        self.reasoning_chunks = chunks;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Record of a call made to the mock client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub request: InferenceRequest,
    pub sent_perf_ns: u64,
}

/// Mock client for tests. Responses are consumed in FIFO order, falling back to a default.
#[derive(Clone, Default)]
pub struct MockInferenceClient {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    default_response: Arc<Mutex<MockResponse>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(response: MockResponse) -> Self {
        let client = Self::new();
        *client.default_response.lock() = response;
        client
    }

    pub fn add_response(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn send(
        &self,
        request: &InferenceRequest,
        clock: &Clock,
    ) -> Result<InferenceResponse, RequestError> {
        self.calls.lock().push(MockCall {
            request: request.clone(),
            sent_perf_ns: clock.perf_ns(),
        });
        let script = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_response.lock().clone());

        if script.hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(script.ttft).await;
        if let Some(error) = script.fail {
            return Err(error);
        }

        let mut out = InferenceResponse {
            status: 200,
            usage: script.usage,
            ..InferenceResponse::default()
        };
        let total = script.reasoning_chunks + script.chunks;
        for i in 0..total {
            if i > 0 {
                tokio::time::sleep(script.chunk_gap).await;
            }
            let kind = if i < script.reasoning_chunks {
                out.reasoning_text.push_str("think ");
                ChunkKind::Reasoning
            } else {
                out.text.push_str("token ");
                ChunkKind::Content
            };
            out.chunks.push(ResponseChunk {
                perf_ns: clock.perf_ns(),
                kind,
            });
        }
        Ok(out)
    }
}
