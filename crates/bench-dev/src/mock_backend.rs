//! Mock inference backend
//!
//! Serves the completion and readiness endpoints of one [`BackendVariant`]
//! on an ephemeral local port. Completion replies follow a script, so the
//! streaming client and runners can be exercised against known token
//! timings, sentinels, malformed lines, dropped connections and error
//! statuses without a GPU.

use crate::{DevError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bench_core::{BackendConfig, BackendVariant, WireFormat};
use bench_runtime::{create_adapter, ApiEndpoint};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Scripted answer to one completion request
#[derive(Debug, Clone)]
pub enum MockReply {
    /// One content event per token in the variant's wire format, then the
    /// terminal event(s)
    Tokens {
        tokens: Vec<String>,
        first_delay: Duration,
        interval: Duration,
    },
    /// Raw lines written verbatim, each after its delay
    Lines(Vec<(Duration, String)>),
    /// Raw lines as in [`MockReply::Lines`], then the connection is dropped
    /// without finishing the body
    Truncated(Vec<(Duration, String)>),
    /// Non-2xx status with a plain-text body
    Error { status: u16, message: String },
}

impl MockReply {
    pub fn tokens(tokens: &[&str], first_delay: Duration, interval: Duration) -> Self {
        MockReply::Tokens {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            first_delay,
            interval,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        MockReply::Error {
            status,
            message: message.into(),
        }
    }
}

/// A completion request as the mock received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub body: Value,
}

impl RecordedRequest {
    pub fn streaming(&self) -> Option<bool> {
        self.body.get("stream").and_then(Value::as_bool)
    }
}

#[derive(Debug, Clone)]
struct MockState {
    inner: Arc<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    variant: BackendVariant,
    model: String,
    ready: AtomicBool,
    default_reply: MockReply,
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Builder for [`MockBackend`]
#[derive(Debug, Clone)]
pub struct MockBackendBuilder {
    variant: BackendVariant,
    model: String,
    default_reply: MockReply,
    replies: Vec<MockReply>,
    ready: bool,
}

impl MockBackendBuilder {
    pub fn new(variant: BackendVariant) -> Self {
        Self {
            variant,
            model: "mock-model".to_string(),
            default_reply: MockReply::tokens(
                &["Hello", ",", " world", "!"],
                Duration::from_millis(10),
                Duration::from_millis(10),
            ),
            replies: Vec::new(),
            ready: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Reply used once the queued replies are used up
    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Queue a reply for the next unanswered completion request
    pub fn with_reply(mut self, reply: MockReply) -> Self {
        self.replies.push(reply);
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Bind an ephemeral port and start serving
    pub async fn start(self) -> Result<MockBackend> {
        let adapter = create_adapter(self.variant, &BackendConfig::new().with("model", self.model.as_str()))
            .map_err(|e| DevError::Mock(e.to_string()))?;
        let completion_path = adapter.completion_path();
        let readiness_path = adapter.readiness_path();
        let headers = adapter.request_headers();

        let state = MockState {
            inner: Arc::new(MockInner {
                variant: self.variant,
                model: self.model,
                ready: AtomicBool::new(self.ready),
                default_reply: self.default_reply,
                replies: Mutex::new(self.replies.into()),
                requests: Mutex::new(Vec::new()),
            }),
        };

        let app = Router::new()
            .route(completion_path, post(completion_handler))
            .route(readiness_path, get(readiness_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!("Mock {} backend listening on {}", self.variant, addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Mock backend server error: {}", e);
            }
        });

        Ok(MockBackend {
            state,
            addr,
            completion_path,
            readiness_path,
            headers,
            server_handle: Some(server_handle),
        })
    }
}

/// Running mock backend; the server stops when this is dropped
#[derive(Debug)]
pub struct MockBackend {
    state: MockState,
    addr: SocketAddr,
    completion_path: &'static str,
    readiness_path: &'static str,
    headers: Vec<(String, String)>,
    server_handle: Option<JoinHandle<()>>,
}

impl MockBackend {
    pub fn builder(variant: BackendVariant) -> MockBackendBuilder {
        MockBackendBuilder::new(variant)
    }

    /// Start a ready mock with the default token script
    pub async fn start(variant: BackendVariant) -> Result<Self> {
        Self::builder(variant).start().await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn variant(&self) -> BackendVariant {
        self.state.inner.variant
    }

    pub fn model(&self) -> &str {
        &self.state.inner.model
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn completion_url(&self) -> String {
        format!("{}{}", self.base_url(), self.completion_path)
    }

    pub fn readiness_url(&self) -> String {
        format!("{}{}", self.base_url(), self.readiness_path)
    }

    /// Endpoint equivalent to what a deployment of this variant reports
    pub fn endpoint(&self) -> Result<ApiEndpoint> {
        let parse = |s: String| Url::parse(&s).map_err(|e| DevError::Mock(format!("invalid URL {}: {}", s, e)));
        Ok(ApiEndpoint {
            variant: self.variant(),
            model: self.model().to_string(),
            base_url: parse(self.base_url())?,
            completion_url: parse(self.completion_url())?,
            readiness_url: parse(self.readiness_url())?,
            headers: self.headers.clone(),
        })
    }

    pub async fn push_reply(&self, reply: MockReply) {
        self.state.inner.replies.lock().await.push_back(reply);
    }

    /// Toggle whether the readiness endpoint answers 200 or 503
    pub fn set_ready(&self, ready: bool) {
        self.state.inner.ready.store(ready, Ordering::SeqCst);
    }

    /// Completion requests received so far
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.inner.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.state.inner.requests.lock().await.len()
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

async fn readiness_handler(State(state): State<MockState>) -> Response {
    let inner = &state.inner;
    if !inner.ready.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "model loading").into_response();
    }

    let body = match inner.variant.wire_format() {
        WireFormat::JsonLines => json!({
            "models": [{"name": inner.model, "model": inner.model}]
        }),
        WireFormat::ServerSentEvents => json!({
            "object": "list",
            "data": [{"id": inner.model, "object": "model", "owned_by": "mock"}]
        }),
    };
    Json(body).into_response()
}

async fn completion_handler(
    State(state): State<MockState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let inner = &state.inner;
    let format = inner.variant.wire_format();
    let streaming = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(format == WireFormat::JsonLines);

    inner.requests.lock().await.push(RecordedRequest {
        path: uri.path().to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    let reply = inner
        .replies
        .lock()
        .await
        .pop_front()
        .unwrap_or_else(|| inner.default_reply.clone());
    debug!("Mock {} answering (streaming: {}) with {:?}", inner.variant, streaming, reply);

    match reply {
        MockReply::Error { status, message } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, message).into_response()
        }
        MockReply::Tokens {
            tokens,
            first_delay,
            interval,
        } => {
            if streaming {
                stream_response(
                    format,
                    token_schedule(format, &inner.model, &tokens, first_delay, interval),
                    false,
                )
            } else {
                let total = first_delay + interval * tokens.len().saturating_sub(1) as u32;
                tokio::time::sleep(total).await;
                Json(full_completion(format, &inner.model, &tokens.concat())).into_response()
            }
        }
        MockReply::Lines(lines) => {
            let lines: Vec<(Duration, String)> = lines
                .into_iter()
                .map(|(delay, line)| (delay, format!("{}\n", line)))
                .collect();
            if streaming {
                stream_response(format, lines, false)
            } else {
                let total = lines_delay(&lines);
                tokio::time::sleep(total).await;
                let text: String = lines.into_iter().map(|(_, l)| l).collect();
                (StatusCode::OK, text).into_response()
            }
        }
        MockReply::Truncated(lines) => {
            let lines = lines
                .into_iter()
                .map(|(delay, line)| (delay, format!("{}\n", line)))
                .collect();
            stream_response(format, lines, true)
        }
    }
}

fn lines_delay(lines: &[(Duration, String)]) -> Duration {
    lines.iter().map(|(d, _)| *d).sum()
}

/// Chunked body following `schedule`; `truncate` aborts it after the last chunk
fn stream_response(format: WireFormat, schedule: Vec<(Duration, String)>, truncate: bool) -> Response {
    let content_type = match format {
        WireFormat::JsonLines => "application/x-ndjson",
        WireFormat::ServerSentEvents => "text/event-stream",
    };

    let chunks = stream::iter(schedule).then(|(delay, chunk)| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, io::Error>(Bytes::from(chunk))
    });
    let abort = truncate.then(|| Err(io::Error::new(io::ErrorKind::ConnectionReset, "mock connection dropped")));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(chunks.chain(stream::iter(abort))),
    )
        .into_response()
}

fn token_schedule(
    format: WireFormat,
    model: &str,
    tokens: &[String],
    first_delay: Duration,
    interval: Duration,
) -> Vec<(Duration, String)> {
    let mut schedule: Vec<(Duration, String)> = tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            let delay = if i == 0 { first_delay } else { interval };
            (delay, content_event(format, model, token))
        })
        .collect();

    match format {
        WireFormat::JsonLines => {
            let done = json!({
                "model": model,
                "response": "",
                "done": true,
                "done_reason": "length",
                "eval_count": tokens.len(),
            });
            schedule.push((Duration::ZERO, format!("{}\n", done)));
        }
        WireFormat::ServerSentEvents => {
            let finish = json!({
                "id": "cmpl-mock",
                "object": "text_completion",
                "model": model,
                "choices": [{"index": 0, "text": "", "finish_reason": "length"}],
            });
            schedule.push((Duration::ZERO, format!("data: {}\n\n", finish)));
            schedule.push((Duration::ZERO, "data: [DONE]\n\n".to_string()));
        }
    }
    schedule
}

fn content_event(format: WireFormat, model: &str, token: &str) -> String {
    match format {
        WireFormat::JsonLines => {
            let event = json!({
                "model": model,
                "created_at": "2024-01-01T00:00:00Z",
                "response": token,
                "done": false,
            });
            format!("{}\n", event)
        }
        WireFormat::ServerSentEvents => {
            let event = json!({
                "id": "cmpl-mock",
                "object": "text_completion",
                "model": model,
                "choices": [{"index": 0, "text": token, "logprobs": null, "finish_reason": null}],
            });
            format!("data: {}\n\n", event)
        }
    }
}

fn full_completion(format: WireFormat, model: &str, text: &str) -> Value {
    match format {
        WireFormat::JsonLines => json!({
            "model": model,
            "response": text,
            "done": true,
        }),
        WireFormat::ServerSentEvents => json!({
            "id": "cmpl-mock",
            "object": "text_completion",
            "model": model,
            "choices": [{"index": 0, "text": text, "finish_reason": "length"}],
        }),
    }
}
