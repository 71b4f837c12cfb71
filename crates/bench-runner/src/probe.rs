//! Single-request instrumentation against a deployed backend

use crate::stream::{LineBuffer, StreamAccumulator, StreamEvent};
use crate::Result;
use bench_core::{BackendVariant, BenchConfig, Error, MetricSample, RequestConfig};
use bench_runtime::ApiEndpoint;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Generation parameters sent with every request
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub max_tokens: u32,
    pub temperature: f64,
    pub streaming: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: 0.7,
            streaming: true,
        }
    }
}

impl ProbeSettings {
    pub fn from_config(config: &BenchConfig, streaming: bool) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            streaming,
        }
    }
}

/// Issues completion requests and measures them
///
/// [`StreamProbe::run`] never returns an error: transport failures, non-2xx
/// statuses and broken streams all come back as a failed [`MetricSample`].
#[derive(Debug, Clone)]
pub struct StreamProbe {
    client: reqwest::Client,
    endpoint: ApiEndpoint,
    settings: ProbeSettings,
    health_timeout: Duration,
}

impl StreamProbe {
    pub fn new(endpoint: ApiEndpoint, settings: ProbeSettings, request: &RequestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request.timeout())
            .connect_timeout(request.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint,
            settings,
            health_timeout: request.health_timeout(),
        })
    }

    pub fn endpoint(&self) -> &ApiEndpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// JSON body for `prompt` in the backend's request shape
    pub fn request_body(&self, prompt: &str) -> Value {
        match self.endpoint.variant {
            BackendVariant::Ollama => json!({
                "model": self.endpoint.model,
                "prompt": prompt,
                "stream": self.settings.streaming,
                "options": {
                    "temperature": self.settings.temperature,
                    "num_predict": self.settings.max_tokens,
                },
            }),
            BackendVariant::VLlm | BackendVariant::LmStudio => json!({
                "model": self.endpoint.model,
                "prompt": prompt,
                "max_tokens": self.settings.max_tokens,
                "temperature": self.settings.temperature,
                "stream": self.settings.streaming,
            }),
        }
    }

    fn request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.endpoint.completion_url.clone())
            .json(&self.request_body(prompt));
        for (name, value) in &self.endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// Run one trial
    pub async fn run(&self, prompt: &str) -> MetricSample {
        self.run_traced(prompt).await.0
    }

    /// Run one trial and keep the stream events it received
    ///
    /// Blocking requests yield no events. A stream that breaks mid-way
    /// keeps the events that arrived before the failure.
    pub async fn run_traced(&self, prompt: &str) -> (MetricSample, Vec<StreamEvent>) {
        debug!(
            "Sending {} request to {}",
            if self.settings.streaming { "streaming" } else { "blocking" },
            self.endpoint.completion_url
        );
        if self.settings.streaming {
            self.run_streaming(prompt).await
        } else {
            (self.run_blocking(prompt).await, Vec::new())
        }
    }

    async fn run_blocking(&self, prompt: &str) -> MetricSample {
        let start = Instant::now();

        let response = match self.request(prompt).send().await {
            Ok(response) => response,
            Err(e) => return transport_failure(&e, None, start),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return transport_failure(&e, Some(status.as_u16()), start),
        };
        let total_time = start.elapsed().as_secs_f64();

        if !status.is_success() {
            return api_failure(status.as_u16(), &body, total_time);
        }

        let mut sample = MetricSample::completed(status.as_u16(), total_time);
        sample.generated_text = completion_text(&body).unwrap_or_default();
        info!("Request completed in {:.3}s", total_time);
        sample
    }

    async fn run_streaming(&self, prompt: &str) -> (MetricSample, Vec<StreamEvent>) {
        let start = Instant::now();

        let response = match self.request(prompt).send().await {
            Ok(response) => response,
            Err(e) => return (transport_failure(&e, None, start), Vec::new()),
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return (
                api_failure(status.as_u16(), &body, start.elapsed().as_secs_f64()),
                Vec::new(),
            );
        }

        let mut accumulator = StreamAccumulator::new(self.endpoint.variant.wire_format());
        let mut lines = LineBuffer::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    let offset = start.elapsed();
                    for line in lines.push(&bytes) {
                        accumulator.push_line(&line, offset);
                    }
                }
                Err(e) => {
                    let sample = transport_failure(&e, Some(status.as_u16()), start);
                    return (sample, accumulator.into_events());
                }
            }
        }
        if let Some(rest) = lines.finish() {
            accumulator.push_line(&rest, start.elapsed());
        }

        let total_time = start.elapsed().as_secs_f64();
        if !accumulator.saw_sentinel() {
            debug!("Stream ended without an end-of-stream marker");
        }

        let metrics = accumulator.metrics();
        info!(
            "Stream completed in {:.3}s: ttft {:.3}s, {} tokens, {:.2} tok/s, tpot {:.2}ms",
            total_time,
            metrics.ttft.unwrap_or_default(),
            metrics.token_count,
            metrics.throughput,
            metrics.tpot
        );

        let mut sample = MetricSample::completed(status.as_u16(), total_time);
        metrics.apply_to(&mut sample);
        (sample, accumulator.into_events())
    }

    /// Whether the readiness endpoint answers with a status below 400
    pub async fn check_service(&self) -> bool {
        let mut request = self
            .client
            .get(self.endpoint.readiness_url.clone())
            .timeout(self.health_timeout);
        for (name, value) in &self.endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                debug!("Readiness endpoint answered {}: {}", status, body.trim());
                status.as_u16() < 400
            }
            Err(e) => {
                warn!("Readiness endpoint {} unreachable: {}", self.endpoint.readiness_url, e);
                false
            }
        }
    }
}

/// Generated text of a non-streaming reply in either response shape
fn completion_text(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("response")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/choices/0/text").and_then(Value::as_str))
        .or_else(|| value.pointer("/choices/0/message/content").and_then(Value::as_str))
        .map(str::to_string)
}

fn transport_failure(err: &reqwest::Error, status: Option<u16>, start: Instant) -> MetricSample {
    let error = if err.is_timeout() {
        Error::transport(format!("request timed out: {}", err))
    } else {
        Error::transport(format!("request failed: {}", err))
    };
    warn!("{}", error);
    MetricSample::failed(&error, status, start.elapsed().as_secs_f64())
}

fn api_failure(status: u16, body: &str, total_time: f64) -> MetricSample {
    let error = Error::api(format!("HTTP {}: {}", status, body.trim()));
    warn!("{}", error);
    MetricSample::failed(&error, Some(status), total_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::ErrorKind;
    use bench_dev::{setup_test_logging, MockBackend, MockReply};

    fn stream_client(mock: &MockBackend, streaming: bool) -> StreamProbe {
        let settings = ProbeSettings {
            streaming,
            ..Default::default()
        };
        StreamProbe::new(mock.endpoint().unwrap(), settings, &RequestConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_ollama_streaming_sample() {
        setup_test_logging();
        let mock = MockBackend::builder(BackendVariant::Ollama)
            .with_default_reply(MockReply::tokens(
                &["The", " capital", " is"],
                Duration::from_millis(100),
                Duration::from_millis(200),
            ))
            .start()
            .await
            .unwrap();

        let sample = stream_client(&mock, true).run("The capital of France is").await;

        assert!(sample.success);
        assert_eq!(sample.status_code, Some(200));
        assert_eq!(sample.token_count, Some(3));
        assert_eq!(sample.content_event_count, 3);
        assert_eq!(sample.event_count, 4);
        assert_eq!(sample.generated_text, "The capital is");

        let ttft = sample.ttft.unwrap();
        assert!(ttft >= 0.1 && ttft <= sample.total_time);
        let window = sample.generation_time.unwrap();
        assert!(window >= 0.35, "generation window {}", window);
        let throughput = sample.throughput.unwrap();
        assert!((throughput - 3.0 / window).abs() < 1e-9);
        assert!((sample.tpot.unwrap() - 1000.0 / throughput).abs() < 1e-9);

        let requests = mock.requests().await;
        assert_eq!(requests[0].body["options"]["num_predict"], 128);
        assert_eq!(requests[0].streaming(), Some(true));
    }

    #[tokio::test]
    async fn test_vllm_streaming_sends_auth_header() {
        let mock = MockBackend::start(BackendVariant::VLlm).await.unwrap();

        let sample = stream_client(&mock, true).run("Hi").await;

        assert!(sample.success);
        assert_eq!(sample.generated_text, "Hello, world!");
        assert_eq!(sample.content_event_count, 4);
        assert_eq!(sample.decode_errors, 0);

        let requests = mock.requests().await;
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer no-key-required"));
        assert_eq!(requests[0].body["max_tokens"], 128);
    }

    #[tokio::test]
    async fn test_malformed_lines_do_not_fail_sample() {
        let lines = vec![
            (Duration::from_millis(20), "data: {broken".to_string()),
            (Duration::from_millis(20), r#"data: {"choices":[{"text":"a"}]}"#.to_string()),
            (Duration::from_millis(20), r#"data: {"choices":[{"text":"b"}]}"#.to_string()),
            (Duration::ZERO, "data: [DONE]".to_string()),
        ];
        let mock = MockBackend::builder(BackendVariant::LmStudio)
            .with_reply(MockReply::Lines(lines))
            .start()
            .await
            .unwrap();

        let sample = stream_client(&mock, true).run("Hi").await;

        assert!(sample.success);
        assert_eq!(sample.decode_errors, 1);
        assert_eq!(sample.token_count, Some(2));
        assert!(sample.ttft.unwrap() <= sample.total_time);
    }

    #[tokio::test]
    async fn test_error_status_fails_sample() {
        let mock = MockBackend::builder(BackendVariant::VLlm)
            .with_reply(MockReply::error(503, "server overloaded"))
            .start()
            .await
            .unwrap();

        let sample = stream_client(&mock, true).run("Hi").await;

        assert!(!sample.success);
        assert_eq!(sample.status_code, Some(503));
        assert_eq!(sample.error_kind, Some(ErrorKind::Api));
        assert!(sample.error.unwrap().contains("HTTP 503: server overloaded"));
        assert_eq!(sample.ttft, None);
    }

    #[tokio::test]
    async fn test_connection_dropped_mid_stream_fails_sample() {
        let event = |text: &str| json!({"model": "mock-model", "response": text, "done": false}).to_string();
        let mock = MockBackend::builder(BackendVariant::Ollama)
            .with_reply(MockReply::Truncated(vec![
                (Duration::from_millis(20), event("The")),
                (Duration::from_millis(20), event(" capital")),
            ]))
            .start()
            .await
            .unwrap();

        let (sample, events) = stream_client(&mock, true).run_traced("The capital of France is").await;

        assert!(!sample.success);
        assert_eq!(sample.error_kind, Some(ErrorKind::Transport));
        assert_eq!(sample.status_code, Some(200));
        assert_eq!(sample.ttft, None);
        assert_eq!(sample.tpot, None);
        assert_eq!(sample.throughput, None);
        assert_eq!(sample.token_count, None);
        assert!(events.len() <= 2);
    }

    #[tokio::test]
    async fn test_run_traced_returns_stream_events() {
        let mock = MockBackend::start(BackendVariant::VLlm).await.unwrap();
        let client = stream_client(&mock, true);

        let (sample, events) = client.run_traced("Hi").await;

        assert!(sample.success);
        assert_eq!(events.len() as u64, sample.event_count);
        assert_eq!(events.iter().filter(|e| e.is_content).count(), 4);
        assert_eq!(events[0].extracted_text.as_deref(), Some("Hello"));
        assert!(events.last().unwrap().raw_payload.ends_with("[DONE]"));
        assert!(events.windows(2).all(|w| w[0].arrival_offset <= w[1].arrival_offset));

        let (blocking, events) = stream_client(&mock, false).run_traced("Hi").await;
        assert!(blocking.success);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_failure() {
        let mut mock = MockBackend::start(BackendVariant::Ollama).await.unwrap();
        let client = stream_client(&mock, true);
        mock.stop().await;

        let sample = client.run("Hi").await;

        assert!(!sample.success);
        assert_eq!(sample.error_kind, Some(ErrorKind::Transport));
        assert_eq!(sample.status_code, None);
        assert!(!client.check_service().await);
    }

    #[tokio::test]
    async fn test_blocking_request() {
        let mock = MockBackend::start(BackendVariant::Ollama).await.unwrap();
        let client = stream_client(&mock, false);

        let sample = client.run("Hi").await;

        assert!(sample.success);
        assert_eq!(sample.generated_text, "Hello, world!");
        assert!(sample.total_time > 0.0);
        assert_eq!(sample.ttft, None);
        assert_eq!(sample.tpot, None);
        assert_eq!(sample.token_count, None);
        assert_eq!(mock.requests().await[0].streaming(), Some(false));
    }

    #[tokio::test]
    async fn test_check_service() {
        let mock = MockBackend::builder(BackendVariant::VLlm)
            .with_ready(false)
            .start()
            .await
            .unwrap();
        let client = stream_client(&mock, true);

        assert!(!client.check_service().await);
        mock.set_ready(true);
        assert!(client.check_service().await);
    }

    #[test]
    fn test_request_bodies() {
        let endpoint = |variant| ApiEndpoint {
            variant,
            model: "m".to_string(),
            base_url: "http://h:1".parse().unwrap(),
            completion_url: "http://h:1/c".parse().unwrap(),
            readiness_url: "http://h:1/r".parse().unwrap(),
            headers: Vec::new(),
        };
        let settings = ProbeSettings {
            max_tokens: 64,
            temperature: 0.2,
            streaming: false,
        };

        let ollama = StreamProbe::new(endpoint(BackendVariant::Ollama), settings.clone(), &RequestConfig::default())
            .unwrap()
            .request_body("p");
        assert_eq!(ollama["options"]["num_predict"], 64);
        assert_eq!(ollama["stream"], false);
        assert!(ollama.get("max_tokens").is_none());

        let openai = StreamProbe::new(endpoint(BackendVariant::VLlm), settings, &RequestConfig::default())
            .unwrap()
            .request_body("p");
        assert_eq!(openai["max_tokens"], 64);
        assert_eq!(openai["temperature"], 0.2);
    }

    #[test]
    fn test_completion_text_shapes() {
        assert_eq!(completion_text(r#"{"response":"x","done":true}"#).as_deref(), Some("x"));
        assert_eq!(completion_text(r#"{"choices":[{"text":"y"}]}"#).as_deref(), Some("y"));
        assert_eq!(completion_text("not json"), None);
    }
}
