//! Streaming response decoding and timing
//!
//! Byte chunks from the HTTP body are split into lines by [`LineBuffer`],
//! each line is decoded for the backend's [`WireFormat`] by [`decode_line`],
//! and [`StreamAccumulator`] records the resulting [`StreamEvent`]s in
//! arrival order and derives the timing metrics.
//!
//! Timing rules:
//! - TTFT is the offset of the first event of any kind, undecodable ones
//!   included.
//! - The generation window runs from the first event to the last content
//!   event. Throughput and TPOT are only derived when more than one content
//!   event arrived; otherwise both are zero.

use bench_core::{Error, MetricSample, WireFormat};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// What one line of a streaming response carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    /// Generated text
    Content(String),
    /// Keep-alive, metadata or an object without text
    Control,
    /// End-of-stream marker
    Done,
}

/// One decoded unit of a streaming response
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub sequence_index: u64,
    /// Time since the request was sent
    pub arrival_offset: Duration,
    pub raw_payload: String,
    pub extracted_text: Option<String>,
    pub is_content: bool,
}

/// A [`StreamEvent`] as written to a chunk dump
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub index: u64,
    /// Seconds since the request was sent
    pub time: f64,
    /// The line as received
    pub content: String,
    pub extracted_text: Option<String>,
    pub is_content: bool,
}

impl From<&StreamEvent> for ChunkRecord {
    fn from(event: &StreamEvent) -> Self {
        Self {
            index: event.sequence_index,
            time: event.arrival_offset.as_secs_f64(),
            content: event.raw_payload.clone(),
            extracted_text: event.extracted_text.clone(),
            is_content: event.is_content,
        }
    }
}

/// Decode one line; `Ok(None)` for blank lines, which are not events
pub fn decode_line(format: WireFormat, line: &str) -> Result<Option<DecodedEvent>, Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    match format {
        WireFormat::JsonLines => decode_json_line(line).map(Some),
        WireFormat::ServerSentEvents => decode_sse_line(line).map(Some),
    }
}

fn decode_json_line(line: &str) -> Result<DecodedEvent, Error> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Error::stream_decode(format!("invalid JSON line: {}", e)))?;

    match value.get("response").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => Ok(DecodedEvent::Content(text.to_string())),
        _ if value.get("done").and_then(Value::as_bool) == Some(true) => Ok(DecodedEvent::Done),
        _ => Ok(DecodedEvent::Control),
    }
}

fn decode_sse_line(line: &str) -> Result<DecodedEvent, Error> {
    if line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
    {
        return Ok(DecodedEvent::Control);
    }

    let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if payload == "[DONE]" {
        return Ok(DecodedEvent::Done);
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::stream_decode(format!("invalid SSE payload: {}", e)))?;

    let choice = value.get("choices").and_then(|c| c.get(0));
    let text = choice.and_then(|c| {
        c.get("text")
            .and_then(Value::as_str)
            .or_else(|| c.pointer("/delta/content").and_then(Value::as_str))
    });

    match text {
        Some(text) if !text.is_empty() => Ok(DecodedEvent::Content(text.to_string())),
        _ => Ok(DecodedEvent::Control),
    }
}

/// Reassembles byte chunks into lines
///
/// Lines end at `\n`; a trailing `\r` is dropped. Bytes after the last
/// newline are held until more data arrives or [`LineBuffer::finish`].
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Leading bytes of `pending` already searched for a newline
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + pos;
            let line = &self.pending[start..end];
            lines.push(line.strip_suffix(b"\r").unwrap_or(line).to_vec());
            start = end + 1;
            from = start;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Take whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        if self.pending.is_empty() {
            None
        } else {
            let mut rest = std::mem::take(&mut self.pending);
            if rest.last() == Some(&b'\r') {
                rest.pop();
            }
            Some(rest)
        }
    }
}

/// Metrics derived from one streaming response
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetrics {
    /// Seconds to the first event, if any arrived
    pub ttft: Option<f64>,
    /// Seconds from the first event to the last content event, when more
    /// than one content event arrived
    pub generation_time: Option<f64>,
    pub throughput: f64,
    pub tpot: f64,
    pub token_count: u64,
    pub event_count: u64,
    pub content_event_count: u64,
    pub decode_errors: u64,
    pub text: String,
}

impl StreamMetrics {
    /// Copy the streaming metrics into a sample
    pub fn apply_to(self, sample: &mut MetricSample) {
        sample.ttft = self.ttft;
        sample.tpot = Some(self.tpot);
        sample.throughput = Some(self.throughput);
        sample.token_count = Some(self.token_count);
        sample.generation_time = self.generation_time;
        sample.event_count = self.event_count;
        sample.content_event_count = self.content_event_count;
        sample.decode_errors = self.decode_errors;
        sample.generated_text = self.text;
    }
}

/// Records events in arrival order and derives timing metrics
#[derive(Debug)]
pub struct StreamAccumulator {
    format: WireFormat,
    events: Vec<StreamEvent>,
    first_event: Option<Duration>,
    last_content: Option<Duration>,
    token_count: u64,
    decode_errors: u64,
    finished: bool,
    text: String,
}

impl StreamAccumulator {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            events: Vec::new(),
            first_event: None,
            last_content: None,
            token_count: 0,
            decode_errors: 0,
            finished: false,
            text: String::new(),
        }
    }

    /// Decode and record one line that arrived `offset` after the request
    pub fn push_line(&mut self, line: &[u8], offset: Duration) {
        let raw = match std::str::from_utf8(line) {
            Ok(raw) => raw,
            Err(e) => {
                let err = Error::stream_decode(format!("line is not valid UTF-8: {}", e));
                self.record_decode_error(String::from_utf8_lossy(line).into_owned(), offset, &err);
                return;
            }
        };

        match decode_line(self.format, raw) {
            Ok(None) => {}
            Ok(Some(decoded)) => self.record(raw.to_string(), offset, decoded),
            Err(err) => self.record_decode_error(raw.to_string(), offset, &err),
        }
    }

    fn record(&mut self, raw: String, offset: Duration, decoded: DecodedEvent) {
        self.first_event.get_or_insert(offset);

        let extracted_text = match decoded {
            DecodedEvent::Content(text) => {
                self.token_count += 1;
                self.last_content = Some(offset);
                self.text.push_str(&text);
                Some(text)
            }
            DecodedEvent::Done => {
                self.finished = true;
                None
            }
            DecodedEvent::Control => None,
        };

        debug!(
            "event {} at {:.3}s{}",
            self.events.len(),
            offset.as_secs_f64(),
            if extracted_text.is_some() { " (content)" } else { "" }
        );

        self.events.push(StreamEvent {
            sequence_index: self.events.len() as u64,
            arrival_offset: offset,
            raw_payload: raw,
            is_content: extracted_text.is_some(),
            extracted_text,
        });
    }

    fn record_decode_error(&mut self, raw: String, offset: Duration, err: &Error) {
        warn!("Skipping undecodable stream event: {}", err);
        self.first_event.get_or_insert(offset);
        self.decode_errors += 1;
        self.events.push(StreamEvent {
            sequence_index: self.events.len() as u64,
            arrival_offset: offset,
            raw_payload: raw,
            extracted_text: None,
            is_content: false,
        });
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<StreamEvent> {
        self.events
    }

    /// Whether the end-of-stream marker was seen
    pub fn saw_sentinel(&self) -> bool {
        self.finished
    }

    pub fn metrics(&self) -> StreamMetrics {
        let ttft = self.first_event.map(|d| d.as_secs_f64());

        let mut generation_time = None;
        let mut throughput = 0.0;
        let mut tpot = 0.0;

        if self.token_count > 1 {
            if let (Some(first), Some(last)) = (self.first_event, self.last_content) {
                let window = last.saturating_sub(first).as_secs_f64();
                generation_time = Some(window);
                if window > 0.0 {
                    throughput = self.token_count as f64 / window;
                }
                if throughput > 0.0 {
                    tpot = 1000.0 / throughput;
                }
            }
        }

        StreamMetrics {
            ttft,
            generation_time,
            throughput,
            tpot,
            token_count: self.token_count,
            event_count: self.events.len() as u64,
            content_event_count: self.events.iter().filter(|e| e.is_content).count() as u64,
            decode_errors: self.decode_errors,
            text: self.text.clone(),
        }
    }
}
