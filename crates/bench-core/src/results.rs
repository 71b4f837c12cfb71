//! Benchmark result records
//!
//! [`MetricSample`] is one completion request, [`TestResult`] is one test
//! definition with all of its samples, and [`SummaryStats`] is the reduction
//! over the successful ones. All of them serialise into the run's result file.

use crate::{BackendConfig, BackendVariant, Error, ErrorKind, TestDefinition};
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Result of one completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Whether the request completed with a 2xx status
    pub success: bool,

    /// Seconds from request start to the first event of any kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft: Option<f64>,

    /// Milliseconds per content event over the generation window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpot: Option<f64>,

    /// Content events per second over the generation window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,

    /// Approximate token count, one per content event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,

    /// Wall-clock seconds for the whole request
    pub total_time: f64,

    /// Seconds from the first event to the last content event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,

    /// Events observed, content or not
    #[serde(default)]
    pub event_count: u64,

    /// Events that carried generated text
    #[serde(default)]
    pub content_event_count: u64,

    /// Events that could not be decoded
    #[serde(default)]
    pub decode_errors: u64,

    /// HTTP status, when a response arrived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Concatenated generated text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generated_text: String,

    /// Failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Round this trial belongs to, zero-based
    #[serde(default)]
    pub round: u32,

    /// Index of the prompt within the configured list
    #[serde(default, rename = "prompt_id")]
    pub prompt_index: usize,

    /// Prompt text
    #[serde(default)]
    pub prompt: String,

    /// When the sample was recorded
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    /// Successful sample with only wall-clock time filled in
    pub fn completed(status_code: u16, total_time: f64) -> Self {
        Self {
            success: true,
            ttft: None,
            tpot: None,
            throughput: None,
            token_count: None,
            total_time,
            generation_time: None,
            event_count: 0,
            content_event_count: 0,
            decode_errors: 0,
            status_code: Some(status_code),
            generated_text: String::new(),
            error_kind: None,
            error: None,
            round: 0,
            prompt_index: 0,
            prompt: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed sample carrying the error verbatim
    pub fn failed(error: &Error, status_code: Option<u16>, total_time: f64) -> Self {
        Self {
            success: false,
            status_code,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            ..Self::completed(0, total_time)
        }
    }

    /// Tag the sample with its trial coordinates
    pub fn for_trial(mut self, round: u32, prompt_index: usize, prompt: impl Into<String>) -> Self {
        self.round = round;
        self.prompt_index = prompt_index;
        self.prompt = prompt.into();
        self
    }

    /// Value of one summarised metric
    pub fn metric(&self, name: MetricName) -> Option<f64> {
        match name {
            MetricName::Ttft => self.ttft,
            MetricName::Tpot => self.tpot,
            MetricName::Throughput => self.throughput,
            MetricName::TotalTime => Some(self.total_time),
        }
    }
}

/// Metrics reduced into a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    Ttft,
    Tpot,
    Throughput,
    TotalTime,
}

impl MetricName {
    pub const ALL: [MetricName; 4] = [
        MetricName::Ttft,
        MetricName::Tpot,
        MetricName::Throughput,
        MetricName::TotalTime,
    ];

    /// Key prefix in the result file
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Ttft => "ttft",
            MetricName::Tpot => "tpot",
            MetricName::Throughput => "throughput",
            MetricName::TotalTime => "total_time",
        }
    }

    /// Display unit
    pub fn unit(&self) -> &'static str {
        match self {
            MetricName::Ttft | MetricName::TotalTime => "s",
            MetricName::Tpot => "ms",
            MetricName::Throughput => "tok/s",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Average and extrema of one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSummary {
    /// Summarise a set of values; `None` when there are none
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            avg: sum / values.len() as f64,
            min,
            max,
        })
    }
}

/// Value of the parameter under test, copied from the backend config
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryParameter {
    pub name: String,
    pub value: Value,
}

/// Per-test summary over successful samples
///
/// Serialised with flat keys (`ttft_avg`, `ttft_min`, ...) and the parameter
/// under test stored under its own name. Metrics without qualifying samples
/// are omitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryStats {
    pub ttft: Option<MetricSummary>,
    pub tpot: Option<MetricSummary>,
    pub throughput: Option<MetricSummary>,
    pub total_time: Option<MetricSummary>,
    pub parameter: Option<SummaryParameter>,
}

impl SummaryStats {
    pub fn get(&self, name: MetricName) -> Option<&MetricSummary> {
        match name {
            MetricName::Ttft => self.ttft.as_ref(),
            MetricName::Tpot => self.tpot.as_ref(),
            MetricName::Throughput => self.throughput.as_ref(),
            MetricName::TotalTime => self.total_time.as_ref(),
        }
    }

    pub fn set(&mut self, name: MetricName, summary: Option<MetricSummary>) {
        match name {
            MetricName::Ttft => self.ttft = summary,
            MetricName::Tpot => self.tpot = summary,
            MetricName::Throughput => self.throughput = summary,
            MetricName::TotalTime => self.total_time = summary,
        }
    }

    /// No metric and no parameter recorded
    pub fn is_empty(&self) -> bool {
        self.parameter.is_none() && MetricName::ALL.iter().all(|m| self.get(*m).is_none())
    }
}

impl Serialize for SummaryStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(param) = &self.parameter {
            map.serialize_entry(&param.name, &param.value)?;
        }
        for name in MetricName::ALL {
            if let Some(summary) = self.get(name) {
                map.serialize_entry(&format!("{}_avg", name), &summary.avg)?;
                map.serialize_entry(&format!("{}_min", name), &summary.min)?;
                map.serialize_entry(&format!("{}_max", name), &summary.max)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SummaryStats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut stats = SummaryStats::default();

        for name in MetricName::ALL {
            let avg = raw.remove(&format!("{}_avg", name)).and_then(|v| v.as_f64());
            let min = raw.remove(&format!("{}_min", name)).and_then(|v| v.as_f64());
            let max = raw.remove(&format!("{}_max", name)).and_then(|v| v.as_f64());
            if let (Some(avg), Some(min), Some(max)) = (avg, min, max) {
                stats.set(name, Some(MetricSummary { avg, min, max }));
            }
        }

        stats.parameter = raw
            .into_iter()
            .next()
            .map(|(name, value)| SummaryParameter { name, value });

        Ok(stats)
    }
}

/// Outcome of one test definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name
    pub name: String,

    /// False when the deployment failed
    pub success: bool,

    /// Backend variant under test
    pub backend: BackendVariant,

    /// Launch parameters used
    pub config: BackendConfig,

    /// Streaming mode
    pub streaming: bool,

    /// Deployment failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Deployment failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Every attempted trial, failed ones included
    #[serde(rename = "test_results", default)]
    pub samples: Vec<MetricSample>,

    /// Reduction over successful samples
    #[serde(default)]
    pub summary: SummaryStats,

    /// When the test started
    pub started_at: DateTime<Utc>,

    /// When the test finished
    pub finished_at: DateTime<Utc>,
}

impl TestResult {
    /// Empty successful result for a definition
    pub fn new(definition: &TestDefinition) -> Self {
        let now = Utc::now();
        Self {
            name: definition.name.clone(),
            success: true,
            backend: definition.backend,
            config: definition.backend_config.clone(),
            streaming: definition.streaming,
            error_kind: None,
            error: None,
            samples: Vec::new(),
            summary: SummaryStats::default(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Result for a definition whose backend never became usable
    pub fn deployment_failed(definition: &TestDefinition, error: &Error) -> Self {
        Self {
            success: false,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            ..Self::new(definition)
        }
    }

    pub fn successful_samples(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter().filter(|s| s.success)
    }

    pub fn failed_count(&self) -> usize {
        self.samples.iter().filter(|s| !s.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metric_summary_from_values() {
        let summary = MetricSummary::from_values(&[1.0, 2.0, 6.0]).unwrap();
        assert_eq!(summary.avg, 3.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 6.0);
        assert!(MetricSummary::from_values(&[]).is_none());
    }

    #[test]
    fn test_summary_flat_serialization() {
        let stats = SummaryStats {
            ttft: Some(MetricSummary { avg: 0.2, min: 0.1, max: 0.3 }),
            parameter: Some(SummaryParameter {
                name: "max-num-seqs".to_string(),
                value: json!(64),
            }),
            ..Default::default()
        };

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["ttft_avg"], json!(0.2));
        assert_eq!(value["ttft_min"], json!(0.1));
        assert_eq!(value["max-num-seqs"], json!(64));
        assert!(value.get("tpot_avg").is_none());

        let back: SummaryStats = serde_json::from_value(value).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn test_empty_summary() {
        let stats = SummaryStats::default();
        assert!(stats.is_empty());
        assert_eq!(serde_json::to_string(&stats).unwrap(), "{}");
    }

    #[test]
    fn test_failed_sample_carries_error() {
        let err = Error::api("HTTP 500: boom");
        let sample = MetricSample::failed(&err, Some(500), 0.05).for_trial(1, 0, "hi");

        assert!(!sample.success);
        assert_eq!(sample.error_kind, Some(ErrorKind::Api));
        assert_eq!(sample.error.as_deref(), Some("API error: HTTP 500: boom"));
        assert_eq!(sample.round, 1);
        assert_eq!(sample.metric(MetricName::Ttft), None);
        assert_eq!(sample.metric(MetricName::TotalTime), Some(0.05));

        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["prompt_id"], json!(0));
        assert!(value.get("ttft").is_none());
    }

    #[test]
    fn test_deployment_failed_result() {
        let def = TestDefinition::new("t", BackendVariant::VLlm, BackendConfig::new());
        let result = TestResult::deployment_failed(&def, &Error::deployment_timeout("600s"));

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::DeploymentTimeout));
        assert!(result.samples.is_empty());

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["backend"], json!("vllm"));
        assert_eq!(value["test_results"], json!([]));
    }
}
