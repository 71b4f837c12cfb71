//! Core domain types: backend variants, backend parameters and test definitions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Inference-serving products that can be deployed and benchmarked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendVariant {
    /// Ollama model server
    #[serde(rename = "ollama")]
    Ollama,
    /// vLLM OpenAI-compatible server
    #[serde(rename = "vllm")]
    VLlm,
    /// LM Studio headless server
    #[serde(rename = "lmstudio", alias = "lm-studio", alias = "lm_studio")]
    LmStudio,
}

impl BackendVariant {
    /// All supported variants
    pub const ALL: [BackendVariant; 3] = [
        BackendVariant::Ollama,
        BackendVariant::VLlm,
        BackendVariant::LmStudio,
    ];

    /// Port the backend listens on when none is configured
    pub fn default_port(&self) -> u16 {
        match self {
            BackendVariant::Ollama => 11434,
            BackendVariant::VLlm => 8000,
            BackendVariant::LmStudio => 1234,
        }
    }

    /// Streaming payload shape emitted by this variant
    pub fn wire_format(&self) -> WireFormat {
        match self {
            BackendVariant::Ollama => WireFormat::JsonLines,
            BackendVariant::VLlm | BackendVariant::LmStudio => WireFormat::ServerSentEvents,
        }
    }
}

impl fmt::Display for BackendVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendVariant::Ollama => write!(f, "ollama"),
            BackendVariant::VLlm => write!(f, "vllm"),
            BackendVariant::LmStudio => write!(f, "lmstudio"),
        }
    }
}

impl FromStr for BackendVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(BackendVariant::Ollama),
            "vllm" => Ok(BackendVariant::VLlm),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(BackendVariant::LmStudio),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Streaming wire shape of a completion response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// One bare JSON object per line
    JsonLines,
    /// `data: {...}` envelopes terminated by `data: [DONE]`
    ServerSentEvents,
}

/// String-keyed launch parameters for one backend deployment
///
/// Stored as the raw JSON object from the run configuration so that
/// variant-specific keys survive untouched into the result file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendConfig {
    params: Map<String, Value>,
}

impl BackendConfig {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style parameter insertion
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a parameter
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    /// Raw parameter lookup
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Underlying JSON object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.params
    }

    /// String parameter; numbers are rendered as strings
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.params.get(key).and_then(value_to_string)
    }

    /// Boolean parameter; accepts JSON booleans and "true"/"false" strings
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.params.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Unsigned integer parameter; accepts JSON numbers and numeric strings
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.params.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Model identifier, falling back to `model_path`
    pub fn model(&self) -> Option<String> {
        self.get_str("model").or_else(|| self.get_str("model_path"))
    }

    /// Configured listen port
    pub fn port(&self) -> Option<u16> {
        self.get_u64("port").and_then(|p| u16::try_from(p).ok())
    }

    /// GPU ids, from either a JSON list or a comma-separated string
    pub fn gpu_ids(&self) -> Vec<String> {
        match self.params.get("gpu_ids") {
            Some(Value::Array(items)) => items.iter().filter_map(value_to_string).collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::Number(n)) => vec![n.to_string()],
            _ => Vec::new(),
        }
    }

    /// Nested map of extra launch flags
    pub fn args(&self) -> Option<&Map<String, Value>> {
        self.params.get("args").and_then(Value::as_object)
    }

    /// Nested map of environment variables
    pub fn env_vars(&self) -> Option<&Map<String, Value>> {
        self.params.get("env_vars").and_then(Value::as_object)
    }

    /// Look up a parameter by name at the top level, then inside `args`
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.params
            .get(name)
            .or_else(|| self.args().and_then(|args| args.get(name)))
    }
}

impl From<Map<String, Value>> for BackendConfig {
    fn from(params: Map<String, Value>) -> Self {
        Self { params }
    }
}

/// Render a scalar JSON value as a plain string
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One benchmark test definition from the run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Test name
    #[serde(default = "default_test_name")]
    pub name: String,

    /// Backend variant to deploy
    pub backend: BackendVariant,

    /// Launch parameters
    #[serde(default)]
    pub backend_config: BackendConfig,

    /// Use the streaming completion API
    #[serde(default = "default_streaming")]
    pub streaming: bool,

    /// Number of rounds; falls back to the run-wide default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
}

impl TestDefinition {
    /// Create a streaming test definition
    pub fn new(name: impl Into<String>, backend: BackendVariant, backend_config: BackendConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            backend_config,
            streaming: true,
            repeat: None,
        }
    }

    /// Set the streaming flag
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set the repeat count
    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Effective repeat count
    pub fn repeat_or(&self, default_repeat: u32) -> u32 {
        self.repeat.unwrap_or(default_repeat)
    }
}

fn default_test_name() -> String {
    "unnamed_test".to_string()
}

fn default_streaming() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_variant_parsing() {
        assert_eq!("ollama".parse::<BackendVariant>().unwrap(), BackendVariant::Ollama);
        assert_eq!("VLLM".parse::<BackendVariant>().unwrap(), BackendVariant::VLlm);
        assert_eq!("lm-studio".parse::<BackendVariant>().unwrap(), BackendVariant::LmStudio);
        assert!("triton".parse::<BackendVariant>().is_err());

        assert_eq!(BackendVariant::VLlm.to_string(), "vllm");
        let json = serde_json::to_string(&BackendVariant::LmStudio).unwrap();
        assert_eq!(json, "\"lmstudio\"");
    }

    #[test]
    fn test_backend_variant_defaults() {
        assert_eq!(BackendVariant::Ollama.default_port(), 11434);
        assert_eq!(BackendVariant::VLlm.default_port(), 8000);
        assert_eq!(BackendVariant::LmStudio.default_port(), 1234);
        assert_eq!(BackendVariant::Ollama.wire_format(), WireFormat::JsonLines);
        assert_eq!(BackendVariant::VLlm.wire_format(), WireFormat::ServerSentEvents);
    }

    #[test]
    fn test_backend_config_accessors() {
        let config: BackendConfig = serde_json::from_value(json!({
            "model_path": "/models/qwen",
            "port": "8001",
            "gpu_ids": [0, 1],
            "use_vllm_serve": "false",
            "args": {"max-num-seqs": 64}
        }))
        .unwrap();

        assert_eq!(config.model().as_deref(), Some("/models/qwen"));
        assert_eq!(config.port(), Some(8001));
        assert_eq!(config.gpu_ids(), vec!["0", "1"]);
        assert_eq!(config.get_bool("use_vllm_serve"), Some(false));
        assert_eq!(config.args().map(|a| a.len()), Some(1));
    }

    #[test]
    fn test_gpu_ids_from_string() {
        let config = BackendConfig::new().with("gpu_ids", "2, 3");
        assert_eq!(config.gpu_ids(), vec!["2", "3"]);
        assert!(BackendConfig::new().gpu_ids().is_empty());
    }

    #[test]
    fn test_parameter_lookup_order() {
        let config: BackendConfig = serde_json::from_value(json!({
            "max-num-seqs": 32,
            "args": {"max-num-seqs": 64, "gpu-memory-utilization": 0.9}
        }))
        .unwrap();

        assert_eq!(config.parameter("max-num-seqs"), Some(&json!(32)));
        assert_eq!(config.parameter("gpu-memory-utilization"), Some(&json!(0.9)));
        assert_eq!(config.parameter("dtype"), None);
    }

    #[test]
    fn test_test_definition_defaults() {
        let def: TestDefinition = serde_json::from_value(json!({
            "backend": "ollama",
            "backend_config": {"model": "llama3"}
        }))
        .unwrap();

        assert_eq!(def.name, "unnamed_test");
        assert!(def.streaming);
        assert_eq!(def.repeat_or(3), 3);
        assert_eq!(def.with_repeat(2).repeat_or(3), 2);
    }
}
