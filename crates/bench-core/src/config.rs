//! Configuration management for llm-bench
//!
//! A run is described by one JSON or YAML document: where commands execute,
//! which backends to deploy, which prompts to send and how long each
//! lifecycle step may take. Every section has defaults so a minimal file
//! only needs its `tests`.

use crate::{Error, Result, TestDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for a benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Where backend commands execute
    #[serde(alias = "ssh")]
    pub executor: ExecutorConfig,

    /// Test definitions, run in order
    pub tests: Vec<TestDefinition>,

    /// Prompts sent in every round
    pub prompts: Vec<String>,

    /// Generation limit per request
    pub max_tokens: u32,

    /// Sampling temperature per request
    pub temperature: f64,

    /// Root directory for run output
    pub result_dir: PathBuf,

    /// Rounds for tests that do not set `repeat`
    pub default_repeat: u32,

    /// Backend parameter copied into each summary; empty disables
    pub test_param: String,

    /// Write every streaming event of every trial under the run directory
    pub save_stream_chunks: bool,

    /// Deployment and teardown timings
    pub lifecycle: LifecycleConfig,

    /// HTTP request settings
    pub request: RequestConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                Error::config(format!("Failed to parse YAML config {}: {}", path.display(), e))
            })?,
            _ => serde_json::from_str(&content).map_err(|e| {
                Error::config(format!("Failed to parse JSON config {}: {}", path.display(), e))
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from a file when given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        self.lifecycle.validate()?;
        self.request.validate()?;

        if self.prompts.is_empty() {
            return Err(Error::config("At least one prompt is required"));
        }

        if self.max_tokens == 0 {
            return Err(Error::config("max_tokens must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::config("temperature must be between 0.0 and 2.0"));
        }

        if self.default_repeat == 0 {
            return Err(Error::config("default_repeat must be greater than 0"));
        }

        let mut seen = std::collections::HashSet::new();
        for test in &self.tests {
            if test.name.is_empty() {
                return Err(Error::config("Test name cannot be empty"));
            }
            if !seen.insert(test.name.as_str()) {
                return Err(Error::config(format!("Duplicate test name: {}", test.name)));
            }
            if test.repeat == Some(0) {
                return Err(Error::config(format!("Test {} has repeat 0", test.name)));
            }
        }

        Ok(())
    }

    /// Name of the parameter under test, if configured
    pub fn parameter_under_test(&self) -> Option<&str> {
        let name = self.test_param.trim();
        (!name.is_empty()).then_some(name)
    }

    /// Find a test definition by name
    pub fn find_test(&self, name: &str) -> Option<&TestDefinition> {
        self.tests.iter().find(|t| t.name == name)
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            tests: Vec::new(),
            prompts: vec![
                "The capital of France is".to_string(),
                "Write a short story about a robot learning to feel emotions".to_string(),
            ],
            max_tokens: 128,
            temperature: 0.7,
            result_dir: PathBuf::from("results"),
            default_repeat: 1,
            test_param: String::new(),
            save_stream_chunks: false,
            lifecycle: LifecycleConfig::default(),
            request: RequestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Command execution target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Run commands on this machine instead of over SSH
    pub local_mode: bool,

    /// SSH host
    pub hostname: String,

    /// SSH user
    pub username: String,

    /// SSH port
    pub port: u16,

    /// Private key for SSH; the agent is used when unset
    pub key_path: Option<PathBuf>,

    /// SSH connect timeout in seconds
    pub connect_timeout_seconds: u64,
}

impl ExecutorConfig {
    /// Validate the executor configuration
    pub fn validate(&self) -> Result<()> {
        if !self.local_mode {
            if self.hostname.is_empty() {
                return Err(Error::config("SSH hostname cannot be empty"));
            }
            if self.port == 0 {
                return Err(Error::config("SSH port cannot be 0"));
            }
        }
        Ok(())
    }

    /// `user@host` destination for the ssh client
    pub fn destination(&self) -> String {
        if self.username.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}@{}", self.username, self.hostname)
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            local_mode: true,
            hostname: "localhost".to_string(),
            username: String::new(),
            port: 22,
            key_path: None,
            connect_timeout_seconds: 10,
        }
    }
}

/// Deployment and teardown timings, all in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Delay between readiness polls
    pub poll_interval_seconds: u64,

    /// Ceiling on the whole readiness wait
    pub ready_timeout_seconds: u64,

    /// Pause after the launch command before the first poll
    pub launch_grace_seconds: u64,

    /// Timeout for ordinary remote commands
    pub command_timeout_seconds: u64,

    /// Timeout for model downloads
    pub pull_timeout_seconds: u64,

    /// Presence checks after the graceful stop signal
    pub stop_attempts: u32,

    /// Delay between presence checks
    pub stop_backoff_seconds: u64,

    /// Lines of backend log reported on failure
    pub log_tail_lines: usize,

    /// Interval between progress snapshots while waiting
    pub progress_log_every_seconds: u64,

    /// Load the model with an empty request once the backend is ready
    pub warmup: bool,
}

impl LifecycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_secs(self.launch_grace_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_seconds)
    }

    pub fn stop_backoff(&self) -> Duration {
        Duration::from_secs(self.stop_backoff_seconds)
    }

    pub fn progress_log_every(&self) -> Duration {
        Duration::from_secs(self.progress_log_every_seconds)
    }

    /// Validate the lifecycle configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_seconds == 0 {
            return Err(Error::config("poll_interval_seconds must be greater than 0"));
        }
        if self.ready_timeout_seconds < self.poll_interval_seconds {
            return Err(Error::config(
                "ready_timeout_seconds must be at least poll_interval_seconds",
            ));
        }
        if self.command_timeout_seconds == 0 {
            return Err(Error::config("command_timeout_seconds must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 20,
            ready_timeout_seconds: 600,
            launch_grace_seconds: 5,
            command_timeout_seconds: 30,
            pull_timeout_seconds: 1800,
            stop_attempts: 5,
            stop_backoff_seconds: 2,
            log_tail_lines: 50,
            progress_log_every_seconds: 60,
            warmup: true,
        }
    }
}

/// HTTP client settings for completion requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Total timeout per completion request
    pub timeout_seconds: u64,

    /// TCP connect timeout
    pub connect_timeout_seconds: u64,

    /// Timeout for the readiness check
    pub health_timeout_seconds: u64,
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_seconds)
    }

    /// Validate the request configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(Error::config("request timeout_seconds must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            connect_timeout_seconds: 10,
            health_timeout_seconds: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
