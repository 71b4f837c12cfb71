//! Error handling for llm-bench
//!
//! Provides a unified error type and result type for use across all llm-bench
//! components, plus the serialisable [`ErrorKind`] that failed samples and
//! results carry into the result file.

use serde::{Deserialize, Serialize};

/// Result type alias for llm-bench operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for llm-bench
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Connection or channel failure (HTTP transport, SSH session, process spawn)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend never became ready within the readiness ceiling
    #[error("Deployment timed out: {0}")]
    DeploymentTimeout(String),

    /// The backend process disappeared before it became ready
    #[error("Backend process exited early: {0}")]
    ProcessExitedEarly(String),

    /// Non-2xx status or malformed payload from a backend API
    #[error("API error: {0}")]
    Api(String),

    /// One malformed streaming event
    #[error("Stream decode error: {0}")]
    StreamDecode(String),

    /// The launch or preparation command was rejected
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// The backend process survived the forceful termination step
    #[error("Stop failed: {0}")]
    StopFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Serialisable classification of a failure, recorded in results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    DeploymentTimeout,
    ProcessExitedEarly,
    Api,
    StreamDecode,
    LaunchFailed,
    StopFailed,
    Configuration,
    Internal,
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a deployment timeout error
    pub fn deployment_timeout(msg: impl Into<String>) -> Self {
        Self::DeploymentTimeout(msg.into())
    }

    /// Create a process-exited-early error
    pub fn process_exited_early(msg: impl Into<String>) -> Self {
        Self::ProcessExitedEarly(msg.into())
    }

    /// Create an API error
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// Create a stream decode error
    pub fn stream_decode(msg: impl Into<String>) -> Self {
        Self::StreamDecode(msg.into())
    }

    /// Create a launch failure
    pub fn launch_failed(msg: impl Into<String>) -> Self {
        Self::LaunchFailed(msg.into())
    }

    /// Create a stop failure
    pub fn stop_failed(msg: impl Into<String>) -> Self {
        Self::StopFailed(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error for the result file
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Io(_) => ErrorKind::Transport,
            Error::DeploymentTimeout(_) => ErrorKind::DeploymentTimeout,
            Error::ProcessExitedEarly(_) => ErrorKind::ProcessExitedEarly,
            Error::Api(_) | Error::Json(_) => ErrorKind::Api,
            Error::StreamDecode(_) => ErrorKind::StreamDecode,
            Error::LaunchFailed(_) => ErrorKind::LaunchFailed,
            Error::StopFailed(_) => ErrorKind::StopFailed,
            Error::InvalidConfiguration(_) | Error::Yaml(_) => ErrorKind::Configuration,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Api(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::DeploymentTimeout => "deployment_timeout",
            ErrorKind::ProcessExitedEarly => "process_exited_early",
            ErrorKind::Api => "api",
            ErrorKind::StreamDecode => "stream_decode",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::StopFailed => "stop_failed",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("missing prompts");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: missing prompts");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::deployment_timeout("600s").kind(), ErrorKind::DeploymentTimeout);
        assert_eq!(Error::process_exited_early("gone").kind(), ErrorKind::ProcessExitedEarly);
        assert_eq!(Error::api("500").kind(), ErrorKind::Api);
        assert_eq!(Error::transport("refused").kind(), ErrorKind::Transport);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(Error::from(io).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::transport("x").is_retryable());
        assert!(Error::api("x").is_retryable());
        assert!(!Error::stop_failed("x").is_retryable());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::DeploymentTimeout).unwrap();
        assert_eq!(json, "\"deployment_timeout\"");
        assert_eq!(ErrorKind::ProcessExitedEarly.to_string(), "process_exited_early");
    }
}
