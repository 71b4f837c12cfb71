//! # bench-runner
//!
//! Drives benchmark runs against deployed inference backends.
//!
//! This crate provides:
//! - Stream decoding for the JSON-lines and SSE wire formats ([`stream`])
//! - [`StreamProbe`], which times a single completion request
//! - [`TestRunner`], which deploys a backend and runs every trial of a test
//! - [`ResultAggregator`], which reduces samples to summary statistics
//! - [`Orchestrator`], which sequences tests and persists results after each one

use bench_core::ErrorKind;
use thiserror::Error;

pub mod aggregate;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod runner;
pub mod stream;

// Re-export main types
pub use aggregate::ResultAggregator;
pub use orchestrator::{Orchestrator, RunOptions};
pub use probe::{ProbeSettings, StreamProbe};
pub use runner::TestRunner;
pub use stream::{ChunkRecord, DecodedEvent, LineBuffer, StreamAccumulator, StreamEvent, StreamMetrics};

/// Result type for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors that can occur outside of individual trials
///
/// Trial failures never surface as `RunnerError`; they are recorded in the
/// sample they belong to.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Runtime error: {0}")]
    Runtime(#[from] bench_runtime::RuntimeError),

    #[error(transparent)]
    Core(#[from] bench_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RunnerError {
    /// Classification recorded in results and used for exit codes
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunnerError::Configuration(_) | RunnerError::TestNotFound(_) => ErrorKind::Configuration,
            RunnerError::Http(_) => ErrorKind::Transport,
            RunnerError::Runtime(e) => e.kind(),
            RunnerError::Core(e) => e.kind(),
            RunnerError::Io(_) | RunnerError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Http(_) => true,
            RunnerError::Runtime(e) => e.is_retryable(),
            RunnerError::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_runtime::RuntimeError;

    #[test]
    fn test_runner_error_kind() {
        let err = RunnerError::from(RuntimeError::DeploymentTimeout("600s".to_string()));
        assert_eq!(err.kind(), ErrorKind::DeploymentTimeout);
        assert!(!err.is_retryable());

        let err = RunnerError::TestNotFound("vllm-tp2".to_string());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "Test not found: vllm-tp2");
    }
}
