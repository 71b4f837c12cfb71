//! # bench-runtime
//!
//! Deployment and teardown of inference-serving backends for llm-bench.
//!
//! This crate provides:
//! - The [`RemoteExecutor`] contract with local-process and SSH implementations
//! - A [`BackendAdapter`] per supported backend (Ollama, vLLM, LM Studio)
//! - The [`ServiceController`] lifecycle state machine
//! - Readiness signals, GPU inventory and a scripted executor for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use bench_core::{BackendConfig, BackendVariant, LifecycleConfig};
//! use bench_runtime::{LocalExecutor, ServiceController};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = Arc::new(LocalExecutor::new());
//!     let mut controller = ServiceController::new(executor, LifecycleConfig::default());
//!
//!     let config = BackendConfig::new().with("model", "llama3.2:1b");
//!     let endpoint = controller.deploy(BackendVariant::Ollama, &config).await?;
//!     println!("serving at {}", endpoint.completion_url);
//!
//!     controller.shutdown().await?;
//!     Ok(())
//! }
//! ```

use bench_core::ErrorKind;
use thiserror::Error;

pub mod adapter;
pub mod controller;
pub mod executor;
pub mod gpu;
pub mod health;
pub mod lmstudio;
pub mod mock;
pub mod ollama;
pub mod process;
pub mod ssh;
pub mod vllm;

// Re-export main types
pub use adapter::{create_adapter, guard_pattern, shell_quote, BackendAdapter, ModelFetch};
pub use controller::{ApiEndpoint, ServiceController, ServiceState};
pub use executor::{create_executor, CommandOutput, RemoteExecutor};
pub use gpu::{query_gpus, GpuInfo};
pub use health::{HealthStatus, ReadinessSignal};
pub use mock::ScriptedExecutor;
pub use process::LocalExecutor;
pub use ssh::SshExecutor;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while deploying or driving a backend
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Deployment timed out: {0}")]
    DeploymentTimeout(String),

    #[error("Backend process exited early: {0}")]
    ProcessExitedEarly(String),

    #[error("Stop failed: {0}")]
    StopFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Transport(_) | RuntimeError::Command(_) | RuntimeError::Io(_)
        )
    }

    /// Classification shared with result records
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Configuration(_) => ErrorKind::Configuration,
            RuntimeError::Transport(_) | RuntimeError::Command(_) | RuntimeError::Io(_) => ErrorKind::Transport,
            RuntimeError::LaunchFailed(_) => ErrorKind::LaunchFailed,
            RuntimeError::DeploymentTimeout(_) => ErrorKind::DeploymentTimeout,
            RuntimeError::ProcessExitedEarly(_) => ErrorKind::ProcessExitedEarly,
            RuntimeError::StopFailed(_) => ErrorKind::StopFailed,
        }
    }
}

impl From<RuntimeError> for bench_core::Error {
    fn from(err: RuntimeError) -> Self {
        let msg = err.to_string();
        match err {
            RuntimeError::Configuration(_) => bench_core::Error::config(msg),
            RuntimeError::Transport(_) | RuntimeError::Command(_) | RuntimeError::Io(_) => {
                bench_core::Error::transport(msg)
            }
            RuntimeError::LaunchFailed(m) => bench_core::Error::launch_failed(m),
            RuntimeError::DeploymentTimeout(m) => bench_core::Error::deployment_timeout(m),
            RuntimeError::ProcessExitedEarly(m) => bench_core::Error::process_exited_early(m),
            RuntimeError::StopFailed(m) => bench_core::Error::stop_failed(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::ErrorKind;

    #[test]
    fn test_runtime_error_properties() {
        let transport = RuntimeError::Transport("ssh exited 255".to_string());
        assert!(transport.is_retryable());
        assert_eq!(transport.kind(), ErrorKind::Transport);

        let timeout = RuntimeError::DeploymentTimeout("600s".to_string());
        assert!(!timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::DeploymentTimeout);
    }

    #[test]
    fn test_conversion_to_core_error() {
        let err: bench_core::Error = RuntimeError::ProcessExitedEarly("vllm gone".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::ProcessExitedEarly);
        assert_eq!(err.to_string(), "Backend process exited early: vllm gone");

        let err: bench_core::Error = RuntimeError::Configuration("port must be a number".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
