//! # bench-dev
//!
//! Development and testing utilities for llm-bench.
//!
//! This crate provides:
//! - A mock inference backend speaking the Ollama and OpenAI-compatible
//!   wire formats, with scripted token timing and error replies
//! - Test logging setup

pub mod mock_backend;
pub mod utils;

// Re-export commonly used types
pub use mock_backend::{MockBackend, MockBackendBuilder, MockReply, RecordedRequest};
pub use utils::setup_test_logging;

#[derive(Debug, thiserror::Error)]
pub enum DevError {
    #[error("Mock error: {0}")]
    Mock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DevError>;
