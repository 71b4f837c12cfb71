//! # bench-core
//!
//! Core types, configuration and error handling for llm-bench, a harness that
//! deploys inference-serving backends and measures their completion latency.
//!
//! This crate provides the foundational data structures that are shared across
//! the other llm-bench components. It includes:
//!
//! - Backend variants and their string-keyed launch configuration
//! - Test definitions as consumed from the run configuration
//! - Per-request metric samples, per-test results and summary statistics
//! - The run configuration schema and its loading/validation
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod results;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{BenchConfig, ExecutorConfig, LifecycleConfig, LoggingConfig, RequestConfig};
pub use error::{Error, ErrorKind, Result};
pub use results::{MetricName, MetricSample, MetricSummary, SummaryParameter, SummaryStats, TestResult};
pub use types::{value_to_string, BackendConfig, BackendVariant, TestDefinition, WireFormat};
