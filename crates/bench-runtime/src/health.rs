//! Readiness and health signals for deployed backends
//!
//! All probes run as shell commands on the backend's host so that a remote
//! backend bound to `localhost` can still be checked.

use crate::adapter::shell_quote;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health status of the active backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Process present and API answering
    Healthy,
    /// Process present, API not answering yet
    Starting,
    /// Process gone or API failing
    Unhealthy(String),
    /// Nothing deployed
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// What told the controller the backend was ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    /// The readiness endpoint answered with this status
    Api(u16),
    /// The backend log contained a ready marker
    LogMarker(String),
}

impl fmt::Display for ReadinessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessSignal::Api(status) => write!(f, "API answered HTTP {}", status),
            ReadinessSignal::LogMarker(line) => write!(f, "log marker: {}", line),
        }
    }
}

/// curl command printing only the HTTP status of a GET on `url`
pub fn http_status_command(url: &str, max_time_seconds: u64) -> String {
    format!(
        "curl -s -o /dev/null -m {} -w '%{{http_code}}' {}",
        max_time_seconds,
        shell_quote(url)
    )
}

/// curl command posting a JSON body and printing only the HTTP status code
pub fn http_post_status_command(url: &str, body: &str, max_time_seconds: u64) -> String {
    format!(
        "curl -s -o /dev/null -m {} -w '%{{http_code}}' -H 'Content-Type: application/json' -d {} {}",
        max_time_seconds,
        shell_quote(body),
        shell_quote(url)
    )
}

/// Parse curl's `%{http_code}` output; `000` means no response
pub fn parse_http_status(stdout: &str) -> Option<u16> {
    match stdout.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(code) => Some(code),
    }
}

pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// grep command printing the first line that matches any marker
///
/// Markers are extended regular expressions. The log path is left unquoted
/// so that `$HOME` expands on the target host.
pub fn log_marker_command(log_file: &str, markers: &[&str]) -> String {
    format!(
        "grep -E -m 1 {} {} 2>/dev/null",
        shell_quote(&markers.join("|")),
        log_file
    )
}

pub fn log_tail_command(log_file: &str, lines: usize) -> String {
    format!("tail -n {} {} 2>/dev/null", lines, log_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_command() {
        let cmd = http_status_command("http://localhost:8000/v1/models", 5);
        assert_eq!(
            cmd,
            "curl -s -o /dev/null -m 5 -w '%{http_code}' http://localhost:8000/v1/models"
        );
    }

    #[test]
    fn test_http_post_status_command() {
        let cmd = http_post_status_command("http://localhost:11434/api/generate", r#"{"model":"m"}"#, 600);
        assert_eq!(
            cmd,
            "curl -s -o /dev/null -m 600 -w '%{http_code}' -H 'Content-Type: application/json' \
             -d '{\"model\":\"m\"}' http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn test_parse_http_status() {
        assert_eq!(parse_http_status("200"), Some(200));
        assert_eq!(parse_http_status(" 503\n"), Some(503));
        assert_eq!(parse_http_status("000"), None);
        assert_eq!(parse_http_status(""), None);
        assert!(is_success_status(204));
        assert!(!is_success_status(404));
    }

    #[test]
    fn test_log_marker_command() {
        let cmd = log_marker_command(
            "$HOME/bench/vllm_server_8000.log",
            &["Application startup complete", "GET /v1/models HTTP/1.1. 200 OK"],
        );
        assert_eq!(
            cmd,
            "grep -E -m 1 'Application startup complete|GET /v1/models HTTP/1.1. 200 OK' \
             $HOME/bench/vllm_server_8000.log 2>/dev/null"
        );
    }

    #[test]
    fn test_health_status_display() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Starting.is_healthy());
        assert_eq!(
            HealthStatus::Unhealthy("process not running".to_string()).to_string(),
            "unhealthy: process not running"
        );
        assert_eq!(ReadinessSignal::Api(200).to_string(), "API answered HTTP 200");
    }
}
