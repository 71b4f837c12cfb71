//! The command execution contract the lifecycle controller is written against

use crate::process::LocalExecutor;
use crate::ssh::SshExecutor;
use crate::Result;
use async_trait::async_trait;
use bench_core::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Captured result of one shell command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; -1 when the command was killed or timed out
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The command exceeded its timeout and was terminated
    pub timed_out: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Output of a command that ran past its timeout
    pub fn timeout(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: true,
        }
    }

    /// Exit code 0 and no timeout
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stderr if present, otherwise stdout, trimmed
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs shell commands and moves files on the host that serves the backend
///
/// Implementations must be usable interchangeably: the controller never
/// knows whether it talks to a local shell or a remote session.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` through a shell, giving up after `timeout`
    ///
    /// A non-zero exit code is not an error; only a failure to run the
    /// command at all is.
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Copy a local file to the target host
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Copy a file from the target host
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()>;

    /// Host name the backend API is reachable at
    fn host(&self) -> &str;

    /// PIDs on the target host that process-pattern signals must skip
    fn protected_pids(&self) -> Vec<u32> {
        Vec::new()
    }
}

/// Build the executor selected by the run configuration
pub fn create_executor(config: &ExecutorConfig) -> Arc<dyn RemoteExecutor> {
    if config.local_mode {
        Arc::new(LocalExecutor::new())
    } else {
        Arc::new(SshExecutor::new(config.clone()))
    }
}
