//! Remote execution through the system OpenSSH client

use crate::executor::{CommandOutput, RemoteExecutor};
use crate::process::run_with_timeout;
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use bench_core::ExecutorConfig;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Executes commands on a remote host with `ssh` and copies files with `scp`
///
/// Authentication is key or agent based; `BatchMode` keeps the client from
/// ever prompting.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: ExecutorConfig,
}

impl SshExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Options shared by ssh and scp
    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_seconds),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = &self.config.key_path {
            options.push("-i".to_string());
            options.push(key.display().to_string());
        }
        options
    }

    /// Arguments for running `command` on the remote host
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.config.port.to_string());
        args.push(self.config.destination());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    /// Arguments for copying `from` to `to`; remote paths carry the destination prefix
    pub fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-P".to_string());
        args.push(self.config.port.to_string());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    fn remote(&self, path: &str) -> String {
        format!("{}:{}", self.config.destination(), path)
    }

    async fn scp(&self, from: String, to: String) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(self.scp_args(&from, &to));
        let timeout = Duration::from_secs(self.config.connect_timeout_seconds.max(1) * 30);
        let output = run_with_timeout(cmd, timeout).await?;
        check_transport(&output)?;
        if !output.success() {
            return Err(RuntimeError::Transport(format!(
                "scp {} -> {} failed: {}",
                from,
                to,
                output.diagnostic()
            )));
        }
        Ok(())
    }
}

/// ssh reserves exit code 255 for its own connection failures
fn check_transport(output: &CommandOutput) -> Result<()> {
    if output.exit_code == 255 {
        return Err(RuntimeError::Transport(format!(
            "ssh connection failed: {}",
            output.diagnostic()
        )));
    }
    Ok(())
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("Executing on {}: {}", self.config.hostname, command);
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(command));
        let output = run_with_timeout(cmd, timeout).await?;
        check_transport(&output)?;
        Ok(output)
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.scp(local_path.display().to_string(), self.remote(remote_path))
            .await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.scp(self.remote(remote_path), local_path.display().to_string())
            .await
    }

    fn host(&self) -> &str {
        &self.config.hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            local_mode: false,
            hostname: "gpu-01".to_string(),
            username: "bench".to_string(),
            port: 2222,
            key_path: Some(PathBuf::from("/home/bench/.ssh/id_ed25519")),
            connect_timeout_seconds: 10,
        }
    }

    #[test]
    fn test_ssh_args() {
        let executor = SshExecutor::new(config());
        let args = executor.ssh_args("pgrep -f '[v]llm'");

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/home/bench/.ssh/id_ed25519");
        let port = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port + 1], "2222");
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args.last().unwrap(), "pgrep -f '[v]llm'");
        assert!(args.contains(&"bench@gpu-01".to_string()));
    }

    #[test]
    fn test_scp_args_use_capital_port_flag() {
        let executor = SshExecutor::new(config());
        let args = executor.scp_args("/tmp/a", &executor.remote("/srv/a"));

        let port = args.iter().position(|a| a == "-P").unwrap();
        assert_eq!(args[port + 1], "2222");
        assert_eq!(args.last().unwrap(), "bench@gpu-01:/srv/a");
    }

    #[test]
    fn test_connection_failure_is_transport_error() {
        let output = CommandOutput::failed(255, "ssh: connect to host gpu-01 port 2222: Connection refused");
        let err = check_transport(&output).unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(_)));
        assert!(check_transport(&CommandOutput::failed(1, "")).is_ok());
    }
}
