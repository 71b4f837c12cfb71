//! Local process execution with bounded waits

use crate::executor::{CommandOutput, RemoteExecutor};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Wait between SIGTERM and SIGKILL for a timed-out command
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long output readers may keep draining after the command ended
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Executes commands on this machine through `bash -c`
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("Executing local command: {}", command);
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        run_with_timeout(cmd, timeout).await
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        copy_file(local_path, Path::new(remote_path)).await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        copy_file(Path::new(remote_path), local_path).await
    }

    fn host(&self) -> &str {
        "localhost"
    }

    /// This process and the shell or terminal that launched it
    fn protected_pids(&self) -> Vec<u32> {
        vec![std::process::id(), std::os::unix::process::parent_id()]
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}

/// Spawn `command`, drain both output pipes concurrently and enforce `timeout`
///
/// On timeout the process gets SIGTERM, then SIGKILL after a short grace
/// period. Output read up to that point is kept and returned with
/// `timed_out` set.
pub(crate) async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| RuntimeError::Transport(format!("Failed to spawn process: {}", e)))?;

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let readers = [
        spawn_reader(child.stdout.take(), stdout_buf.clone()),
        spawn_reader(child.stderr.take(), stderr_buf.clone()),
    ];

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code().unwrap_or(-1), false),
        Err(_) => {
            warn!("Command exceeded {:?}, terminating", timeout);
            terminate(&mut child).await;
            (-1, true)
        }
    };

    // Background children may keep the pipes open after the shell exits.
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();

    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("command timed out after {:.1}s", timeout.as_secs_f64()));
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

fn spawn_reader<R>(stream: Option<R>, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM: {}", e);
            } else {
                debug!("Sent SIGTERM to process {}", pid);
            }
        }
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        warn!("Process ignored SIGTERM, forcing kill");
        if let Err(e) = child.kill().await {
            error!("Failed to kill process: {}", e);
        }
    }
}
