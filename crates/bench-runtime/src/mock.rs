//! Scripted executor for exercising lifecycle logic without a real host

use crate::executor::{CommandOutput, RemoteExecutor};
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Executor that answers commands from a script and records every call
///
/// Rules are matched in insertion order by substring. A rule built with
/// [`ScriptedExecutor::on_sequence`] replays its outputs in order and keeps
/// repeating the last one. Commands no rule matches succeed with empty
/// output.
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    inner: Arc<ScriptedExecutorInner>,
}

#[derive(Debug)]
struct ScriptedExecutorInner {
    host: String,
    rules: RwLock<Vec<Rule>>,
    history: RwLock<Vec<String>>,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    outputs: VecDeque<CommandOutput>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::with_host("localhost")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScriptedExecutorInner {
                host: host.into(),
                rules: RwLock::new(Vec::new()),
                history: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Always answer commands containing `pattern` with `output`
    pub fn on(self, pattern: impl Into<String>, output: CommandOutput) -> Self {
        self.on_sequence(pattern, vec![output])
    }

    /// Answer commands containing `pattern` with `outputs` in order
    pub fn on_sequence(self, pattern: impl Into<String>, outputs: Vec<CommandOutput>) -> Self {
        if let Ok(mut rules) = self.inner.rules.try_write() {
            rules.push(Rule {
                pattern: pattern.into(),
                outputs: outputs.into(),
            });
        }
        self
    }

    /// Every command executed so far, in order
    pub async fn commands(&self) -> Vec<String> {
        self.inner.history.read().await.clone()
    }

    /// Number of executed commands containing `pattern`
    pub async fn count_matching(&self, pattern: &str) -> usize {
        self.inner
            .history
            .read()
            .await
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Forget recorded commands
    pub async fn clear_history(&self) {
        self.inner.history.write().await.clear();
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.inner.history.write().await.push(command.to_string());

        let mut rules = self.inner.rules.write().await;
        let output = rules
            .iter_mut()
            .find(|rule| command.contains(&rule.pattern))
            .and_then(|rule| {
                if rule.outputs.len() > 1 {
                    rule.outputs.pop_front()
                } else {
                    rule.outputs.front().cloned()
                }
            })
            .unwrap_or_default();

        debug!("Scripted `{}` -> exit {}", command, output.exit_code);
        Ok(output)
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.inner
            .history
            .write()
            .await
            .push(format!("upload {} {}", local_path.display(), remote_path));
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        self.inner
            .history
            .write()
            .await
            .push(format!("download {} {}", remote_path, local_path.display()));
        Ok(())
    }

    fn host(&self) -> &str {
        &self.inner.host
    }
}
