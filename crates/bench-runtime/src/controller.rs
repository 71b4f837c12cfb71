//! Backend lifecycle controller
//!
//! [`ServiceController`] owns the single deployment slot on the target host.
//! It drives one [`BackendAdapter`] at a time through
//!
//! ```text
//! Idle -> Deploying -> AwaitingReady -> Ready -> Stopping -> Stopped
//!             \              \                      \
//!              +--------------+----------------------+--> Failed
//! ```
//!
//! Deploying a new backend always stops the current one first, so at most
//! one backend is ever past `Idle`/`Stopped`. All waits use tokio's clock
//! and the [`LifecycleConfig`] timings, which keeps the state machine
//! deterministic under a paused test clock.

use crate::adapter::{create_adapter, BackendAdapter, ModelFetch};
use crate::executor::{CommandOutput, RemoteExecutor};
use crate::gpu::query_gpus;
use crate::health::{self, HealthStatus, ReadinessSignal};
use crate::{Result, RuntimeError};
use bench_core::{BackendConfig, BackendVariant, LifecycleConfig};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

/// Lifecycle state of the deployment slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Idle,
    Deploying,
    AwaitingReady,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

impl ServiceState {
    /// Whether a backend may be occupying the host
    pub fn is_active(&self) -> bool {
        !matches!(self, ServiceState::Idle | ServiceState::Stopped)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Idle => "idle",
            ServiceState::Deploying => "deploying",
            ServiceState::AwaitingReady => "awaiting_ready",
            ServiceState::Ready => "ready",
            ServiceState::Failed => "failed",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Where and how to reach a ready backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiEndpoint {
    pub variant: BackendVariant,
    pub model: String,
    pub base_url: Url,
    pub completion_url: Url,
    pub readiness_url: Url,
    /// Headers every completion request must carry
    pub headers: Vec<(String, String)>,
}

impl ApiEndpoint {
    fn from_adapter(adapter: &dyn BackendAdapter, host: &str) -> Result<Self> {
        let base_url = adapter.api_base_url(host)?;
        let join = |path: &str| {
            base_url
                .join(path)
                .map_err(|e| RuntimeError::Configuration(format!("Invalid API path {}: {}", path, e)))
        };
        Ok(Self {
            variant: adapter.variant(),
            model: adapter.model().to_string(),
            completion_url: join(adapter.completion_path())?,
            readiness_url: join(adapter.readiness_path())?,
            headers: adapter.request_headers(),
            base_url,
        })
    }
}

/// Owns the single active backend deployment
pub struct ServiceController {
    executor: Arc<dyn RemoteExecutor>,
    lifecycle: LifecycleConfig,
    state: ServiceState,
    active: Option<Arc<dyn BackendAdapter>>,
    endpoint: Option<ApiEndpoint>,
}

impl ServiceController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, lifecycle: LifecycleConfig) -> Self {
        Self {
            executor,
            lifecycle,
            state: ServiceState::Idle,
            active: None,
            endpoint: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Variant occupying the slot, ready or not
    pub fn active_variant(&self) -> Option<BackendVariant> {
        self.active.as_ref().map(|a| a.variant())
    }

    /// Endpoint of the deployment, only while `Ready`
    pub fn endpoint(&self) -> Option<&ApiEndpoint> {
        match self.state {
            ServiceState::Ready => self.endpoint.as_ref(),
            _ => None,
        }
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    fn transition(&mut self, next: ServiceState) {
        if self.state != next {
            debug!("Service state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Deploy a backend and wait until it serves requests
    ///
    /// Any current deployment is stopped first. On failure the controller
    /// ends in `Failed` and makes a best-effort attempt to remove the
    /// half-started process.
    pub async fn deploy(&mut self, variant: BackendVariant, config: &BackendConfig) -> Result<ApiEndpoint> {
        let adapter: Arc<dyn BackendAdapter> = Arc::from(create_adapter(variant, config)?);
        let endpoint = ApiEndpoint::from_adapter(adapter.as_ref(), self.executor.host())?;

        self.stop().await?;

        info!(
            "Deploying {} backend (model {}, port {})",
            variant,
            adapter.model(),
            adapter.port()
        );
        self.transition(ServiceState::Deploying);
        self.active = Some(adapter.clone());

        match self.bring_up(adapter.as_ref()).await {
            Ok(signal) => {
                info!("{} backend ready at {} ({})", variant, endpoint.base_url, signal);
                self.endpoint = Some(endpoint.clone());
                self.transition(ServiceState::Ready);
                Ok(endpoint)
            }
            Err(e) => {
                error!("Deployment of {} backend failed: {}", variant, e);
                self.transition(ServiceState::Failed);
                self.cleanup_failed(adapter.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Stop the active deployment
    ///
    /// Returns immediately without issuing commands when nothing is deployed.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(adapter) = self.active.clone() else {
            if self.state == ServiceState::Failed {
                self.transition(ServiceState::Stopped);
            }
            return Ok(());
        };

        self.endpoint = None;
        self.transition(ServiceState::Stopping);

        match self.stop_processes(adapter.as_ref()).await {
            Ok(()) => {
                info!("{} backend stopped", adapter.variant());
                self.active = None;
                self.transition(ServiceState::Stopped);
                Ok(())
            }
            Err(e) => {
                error!("Failed to stop {} backend: {}", adapter.variant(), e);
                self.transition(ServiceState::Failed);
                Err(e)
            }
        }
    }

    /// Stop processes of a backend this controller did not start
    ///
    /// Runs the stop protocol against the variant's process patterns without
    /// touching the tracked deployment.
    pub async fn stop_backend(&self, variant: BackendVariant, config: &BackendConfig) -> Result<()> {
        let adapter = create_adapter(variant, config)?;
        self.stop_processes(adapter.as_ref()).await
    }

    /// Stop whatever is deployed; call before dropping the controller
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop().await
    }

    /// Whether the active backend process is alive and its API answers
    pub async fn check_service(&self) -> Result<HealthStatus> {
        let Some(adapter) = &self.active else {
            return Ok(HealthStatus::Unknown);
        };

        if !self.process_alive(adapter.as_ref()).await? {
            return Ok(HealthStatus::Unhealthy(format!(
                "{} process not running",
                adapter.variant()
            )));
        }

        let probe = self.run(&adapter.build_readiness_command()).await?;
        if adapter.is_ready(&probe) {
            return Ok(HealthStatus::Healthy);
        }

        Ok(match self.state {
            ServiceState::Ready => HealthStatus::Unhealthy(format!(
                "readiness probe answered {}",
                probe.stdout.trim()
            )),
            _ => HealthStatus::Starting,
        })
    }

    async fn bring_up(&mut self, adapter: &dyn BackendAdapter) -> Result<ReadinessSignal> {
        // Strays from an earlier run would hold the port or the GPUs.
        self.stop_processes(adapter).await?;

        for command in adapter.prepare_commands() {
            let output = self.run(&command).await?;
            if !output.success() {
                return Err(RuntimeError::LaunchFailed(format!(
                    "`{}` failed: {}",
                    command,
                    output.diagnostic()
                )));
            }
        }

        let start = adapter.build_start_command();
        info!("Launching {}: {}", adapter.variant(), start);
        let output = self.run(&start).await?;
        if !output.success() {
            return Err(RuntimeError::LaunchFailed(format!(
                "launch command exited with {}: {}",
                output.exit_code,
                output.diagnostic()
            )));
        }

        self.transition(ServiceState::AwaitingReady);
        sleep(self.lifecycle.launch_grace()).await;

        if let Some(fetch) = adapter.model_fetch() {
            self.fetch_model(&fetch).await?;
        }

        let signal = self.await_ready(adapter).await?;
        if self.lifecycle.warmup {
            self.warm_up(adapter).await;
        }
        Ok(signal)
    }

    /// Load the model so the first trial does not pay for it
    ///
    /// Failures only warn; the backend already answered its readiness check.
    async fn warm_up(&self, adapter: &dyn BackendAdapter) {
        let timeout = self.lifecycle.ready_timeout();
        let Some(command) = adapter.build_warmup_command(timeout.as_secs()) else {
            return;
        };

        info!("Loading {} into {}", adapter.model(), adapter.variant());
        match self.executor.execute(&command, timeout + self.lifecycle.command_timeout()).await {
            Ok(output) if output.success() => match health::parse_http_status(&output.stdout) {
                Some(status) if health::is_success_status(status) => {
                    info!("{} loaded", adapter.model());
                }
                status => warn!(
                    "Warm-up request for {} answered {}",
                    adapter.model(),
                    status.map(|s| s.to_string()).unwrap_or_else(|| output.stdout.trim().to_string())
                ),
            },
            Ok(output) => warn!("Warm-up request for {} failed: {}", adapter.model(), output.diagnostic()),
            Err(e) => warn!("Warm-up request for {} failed: {}", adapter.model(), e),
        }
    }

    async fn fetch_model(&self, fetch: &ModelFetch) -> Result<()> {
        let listing = self.run(&fetch.check_command).await?;
        if fetch.is_present(&listing) {
            debug!("Model {} already available", fetch.model);
            return Ok(());
        }

        info!("Model {} not found locally, pulling", fetch.model);
        let output = self
            .executor
            .execute(&fetch.pull_command, self.lifecycle.pull_timeout())
            .await?;
        if !output.success() {
            return Err(RuntimeError::LaunchFailed(format!(
                "pulling model {} failed: {}",
                fetch.model,
                output.diagnostic()
            )));
        }
        info!("Model {} pulled", fetch.model);
        Ok(())
    }

    async fn await_ready(&self, adapter: &dyn BackendAdapter) -> Result<ReadinessSignal> {
        let variant = adapter.variant();
        let started = Instant::now();
        let deadline = started + self.lifecycle.ready_timeout();
        let mut next_progress = started + self.lifecycle.progress_log_every();

        info!(
            "Waiting up to {}s for {} to become ready",
            self.lifecycle.ready_timeout_seconds, variant
        );

        loop {
            let elapsed = started.elapsed().as_secs();

            if !self.process_alive(adapter).await? {
                let tail = self.log_tail(adapter).await;
                return Err(RuntimeError::ProcessExitedEarly(format!(
                    "{} process exited after {}s; last log lines:\n{}",
                    variant, elapsed, tail
                )));
            }

            let probe = self.run(&adapter.build_readiness_command()).await?;
            if adapter.is_ready(&probe) {
                let status = health::parse_http_status(&probe.stdout).unwrap_or(200);
                return Ok(ReadinessSignal::Api(status));
            }

            if let Some(line) = self.find_ready_marker(adapter).await? {
                return Ok(ReadinessSignal::LogMarker(line));
            }

            let now = Instant::now();
            if now >= deadline {
                let tail = self.log_tail(adapter).await;
                return Err(RuntimeError::DeploymentTimeout(format!(
                    "{} not ready after {}s; last log lines:\n{}",
                    variant, self.lifecycle.ready_timeout_seconds, tail
                )));
            }

            if now >= next_progress {
                self.log_progress(adapter, elapsed).await;
                next_progress = now + self.lifecycle.progress_log_every();
            }

            debug!("{} not ready yet ({}s elapsed)", variant, elapsed);
            sleep(self.lifecycle.poll_interval().min(deadline - now)).await;
        }
    }

    /// Graceful signal, bounded re-checks, then SIGKILL
    async fn stop_processes(&self, adapter: &dyn BackendAdapter) -> Result<()> {
        let variant = adapter.variant();
        if !self.process_alive(adapter).await? {
            debug!("No {} process running", variant);
            return Ok(());
        }

        info!("Stopping {} processes", variant);
        let exclude = self.executor.protected_pids();
        self.run(&adapter.build_stop_command(false, &exclude)).await?;

        for attempt in 1..=self.lifecycle.stop_attempts {
            sleep(self.lifecycle.stop_backoff()).await;
            if !self.process_alive(adapter).await? {
                return Ok(());
            }
            debug!(
                "{} still running (check {}/{})",
                variant, attempt, self.lifecycle.stop_attempts
            );
        }

        warn!("{} ignored SIGTERM, sending SIGKILL", variant);
        self.run(&adapter.build_stop_command(true, &exclude)).await?;
        sleep(self.lifecycle.stop_backoff()).await;

        if self.process_alive(adapter).await? {
            return Err(RuntimeError::StopFailed(format!(
                "{} process still present after SIGKILL",
                variant
            )));
        }
        Ok(())
    }

    async fn cleanup_failed(&mut self, adapter: &dyn BackendAdapter) {
        match self.stop_processes(adapter).await {
            Ok(()) => self.active = None,
            Err(e) => warn!("Cleanup after failed {} deployment incomplete: {}", adapter.variant(), e),
        }
    }

    async fn process_alive(&self, adapter: &dyn BackendAdapter) -> Result<bool> {
        let exclude = self.executor.protected_pids();
        let output = self.run(&adapter.build_presence_command(&exclude)).await?;
        Ok(output.success())
    }

    async fn find_ready_marker(&self, adapter: &dyn BackendAdapter) -> Result<Option<String>> {
        let command = health::log_marker_command(&adapter.log_file(), adapter.ready_markers());
        let output = self.run(&command).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    async fn log_tail(&self, adapter: &dyn BackendAdapter) -> String {
        let command = health::log_tail_command(&adapter.log_file(), self.lifecycle.log_tail_lines);
        match self.run(&command).await {
            Ok(output) if output.success() => output.stdout.trim_end().to_string(),
            Ok(_) => format!("<{} unavailable>", adapter.log_file()),
            Err(e) => format!("<{} unreadable: {}>", adapter.log_file(), e),
        }
    }

    async fn log_progress(&self, adapter: &dyn BackendAdapter, elapsed: u64) {
        debug!(
            "{} still loading after {}s, log tail:\n{}",
            adapter.variant(),
            elapsed,
            self.log_tail(adapter).await
        );
        match query_gpus(self.executor.as_ref(), self.lifecycle.command_timeout()).await {
            Ok(gpus) => {
                for gpu in gpus {
                    debug!(
                        "GPU {} {}: {:.0}/{:.0} MiB used, {:.0}% busy",
                        gpu.index, gpu.name, gpu.memory_used_mib, gpu.memory_total_mib, gpu.utilization_percent
                    );
                }
            }
            Err(e) => debug!("GPU snapshot unavailable: {}", e),
        }
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.executor
            .execute(command, self.lifecycle.command_timeout())
            .await
    }
}

impl Drop for ServiceController {
    fn drop(&mut self) {
        if let Some(adapter) = &self.active {
            warn!(
                "ServiceController dropped with an active {} deployment; it keeps running",
                adapter.variant()
            );
        }
    }
}
