//! Run coordination: test selection, sequencing and result persistence

use crate::runner::TestRunner;
use crate::{Result, RunnerError};
use bench_core::{BenchConfig, TestDefinition, TestResult};
use bench_runtime::{create_executor, ApiEndpoint, RemoteExecutor, ServiceController};
use chrono::Local;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// File written into each run directory
pub const RESULTS_FILE: &str = "test_results.json";

/// Run subdirectory holding per-trial stream event dumps
pub const CHUNKS_DIR: &str = "stream_chunks";

/// Command-line overrides and selection for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Test names or 1-based indices; empty runs every test
    pub tests: Vec<String>,
    pub repeat: Option<u32>,
    pub max_tokens: Option<u32>,
    pub prompts: Option<Vec<String>>,
    /// Dump stream events even when the configuration does not ask for it
    pub save_chunks: bool,
    /// Stop the backend once the run ends
    pub cleanup: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tests: Vec::new(),
            repeat: None,
            max_tokens: None,
            prompts: None,
            save_chunks: false,
            cleanup: true,
        }
    }
}

impl RunOptions {
    /// Apply the overrides to a loaded configuration and re-validate it
    pub fn apply_overrides(&self, config: &mut BenchConfig) -> Result<()> {
        if let Some(repeat) = self.repeat {
            config.default_repeat = repeat;
            for test in &mut config.tests {
                test.repeat = Some(repeat);
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(prompts) = &self.prompts {
            config.prompts = prompts.clone();
        }
        if self.save_chunks {
            config.save_stream_chunks = true;
        }
        config.validate()?;
        Ok(())
    }
}

/// Sequences test definitions against one controller and saves results
/// after every test
pub struct Orchestrator {
    config: BenchConfig,
    controller: ServiceController,
    results: Vec<TestResult>,
    run_dir: PathBuf,
}

impl Orchestrator {
    /// Build with the executor selected by the configuration
    pub fn new(config: BenchConfig) -> Self {
        let executor = create_executor(&config.executor);
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: BenchConfig, executor: Arc<dyn RemoteExecutor>) -> Self {
        let controller = ServiceController::new(executor, config.lifecycle.clone());
        let run_dir = config
            .result_dir
            .join(format!("run_{}", Local::now().format("%Y%m%d_%H%M%S")));

        Self {
            config,
            controller,
            results: Vec::new(),
            run_dir,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn controller(&self) -> &ServiceController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ServiceController {
        &mut self.controller
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn results_file(&self) -> PathBuf {
        self.run_dir.join(RESULTS_FILE)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.run_dir.join(CHUNKS_DIR)
    }

    /// Resolve identifiers to test definitions, in the order given
    ///
    /// An identifier matches a test name first, then a 1-based index.
    /// No identifiers selects every configured test.
    pub fn select_tests(&self, identifiers: &[String]) -> Result<Vec<TestDefinition>> {
        let tests = &self.config.tests;
        if identifiers.is_empty() {
            return Ok(tests.clone());
        }

        identifiers
            .iter()
            .map(|id| {
                if let Some(test) = self.config.find_test(id) {
                    return Ok(test.clone());
                }
                match id.parse::<usize>() {
                    Ok(index) if (1..=tests.len()).contains(&index) => Ok(tests[index - 1].clone()),
                    _ => Err(RunnerError::TestNotFound(id.clone())),
                }
            })
            .collect()
    }

    /// Run the selected tests in order
    ///
    /// Every selected test yields one result, whether or not its backend
    /// deployed. Results are written after each test.
    pub async fn run(&mut self, options: &RunOptions) -> Result<&[TestResult]> {
        options.apply_overrides(&mut self.config)?;
        let tests = self.select_tests(&options.tests)?;
        if tests.is_empty() {
            return Err(RunnerError::Configuration("No tests configured".to_string()));
        }

        let outcome = self.run_tests(&tests).await;

        if options.cleanup {
            if let Err(e) = self.controller.shutdown().await {
                warn!("Failed to stop backend after run: {}", e);
            }
        } else {
            info!("Leaving backend running");
        }

        outcome?;
        Ok(&self.results)
    }

    async fn run_tests(&mut self, tests: &[TestDefinition]) -> Result<()> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        info!(
            "Running {} tests, results go to {}",
            tests.len(),
            self.results_file().display()
        );

        let mut runner = TestRunner::new(&self.config);
        if self.config.save_stream_chunks {
            info!("Stream events go to {}", self.chunks_dir().display());
            runner = runner.with_chunk_dir(self.chunks_dir());
        }
        for (i, test) in tests.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, tests.len(), test.name);
            let result = runner.run(&mut self.controller, test).await;
            self.results.push(result);
            self.save_results().await?;
        }

        info!("All {} tests finished", tests.len());
        Ok(())
    }

    /// Deploy the first selected test's backend and leave it running
    pub async fn deploy_only(&mut self, identifiers: &[String]) -> Result<ApiEndpoint> {
        let test = self
            .select_tests(identifiers)?
            .into_iter()
            .next()
            .ok_or_else(|| RunnerError::Configuration("No tests configured".to_string()))?;

        info!("Deploying {} without running trials", test.name);
        Ok(self.controller.deploy(test.backend, &test.backend_config).await?)
    }

    /// Stop the processes of every backend variant the configuration uses
    pub async fn stop_all(&mut self) -> Result<()> {
        self.controller.shutdown().await?;

        let mut seen = HashSet::new();
        for test in &self.config.tests {
            if seen.insert(test.backend) {
                self.controller
                    .stop_backend(test.backend, &test.backend_config)
                    .await?;
            }
        }
        Ok(())
    }

    async fn save_results(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.results)?;
        let path = self.results_file();
        tokio::fs::write(&path, json).await?;
        info!("Results saved to {}", path.display());
        Ok(())
    }

    /// Read a results file written by an earlier run
    pub async fn load_results(path: impl AsRef<Path>) -> Result<Vec<TestResult>> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
