//! Execution of one test definition

use crate::aggregate::ResultAggregator;
use crate::probe::{ProbeSettings, StreamProbe};
use crate::stream::{ChunkRecord, StreamEvent};
use crate::RunnerError;
use bench_core::{BenchConfig, Error, RequestConfig, TestDefinition, TestResult};
use bench_runtime::ServiceController;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Deploys a test's backend and runs every (round, prompt) trial against it
///
/// Trial failures are recorded in the result and never stop the remaining
/// trials. A deployment failure yields a failed result with no samples.
#[derive(Debug, Clone)]
pub struct TestRunner {
    prompts: Vec<String>,
    max_tokens: u32,
    temperature: f64,
    default_repeat: u32,
    request: RequestConfig,
    aggregator: ResultAggregator,
    chunk_dir: Option<PathBuf>,
}

impl TestRunner {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            prompts: config.prompts.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            default_repeat: config.default_repeat,
            request: config.request.clone(),
            aggregator: ResultAggregator::with_parameter(config.parameter_under_test()),
            chunk_dir: None,
        }
    }

    /// Write the events of every streaming trial as JSON files under `dir`
    pub fn with_chunk_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chunk_dir = Some(dir.into());
        self
    }

    /// Path of the event dump for one trial
    pub fn chunk_file(dir: &Path, test: &str, round: u32, prompt_index: usize) -> PathBuf {
        let stem: String = test
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        dir.join(format!("{}_round{}_prompt{}.json", stem, round, prompt_index))
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Number of rounds `definition` will run
    pub fn rounds(&self, definition: &TestDefinition) -> u32 {
        definition.repeat_or(self.default_repeat)
    }

    pub async fn run(&self, controller: &mut ServiceController, definition: &TestDefinition) -> TestResult {
        info!(
            "Running test {} on {} ({} mode)",
            definition.name,
            definition.backend,
            if definition.streaming { "streaming" } else { "blocking" }
        );

        let endpoint = match controller
            .deploy(definition.backend, &definition.backend_config)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => return self.deployment_failed(definition, e.into()),
        };

        let settings = ProbeSettings {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            streaming: definition.streaming,
        };
        let probe = match StreamProbe::new(endpoint, settings, &self.request) {
            Ok(probe) => probe,
            Err(e) => return self.deployment_failed(definition, Error::internal(e.to_string())),
        };

        if !probe.check_service().await {
            warn!("{} readiness endpoint did not answer, running trials anyway", definition.name);
        }

        let mut result = TestResult::new(definition);
        let rounds = self.rounds(definition);

        for round in 0..rounds {
            info!("Round {}/{} of {}", round + 1, rounds, definition.name);
            for (index, prompt) in self.prompts.iter().enumerate() {
                debug!("Prompt {}: {}", index, prompt);
                let (sample, events) = probe.run_traced(prompt).await;
                let sample = sample.for_trial(round, index, prompt.as_str());
                if let (Some(dir), true) = (&self.chunk_dir, definition.streaming) {
                    save_chunks(&Self::chunk_file(dir, &definition.name, round, index), &events).await;
                }
                if sample.success {
                    info!(
                        "Trial {}/{} ok: ttft {}, tpot {}",
                        round + 1,
                        index + 1,
                        format_metric(sample.ttft, "s", 4),
                        format_metric(sample.tpot, "ms", 2)
                    );
                } else {
                    warn!(
                        "Trial {}/{} failed: {}",
                        round + 1,
                        index + 1,
                        sample.error.as_deref().unwrap_or("unknown error")
                    );
                }
                result.samples.push(sample);
            }
        }

        result.summary = self
            .aggregator
            .summarize(&result.samples, &definition.backend_config);
        result.finished_at = Utc::now();

        info!(
            "Test {} finished: {} of {} trials succeeded",
            definition.name,
            result.samples.len() - result.failed_count(),
            result.samples.len()
        );
        result
    }

    fn deployment_failed(&self, definition: &TestDefinition, err: Error) -> TestResult {
        error!("Test {} aborted, backend deployment failed: {}", definition.name, err);
        let mut result = TestResult::deployment_failed(definition, &err);
        result.finished_at = Utc::now();
        result
    }
}

async fn save_chunks(path: &Path, events: &[StreamEvent]) {
    let records: Vec<ChunkRecord> = events.iter().map(ChunkRecord::from).collect();
    let written = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&records)?).await?;
        Ok::<_, RunnerError>(())
    };

    match written.await {
        Ok(()) => debug!("Saved {} stream events to {}", records.len(), path.display()),
        Err(e) => warn!("Failed to save stream events to {}: {}", path.display(), e),
    }
}

fn format_metric(value: Option<f64>, unit: &str, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}{}", precision, v, unit),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::{BackendConfig, BackendVariant, ErrorKind, LifecycleConfig, MetricSummary};
    use bench_dev::{setup_test_logging, MockBackend, MockReply};
    use bench_runtime::{CommandOutput, ScriptedExecutor};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_lifecycle() -> LifecycleConfig {
        LifecycleConfig {
            launch_grace_seconds: 0,
            ..Default::default()
        }
    }

    fn ready_executor() -> ScriptedExecutor {
        ScriptedExecutor::with_host("127.0.0.1")
            .on_sequence("pgrep", vec![CommandOutput::failed(1, ""), CommandOutput::ok("4242")])
            .on("curl", CommandOutput::ok("200"))
    }

    fn definition(mock: &MockBackend, streaming: bool) -> TestDefinition {
        let config = BackendConfig::new()
            .with("model", mock.model())
            .with("port", mock.port())
            .with("num_parallel", 4);
        TestDefinition::new("ollama-np4", mock.variant(), config)
            .with_streaming(streaming)
            .with_repeat(2)
    }

    fn bench_config() -> BenchConfig {
        BenchConfig {
            prompts: vec!["The capital of France is".to_string(), "Tell me a joke".to_string()],
            test_param: "num_parallel".to_string(),
            ..Default::default()
        }
    }

    fn quick_tokens() -> MockReply {
        MockReply::tokens(&["a", "b", "c"], Duration::from_millis(20), Duration::from_millis(30))
    }

    #[tokio::test]
    async fn test_all_trials_run_and_are_tagged() {
        setup_test_logging();
        let mock = MockBackend::builder(BackendVariant::Ollama)
            .with_default_reply(quick_tokens())
            .start()
            .await
            .unwrap();
        let mut controller = ServiceController::new(Arc::new(ready_executor()), fast_lifecycle());
        let runner = TestRunner::new(&bench_config());

        let result = runner.run(&mut controller, &definition(&mock, true)).await;

        assert!(result.success);
        assert_eq!(result.samples.len(), 4);
        assert!(result.samples.iter().all(|s| s.success));
        let coordinates: Vec<(u32, usize)> = result.samples.iter().map(|s| (s.round, s.prompt_index)).collect();
        assert_eq!(coordinates, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(result.samples[1].prompt, "Tell me a joke");

        assert!(result.summary.ttft.is_some());
        assert!(result.summary.throughput.is_some());
        let parameter = result.summary.parameter.clone().unwrap();
        assert_eq!(parameter.name, "num_parallel");
        assert_eq!(parameter.value, serde_json::json!(4));
        assert!(result.finished_at >= result.started_at);
        assert_eq!(mock.request_count().await, 4);
    }

    #[tokio::test]
    async fn test_one_failed_trial_is_recorded() {
        let mock = MockBackend::builder(BackendVariant::Ollama)
            .with_default_reply(quick_tokens())
            .with_reply(quick_tokens())
            .with_reply(MockReply::error(500, "model runner crashed"))
            .start()
            .await
            .unwrap();
        let mut controller = ServiceController::new(Arc::new(ready_executor()), fast_lifecycle());
        let runner = TestRunner::new(&bench_config());

        let result = runner.run(&mut controller, &definition(&mock, true)).await;

        assert!(result.success);
        assert_eq!(result.samples.len(), 4);
        assert_eq!(result.failed_count(), 1);
        let failed = &result.samples[1];
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ErrorKind::Api));

        let ttfts: Vec<f64> = result.successful_samples().filter_map(|s| s.ttft).collect();
        assert_eq!(ttfts.len(), 3);
        assert_eq!(result.summary.ttft, MetricSummary::from_values(&ttfts));
    }

    #[tokio::test]
    async fn test_stream_events_saved_per_trial() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::builder(BackendVariant::Ollama)
            .with_default_reply(quick_tokens())
            .start()
            .await
            .unwrap();
        let mut controller = ServiceController::new(Arc::new(ready_executor()), fast_lifecycle());
        let chunks = dir.path().join("stream_chunks");
        let runner = TestRunner::new(&bench_config()).with_chunk_dir(&chunks);

        let result = runner.run(&mut controller, &definition(&mock, true)).await;
        assert_eq!(result.samples.len(), 4);

        let mut files: Vec<String> = std::fs::read_dir(&chunks)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                "ollama-np4_round0_prompt0.json",
                "ollama-np4_round0_prompt1.json",
                "ollama-np4_round1_prompt0.json",
                "ollama-np4_round1_prompt1.json",
            ]
        );

        let dump: serde_json::Value =
            serde_json::from_slice(&std::fs::read(chunks.join("ollama-np4_round1_prompt0.json")).unwrap()).unwrap();
        let records = dump.as_array().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["index"], 0);
        assert_eq!(records[0]["extracted_text"], "a");
        assert_eq!(records[0]["is_content"], true);
        assert_eq!(records[3]["is_content"], false);
        assert!(records[3]["content"].as_str().unwrap().contains("\"done\":true"));
        assert!(records[0]["time"].as_f64().unwrap() <= records[3]["time"].as_f64().unwrap());
    }

    #[tokio::test]
    async fn test_blocking_trials_write_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::start(BackendVariant::Ollama).await.unwrap();
        let mut controller = ServiceController::new(Arc::new(ready_executor()), fast_lifecycle());
        let runner = TestRunner::new(&bench_config()).with_chunk_dir(dir.path().join("stream_chunks"));

        runner.run(&mut controller, &definition(&mock, false)).await;

        assert!(!dir.path().join("stream_chunks").exists());
    }

    #[test]
    fn test_chunk_file_names() {
        let path = TestRunner::chunk_file(Path::new("/runs/r1"), "vllm tp=2/fp8", 1, 3);
        assert_eq!(path, Path::new("/runs/r1/vllm_tp_2_fp8_round1_prompt3.json"));
    }

    #[tokio::test]
    async fn test_blocking_mode_summary() {
        let mock = MockBackend::start(BackendVariant::Ollama).await.unwrap();
        let mut controller = ServiceController::new(Arc::new(ready_executor()), fast_lifecycle());
        let runner = TestRunner::new(&bench_config());

        let result = runner.run(&mut controller, &definition(&mock, false)).await;

        assert_eq!(result.samples.len(), 4);
        assert!(result.summary.ttft.is_none());
        assert!(result.summary.total_time.is_some());
        assert!(!result.streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deployment_timeout_runs_no_trials() {
        let executor = ScriptedExecutor::new()
            .on_sequence(
                "pgrep",
                vec![
                    CommandOutput::failed(1, ""),
                    CommandOutput::ok("4242"),
                    CommandOutput::ok("4242"),
                ],
            )
            .on("curl", CommandOutput::ok("000"))
            .on("grep -E", CommandOutput::failed(1, ""));
        let mut controller = ServiceController::new(Arc::new(executor), LifecycleConfig::default());
        let runner = TestRunner::new(&BenchConfig::default());
        let definition = TestDefinition::new(
            "vllm-never-ready",
            BackendVariant::VLlm,
            BackendConfig::new().with("model", "facebook/opt-125m"),
        );

        let result = runner.run(&mut controller, &definition).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::DeploymentTimeout));
        assert!(result.samples.is_empty());
        assert!(result.summary.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_backend_config_fails_test() {
        let mut controller = ServiceController::new(Arc::new(ScriptedExecutor::new()), fast_lifecycle());
        let runner = TestRunner::new(&BenchConfig::default());
        let definition = TestDefinition::new("no-model", BackendVariant::LmStudio, BackendConfig::new());

        let result = runner.run(&mut controller, &definition).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
        assert_eq!(runner.rounds(&definition), 1);
    }
}
