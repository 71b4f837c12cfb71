//! Ollama backend adapter

use crate::adapter::{
    cuda_visible_devices, env_assignments, port_or_default, required_model, shell_quote, BackendAdapter,
    ModelFetch,
};
use crate::{health, Result};
use bench_core::{value_to_string, BackendConfig, BackendVariant};
use serde_json::json;
use tracing::warn;

/// Environment variables Ollama understands
pub const SUPPORTED_ENV_VARS: &[&str] = &[
    "OLLAMA_DEBUG",
    "OLLAMA_HOST",
    "OLLAMA_KEEP_ALIVE",
    "OLLAMA_MAX_LOADED_MODELS",
    "OLLAMA_MAX_QUEUE",
    "OLLAMA_MODELS",
    "OLLAMA_NUM_PARALLEL",
    "OLLAMA_NOPRUNE",
    "OLLAMA_ORIGINS",
    "OLLAMA_SCHED_SPREAD",
    "OLLAMA_TMPDIR",
    "OLLAMA_FLASH_ATTENTION",
    "OLLAMA_LLM_LIBRARY",
];

/// Ollama adapter
///
/// Launches `ollama serve` bound to the configured port and pulls the model
/// through that server when it is not in the local store yet.
#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    model: String,
    port: u16,
    env: Vec<(String, String)>,
}

impl OllamaAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let model = required_model(BackendVariant::Ollama, config)?;
        let port = port_or_default(BackendVariant::Ollama, config)?;

        let mut env: Vec<(String, String)> = Vec::new();
        env.extend(cuda_visible_devices(config));

        for (name, value) in config.env_vars().into_iter().flatten() {
            if name == "OLLAMA_HOST" {
                warn!("OLLAMA_HOST is derived from the configured port, ignoring env_vars value");
                continue;
            }
            if !SUPPORTED_ENV_VARS.contains(&name.as_str()) {
                warn!("Ignoring unsupported Ollama environment variable: {}", name);
                continue;
            }
            match value_to_string(value) {
                Some(value) => env.push((name.clone(), value)),
                None => warn!("Ignoring non-scalar Ollama environment variable: {}", name),
            }
        }

        let shorthands = [
            ("num_parallel", "OLLAMA_NUM_PARALLEL"),
            ("max_loaded_models", "OLLAMA_MAX_LOADED_MODELS"),
        ];
        for (key, var) in shorthands {
            if env.iter().any(|(name, _)| name == var) {
                continue;
            }
            if let Some(value) = config.get_str(key) {
                env.push((var.to_string(), value));
            }
        }

        env.push(("OLLAMA_HOST".to_string(), format!("0.0.0.0:{}", port)));

        Ok(Self { model, port, env })
    }

    /// Environment assignments the server is started with
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Client-side host so `ollama list`/`pull` reach this server
    fn client_host(&self) -> String {
        format!("OLLAMA_HOST=127.0.0.1:{}", self.port)
    }
}

impl BackendAdapter for OllamaAdapter {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn model_fetch(&self) -> Option<ModelFetch> {
        Some(ModelFetch {
            check_command: format!("{} ollama list", self.client_host()),
            model: self.model.clone(),
            pull_command: format!("{} ollama pull {}", self.client_host(), shell_quote(&self.model)),
        })
    }

    /// Empty generate request, which makes Ollama load the model and return
    fn build_warmup_command(&self, max_time_seconds: u64) -> Option<String> {
        let url = format!("http://localhost:{}{}", self.port, self.completion_path());
        let body = json!({"model": self.model, "prompt": "", "stream": false});
        Some(health::http_post_status_command(&url, &body.to_string(), max_time_seconds))
    }

    fn build_start_command(&self) -> String {
        format!(
            "nohup env {} ollama serve > {} 2>&1 &",
            env_assignments(&self.env),
            self.log_file()
        )
    }

    fn process_patterns(&self) -> &'static [&'static str] {
        &["ollama serve"]
    }

    fn log_file(&self) -> String {
        format!("ollama_serve_{}.log", self.port)
    }

    fn ready_markers(&self) -> &'static [&'static str] {
        &["Listening on"]
    }

    fn readiness_path(&self) -> &'static str {
        "/api/tags"
    }

    fn completion_path(&self) -> &'static str {
        "/api/generate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(params: serde_json::Value) -> OllamaAdapter {
        let config: BackendConfig = serde_json::from_value(params).unwrap();
        OllamaAdapter::new(&config).unwrap()
    }

    #[test]
    fn test_start_command() {
        let adapter = adapter(json!({
            "model": "llama3.2:1b",
            "port": 11500,
            "gpu_ids": [0, 1],
            "env_vars": {"OLLAMA_KEEP_ALIVE": "5m", "NOT_OLLAMA": "x", "OLLAMA_HOST": "1.2.3.4:1"},
            "num_parallel": 4
        }));

        assert_eq!(
            adapter.build_start_command(),
            "nohup env CUDA_VISIBLE_DEVICES=0,1 OLLAMA_KEEP_ALIVE=5m OLLAMA_NUM_PARALLEL=4 \
             OLLAMA_HOST=0.0.0.0:11500 ollama serve > ollama_serve_11500.log 2>&1 &"
        );
    }

    #[test]
    fn test_env_vars_override_shorthand() {
        let adapter = adapter(json!({
            "model": "m",
            "env_vars": {"OLLAMA_NUM_PARALLEL": "8"},
            "num_parallel": 2,
            "max_loaded_models": 1
        }));

        let env = adapter.environment();
        assert!(env.contains(&("OLLAMA_NUM_PARALLEL".to_string(), "8".to_string())));
        assert!(!env.contains(&("OLLAMA_NUM_PARALLEL".to_string(), "2".to_string())));
        assert!(env.contains(&("OLLAMA_MAX_LOADED_MODELS".to_string(), "1".to_string())));
    }

    #[test]
    fn test_model_fetch_targets_configured_port() {
        let adapter = adapter(json!({"model": "qwen2.5:7b", "port": 11500}));
        let fetch = adapter.model_fetch().unwrap();

        assert_eq!(fetch.check_command, "OLLAMA_HOST=127.0.0.1:11500 ollama list");
        assert_eq!(fetch.pull_command, "OLLAMA_HOST=127.0.0.1:11500 ollama pull qwen2.5:7b");
        assert!(fetch.is_present(&crate::CommandOutput::ok("NAME\nqwen2.5:7b  abc  4.7 GB\n")));
        assert!(!fetch.is_present(&crate::CommandOutput::ok("NAME\nqwen2.5:7b-instruct  abc  4.7 GB\n")));
        assert!(!fetch.is_present(&crate::CommandOutput::ok("NAME\n")));
    }

    #[test]
    fn test_warmup_command_loads_model() {
        let adapter = adapter(json!({"model": "llama3.2:1b", "port": 11500}));

        assert_eq!(
            adapter.build_warmup_command(600).unwrap(),
            "curl -s -o /dev/null -m 600 -w '%{http_code}' -H 'Content-Type: application/json' \
             -d '{\"model\":\"llama3.2:1b\",\"prompt\":\"\",\"stream\":false}' \
             http://localhost:11500/api/generate"
        );
    }

    #[test]
    fn test_process_commands_are_guarded() {
        let adapter = adapter(json!({"model": "m"}));
        assert_eq!(adapter.build_presence_command(&[]), "pgrep -f '[o]llama serve'");
        assert_eq!(adapter.build_stop_command(false, &[]), "pkill -TERM -f '[o]llama serve'");
        assert_eq!(adapter.build_stop_command(true, &[]), "pkill -9 -f '[o]llama serve'");
        assert_eq!(
            adapter.build_readiness_command(),
            "curl -s -o /dev/null -m 5 -w '%{http_code}' http://localhost:11434/api/tags"
        );
    }
}
