//! vLLM backend adapter

use crate::adapter::{
    cuda_visible_devices, env_assignments, expand_home, port_or_default, render_flags, required_model,
    shell_quote, BackendAdapter,
};
use crate::{Result, RuntimeError};
use bench_core::{BackendConfig, BackendVariant};

/// Launch flags forwarded from `args`
pub const SUPPORTED_ARGS: &[&str] = &[
    "tensor-parallel-size",
    "gpu-memory-utilization",
    "max-num-batched-tokens",
    "max-num-partial-prefills",
    "swap-space",
    "max-num-seqs",
    "max-model-len",
    "max-batch-size",
    "max-tokens",
    "quantization",
    "dtype",
    "enforce-eager",
    "worker-use-ray",
    "block-size",
    "host",
    "disable-log-requests",
    "disable-log-stats",
];

const DEFAULT_WORKING_DIR: &str = "~/vllm_bench";

/// vLLM OpenAI-compatible server adapter
#[derive(Debug, Clone)]
pub struct VLlmAdapter {
    model: String,
    port: u16,
    working_dir: String,
    tensor_parallel_size: u64,
    use_vllm_serve: bool,
    venv: Option<String>,
    gpu_env: Option<(String, String)>,
    flags: Vec<String>,
}

impl VLlmAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let model = required_model(BackendVariant::VLlm, config)?;
        let port = port_or_default(BackendVariant::VLlm, config)?;

        let tensor_parallel_size = match config.get("tensor_parallel_size") {
            None => 1,
            Some(_) => config.get_u64("tensor_parallel_size").filter(|n| *n > 0).ok_or_else(|| {
                RuntimeError::Configuration("tensor_parallel_size must be a positive integer".to_string())
            })?,
        };

        let working_dir = expand_home(
            &config
                .get_str("working_dir")
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
        );

        Ok(Self {
            model,
            port,
            working_dir,
            tensor_parallel_size,
            use_vllm_serve: config.get_bool("use_vllm_serve").unwrap_or(true),
            venv: config.get_str("venv").map(|v| expand_home(&v)),
            gpu_env: cuda_visible_devices(config),
            flags: render_flags(BackendVariant::VLlm, config.args(), SUPPORTED_ARGS),
        })
    }

    /// Working directory the server is started from, `~` already expanded
    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// Command line run inside the login environment
    fn server_command(&self) -> String {
        let mut cmd = if self.use_vllm_serve {
            format!("vllm serve {}", shell_quote(&self.model))
        } else {
            format!(
                "python -m vllm.entrypoints.openai.api_server --model {}",
                shell_quote(&self.model)
            )
        };

        if !self.flags.iter().any(|f| f.starts_with("--tensor-parallel-size")) {
            cmd.push_str(&format!(" --tensor-parallel-size={}", self.tensor_parallel_size));
        }
        cmd.push_str(&format!(" --port {}", self.port));
        for flag in &self.flags {
            cmd.push(' ');
            cmd.push_str(flag);
        }
        cmd
    }
}

impl BackendAdapter for VLlmAdapter {
    fn variant(&self) -> BackendVariant {
        BackendVariant::VLlm
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn prepare_commands(&self) -> Vec<String> {
        vec![format!("mkdir -p {}", self.working_dir)]
    }

    fn build_start_command(&self) -> String {
        let source = match &self.venv {
            Some(venv) => format!("source {}/bin/activate", venv),
            None => "source ~/.bashrc".to_string(),
        };

        let env = self
            .gpu_env
            .as_ref()
            .map(|var| format!("{} ", env_assignments(std::slice::from_ref(var))))
            .unwrap_or_default();

        let inner = format!(
            "{} && cd {} && {}{}",
            source,
            self.working_dir,
            env,
            self.server_command()
        );

        format!(
            "nohup bash -c {} > {} 2>&1 &",
            shell_quote(&inner),
            self.log_file()
        )
    }

    fn process_patterns(&self) -> &'static [&'static str] {
        &["vllm serve", "vllm.entrypoints.openai.api_server"]
    }

    fn log_file(&self) -> String {
        format!("{}/vllm_server_{}.log", self.working_dir, self.port)
    }

    fn ready_markers(&self) -> &'static [&'static str] {
        &["Application startup complete", "GET /v1/models HTTP/1.1. 200 OK"]
    }

    fn readiness_path(&self) -> &'static str {
        "/v1/models"
    }

    fn completion_path(&self) -> &'static str {
        "/v1/completions"
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        vec![("Authorization".to_string(), "Bearer no-key-required".to_string())]
    }
}
