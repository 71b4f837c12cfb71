//! LM Studio backend adapter

use crate::adapter::{
    cuda_visible_devices, env_assignments, port_or_default, required_model, shell_quote, BackendAdapter,
};
use crate::Result;
use bench_core::{BackendConfig, BackendVariant};

/// Headless `lmstudio-server` adapter
#[derive(Debug, Clone)]
pub struct LmStudioAdapter {
    model: String,
    port: u16,
    gpu_env: Option<(String, String)>,
    other_args: String,
}

impl LmStudioAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            model: required_model(BackendVariant::LmStudio, config)?,
            port: port_or_default(BackendVariant::LmStudio, config)?,
            gpu_env: cuda_visible_devices(config),
            other_args: config.get_str("other_args").unwrap_or_default(),
        })
    }
}

impl BackendAdapter for LmStudioAdapter {
    fn variant(&self) -> BackendVariant {
        BackendVariant::LmStudio
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn build_start_command(&self) -> String {
        let mut cmd = String::from("nohup ");
        if let Some(var) = &self.gpu_env {
            cmd.push_str(&format!("env {} ", env_assignments(std::slice::from_ref(var))));
        }
        cmd.push_str(&format!(
            "lmstudio-server --model {} --port {}",
            shell_quote(&self.model),
            self.port
        ));
        let other_args = self.other_args.trim();
        if !other_args.is_empty() {
            cmd.push(' ');
            cmd.push_str(other_args);
        }
        cmd.push_str(&format!(" > {} 2>&1 &", self.log_file()));
        cmd
    }

    fn process_patterns(&self) -> &'static [&'static str] {
        &["lmstudio-server"]
    }

    fn log_file(&self) -> String {
        format!("lmstudio_server_{}.log", self.port)
    }

    fn ready_markers(&self) -> &'static [&'static str] {
        &["Server started"]
    }

    fn readiness_path(&self) -> &'static str {
        "/v1/models"
    }

    fn completion_path(&self) -> &'static str {
        "/v1/completions"
    }
}
