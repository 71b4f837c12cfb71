//! Backend adapter interface
//!
//! An adapter turns a [`BackendConfig`] into the shell commands that start,
//! probe and stop one backend product. Adapters never run anything
//! themselves; the [`ServiceController`](crate::ServiceController) executes
//! their commands and owns all lifecycle state.

use crate::executor::CommandOutput;
use crate::health;
use crate::lmstudio::LmStudioAdapter;
use crate::ollama::OllamaAdapter;
use crate::vllm::VLlmAdapter;
use crate::{Result, RuntimeError};
use bench_core::{value_to_string, BackendConfig, BackendVariant};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;
use url::Url;

/// Seconds the readiness curl may take
const READINESS_PROBE_SECONDS: u64 = 5;

/// Capability interface implemented once per backend variant
pub trait BackendAdapter: Send + Sync + fmt::Debug {
    /// Backend variant served by this adapter
    fn variant(&self) -> BackendVariant;

    /// Model identifier sent in completion requests
    fn model(&self) -> &str;

    /// Port the backend API listens on
    fn port(&self) -> u16;

    /// Commands run in order before launch, each must succeed
    fn prepare_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Download step run after launch when the model is missing
    fn model_fetch(&self) -> Option<ModelFetch> {
        None
    }

    /// Request that loads the model once the API answers, printing the HTTP status
    fn build_warmup_command(&self, _max_time_seconds: u64) -> Option<String> {
        None
    }

    /// Backgrounded launch command; returns as soon as the process is spawned
    fn build_start_command(&self) -> String;

    /// Patterns matching the server's own command line and nothing broader
    fn process_patterns(&self) -> &'static [&'static str];

    /// Guarded alternation of [`process_patterns`](Self::process_patterns) for `pgrep -f`
    fn process_regex(&self) -> String {
        self.process_patterns()
            .iter()
            .map(|p| guard_pattern(p))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Command that exits 0 iff a backend process other than `exclude` is present
    fn build_presence_command(&self, exclude: &[u32]) -> String {
        let pattern = shell_quote(&self.process_regex());
        match pid_filter(exclude) {
            None => format!("pgrep -f {}", pattern),
            Some(filter) => format!("pgrep -f {} | {}", pattern, filter),
        }
    }

    /// Graceful (SIGTERM) or forceful (SIGKILL) termination command
    ///
    /// PIDs in `exclude` never receive the signal.
    fn build_stop_command(&self, force: bool, exclude: &[u32]) -> String {
        let signal = if force { "-9" } else { "-TERM" };
        let pattern = shell_quote(&self.process_regex());
        match pid_filter(exclude) {
            None => format!("pkill {} -f {}", signal, pattern),
            Some(filter) => format!("pgrep -f {} | {} | xargs -r kill {}", pattern, filter, signal),
        }
    }

    /// Path of the captured backend log on the target host
    fn log_file(&self) -> String;

    /// Extended regular expressions that appear in the log once serving
    fn ready_markers(&self) -> &'static [&'static str];

    /// Lightweight GET endpoint used as the readiness probe
    fn readiness_path(&self) -> &'static str;

    /// Completion endpoint
    fn completion_path(&self) -> &'static str;

    /// Readiness probe, run on the target host against its loopback address
    fn build_readiness_command(&self) -> String {
        let url = format!("http://localhost:{}{}", self.port(), self.readiness_path());
        health::http_status_command(&url, READINESS_PROBE_SECONDS)
    }

    /// Interpret the output of the readiness probe
    fn is_ready(&self, probe: &CommandOutput) -> bool {
        probe.success()
            && health::parse_http_status(&probe.stdout)
                .map(health::is_success_status)
                .unwrap_or(false)
    }

    /// Extra headers completion requests must carry
    fn request_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Root URL of the backend API as seen from the benchmark host
    fn api_base_url(&self, host: &str) -> Result<Url> {
        Url::parse(&format!("http://{}:{}/", host, self.port()))
            .map_err(|e| RuntimeError::Configuration(format!("Invalid API host {}: {}", host, e)))
    }
}

/// Pull-if-absent step for backends that manage their own model store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFetch {
    /// Lists locally available models
    pub check_command: String,
    /// Model name looked up in the first column of the listing
    pub model: String,
    /// Downloads the model
    pub pull_command: String,
}

impl ModelFetch {
    /// Whether a listing row names exactly this model, `:latest` assumed when untagged
    pub fn is_present(&self, listing: &CommandOutput) -> bool {
        if !listing.success() {
            return false;
        }
        let wanted = with_default_tag(&self.model);
        listing
            .stdout
            .lines()
            .filter_map(|row| row.split_whitespace().next())
            .filter(|name| *name != "NAME")
            .any(|name| with_default_tag(name) == wanted)
    }
}

fn with_default_tag(name: &str) -> String {
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    if last_segment.contains(':') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

/// Create the adapter for a variant, validating its parameters
pub fn create_adapter(variant: BackendVariant, config: &BackendConfig) -> Result<Box<dyn BackendAdapter>> {
    Ok(match variant {
        BackendVariant::Ollama => Box::new(OllamaAdapter::new(config)?),
        BackendVariant::VLlm => Box::new(VLlmAdapter::new(config)?),
        BackendVariant::LmStudio => Box::new(LmStudioAdapter::new(config)?),
    })
}

/// Turn `vllm` into `[v]llm` so a pattern never matches the shell running it
pub fn guard_pattern(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => format!("[{}]{}", first, chars.as_str()),
        _ => pattern.to_string(),
    }
}

/// `grep` stage dropping the given PIDs from `pgrep` output
fn pid_filter(exclude: &[u32]) -> Option<String> {
    if exclude.is_empty() {
        return None;
    }
    let pids = exclude.iter().map(u32::to_string).collect::<Vec<_>>().join("|");
    Some(format!("grep -vxE '{}'", pids))
}

/// Quote a word for a POSIX shell, leaving plain words untouched
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:,=@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Replace a leading `~` with `$HOME` so it expands inside quoted commands
pub fn expand_home(path: &str) -> String {
    match path.strip_prefix('~') {
        Some(rest) => format!("$HOME{}", rest),
        None => path.to_string(),
    }
}

/// Model from the config, required for every variant
pub(crate) fn required_model(variant: BackendVariant, config: &BackendConfig) -> Result<String> {
    config
        .model()
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| {
            RuntimeError::Configuration(format!("{} backend requires `model` or `model_path`", variant))
        })
}

/// Configured port or the variant default
pub(crate) fn port_or_default(variant: BackendVariant, config: &BackendConfig) -> Result<u16> {
    match config.get("port") {
        None | Some(Value::Null) => Ok(variant.default_port()),
        Some(_) => config
            .port()
            .filter(|p| *p != 0)
            .ok_or_else(|| RuntimeError::Configuration(format!("{} backend has an invalid port", variant))),
    }
}

/// `CUDA_VISIBLE_DEVICES` assignment for the configured GPU ids
pub(crate) fn cuda_visible_devices(config: &BackendConfig) -> Option<(String, String)> {
    let ids = config.gpu_ids();
    (!ids.is_empty()).then(|| ("CUDA_VISIBLE_DEVICES".to_string(), ids.join(",")))
}

/// Render `KEY=value` words for an `env` prefix
pub(crate) fn env_assignments(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render whitelisted launch flags
///
/// `true` becomes a bare `--flag`; `null` and `false` are skipped; anything
/// else becomes `--flag=value`. Keys outside `supported` are dropped with a
/// warning.
pub(crate) fn render_flags(
    variant: BackendVariant,
    args: Option<&Map<String, Value>>,
    supported: &[&str],
) -> Vec<String> {
    let mut flags = Vec::new();
    for (name, value) in args.into_iter().flatten() {
        if !supported.contains(&name.as_str()) {
            warn!("Ignoring unsupported {} argument: {}", variant, name);
            continue;
        }
        match value {
            Value::Bool(true) => flags.push(format!("--{}", name)),
            Value::Null | Value::Bool(false) => {}
            other => match value_to_string(other) {
                Some(v) => flags.push(format!("--{}={}", name, shell_quote(&v))),
                None => warn!("Ignoring non-scalar {} argument: {}", variant, name),
            },
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guard_pattern() {
        assert_eq!(guard_pattern("vllm"), "[v]llm");
        assert_eq!(guard_pattern("ollama serve"), "[o]llama serve");
        assert_eq!(guard_pattern("-x"), "-x");
        assert_eq!(guard_pattern(""), "");
    }

    #[test]
    fn test_process_commands_skip_protected_pids() {
        let adapter = create_adapter(BackendVariant::VLlm, &BackendConfig::new().with("model", "m")).unwrap();
        let pattern = "'[v]llm serve|[v]llm.entrypoints.openai.api_server'";

        assert_eq!(adapter.build_presence_command(&[]), format!("pgrep -f {}", pattern));
        assert_eq!(
            adapter.build_presence_command(&[4242, 17]),
            format!("pgrep -f {} | grep -vxE '4242|17'", pattern)
        );
        assert_eq!(adapter.build_stop_command(true, &[]), format!("pkill -9 -f {}", pattern));
        assert_eq!(
            adapter.build_stop_command(false, &[4242]),
            format!("pgrep -f {} | grep -vxE '4242' | xargs -r kill -TERM", pattern)
        );
    }

    #[test]
    fn test_model_fetch_matches_exact_names() {
        let fetch = |model: &str| ModelFetch {
            check_command: "ollama list".to_string(),
            model: model.to_string(),
            pull_command: format!("ollama pull {}", model),
        };
        let listing = CommandOutput::ok(
            "NAME              ID              SIZE      MODIFIED\n\
             llama3.2:1b       baf6a787fdff    1.3 GB    2 days ago\n\
             qwen2.5:7b        845dbda0ea48    4.7 GB    3 weeks ago\n\
             mistral:latest    f974a74358d6    4.1 GB    5 weeks ago\n",
        );

        assert!(fetch("llama3.2:1b").is_present(&listing));
        assert!(fetch("mistral").is_present(&listing));
        assert!(fetch("mistral:latest").is_present(&listing));
        assert!(!fetch("llama3").is_present(&listing));
        assert!(!fetch("llama3.2").is_present(&listing));
        assert!(!fetch("qwen2.5:7b-instruct").is_present(&listing));
        assert!(!fetch("qwen2.5").is_present(&listing));
        assert!(!fetch("NAME").is_present(&listing));
        assert!(!fetch("mistral").is_present(&CommandOutput::failed(1, "mistral")));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("llama3.2:1b"), "llama3.2:1b");
        assert_eq!(shell_quote("[v]llm"), "'[v]llm'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("~/vllm_bench"), "$HOME/vllm_bench");
        assert_eq!(expand_home("/srv/vllm"), "/srv/vllm");
    }

    #[test]
    fn test_render_flags() {
        let args = json!({
            "enforce-eager": true,
            "disable-log-stats": false,
            "quantization": null,
            "max-num-seqs": 64,
            "gpu-memory-utilization": 0.9,
            "rogue-flag": "x"
        });
        let flags = render_flags(
            BackendVariant::VLlm,
            args.as_object(),
            &["enforce-eager", "disable-log-stats", "quantization", "max-num-seqs", "gpu-memory-utilization"],
        );

        assert!(flags.contains(&"--enforce-eager".to_string()));
        assert!(flags.contains(&"--max-num-seqs=64".to_string()));
        assert!(flags.contains(&"--gpu-memory-utilization=0.9".to_string()));
        assert_eq!(flags.len(), 3);
    }

    #[test]
    fn test_port_and_model_resolution() {
        let config = BackendConfig::new().with("model", "m").with("port", 9000);
        assert_eq!(port_or_default(BackendVariant::VLlm, &config).unwrap(), 9000);
        assert_eq!(port_or_default(BackendVariant::VLlm, &BackendConfig::new()).unwrap(), 8000);
        assert!(port_or_default(BackendVariant::VLlm, &BackendConfig::new().with("port", "x")).is_err());

        assert!(required_model(BackendVariant::Ollama, &BackendConfig::new()).is_err());
        assert_eq!(required_model(BackendVariant::Ollama, &config).unwrap(), "m");
    }

    #[test]
    fn test_create_adapter_per_variant() {
        let config = BackendConfig::new().with("model", "m");
        for variant in BackendVariant::ALL {
            let adapter = create_adapter(variant, &config).unwrap();
            assert_eq!(adapter.variant(), variant);
            assert_eq!(adapter.port(), variant.default_port());
        }
        assert!(create_adapter(BackendVariant::VLlm, &BackendConfig::new()).is_err());
    }

    #[test]
    fn test_default_readiness_interpretation() {
        let adapter = create_adapter(BackendVariant::LmStudio, &BackendConfig::new().with("model", "m")).unwrap();
        assert!(adapter.is_ready(&CommandOutput::ok("200")));
        assert!(!adapter.is_ready(&CommandOutput::ok("000")));
        assert!(!adapter.is_ready(&CommandOutput::ok("503")));
        assert!(!adapter.is_ready(&CommandOutput::failed(7, "")));
    }
}
