//! GPU inventory from `nvidia-smi`

use crate::executor::RemoteExecutor;
use crate::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Query used for the inventory, one CSV row per GPU without header or units
pub const GPU_QUERY_COMMAND: &str = "nvidia-smi --query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu --format=csv,noheader,nounits";

/// One GPU on the target host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: f64,
    pub memory_used_mib: f64,
    pub memory_free_mib: f64,
    pub utilization_percent: f64,
}

/// Parse `nvidia-smi` CSV output; malformed rows are skipped
pub fn parse_gpu_csv(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 6 {
                debug!("Skipping malformed GPU row: {}", line);
                return None;
            }
            let row = GpuInfo {
                index: parts[0].parse().ok()?,
                name: parts[1].to_string(),
                memory_total_mib: parts[2].parse().ok()?,
                memory_used_mib: parts[3].parse().ok()?,
                memory_free_mib: parts[4].parse().ok()?,
                utilization_percent: parts[5].parse().ok()?,
            };
            Some(row)
        })
        .collect()
}

/// List the GPUs visible on the executor's host
pub async fn query_gpus(executor: &dyn RemoteExecutor, timeout: Duration) -> Result<Vec<GpuInfo>> {
    let output = executor.execute(GPU_QUERY_COMMAND, timeout).await?;
    if !output.success() {
        return Err(RuntimeError::Command(format!(
            "nvidia-smi failed with exit code {}: {}",
            output.exit_code,
            output.diagnostic()
        )));
    }
    Ok(parse_gpu_csv(&output.stdout))
}
