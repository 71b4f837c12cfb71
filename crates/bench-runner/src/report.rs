//! Terminal tables for test results, test lists and GPU state

use bench_core::{value_to_string, BenchConfig, MetricName, TestResult};
use bench_runtime::GpuInfo;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);
    table
}

fn average(result: &TestResult, metric: MetricName) -> String {
    match result.summary.get(metric) {
        Some(summary) => match metric {
            MetricName::Ttft | MetricName::TotalTime => format!("{:.4}", summary.avg),
            MetricName::Tpot | MetricName::Throughput => format!("{:.2}", summary.avg),
        },
        None => "-".to_string(),
    }
}

/// One row per test with averaged metrics
pub fn results_table(results: &[TestResult]) -> Table {
    let mut table = new_table(&[
        "Test",
        "Backend",
        "Status",
        "Trials",
        "TTFT avg (s)",
        "TPOT avg (ms)",
        "Throughput avg (tok/s)",
        "Total avg (s)",
        "Parameter",
    ]);

    for result in results {
        let ok = result.samples.len() - result.failed_count();
        let status = if !result.success {
            Cell::new("deploy failed").fg(Color::Red)
        } else if ok == 0 {
            Cell::new("no successes").fg(Color::Red)
        } else if result.failed_count() > 0 {
            Cell::new("partial").fg(Color::Yellow)
        } else {
            Cell::new("ok").fg(Color::Green)
        };

        let parameter = result
            .summary
            .parameter
            .as_ref()
            .map(|p| {
                let value = value_to_string(&p.value).unwrap_or_else(|| p.value.to_string());
                format!("{}={}", p.name, value)
            })
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&result.name),
            Cell::new(result.backend),
            status,
            Cell::new(format!("{}/{}", ok, result.samples.len())),
            Cell::new(average(result, MetricName::Ttft)),
            Cell::new(average(result, MetricName::Tpot)),
            Cell::new(average(result, MetricName::Throughput)),
            Cell::new(average(result, MetricName::TotalTime)),
            Cell::new(parameter),
        ]);
    }

    table
}

/// Print the results table followed by any deployment errors
pub fn print_results(results: &[TestResult]) {
    if results.is_empty() {
        println!("{}", "No results".dimmed());
        return;
    }

    println!("{}", results_table(results));

    for result in results.iter().filter(|r| !r.success) {
        eprintln!(
            "{} {}: {}",
            "✗".red().bold(),
            result.name.bold(),
            result.error.as_deref().unwrap_or("deployment failed").red()
        );
    }
}

/// Configured tests with their 1-based selection index
pub fn tests_table(config: &BenchConfig) -> Table {
    let mut table = new_table(&["#", "Name", "Backend", "Mode", "Repeat", "Model"]);

    for (i, test) in config.tests.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&test.name),
            Cell::new(test.backend),
            Cell::new(if test.streaming { "streaming" } else { "blocking" }),
            Cell::new(test.repeat_or(config.default_repeat)),
            Cell::new(test.backend_config.get_str("model").unwrap_or_else(|| "-".to_string())),
        ]);
    }

    table
}

pub fn gpu_table(gpus: &[GpuInfo]) -> Table {
    let mut table = new_table(&["GPU", "Name", "Memory used (MiB)", "Memory total (MiB)", "Utilization (%)"]);

    for gpu in gpus {
        table.add_row(vec![
            Cell::new(gpu.index),
            Cell::new(&gpu.name),
            Cell::new(format!("{:.0}", gpu.memory_used_mib)),
            Cell::new(format!("{:.0}", gpu.memory_total_mib)),
            Cell::new(format!("{:.0}", gpu.utilization_percent)),
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::{BackendConfig, BackendVariant, Error, MetricSample, MetricSummary, SummaryParameter, TestDefinition};
    use serde_json::json;

    fn definition() -> TestDefinition {
        TestDefinition::new(
            "vllm-tp2",
            BackendVariant::VLlm,
            BackendConfig::new().with("model", "facebook/opt-125m"),
        )
    }

    #[test]
    fn test_results_table_rows() {
        let mut ok = TestResult::new(&definition());
        ok.samples.push(MetricSample::completed(200, 1.0));
        ok.samples.push(MetricSample::failed(&Error::api("HTTP 500: boom"), Some(500), 0.1));
        ok.summary.ttft = MetricSummary::from_values(&[0.12345]);
        ok.summary.parameter = Some(SummaryParameter {
            name: "tensor_parallel_size".to_string(),
            value: json!(2),
        });
        let failed = TestResult::deployment_failed(&definition(), &Error::deployment_timeout("no ready signal"));

        let rendered = results_table(&[ok, failed]).to_string();

        assert!(rendered.contains("vllm-tp2"));
        assert!(rendered.contains("partial"));
        assert!(rendered.contains("1/2"));
        assert!(rendered.contains("0.1235"));
        assert!(rendered.contains("tensor_parallel_size=2"));
        assert!(rendered.contains("deploy failed"));
    }

    #[test]
    fn test_tests_table_lists_indices() {
        let config = BenchConfig {
            tests: vec![definition().with_repeat(3)],
            ..Default::default()
        };

        let rendered = tests_table(&config).to_string();

        assert!(rendered.contains("vllm-tp2"));
        assert!(rendered.contains("facebook/opt-125m"));
        assert!(rendered.contains("streaming"));
    }
}
