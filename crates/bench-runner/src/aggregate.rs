//! Reduction of samples into summary statistics

use bench_core::{BackendConfig, MetricName, MetricSample, MetricSummary, SummaryParameter, SummaryStats};

/// Summarises successful samples of one test
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    parameter: Option<String>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the named backend parameter into every summary
    pub fn with_parameter(parameter: Option<&str>) -> Self {
        Self {
            parameter: parameter.map(str::to_string),
        }
    }

    pub fn parameter(&self) -> Option<&str> {
        self.parameter.as_deref()
    }

    pub fn summarize(&self, samples: &[MetricSample], config: &BackendConfig) -> SummaryStats {
        let successful: Vec<&MetricSample> = samples.iter().filter(|s| s.success).collect();

        let mut stats = SummaryStats::default();
        for name in MetricName::ALL {
            let values: Vec<f64> = successful.iter().filter_map(|s| s.metric(name)).collect();
            stats.set(name, MetricSummary::from_values(&values));
        }

        stats.parameter = self.parameter.as_ref().and_then(|name| {
            config.parameter(name).map(|value| SummaryParameter {
                name: name.clone(),
                value: value.clone(),
            })
        });

        stats
    }
}
