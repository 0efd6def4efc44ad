use crate::error::FlowMetricsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Free-form options table passed to an enricher's `configure`.
pub type EnricherOptions = toml::value::Table;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the flow listener binds to, e.g. "0.0.0.0:20000".
    pub flow_endpoint: String,
    /// Address of the metrics/health HTTP endpoint. Exposition is disabled
    /// when absent.
    #[serde(default)]
    pub telemetry_endpoint: Option<String>,
    /// Inactivity window, in seconds, after which a per-label-combination
    /// counter is evicted. 0 or absent falls back to 180.
    #[serde(default)]
    pub flush_interval: u64,
    /// Size of the ingestion worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub extensions: HashMap<String, EnricherOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub filter: Vec<FilterRule>,
    #[serde(default)]
    pub enrich: Vec<String>,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub prefix: String,
    #[serde(default)]
    pub items: Vec<MetricSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub labels: Vec<LabelSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSpec {
    /// Output label name.
    pub name: String,
    /// Source attribute name, or the literal itself for `static`.
    pub value: String,
    /// One of: ipv4, str, uint32, uint64, static.
    pub converter: String,
    /// Fallback label value when the attribute is absent. Absent or
    /// "empty_str" yields the empty string.
    #[serde(default)]
    pub on_missing: Option<String>,
}

/// One flow match rule. Exactly one of the rule fields must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    /// Name of the flow attribute the rule matches against.
    #[serde(rename = "match", default)]
    pub match_attr: String,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub is: Option<String>,
    #[serde(default)]
    pub is_uint32: Option<String>,
    #[serde(default)]
    pub local_to_local: Option<bool>,
}

fn default_workers() -> usize {
    2
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| FlowMetricsError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Effective counter inactivity window; a zero/absent `flush_interval`
    /// falls back to 180 seconds.
    pub fn flush_duration(&self) -> Duration {
        let secs = if self.flush_interval == 0 {
            180
        } else {
            self.flush_interval
        };
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.flow_endpoint.is_empty() {
            return Err(FlowMetricsError::InvalidConfig(
                "flow_endpoint cannot be empty".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(FlowMetricsError::InvalidConfig(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.metrics.prefix.is_empty() {
            return Err(FlowMetricsError::InvalidConfig(
                "pipeline.metrics.prefix cannot be empty".to_string(),
            ));
        }

        for item in &self.pipeline.metrics.items {
            if item.name.is_empty() {
                return Err(FlowMetricsError::InvalidConfig(
                    "metric name cannot be empty".to_string(),
                ));
            }
            if item.labels.is_empty() {
                return Err(FlowMetricsError::InvalidConfig(format!(
                    "metric {} must declare at least one label",
                    item.name
                )));
            }
        }

        Ok(())
    }
}
