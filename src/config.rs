//! Configuration Module
//!
//! Provides TOML-based configuration for latency-monitor.
//! Configuration is optional - CLI arguments can override file settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalyzerConfig, LATENCY_PERCENTILES};
use crate::classifier::NatPolicy;
use crate::export::OutputFormat;
use crate::record::PAYLOAD_PREFIX_CHARS;
use crate::reorder::{Watermark, WARMUP_LINES};
use crate::summary::{FlowCap, MAX_FLOW_PLOTS};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub reorder: ReorderConfig,
    pub classify: ClassifyConfig,
    pub aggregate: AggregateConfig,
    pub combine: CombineConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads configuration from file if given, otherwise returns defaults
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::load(p).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.reorder.warmup_lines == 0 && self.reorder.max_lateness_secs.is_none() {
            anyhow::bail!("warmup_lines must be greater than 0 unless max_lateness_secs is set");
        }
        if let Some(lateness) = self.reorder.max_lateness_secs {
            if !(lateness > 0.0 && lateness.is_finite()) {
                anyhow::bail!("max_lateness_secs must be a positive number of seconds");
            }
        }
        if self.classify.payload_prefix_chars < 8 {
            anyhow::bail!("payload_prefix_chars must be at least 8 to recover ports");
        }

        let agg = &self.aggregate;
        for (name, value) in [
            ("plot_interval_secs", agg.plot_interval_secs),
            ("steady_interval_secs", agg.steady_interval_secs),
            ("chunk_interval_secs", agg.chunk_interval_secs),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }
        if !(agg.steady_state_secs >= 0.0 && agg.steady_state_secs.is_finite()) {
            anyhow::bail!("steady_state_secs must not be negative");
        }
        if agg.max_flows == 0 {
            anyhow::bail!("max_flows must be greater than 0");
        }
        if agg.percentiles.is_empty() {
            anyhow::bail!("percentiles must not be empty");
        }
        if let Some(p) = agg.percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
            anyhow::bail!("percentile {} is outside 0-100", p);
        }

        if self.combine.group_column.is_empty() {
            anyhow::bail!("group_column must not be empty");
        }
        Ok(())
    }
}

/// Reorderer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Lines read before merging starts (line-count watermark)
    pub warmup_lines: usize,
    /// Release records this many seconds behind the newest one instead
    pub max_lateness_secs: Option<f64>,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            warmup_lines: WARMUP_LINES,
            max_lateness_secs: None,
        }
    }
}

impl ReorderConfig {
    pub fn watermark(&self) -> Watermark {
        match self.max_lateness_secs {
            Some(secs) => Watermark::MaxLateness(secs),
            None => Watermark::LineCount(self.warmup_lines),
        }
    }
}

/// Flow classification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifyConfig {
    /// Payload hex characters kept for fingerprinting
    pub payload_prefix_chars: usize,
    /// Require a matching port when joining NAT halves
    pub nat_match_ports: bool,
    /// Reject NAT joins whose packet counts differ by more than this
    pub nat_max_packet_delta: Option<usize>,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            payload_prefix_chars: PAYLOAD_PREFIX_CHARS,
            nat_match_ports: false,
            nat_max_packet_delta: None,
        }
    }
}

impl ClassifyConfig {
    pub fn nat_policy(&self) -> NatPolicy {
        NatPolicy {
            match_ports: self.nat_match_ports,
            max_packet_delta: self.nat_max_packet_delta,
        }
    }
}

/// Aggregation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Flows reported individually per direction
    pub max_flows: usize,
    /// Minimum packets for a flow to be reported individually
    pub min_packets: u64,
    /// Latency percentiles to report
    pub percentiles: Vec<f64>,
    /// Plotting series bucket width in seconds
    pub plot_interval_secs: f64,
    /// Steady-state series bucket width in seconds
    pub steady_interval_secs: f64,
    /// Start-up time excluded from steady-state figures
    pub steady_state_secs: f64,
    /// Chunk width for per-interval statistics
    pub chunk_interval_secs: f64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        let analyzer = AnalyzerConfig::default();
        Self {
            max_flows: MAX_FLOW_PLOTS,
            min_packets: 0,
            percentiles: LATENCY_PERCENTILES.to_vec(),
            plot_interval_secs: analyzer.plot_interval_secs,
            steady_interval_secs: analyzer.steady_interval_secs,
            steady_state_secs: analyzer.steady_state_secs,
            chunk_interval_secs: analyzer.chunk_interval_secs,
        }
    }
}

impl AggregateConfig {
    pub fn analyzer(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            percentiles: self.percentiles.clone(),
            plot_interval_secs: self.plot_interval_secs,
            steady_interval_secs: self.steady_interval_secs,
            steady_state_secs: self.steady_state_secs,
            chunk_interval_secs: self.chunk_interval_secs,
        }
    }

    pub fn flow_cap(&self) -> FlowCap {
        FlowCap {
            max_flows: self.max_flows,
            min_packets: self.min_packets,
        }
    }
}

/// Cross-run combination configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CombineConfig {
    /// Subdirectory name prefix of each run
    pub run_prefix: String,
    /// Results file inside each run directory
    pub results_file: String,
    /// Column rows are grouped by
    pub group_column: String,
    /// Metric columns to combine (empty = every numeric column)
    pub columns: Vec<String>,
    /// File written to the root directory
    pub output_file: String,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            run_prefix: "run".to_string(),
            results_file: "detailed_results.csv".to_string(),
            group_column: "Test Case".to_string(),
            columns: Vec::new(),
            output_file: "result.csv".to_string(),
        }
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Report format (text, json, jsonl)
    #[serde(with = "output_format_serde")]
    pub format: OutputFormat,
    /// Write per-flow latency, CCDF and time-series CSVs
    pub per_flow_files: bool,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            per_flow_files: true,
            verbose: false,
        }
    }
}

/// Custom serde implementation for OutputFormat
mod output_format_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(format: &OutputFormat, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
