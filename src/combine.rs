//! Cross-run combination of repeated experiment results.
//!
//! Each run lives in its own subdirectory (`run*/`) holding a results CSV.
//! Rows are grouped by a test-case column and every metric column is reduced
//! to a mean and a 95% normal-approximation confidence interval.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::config::CombineConfig;
use crate::error::{CombineError, Result};

/// Confidence level of the reported interval.
pub const CONFIDENCE: f64 = 0.95;

/// Mean with lower and upper confidence bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub low: f64,
    pub high: f64,
}

impl ConfidenceInterval {
    fn nan() -> Self {
        Self {
            mean: f64::NAN,
            low: f64::NAN,
            high: f64::NAN,
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Mean and 95% confidence interval of repeated measurements.
///
/// - any non-finite input, or all inputs zero: NaN for all three
/// - zero standard error: the mean three times
/// - otherwise `mean ± z · sem`, bounds rounded to one decimal
///
/// A single value has an undefined standard error, so its bounds are NaN.
pub fn confidence_interval(values: &[f64]) -> ConfidenceInterval {
    if values.is_empty()
        || values.iter().any(|v| !v.is_finite())
        || values.iter().all(|v| *v == 0.0)
    {
        return ConfidenceInterval::nan();
    }

    let mean = values.mean();
    let sem = values.std_dev() / (values.len() as f64).sqrt();
    if sem == 0.0 {
        return ConfidenceInterval {
            mean,
            low: mean,
            high: mean,
        };
    }

    let z = Normal::new(0.0, 1.0)
        .map(|n| n.inverse_cdf(0.5 + CONFIDENCE / 2.0))
        .unwrap_or(f64::NAN);
    ConfidenceInterval {
        mean,
        low: round1(mean - z * sem),
        high: round1(mean + z * sem),
    }
}

/// Run directories under `root` that contain `config.results_file`, sorted by name.
pub fn find_runs(root: &Path, config: &CombineConfig) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("Failed to read results directory: {}", root.display()))?;

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let is_run = name.to_string_lossy().starts_with(&config.run_prefix);
        let results = entry.path().join(&config.results_file);
        if is_run && entry.path().is_dir() && results.is_file() {
            runs.push(results);
        }
    }
    runs.sort();

    if runs.is_empty() {
        return Err(CombineError::NoRuns {
            root: root.to_path_buf(),
            file_name: config.results_file.clone(),
        }
        .into());
    }
    Ok(runs)
}

/// One results file loaded as header plus string rows.
#[derive(Debug, Clone)]
struct RunTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RunTable {
    fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Cannot open results file {}", path.display()))?;

        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Malformed row in {}", path.display()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Combined statistics for every test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedResults {
    pub group_column: String,
    pub metrics: Vec<String>,
    /// Test case → one interval per metric, in `metrics` order.
    pub groups: BTreeMap<String, Vec<ConfidenceInterval>>,
    pub runs: usize,
}

impl CombinedResults {
    /// Header row: the grouping column, then mean/low/high per metric.
    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec![self.group_column.clone()];
        for metric in &self.metrics {
            headers.push(format!("{} Mean", metric));
            headers.push(format!("{} CI_low", metric));
            headers.push(format!("{} CI_high", metric));
        }
        headers
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(self.headers())?;
        for (group, intervals) in &self.groups {
            let mut row = vec![group.clone()];
            for ci in intervals {
                row.extend([ci.mean, ci.low, ci.high].iter().map(|v| v.to_string()));
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Reads every run under `root` and reduces each metric per test case.
pub fn combine_runs(root: &Path, config: &CombineConfig) -> Result<CombinedResults> {
    let paths = find_runs(root, config)?;
    info!("Combining {} runs under {}", paths.len(), root.display());

    let mut tables = Vec::with_capacity(paths.len());
    for path in &paths {
        let table = RunTable::load(path)?;
        if table.column(&config.group_column).is_none() {
            return Err(CombineError::MissingColumn {
                path: path.clone(),
                column: config.group_column.clone(),
            }
            .into());
        }
        debug!("{}: {} rows", path.display(), table.rows.len());
        tables.push((path, table));
    }

    let metrics = if config.columns.is_empty() {
        numeric_columns(&tables, &config.group_column)
    } else {
        for (path, table) in &tables {
            if let Some(missing) = config.columns.iter().find(|c| table.column(c).is_none()) {
                return Err(CombineError::MissingColumn {
                    path: path.to_path_buf(),
                    column: missing.clone(),
                }
                .into());
            }
        }
        config.columns.clone()
    };

    let mut samples: BTreeMap<String, Vec<Vec<f64>>> = BTreeMap::new();
    for (_, table) in &tables {
        let group_index = table.column(&config.group_column).unwrap_or(0);
        let indices: Vec<Option<usize>> = metrics.iter().map(|m| table.column(m)).collect();
        for row in &table.rows {
            let Some(group) = row.get(group_index) else {
                continue;
            };
            let per_metric = samples
                .entry(group.clone())
                .or_insert_with(|| vec![Vec::new(); metrics.len()]);
            for (values, index) in per_metric.iter_mut().zip(&indices) {
                let value = index
                    .and_then(|i| row.get(i))
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(f64::NAN);
                values.push(value);
            }
        }
    }

    let groups = samples
        .into_iter()
        .map(|(group, per_metric)| {
            let intervals: Vec<ConfidenceInterval> = per_metric.iter().map(|v| confidence_interval(v)).collect();
            (group, intervals)
        })
        .collect();

    Ok(CombinedResults {
        group_column: config.group_column.clone(),
        metrics,
        groups,
        runs: paths.len(),
    })
}

/// Columns, in first-file order, whose every value parses as a number.
fn numeric_columns(tables: &[(&PathBuf, RunTable)], group_column: &str) -> Vec<String> {
    let Some((_, first)) = tables.first() else {
        return Vec::new();
    };
    first
        .headers
        .iter()
        .filter(|h| h.as_str() != group_column)
        .filter(|h| {
            tables.iter().all(|(_, table)| match table.column(h) {
                Some(i) => table
                    .rows
                    .iter()
                    .all(|row| row.get(i).is_some_and(|v| v.parse::<f64>().is_ok())),
                None => false,
            })
        })
        .cloned()
        .collect()
}
