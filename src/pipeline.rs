//! End-to-end `analyze` pipeline.
//!
//! ```text
//! lines ──> [reorder] ──> classify ──> NAT join ──> correlate ──> cap ──> summarize ──> CSV
//!                                                   (blocking pool)
//! ```

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::analyzer::marking_breakdown;
use crate::classifier::{ClassifyStats, Flow, FlowTable};
use crate::config::Config;
use crate::correlator::{correlate_all, correlate_flow, CorrelatedFlow, Correlation, Direction};
use crate::error::Result;
use crate::export::{
    write_aggregate_csv, write_ccdf_csv, write_interval_csv, write_latency_csv,
    write_summary_csv, write_timeseries_csv, DirectionReport, FlowReport, RunReport,
};
use crate::record::PacketRecord;
use crate::reorder::ReorderedLines;
use crate::summary::DirectionSummary;

/// Positional arguments of one `analyze` run.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Label used in the report.
    pub name: String,
    /// Interface NAT halves are anchored on.
    pub cmci_interface: String,
    /// Network-side interface; every other interface counts as CMCI.
    pub nsi_interface: String,
    pub output_dir: PathBuf,
    /// Restore time order before classification.
    pub reorder: bool,
}

/// Classified and correlated flows, before capping.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub classify: ClassifyStats,
    pub flows_seen: usize,
    pub correlation: Correlation,
}

/// Parses and classifies every line, then joins NAT halves on `cmci_interface`.
pub fn classify_lines<I>(lines: I, config: &Config, reorder: bool, cmci_interface: &str) -> Result<FlowTable>
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut table = FlowTable::new();
    if reorder {
        let watermark = config.reorder.watermark();
        debug!("Reordering input with {:?}", watermark);
        let ordered = ReorderedLines::new(lines, watermark).map(|line| line.map(|l| l.text));
        ingest_lines(&mut table, ordered, config.classify.payload_prefix_chars)?;
    } else {
        ingest_lines(&mut table, lines, config.classify.payload_prefix_chars)?;
    }

    let stats = table.stats();
    info!(
        "Classified {} records into {} flows ({} skipped)",
        stats.records,
        table.len(),
        stats.skipped
    );

    table.reunify_nat_halves(cmci_interface, &config.classify.nat_policy());
    Ok(table)
}

fn ingest_lines<I>(table: &mut FlowTable, lines: I, prefix: usize) -> Result<()>
where
    I: Iterator<Item = io::Result<String>>,
{
    for line in lines {
        let line = line.context("Failed to read packet line")?;
        if line.trim().is_empty() {
            continue;
        }
        match PacketRecord::parse(&line, prefix) {
            Ok(record) => {
                if !table.ingest(&record) {
                    debug!("Skipping record without ports: {}", line);
                }
            }
            Err(e) => {
                debug!("Skipping line: {}", e);
                table.note_skipped();
            }
        }
    }
    Ok(())
}

/// Runs classification and sequential correlation.
pub fn analyze_lines<I>(lines: I, config: &Config, options: &AnalyzeOptions) -> Result<Analysis>
where
    I: Iterator<Item = io::Result<String>>,
{
    let table = classify_lines(lines, config, options.reorder, &options.cmci_interface)?;
    let classify = table.stats().clone();
    let flows = table.into_flows();

    let correlation = correlate_all(&flows, &options.nsi_interface);

    Ok(Analysis {
        classify,
        flows_seen: flows.len(),
        correlation,
    })
}

/// Correlates flows on the blocking pool, one task per flow.
///
/// Results are filed in input (flow key) order regardless of completion order.
pub async fn correlate_parallel(flows: Vec<Flow>, nsi_interface: &str) -> Result<Correlation> {
    let mut tasks = JoinSet::new();
    let count = flows.len();
    for (index, flow) in flows.into_iter().enumerate() {
        let nsi = nsi_interface.to_string();
        tasks.spawn_blocking(move || (index, correlate_flow(&flow, &nsi)));
    }

    let mut results: Vec<(usize, Option<CorrelatedFlow>)> = Vec::with_capacity(count);
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("Correlation task failed")?);
    }
    results.sort_by_key(|(index, _)| *index);

    let mut correlation = Correlation::default();
    for (_, flow) in results {
        correlation.push(flow);
    }
    Ok(correlation)
}

/// Caps and summarizes both directions, upstream first.
pub fn summarize(correlation: &Correlation, config: &Config) -> Vec<(DirectionSummary, Vec<CorrelatedFlow>)> {
    let cap = config.aggregate.flow_cap();
    let analyzer = config.aggregate.analyzer();

    [Direction::Upstream, Direction::Downstream]
        .into_iter()
        .map(|direction| {
            let flows = cap.apply(correlation.flows(direction).to_vec());
            let summary = DirectionSummary::calculate(direction, &flows, &analyzer);
            (summary, flows)
        })
        .collect()
}

/// Writes every per-direction and per-flow table into `options.output_dir`.
pub fn write_outputs(
    summaries: &[(DirectionSummary, Vec<CorrelatedFlow>)],
    config: &Config,
    options: &AnalyzeOptions,
) -> Result<()> {
    let dir = &options.output_dir;
    anyhow::ensure!(
        dir.is_dir(),
        "Output directory does not exist: {}",
        dir.display()
    );

    for (summary, flows) in summaries {
        write_summary_csv(dir, summary)?;
        write_aggregate_csv(dir, summary)?;
        write_interval_csv(dir, summary)?;

        for flow in flows {
            write_latency_csv(dir, flow)?;
            if config.output.per_flow_files {
                write_ccdf_csv(dir, flow)?;
                write_timeseries_csv(dir, flow, config.aggregate.plot_interval_secs)?;
            }
        }
    }
    debug!("Wrote outputs to {}", dir.display());
    Ok(())
}

fn build_report(
    options: &AnalyzeOptions,
    classify: &ClassifyStats,
    flows_seen: usize,
    excluded: usize,
    summaries: &[(DirectionSummary, Vec<CorrelatedFlow>)],
) -> RunReport {
    let directions = summaries
        .iter()
        .map(|(summary, flows)| DirectionReport {
            direction: summary.direction,
            flows: summary
                .rows
                .iter()
                .zip(flows)
                .map(|(row, flow)| FlowReport {
                    flow_number: row.flow_number,
                    flow_id: row.flow_id.clone(),
                    packets: row.num_packets,
                    stats: row.stats.clone(),
                    marking: marking_breakdown(flow),
                })
                .collect(),
        })
        .collect();

    RunReport {
        name: options.name.clone(),
        timestamp: Utc::now(),
        records: classify.records,
        records_skipped: classify.skipped,
        flows_seen,
        flows_excluded: excluded,
        nat_joins: classify.nat_joins,
        directions,
    }
}

/// Full `analyze` run: classify, correlate in parallel, summarize, write tables.
pub async fn run_analysis<I>(lines: I, config: &Config, options: &AnalyzeOptions) -> Result<RunReport>
where
    I: Iterator<Item = io::Result<String>>,
{
    anyhow::ensure!(
        options.output_dir.is_dir(),
        "Output directory does not exist: {}",
        options.output_dir.display()
    );

    let table = classify_lines(lines, config, options.reorder, &options.cmci_interface)?;
    let classify = table.stats().clone();
    let flows = table.into_flows();
    let flows_seen = flows.len();

    let correlation = correlate_parallel(flows, &options.nsi_interface).await?;
    info!(
        "Correlated {} upstream and {} downstream flows ({} excluded)",
        correlation.upstream.len(),
        correlation.downstream.len(),
        correlation.excluded
    );

    let summaries = summarize(&correlation, config);
    write_outputs(&summaries, config, options)?;

    let report = build_report(
        options,
        &classify,
        flows_seen,
        correlation.excluded,
        &summaries,
    );
    info!("Analysis '{}' complete", options.name);
    Ok(report)
}
