//! Export Module
//!
//! Writes the per-flow and per-direction CSV tables and renders the run
//! report as text, JSON or JSON Lines.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analyzer::{ccdf, format_share, FlowStats, FlowTimeseries, MarkingRow};
use crate::correlator::{CorrelatedFlow, Direction};
use crate::error::Result;
use crate::summary::{DirectionSummary, SummaryRow};

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// Column set of `summary_table_<direction>.csv`.
pub const SUMMARY_HEADERS: [&str; 19] = [
    "Flow Number",
    "Flow ID",
    "Packet Delay P0 (ms)",
    "Packet Delay P90 (ms)",
    "Packet Delay P99 (ms)",
    "Packet Delay P99.9 (ms)",
    "PDV P99 (ms)",
    "PDV P99.9 (ms)",
    "Mean data rate (Mbps)",
    "P10 of data rate (Mbps)",
    "P10 % of mean",
    "Ramp time to 90% Tput (ms)",
    "Num Packets",
    "Num NotECT",
    "Num ECT0",
    "Num ECT1",
    "Num CE",
    "Dropped Packets",
    "Missing Packets",
];

pub const LATENCY_HEADERS: [&str; 3] = ["Timestamp", "Latency", "Frame Length"];

pub const INTERVAL_HEADERS: [&str; 8] = [
    "Flow ID",
    "Chunk",
    "Latency P0 (ms)",
    "Latency P90 (ms)",
    "Latency P99 (ms)",
    "Latency P99.9 (ms)",
    "Latency P100 (ms)",
    "Mean data rate (Mbps)",
];

/// File name for a per-flow table: the flow id followed by `suffix`.
pub fn flow_file_name(flow_id: &str, suffix: &str) -> String {
    format!("{}{}", flow_id.replace(['/', '\\'], "_"), suffix)
}

fn writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
    csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn fmt3(value: f64) -> String {
    format!("{:.3}", value)
}

/// Writes `<flow-id>latency.csv`: one row per matched packet.
pub fn write_latency_csv(dir: &Path, flow: &CorrelatedFlow) -> Result<PathBuf> {
    let path = dir.join(flow_file_name(&flow.id, "latency.csv"));
    let mut out = writer(&path)?;
    out.write_record(LATENCY_HEADERS)?;
    for (ts, latency) in &flow.latency {
        let size = flow.size.get(ts).copied().unwrap_or(0);
        out.write_record([ts.secs().to_string(), latency.to_string(), size.to_string()])?;
    }
    out.flush()?;
    Ok(path)
}

/// Writes `<flow-id>ccdf.csv`.
pub fn write_ccdf_csv(dir: &Path, flow: &CorrelatedFlow) -> Result<PathBuf> {
    let path = dir.join(flow_file_name(&flow.id, "ccdf.csv"));
    let latencies: Vec<f64> = flow.latency.values().map(|l| l * 1000.0).collect();
    let mut out = writer(&path)?;
    out.write_record(["Latency (ms)", "CCDF"])?;
    for (latency, p) in ccdf(&latencies) {
        out.write_record([latency.to_string(), p.to_string()])?;
    }
    out.flush()?;
    Ok(path)
}

/// Writes `<flow-id>timeseries.csv` at the plotting interval.
pub fn write_timeseries_csv(dir: &Path, flow: &CorrelatedFlow, interval: f64) -> Result<PathBuf> {
    let path = dir.join(flow_file_name(&flow.id, "timeseries.csv"));
    let series = FlowTimeseries::calculate(flow, interval);
    let mut out = writer(&path)?;
    out.write_record([
        "Time (s)",
        "Ingress Rate (Mbps)",
        "Egress Rate (Mbps)",
        "CE Fraction",
    ])?;
    for i in 0..series.len() {
        out.write_record([
            format!("{:.1}", series.time_s[i]),
            series.ingress_mbps[i].to_string(),
            series.egress_mbps[i].to_string(),
            series.ce_fraction[i].to_string(),
        ])?;
    }
    out.flush()?;
    Ok(path)
}

fn summary_record(row: &SummaryRow) -> Vec<String> {
    let s = &row.stats;
    vec![
        row.flow_number.to_string(),
        row.flow_id.clone(),
        fmt3(s.p0_ms),
        fmt3(s.p90_ms),
        fmt3(s.p99_ms),
        fmt3(s.p99_9_ms),
        fmt3(s.pdv_99_ms),
        fmt3(s.pdv_99_9_ms),
        fmt3(s.mean_mbps),
        fmt3(s.p10_mbps),
        s.p10_percent_of_mean
            .map(|p| format!("{:.1}", p))
            .unwrap_or_else(|| "N/A".to_string()),
        s.ramp_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "N/A".to_string()),
        row.num_packets.to_string(),
        row.not_ect.to_string(),
        row.ect0.to_string(),
        row.ect1.to_string(),
        row.ce.to_string(),
        s.dropped.to_string(),
        s.missing.to_string(),
    ]
}

/// Writes `summary_table_<direction>.csv`.
pub fn write_summary_csv(dir: &Path, summary: &DirectionSummary) -> Result<PathBuf> {
    let path = dir.join(format!("summary_table_{}.csv", summary.direction));
    let mut out = writer(&path)?;
    out.write_record(SUMMARY_HEADERS)?;
    for row in &summary.rows {
        out.write_record(summary_record(row))?;
    }
    out.flush()?;
    Ok(path)
}

/// Writes `aggregate_throughput_<direction>.csv`: per-flow and total egress rate.
pub fn write_aggregate_csv(dir: &Path, summary: &DirectionSummary) -> Result<PathBuf> {
    let path = dir.join(format!("aggregate_throughput_{}.csv", summary.direction));
    let aggregate = &summary.aggregate;
    let mut out = writer(&path)?;

    let mut headers = vec!["Time (s)".to_string()];
    headers.extend(aggregate.flows.iter().map(|(id, _)| format!("{} (Mbps)", id)));
    headers.push("Total (Mbps)".to_string());
    out.write_record(&headers)?;

    for (i, t) in aggregate.time_s.iter().enumerate() {
        let mut record = vec![format!("{:.1}", t)];
        record.extend(aggregate.flows.iter().map(|(_, s)| s[i].to_string()));
        record.push(aggregate.total_mbps[i].to_string());
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(path)
}

/// Writes `interval_stats_<direction>.csv`.
pub fn write_interval_csv(dir: &Path, summary: &DirectionSummary) -> Result<PathBuf> {
    let path = dir.join(format!("interval_stats_{}.csv", summary.direction));
    let mut out = writer(&path)?;
    out.write_record(INTERVAL_HEADERS)?;
    for (id, chunks) in &summary.intervals {
        for c in chunks {
            out.write_record([
                id.clone(),
                c.chunk.to_string(),
                fmt3(c.p0_ms),
                fmt3(c.p90_ms),
                fmt3(c.p99_ms),
                fmt3(c.p99_9_ms),
                fmt3(c.p100_ms),
                fmt3(c.mean_mbps),
            ])?;
        }
    }
    out.flush()?;
    Ok(path)
}

/// Per-flow section of the run report.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub flow_number: usize,
    pub flow_id: String,
    pub packets: u64,
    pub stats: FlowStats,
    pub marking: Vec<MarkingRow>,
}

/// Per-direction section of the run report.
#[derive(Debug, Clone, Serialize)]
pub struct DirectionReport {
    pub direction: Direction,
    pub flows: Vec<FlowReport>,
}

/// Outcome of one `analyze` run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub records: u64,
    pub records_skipped: u64,
    pub flows_seen: usize,
    pub flows_excluded: usize,
    pub nat_joins: usize,
    pub directions: Vec<DirectionReport>,
}

/// JSON-serializable run report
#[derive(Serialize)]
pub struct JsonReport<'a> {
    pub version: &'static str,
    pub name: &'a str,
    pub timestamp: String,
    pub records: u64,
    pub records_skipped: u64,
    pub flows_seen: usize,
    pub flows_excluded: usize,
    pub nat_joins: usize,
    pub directions: &'a [DirectionReport],
}

impl<'a> From<&'a RunReport> for JsonReport<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            version: "1.0",
            name: &report.name,
            timestamp: report.timestamp.to_rfc3339(),
            records: report.records,
            records_skipped: report.records_skipped,
            flows_seen: report.flows_seen,
            flows_excluded: report.flows_excluded,
            nat_joins: report.nat_joins,
            directions: &report.directions,
        }
    }
}

/// Exports a report in the specified format
pub fn export_report(report: &RunReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => export_text(report),
        OutputFormat::Json => export_json(report),
        OutputFormat::JsonLines => export_jsonl(report),
    }
}

/// Exports report as pretty-printed JSON
pub fn export_json(report: &RunReport) -> String {
    let json_report = JsonReport::from(report);
    serde_json::to_string_pretty(&json_report)
        .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Exports report as JSON Lines (one flow per line)
pub fn export_jsonl(report: &RunReport) -> String {
    let mut lines = Vec::new();

    // First line is the summary
    let summary = serde_json::json!({
        "type": "summary",
        "name": report.name,
        "timestamp": report.timestamp.to_rfc3339(),
        "flows_seen": report.flows_seen,
        "flows_excluded": report.flows_excluded,
        "nat_joins": report.nat_joins,
    });
    lines.push(serde_json::to_string(&summary).unwrap_or_default());

    for direction in &report.directions {
        for flow in &direction.flows {
            let line = serde_json::json!({
                "type": "flow",
                "direction": direction.direction,
                "flow": flow,
            });
            if let Ok(line) = serde_json::to_string(&line) {
                lines.push(line);
            }
        }
    }

    lines.join("\n")
}

/// Exports report as formatted text
pub fn export_text(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "--- Latency Report: {} ---\nTime: {}\nRecords: {} ({} skipped)\nFlows: {} seen, {} excluded, {} NAT joins\n",
        report.name,
        report.timestamp.format("%Y-%m-%d %H:%M:%S"),
        report.records,
        report.records_skipped,
        report.flows_seen,
        report.flows_excluded,
        report.nat_joins,
    ));

    for direction in &report.directions {
        output.push_str(&format!(
            "\n{} flows ({}):\n",
            capitalize(&direction.direction.to_string()),
            direction.flows.len()
        ));
        if direction.flows.is_empty() {
            continue;
        }
        output.push_str(&"-".repeat(100));
        output.push('\n');

        for flow in &direction.flows {
            let s = &flow.stats;
            output.push_str(&format!(
                "{:>2}. {} | P99: {:.3}ms | PDV99: {:.3}ms | Rate: {:.1}Mbps | Ramp: {} | Packets: {}\n",
                flow.flow_number,
                flow.flow_id,
                s.p99_ms,
                s.pdv_99_ms,
                s.mean_mbps,
                format_ramp(s.ramp_ms),
                flow.packets,
            ));
            let marking: Vec<String> = flow
                .marking
                .iter()
                .map(|m| format!("{} {} ({})", m.label, m.count, format_share(m.share)))
                .collect();
            output.push_str(&format!("    {}\n", marking.join(", ")));
        }
    }

    output
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Formats a ramp time in a human-readable way
fn format_ramp(ms: Option<u64>) -> String {
    match ms {
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{}ms", ms),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{marking_breakdown, AnalyzerConfig};
    use crate::record::{Ecn, Timestamp};
    use std::collections::BTreeMap;
    use std::fs;

    fn flow() -> CorrelatedFlow {
        let times = [0.0, 0.05, 0.12];
        CorrelatedFlow {
            id: "TCP [10.0.0.1 5000] to [10.0.0.2 80]".to_string(),
            direction: Direction::Downstream,
            latency: times.iter().map(|&t| (Timestamp(t), 0.004)).collect(),
            size: times.iter().map(|&t| (Timestamp(t), 1500)).collect(),
            sanctioned: BTreeMap::new(),
            ce_size: BTreeMap::from([(Timestamp(0.05), 1500)]),
            dscp: BTreeMap::from([(0, 3)]),
            ecn: BTreeMap::from([(Ecn::Ect1, 2), (Ecn::Ce, 1)]),
            matched: 3,
            unmatched: 0,
            dropped: 1,
            dropped_timestamps: vec![0.08],
            unmatched_timestamps: Vec::new(),
        }
    }

    fn report() -> RunReport {
        let f = flow();
        let stats = FlowStats::calculate(&f, &AnalyzerConfig::default());
        RunReport {
            name: "wired-test".to_string(),
            timestamp: Utc::now(),
            records: 10,
            records_skipped: 1,
            flows_seen: 2,
            flows_excluded: 1,
            nat_joins: 0,
            directions: vec![
                DirectionReport {
                    direction: Direction::Upstream,
                    flows: Vec::new(),
                },
                DirectionReport {
                    direction: Direction::Downstream,
                    flows: vec![FlowReport {
                        flow_number: 1,
                        flow_id: f.id.clone(),
                        packets: f.total(),
                        stats,
                        marking: marking_breakdown(&f),
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "jsonl".parse::<OutputFormat>().unwrap(),
            OutputFormat::JsonLines
        );
        assert!("invalid".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_output_format_display() {
        assert_eq!(OutputFormat::Text.to_string(), "text");
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::JsonLines.to_string(), "jsonl");
    }

    #[test]
    fn test_format_ramp() {
        assert_eq!(format_ramp(Some(300)), "300ms");
        assert_eq!(format_ramp(Some(1500)), "1.5s");
        assert_eq!(format_ramp(None), "N/A");
    }

    #[test]
    fn test_latency_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_latency_csv(dir.path(), &flow()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("80]latency.csv"));

        let text = fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Timestamp,Latency,Frame Length"));
        assert_eq!(lines.next(), Some("0,0.004,1500"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn test_summary_csv_columns() {
        let dir = tempfile::tempdir().unwrap();
        let flows = vec![flow()];
        let summary = DirectionSummary::calculate(
            Direction::Downstream,
            &flows,
            &AnalyzerConfig::default(),
        );
        let path = write_summary_csv(dir.path(), &summary).unwrap();
        assert!(path.ends_with("summary_table_downstream.csv"));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, SUMMARY_HEADERS);

        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[0], "1");
        assert_eq!(&row[2], "4.000");
        assert_eq!(&row[12], "4");
        assert_eq!(&row[16], "1");
        assert_eq!(&row[17], "1");
    }

    #[test]
    fn test_direction_tables_written() {
        let dir = tempfile::tempdir().unwrap();
        let flows = vec![flow()];
        let summary =
            DirectionSummary::calculate(Direction::Upstream, &flows, &AnalyzerConfig::default());

        let aggregate = write_aggregate_csv(dir.path(), &summary).unwrap();
        let text = fs::read_to_string(aggregate).unwrap();
        assert!(text.lines().next().unwrap().ends_with("Total (Mbps)"));

        let intervals = write_interval_csv(dir.path(), &summary).unwrap();
        let text = fs::read_to_string(intervals).unwrap();
        assert_eq!(text.lines().count(), 2);

        let f = flow();
        assert!(write_ccdf_csv(dir.path(), &f).unwrap().exists());
        let series = write_timeseries_csv(dir.path(), &f, 0.1).unwrap();
        assert!(fs::read_to_string(series).unwrap().contains("CE Fraction"));
    }

    #[test]
    fn test_export_json_report() {
        let json = export_json(&report());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "wired-test");
        assert_eq!(value["directions"][1]["direction"], "downstream");
        assert_eq!(value["directions"][1]["flows"][0]["packets"], 4);
    }

    #[test]
    fn test_export_jsonl_lines() {
        let jsonl = export_jsonl(&report());
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"summary\""));
        assert!(lines[1].contains("\"flow\""));
    }

    #[test]
    fn test_export_text_report() {
        let text = export_text(&report());
        assert!(text.contains("Latency Report: wired-test"));
        assert!(text.contains("Upstream flows (0)"));
        assert!(text.contains("Downstream flows (1)"));
        assert!(text.contains("Drops 1 (25.00%)"));
    }
}
