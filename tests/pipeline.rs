//! Reorder → Classify → Correlate → Aggregate through the public API.

use std::io;

use latency_monitor::analyzer::AnalyzerConfig;
use latency_monitor::classifier::{FlowTable, NatPolicy};
use latency_monitor::config::Config;
use latency_monitor::correlator::{correlate_all, Direction};
use latency_monitor::pipeline::{analyze_lines, AnalyzeOptions};
use latency_monitor::record::PacketRecord;
use latency_monitor::reorder::{ReorderedLines, Watermark};
use latency_monitor::summary::{DirectionSummary, FlowCap};

const NSI: &str = "nsi0";
const CMCI: &str = "cmci0";

/// TCP 5000 -> 80 with a per-packet sequence byte so every packet has its own fingerprint.
fn packet_line(ts: f64, iface: &str, src: &str, dst: &str, seq: u8, checksum: &str) -> String {
    format!(
        "{ts:.6} {iface} {src} {dst} 6 0 1 0x{seq:04x} 1000 13880050000000{seq:02x}0000000050180200{checksum}000048656c6c6f"
    )
}

/// NSI sees f0..f4 at 0.0..0.4; CMCI sees the same 50 ms later, minus f2.
fn dual_capture() -> Vec<String> {
    let mut nsi = Vec::new();
    let mut cmci = Vec::new();
    for seq in 0..5u8 {
        let t = seq as f64 * 0.1;
        nsi.push(packet_line(t, NSI, "10.0.0.1", "10.0.0.2", seq, "abcd"));
        if seq != 2 {
            // Checksum rewritten by the device under test.
            cmci.push(packet_line(t + 0.05, CMCI, "10.0.0.1", "10.0.0.2", seq, "1234"));
        }
    }
    // The capture tool emits whole interface batches out of order.
    cmci.into_iter().chain(nsi).collect()
}

fn reordered(lines: Vec<String>) -> Vec<String> {
    ReorderedLines::new(lines.into_iter().map(Ok), Watermark::default())
        .map(|line| line.map(|l| l.text))
        .collect::<io::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn test_end_to_end_downstream_with_one_drop() {
    let ordered = reordered(dual_capture());
    let times: Vec<f64> = ordered
        .iter()
        .map(|l| l.split_whitespace().next().unwrap().parse().unwrap())
        .collect();
    assert!(
        times.windows(2).all(|w| w[0] <= w[1]),
        "reordered output must be time-sorted: {:?}",
        times
    );

    let records = ordered
        .iter()
        .map(|l| l.parse::<PacketRecord>().unwrap());
    let mut table = FlowTable::from_records(records);
    table.reunify_nat_halves(CMCI, &NatPolicy::default());
    assert_eq!(table.len(), 1);

    let correlation = correlate_all(&table.into_flows(), NSI);
    assert!(correlation.upstream.is_empty());
    assert_eq!(correlation.excluded, 0);
    assert_eq!(correlation.downstream.len(), 1);

    let flow = &correlation.downstream[0];
    assert_eq!(flow.direction, Direction::Downstream);
    assert_eq!(flow.matched, 4);
    assert_eq!(flow.dropped, 1);
    assert_eq!(flow.unmatched, 0);
    assert_eq!(flow.total(), 5);
    assert!((flow.dropped_timestamps[0] - 0.2).abs() < 1e-9);
    for latency in flow.latency.values() {
        assert!((latency - 0.05).abs() < 1e-9, "latency {} != 0.05", latency);
    }

    let flows = FlowCap::default().apply(correlation.downstream.clone());
    let summary =
        DirectionSummary::calculate(Direction::Downstream, &flows, &AnalyzerConfig::default());
    let row = &summary.rows[0];
    assert_eq!(row.num_packets, 5);
    assert_eq!(row.ect1, 4);
    assert_eq!(row.stats.dropped, 1);
    assert!((row.stats.p99_ms - 50.0).abs() < 1e-6);
}

#[test]
fn test_end_to_end_upstream_across_nat() {
    // Client 192.168.1.10 is translated to 203.0.113.1 on the network side.
    let mut lines = Vec::new();
    for seq in 0..4u8 {
        let t = 1.0 + seq as f64 * 0.1;
        lines.push(packet_line(t, CMCI, "192.168.1.10", "198.51.100.7", seq, "abcd"));
        lines.push(packet_line(t + 0.02, NSI, "203.0.113.1", "198.51.100.7", seq, "9999"));
    }

    let options = AnalyzeOptions {
        name: "nat".to_string(),
        cmci_interface: CMCI.to_string(),
        nsi_interface: NSI.to_string(),
        output_dir: std::env::temp_dir(),
        reorder: true,
    };
    let analysis = analyze_lines(lines.into_iter().map(Ok), &Config::default(), &options).unwrap();

    assert_eq!(analysis.classify.nat_joins, 1);
    assert_eq!(analysis.flows_seen, 1);
    assert!(analysis.correlation.downstream.is_empty());

    let flow = &analysis.correlation.upstream[0];
    assert_eq!(flow.matched, 4);
    assert_eq!(flow.total(), 4);
    assert!(flow
        .latency
        .values()
        .all(|l| (l - 0.02).abs() < 1e-9));
}

#[test]
fn test_single_sided_flow_excluded() {
    let lines: Vec<String> = (0..3u8)
        .map(|seq| packet_line(seq as f64, NSI, "10.0.0.1", "10.0.0.2", seq, "abcd"))
        .collect();
    let options = AnalyzeOptions {
        name: "one-sided".to_string(),
        cmci_interface: CMCI.to_string(),
        nsi_interface: NSI.to_string(),
        output_dir: std::env::temp_dir(),
        reorder: false,
    };
    let analysis = analyze_lines(lines.into_iter().map(Ok), &Config::default(), &options).unwrap();

    assert_eq!(analysis.flows_seen, 1);
    assert_eq!(analysis.correlation.excluded, 1);
    assert!(analysis.correlation.upstream.is_empty());
    assert!(analysis.correlation.downstream.is_empty());
}
