//! Flow statistics - turns a correlated flow into latency and throughput figures.
//!
//! # Methodology
//!
//! ## Throughput
//! Bytes are bucketed into fixed-width intervals by timestamp:
//! bucket = ⌊t / I⌋, rate = 8 · Σbytes / I bits per second. Buckets between
//! zero and the last observed bucket are zero-filled.
//!
//! ## Percentiles
//! Percentiles use linear interpolation between closest ranks:
//! h = (n − 1) · p / 100, P = x⌊h⌋ + (h − ⌊h⌋) · (x⌈h⌉ − x⌊h⌋).
//!
//! ## Packet delay variation
//! - PDV P99 = P99 − P1
//! - PDV P99.9 = P99.9 − P0.1
//!
//! ## Steady state
//! Mean and P10 of the 1 s throughput series from the first observed bucket
//! (plus the steady-state warm-up) to the last. The ramp time is how long the
//! 100 ms series takes, from its first nonzero bucket, to first reach 90% of
//! the 100 ms mean.

use std::collections::BTreeMap;

use serde::Serialize;
use statrs::statistics::{Data, Distribution};

use crate::correlator::CorrelatedFlow;
use crate::record::{insert_unique, Timestamp};

/// Latency percentiles reported per flow.
pub const LATENCY_PERCENTILES: [f64; 9] = [0.0, 0.1, 1.0, 10.0, 50.0, 90.0, 99.0, 99.9, 100.0];

/// Fraction of the steady-state rate that ends the ramp.
pub const RAMP_THRESHOLD: f64 = 0.9;

/// Configuration for per-flow statistics.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Latency percentiles to report, in percent.
    pub percentiles: Vec<f64>,
    /// Bucket width of the plotting series in seconds.
    pub plot_interval_secs: f64,
    /// Bucket width of the steady-state series in seconds.
    pub steady_interval_secs: f64,
    /// Start-up time excluded from steady-state figures, in seconds.
    pub steady_state_secs: f64,
    /// Chunk width for per-interval latency statistics in seconds.
    pub chunk_interval_secs: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            percentiles: LATENCY_PERCENTILES.to_vec(),
            plot_interval_secs: 0.1,
            steady_interval_secs: 1.0,
            steady_state_secs: 0.0,
            chunk_interval_secs: 1.0,
        }
    }
}

/// Bits-per-second series over fixed-width buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Throughput {
    /// One entry per bucket from 0 to `end`, zero-filled.
    pub bps: Vec<f64>,
    /// First bucket holding any bytes.
    pub start: usize,
    /// Last bucket holding any bytes.
    pub end: usize,
}

impl Throughput {
    pub fn is_empty(&self) -> bool {
        self.bps.is_empty()
    }

    /// Extends with zero buckets up to `len`.
    pub fn pad_to(&mut self, len: usize) {
        if self.bps.len() < len {
            self.bps.resize(len, 0.0);
        }
    }
}

fn bucket(secs: f64, interval: f64) -> usize {
    (secs / interval).floor().max(0.0) as usize
}

/// Buckets packet sizes into `interval`-second bins.
pub fn throughput(sizes: &BTreeMap<Timestamp, u32>, interval: f64) -> Throughput {
    let mut bytes: BTreeMap<usize, f64> = BTreeMap::new();
    for (ts, size) in sizes {
        *bytes.entry(bucket(ts.secs(), interval)).or_insert(0.0) += f64::from(*size);
    }

    let (Some((&start, _)), Some((&end, _))) = (bytes.first_key_value(), bytes.last_key_value())
    else {
        return Throughput::default();
    };

    let mut bps = vec![0.0; end + 1];
    for (index, total) in bytes {
        bps[index] = total * 8.0 / interval;
    }
    Throughput { bps, start, end }
}

/// Linear-interpolated percentile of already sorted values. NaN when empty.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (sorted.len() - 1) as f64 * (p / 100.0).clamp(0.0, 1.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Linear-interpolated percentile of unsorted values.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

fn mean(values: &[f64]) -> f64 {
    Data::new(values.to_vec()).mean().unwrap_or(0.0)
}

/// Complementary CDF: sorted latencies against a probability falling 1 → 0.
pub fn ccdf(latencies: &[f64]) -> Vec<(f64, f64)> {
    let mut sorted = latencies.to_vec();
    sorted.sort_by(f64::total_cmp);
    let steps = sorted.len().saturating_sub(1).max(1) as f64;
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, latency)| (latency, 1.0 - i as f64 / steps))
        .collect()
}

/// Packet sizes re-keyed by egress time (ingress + latency).
pub fn egress_sizes(flow: &CorrelatedFlow) -> BTreeMap<Timestamp, u32> {
    let mut egress = BTreeMap::new();
    for (ingress, size) in &flow.size {
        let latency = flow.latency.get(ingress).copied().unwrap_or(0.0);
        insert_unique(&mut egress, ingress.secs() + latency, *size);
    }
    egress
}

/// Summary statistics for one flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStats {
    /// `(percentile, latency ms)` for every configured percentile.
    pub latency_ms: Vec<(f64, f64)>,
    pub p0_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub p99_9_ms: f64,
    pub pdv_99_ms: f64,
    pub pdv_99_9_ms: f64,
    pub dropped: u64,
    pub missing: u64,
    pub mean_mbps: f64,
    pub p10_mbps: f64,
    /// P10 as a percentage of the mean; `None` when the mean is zero.
    pub p10_percent_of_mean: Option<f64>,
    /// Mean of the plotting-interval series past the warm-up, in Mbps.
    pub plot_mean_mbps: f64,
    /// `None` when the rate never reaches the threshold.
    pub ramp_ms: Option<u64>,
}

impl FlowStats {
    pub fn calculate(flow: &CorrelatedFlow, config: &AnalyzerConfig) -> Self {
        let mut sorted: Vec<f64> = flow.latency.values().map(|l| l * 1000.0).collect();
        sorted.sort_by(f64::total_cmp);
        let at = |p: f64| percentile_sorted(&sorted, p);

        let latency_ms = config.percentiles.iter().map(|&p| (p, at(p))).collect();

        let steady = throughput(&flow.size, config.steady_interval_secs);
        let (mean_bps, p10_bps) = steady_state(&steady, config);
        let plot = throughput(&flow.size, config.plot_interval_secs);
        let plot_bps = plot_mean(&plot, config);

        Self {
            latency_ms,
            p0_ms: at(0.0),
            p90_ms: at(90.0),
            p99_ms: at(99.0),
            p99_9_ms: at(99.9),
            pdv_99_ms: at(99.0) - at(1.0),
            pdv_99_9_ms: at(99.9) - at(0.1),
            dropped: flow.dropped,
            missing: flow.unmatched,
            mean_mbps: mean_bps / 1e6,
            p10_mbps: p10_bps / 1e6,
            p10_percent_of_mean: (mean_bps > 0.0).then(|| 100.0 * p10_bps / mean_bps),
            plot_mean_mbps: plot_bps / 1e6,
            ramp_ms: ramp_time(&plot, plot_bps)
                .map(|buckets| (buckets as f64 * config.plot_interval_secs * 1000.0).round() as u64),
        }
    }
}

/// Mean and P10 of the steady-state series, in bps.
fn steady_state(series: &Throughput, config: &AnalyzerConfig) -> (f64, f64) {
    if series.is_empty() {
        return (0.0, 0.0);
    }
    let skip = bucket(config.steady_state_secs, config.steady_interval_secs);
    let from = series.start + skip;
    if from < series.end {
        let window = &series.bps[from..=series.end];
        (mean(window), percentile(window, 10.0))
    } else {
        (mean(&series.bps), 0.0)
    }
}

/// Mean of a plotting series after the steady-state warm-up, in bps.
pub fn plot_mean(series: &Throughput, config: &AnalyzerConfig) -> f64 {
    let skip = bucket(config.steady_state_secs, config.plot_interval_secs);
    if series.bps.len() > skip {
        mean(&series.bps[skip..])
    } else {
        0.0
    }
}

/// Buckets from the first nonzero one until the rate reaches 90% of `target`.
pub fn ramp_time(series: &Throughput, target: f64) -> Option<usize> {
    let first = series.bps.iter().position(|&b| b > 0.0)?;
    series.bps[first..]
        .iter()
        .position(|&b| b >= RAMP_THRESHOLD * target)
}

/// Latency and rate figures for one fixed-width chunk of a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalStats {
    pub chunk: u64,
    pub p0_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub p99_9_ms: f64,
    pub p100_ms: f64,
    pub mean_mbps: f64,
}

/// Splits a flow into `interval`-second chunks keyed by sending timestamp.
pub fn interval_stats(flow: &CorrelatedFlow, interval: f64) -> Vec<IntervalStats> {
    let mut chunks: BTreeMap<u64, (Vec<f64>, u64)> = BTreeMap::new();
    for (ts, latency) in &flow.latency {
        let chunk = chunks
            .entry(bucket(ts.secs(), interval) as u64)
            .or_default();
        chunk.0.push(latency * 1000.0);
        chunk.1 += u64::from(flow.size.get(ts).copied().unwrap_or(0));
    }

    chunks
        .into_iter()
        .map(|(chunk, (mut latencies, bytes))| {
            latencies.sort_by(f64::total_cmp);
            IntervalStats {
                chunk,
                p0_ms: percentile_sorted(&latencies, 0.0),
                p90_ms: percentile_sorted(&latencies, 90.0),
                p99_ms: percentile_sorted(&latencies, 99.0),
                p99_9_ms: percentile_sorted(&latencies, 99.9),
                p100_ms: percentile_sorted(&latencies, 100.0),
                mean_mbps: 8.0 * bytes as f64 / interval / 1e6,
            }
        })
        .collect()
}

/// Ingress rate, egress rate and CE-marked byte fraction per bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowTimeseries {
    pub time_s: Vec<f64>,
    pub ingress_mbps: Vec<f64>,
    pub egress_mbps: Vec<f64>,
    pub ce_fraction: Vec<f64>,
}

impl FlowTimeseries {
    pub fn calculate(flow: &CorrelatedFlow, interval: f64) -> Self {
        let mut ingress = throughput(&flow.size, interval);
        let mut egress = throughput(&egress_sizes(flow), interval);
        // CE sizes are keyed by ingress time, so compare against ingress bytes.
        let mut ce = throughput(&flow.ce_size, interval);

        let len = ingress.bps.len().max(egress.bps.len());
        ingress.pad_to(len);
        egress.pad_to(len);
        ce.pad_to(len);

        Self {
            time_s: (0..len).map(|i| i as f64 * interval).collect(),
            ingress_mbps: ingress.bps.iter().map(|b| b / 1e6).collect(),
            egress_mbps: egress.bps.iter().map(|b| b / 1e6).collect(),
            ce_fraction: ce
                .bps
                .iter()
                .zip(&ingress.bps)
                .map(|(ce, total)| if *total > 0.0 { ce / total } else { 0.0 })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.time_s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_s.is_empty()
    }
}

/// One line of a flow's packet-count breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkingRow {
    pub label: String,
    pub count: u64,
    /// Share of all packets in percent; `None` when the flow has no packets.
    pub share: Option<f64>,
}

/// DSCP and ECN histograms followed by drops, missing and total.
pub fn marking_breakdown(flow: &CorrelatedFlow) -> Vec<MarkingRow> {
    let total = flow.total();
    let row = |label: String, count: u64| MarkingRow {
        label,
        count,
        share: (total > 0).then(|| 100.0 * count as f64 / total as f64),
    };

    let mut rows: Vec<MarkingRow> = flow
        .dscp
        .iter()
        .map(|(dscp, count)| row(format!("DSCP {}", dscp), *count))
        .collect();
    rows.extend(
        flow.ecn
            .iter()
            .map(|(ecn, count)| row(ecn.label().to_string(), *count)),
    );
    rows.push(row("Drops".to_string(), flow.dropped));
    rows.push(row("Missing".to_string(), flow.unmatched));
    rows.push(row("Total".to_string(), total));
    rows
}

/// Formats a guarded percentage, or `N/A`.
pub fn format_share(share: Option<f64>) -> String {
    match share {
        Some(share) => format!("{:.2}%", share),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::Direction;
    use crate::record::Ecn;

    fn sizes(entries: &[(f64, u32)]) -> BTreeMap<Timestamp, u32> {
        entries.iter().map(|&(t, s)| (Timestamp(t), s)).collect()
    }

    fn flow(latencies: &[(f64, f64)], size: u32) -> CorrelatedFlow {
        CorrelatedFlow {
            id: "TCP [10.0.0.1 5000] to [10.0.0.2 80]".to_string(),
            direction: Direction::Downstream,
            latency: latencies.iter().map(|&(t, l)| (Timestamp(t), l)).collect(),
            size: latencies.iter().map(|&(t, _)| (Timestamp(t), size)).collect(),
            sanctioned: BTreeMap::new(),
            ce_size: BTreeMap::new(),
            dscp: BTreeMap::from([(0, latencies.len() as u64)]),
            ecn: BTreeMap::from([(Ecn::Ect1, latencies.len() as u64)]),
            matched: latencies.len() as u64,
            unmatched: 0,
            dropped: 0,
            dropped_timestamps: Vec::new(),
            unmatched_timestamps: Vec::new(),
        }
    }

    #[test]
    fn test_single_packet_throughput() {
        let t = throughput(&sizes(&[(2.35, 1500)]), 0.1);
        assert_eq!(t.bps.len(), 24);
        assert_eq!(t.start, 23);
        assert_eq!(t.end, 23);
        assert!(t.bps[..23].iter().all(|b| *b == 0.0));
        assert!((t.bps[23] - 8.0 * 1500.0 / 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_throughput_sums_within_bucket() {
        let t = throughput(&sizes(&[(0.0, 100), (0.5, 100), (1.2, 50)]), 1.0);
        assert_eq!(t.bps, vec![1600.0, 400.0]);
        assert_eq!((t.start, t.end), (0, 1));
    }

    #[test]
    fn test_throughput_empty() {
        let t = throughput(&BTreeMap::new(), 1.0);
        assert!(t.is_empty());
    }

    #[test]
    fn test_percentile_uniform() {
        let values: Vec<f64> = (0..1000).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.0), 0.0);
        assert_eq!(percentile(&values, 100.0), 999.0);
        assert!((percentile(&values, 50.0) - 499.5).abs() < 1e-9);
        assert!((percentile(&values, 99.0) - 989.01).abs() < 1e-9);
        assert!((percentile(&values, 99.9) - 998.001).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_empty_is_nan() {
        assert!(percentile(&[], 50.0).is_nan());
    }

    #[test]
    fn test_stats_uniform_latency_pdv() {
        let latencies: Vec<(f64, f64)> = (0..1000)
            .map(|i| (i as f64 * 0.001, i as f64 / 1000.0))
            .collect();
        let stats = FlowStats::calculate(&flow(&latencies, 100), &AnalyzerConfig::default());

        assert!((stats.p0_ms - 0.0).abs() < 1e-9);
        assert!((stats.p99_ms - 989.01).abs() < 1e-6);
        // P99 - P1 = 989.01 - 9.99
        assert!((stats.pdv_99_ms - 979.02).abs() < 1e-6);
        assert_eq!(stats.latency_ms.len(), LATENCY_PERCENTILES.len());
        assert!((stats.latency_ms[8].1 - 999.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_constant_rate() {
        // 128 packets/s of 1000 bytes for 5 s: 1.024 Mbps.
        let latencies: Vec<(f64, f64)> = (0..640).map(|i| (i as f64 / 128.0, 0.005)).collect();
        let stats = FlowStats::calculate(&flow(&latencies, 1000), &AnalyzerConfig::default());

        assert!((stats.mean_mbps - 1.024).abs() < 1e-9, "mean {}", stats.mean_mbps);
        assert!((stats.p10_mbps - 1.024).abs() < 1e-9);
        assert!((stats.p10_percent_of_mean.unwrap() - 100.0).abs() < 1e-6);
        assert_eq!(stats.ramp_ms, Some(0));
    }

    #[test]
    fn test_ramp_time_counts_from_first_nonzero() {
        let series = Throughput {
            bps: vec![0.0, 0.0, 10.0, 50.0, 95.0, 100.0],
            start: 2,
            end: 5,
        };
        assert_eq!(ramp_time(&series, 100.0), Some(2));
        assert_eq!(ramp_time(&series, 1000.0), None);
        assert_eq!(ramp_time(&Throughput::default(), 1.0), None);
    }

    #[test]
    fn test_p10_percent_guarded() {
        let stats = FlowStats::calculate(&flow(&[], 100), &AnalyzerConfig::default());
        assert_eq!(stats.p10_percent_of_mean, None);
        assert_eq!(stats.mean_mbps, 0.0);
        assert!(stats.p0_ms.is_nan());
    }

    #[test]
    fn test_ccdf_shape() {
        let points = ccdf(&[0.3, 0.1, 0.2]);
        assert_eq!(points, vec![(0.1, 1.0), (0.2, 0.5), (0.3, 0.0)]);
        assert_eq!(ccdf(&[0.4]), vec![(0.4, 1.0)]);
    }

    #[test]
    fn test_egress_shift_resolves_collisions() {
        // Two packets arriving at different times but leaving together.
        let f = flow(&[(0.0, 0.02), (0.01, 0.01)], 100);
        let egress = egress_sizes(&f);
        assert_eq!(egress.len(), 2);
        assert!(egress.keys().all(|k| (k.secs() - 0.02).abs() < 1e-9));
    }

    #[test]
    fn test_interval_stats_chunks() {
        let latencies: Vec<(f64, f64)> = (0..20).map(|i| (i as f64 * 0.1, 0.001 * i as f64)).collect();
        let chunks = interval_stats(&flow(&latencies, 125), 1.0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk, 0);
        // 10 packets x 125 bytes x 8 bits in one second.
        assert!((chunks[0].mean_mbps - 0.01).abs() < 1e-12);
        assert!((chunks[1].p0_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeseries_ce_fraction() {
        let mut f = flow(&[(0.0, 0.001), (0.05, 0.001), (0.15, 0.001)], 100);
        f.ce_size.insert(Timestamp(0.05), 100);
        let series = FlowTimeseries::calculate(&f, 0.1);

        assert_eq!(series.len(), 2);
        assert!((series.ce_fraction[0] - 0.5).abs() < 1e-9);
        assert_eq!(series.ce_fraction[1], 0.0);
        assert_eq!(series.ingress_mbps.len(), series.egress_mbps.len());
    }

    #[test]
    fn test_marking_breakdown_rows() {
        let mut f = flow(&[(0.0, 0.001), (0.1, 0.001), (0.2, 0.001)], 100);
        f.dropped = 1;
        let rows = marking_breakdown(&f);

        let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["DSCP 0", "ECT1", "Drops", "Missing", "Total"]);
        assert_eq!(rows[4].count, 4);
        assert_eq!(format_share(rows[2].share), "25.00%");
    }

    #[test]
    fn test_marking_breakdown_empty_flow_is_na() {
        let rows = marking_breakdown(&flow(&[], 100));
        assert!(rows.iter().all(|r| r.share.is_none()));
        assert_eq!(format_share(rows[0].share), "N/A");
    }
}
