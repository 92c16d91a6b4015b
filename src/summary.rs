//! Per-direction summaries: cardinality cap, egress aggregation and summary rows.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::analyzer::{
    egress_sizes, interval_stats, throughput, AnalyzerConfig, FlowStats, IntervalStats,
};
use crate::correlator::{CorrelatedFlow, Direction};
use crate::record::{insert_unique, Ecn};

/// Name of the synthetic flow that absorbs everything past the cap.
pub const OTHER_FLOWS: &str = "other flows";

/// Flows kept individually per direction by default.
pub const MAX_FLOW_PLOTS: usize = 20;

/// Limits how many flows are reported individually.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowCap {
    pub max_flows: usize,
    pub min_packets: u64,
}

impl Default for FlowCap {
    fn default() -> Self {
        Self {
            max_flows: MAX_FLOW_PLOTS,
            min_packets: 0,
        }
    }
}

impl FlowCap {
    /// Keeps the largest flows and merges the rest into [`OTHER_FLOWS`].
    ///
    /// Flows are ranked by total packets, descending; ties keep input order.
    /// A flow is kept only while fewer than `max_flows` are kept and it has
    /// at least `min_packets` packets.
    pub fn apply(&self, mut flows: Vec<CorrelatedFlow>) -> Vec<CorrelatedFlow> {
        flows.sort_by(|a, b| b.total().cmp(&a.total()));

        let kept = flows
            .iter()
            .take(self.max_flows)
            .take_while(|f| f.total() >= self.min_packets)
            .count();
        let rest = flows.split_off(kept);

        if let Some(other) = merge_flows(rest) {
            flows.push(other);
        }
        flows
    }
}

/// Folds flows into one synthetic [`OTHER_FLOWS`] entry.
///
/// Timestamp-keyed maps are unioned with collision perturbation so no sample
/// is lost; histograms and counters are summed.
pub fn merge_flows(flows: Vec<CorrelatedFlow>) -> Option<CorrelatedFlow> {
    let direction = flows.first()?.direction;
    let mut merged = CorrelatedFlow {
        id: OTHER_FLOWS.to_string(),
        direction,
        latency: BTreeMap::new(),
        size: BTreeMap::new(),
        sanctioned: BTreeMap::new(),
        ce_size: BTreeMap::new(),
        dscp: BTreeMap::new(),
        ecn: BTreeMap::new(),
        matched: 0,
        unmatched: 0,
        dropped: 0,
        dropped_timestamps: Vec::new(),
        unmatched_timestamps: Vec::new(),
    };

    let count = flows.len();
    for flow in flows {
        for (ts, latency) in &flow.latency {
            let key = insert_unique(&mut merged.latency, ts.secs(), *latency);
            if let Some(size) = flow.size.get(ts) {
                merged.size.insert(key, *size);
            }
            if let Some(sanctioned) = flow.sanctioned.get(ts) {
                merged.sanctioned.insert(key, *sanctioned);
            }
            if let Some(ce) = flow.ce_size.get(ts) {
                merged.ce_size.insert(key, *ce);
            }
        }
        for (dscp, n) in flow.dscp {
            *merged.dscp.entry(dscp).or_insert(0) += n;
        }
        for (ecn, n) in flow.ecn {
            *merged.ecn.entry(ecn).or_insert(0) += n;
        }
        merged.matched += flow.matched;
        merged.unmatched += flow.unmatched;
        merged.dropped += flow.dropped;
        merged.dropped_timestamps.extend(flow.dropped_timestamps);
        merged.unmatched_timestamps.extend(flow.unmatched_timestamps);
    }
    merged.dropped_timestamps.sort_by(f64::total_cmp);
    merged.unmatched_timestamps.sort_by(f64::total_cmp);

    debug!("Merged {} flows into '{}'", count, OTHER_FLOWS);
    Some(merged)
}

/// One row of `summary_table_<direction>.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub flow_number: usize,
    pub flow_id: String,
    pub stats: FlowStats,
    pub num_packets: u64,
    pub not_ect: u64,
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl SummaryRow {
    pub fn new(flow_number: usize, flow: &CorrelatedFlow, config: &AnalyzerConfig) -> Self {
        Self {
            flow_number,
            flow_id: flow.id.clone(),
            stats: FlowStats::calculate(flow, config),
            num_packets: flow.total(),
            not_ect: flow.ecn_count(Ecn::NotEct),
            ect0: flow.ecn_count(Ecn::Ect0),
            ect1: flow.ecn_count(Ecn::Ect1),
            ce: flow.ecn_count(Ecn::Ce),
        }
    }
}

/// Egress rate of every flow on one shared time axis, plus the total.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSeries {
    pub time_s: Vec<f64>,
    /// `(flow id, Mbps per bucket)`, all the same length as `time_s`.
    pub flows: Vec<(String, Vec<f64>)>,
    pub total_mbps: Vec<f64>,
}

impl AggregateSeries {
    pub fn calculate(flows: &[CorrelatedFlow], interval: f64) -> Self {
        let mut series: Vec<_> = flows
            .iter()
            .map(|flow| (flow.id.clone(), throughput(&egress_sizes(flow), interval)))
            .collect();

        let len = series.iter().map(|(_, t)| t.bps.len()).max().unwrap_or(0);
        let mut total = vec![0.0; len];
        for (_, t) in &mut series {
            t.pad_to(len);
            for (sum, bps) in total.iter_mut().zip(&t.bps) {
                *sum += bps;
            }
        }

        Self {
            time_s: (0..len).map(|i| i as f64 * interval).collect(),
            flows: series
                .into_iter()
                .map(|(id, t)| (id, t.bps.iter().map(|b| b / 1e6).collect()))
                .collect(),
            total_mbps: total.iter().map(|b| b / 1e6).collect(),
        }
    }
}

/// Everything reported for one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionSummary {
    pub direction: Direction,
    pub rows: Vec<SummaryRow>,
    #[serde(skip)]
    pub aggregate: AggregateSeries,
    #[serde(skip)]
    pub intervals: Vec<(String, Vec<IntervalStats>)>,
}

impl DirectionSummary {
    /// Summarizes already-capped flows in their reporting order.
    pub fn calculate(
        direction: Direction,
        flows: &[CorrelatedFlow],
        config: &AnalyzerConfig,
    ) -> Self {
        if flows.is_empty() {
            info!("Zero {} flows found", direction);
        } else {
            info!("{} {} flows to be reported", flows.len(), direction);
            for flow in flows {
                debug!("{} {} pkts", flow.id, flow.total());
            }
        }

        Self {
            direction,
            rows: flows
                .iter()
                .enumerate()
                .map(|(i, flow)| SummaryRow::new(i + 1, flow, config))
                .collect(),
            aggregate: AggregateSeries::calculate(flows, config.plot_interval_secs),
            intervals: flows
                .iter()
                .map(|flow| {
                    (
                        flow.id.clone(),
                        interval_stats(flow, config.chunk_interval_secs),
                    )
                })
                .collect(),
        }
    }
}
