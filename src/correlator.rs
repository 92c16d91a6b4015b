//! Dual-capture correlation - joins each flow's packets across the NSI and
//! CMCI vantage points and turns the joins into one-way latency samples.
//!
//! # Matching
//!
//! A single pass over a flow's time-ordered packets keeps one pending queue
//! per fingerprint for each side. When a packet's fingerprint is already
//! pending on the opposite side, the oldest pending entry is consumed and a
//! match is recorded. Latency is always `cmci_ts - nsi_ts`, so a packet that
//! reached the CMCI before the NSI yields a negative sample.
//!
//! # Direction
//!
//! Until the pass is over we cannot tell whether the flow runs downstream
//! (NSI first) or upstream (CMCI first), so every match is recorded twice:
//! keyed by the NSI timestamp with CMCI-side markings, and keyed by the CMCI
//! timestamp with NSI-side markings. The sign of the mean NSI-keyed latency
//! then picks one view; upstream flows have their samples negated.
//!
//! # Edge trimming
//!
//! The two captures never start or stop at exactly the same instant. Leftover
//! packets outside the span between the first and last match are discarded.
//! Leftovers inside that span on the sending side were lost by the device
//! (dropped); leftovers on the receiving side were missed by the sending
//! side's capture (unmatched).

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use crate::classifier::{Flow, FlowPacket};
use crate::fingerprint::Fingerprint;
use crate::record::{insert_unique, Ecn, Timestamp};

/// DSCP value carried by L4S traffic classified as sanctioned.
pub const SANCTIONED_DSCP: u8 = 3;

/// Which way a flow crosses the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Customer side towards network side (CMCI first).
    Upstream,
    /// Network side towards customer side (NSI first).
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream => write!(f, "upstream"),
            Self::Downstream => write!(f, "downstream"),
        }
    }
}

/// What one vantage point saw of a packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub timestamp: f64,
    pub dscp: u8,
    pub ecn: Ecn,
    pub frame_len: u32,
}

impl From<&FlowPacket> for Observation {
    fn from(packet: &FlowPacket) -> Self {
        Self {
            timestamp: packet.timestamp,
            dscp: packet.dscp,
            ecn: packet.ecn,
            frame_len: packet.frame_len,
        }
    }
}

impl Observation {
    fn is_sanctioned(&self) -> bool {
        self.dscp == SANCTIONED_DSCP && matches!(self.ecn, Ecn::Ect1 | Ecn::Ce)
    }
}

/// One packet seen at both vantage points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPair {
    pub fingerprint: Fingerprint,
    pub nsi: Observation,
    pub cmci: Observation,
}

impl MatchedPair {
    /// Signed latency, positive when the NSI saw the packet first.
    pub fn latency(&self) -> f64 {
        self.cmci.timestamp - self.nsi.timestamp
    }
}

/// Pending-match state owned by a single flow's pass.
#[derive(Debug, Default)]
pub struct FlowState {
    pending_nsi: HashMap<Fingerprint, VecDeque<Observation>>,
    pending_cmci: HashMap<Fingerprint, VecDeque<Observation>>,
}

impl FlowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one packet; returns a match if the other side already saw it.
    ///
    /// Repeated fingerprints queue up and are matched in capture order.
    pub fn observe(&mut self, packet: &FlowPacket, on_nsi: bool) -> Option<MatchedPair> {
        let this = Observation::from(packet);
        let (mine, theirs) = if on_nsi {
            (&mut self.pending_nsi, &mut self.pending_cmci)
        } else {
            (&mut self.pending_cmci, &mut self.pending_nsi)
        };

        if let Some(queue) = theirs.get_mut(&packet.fingerprint) {
            if let Some(counterpart) = queue.pop_front() {
                if queue.is_empty() {
                    theirs.remove(&packet.fingerprint);
                }
                let (nsi, cmci) = if on_nsi {
                    (this, counterpart)
                } else {
                    (counterpart, this)
                };
                return Some(MatchedPair {
                    fingerprint: packet.fingerprint,
                    nsi,
                    cmci,
                });
            }
        }

        mine.entry(packet.fingerprint).or_default().push_back(this);
        None
    }

    /// Remaining unmatched timestamps as `(nsi, cmci)`, each sorted.
    pub fn into_leftovers(self) -> (Vec<f64>, Vec<f64>) {
        fn flatten(pending: HashMap<Fingerprint, VecDeque<Observation>>) -> Vec<f64> {
            let mut times: Vec<f64> = pending
                .into_values()
                .flatten()
                .map(|o| o.timestamp)
                .collect();
            times.sort_by(f64::total_cmp);
            times
        }
        (flatten(self.pending_nsi), flatten(self.pending_cmci))
    }
}

/// Per-flow series keyed by one side's timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchoredSeries {
    pub latency: BTreeMap<Timestamp, f64>,
    pub size: BTreeMap<Timestamp, u32>,
    pub sanctioned: BTreeMap<Timestamp, f64>,
    pub ce_size: BTreeMap<Timestamp, u32>,
    pub dscp: BTreeMap<u8, u64>,
    pub ecn: BTreeMap<Ecn, u64>,
}

impl AnchoredSeries {
    /// Records a match keyed by `anchor`, marked with `receiver`'s header.
    fn record(&mut self, anchor: &Observation, receiver: &Observation, latency: f64) {
        let key = insert_unique(&mut self.latency, anchor.timestamp, latency);
        self.size.insert(key, receiver.frame_len);
        if receiver.is_sanctioned() {
            self.sanctioned.insert(key, latency);
        }
        if receiver.ecn == Ecn::Ce {
            self.ce_size.insert(key, receiver.frame_len);
        }
        *self.dscp.entry(receiver.dscp).or_insert(0) += 1;
        *self.ecn.entry(receiver.ecn).or_insert(0) += 1;
    }

    fn negate(&mut self) {
        self.latency.values_mut().for_each(|v| *v = -*v);
        self.sanctioned.values_mut().for_each(|v| *v = -*v);
    }

    /// Anchor-side and receiving-side `(first, last)` match times.
    fn match_span(&self) -> Option<((f64, f64), (f64, f64))> {
        let (first, first_latency) = self.latency.first_key_value()?;
        let (last, last_latency) = self.latency.last_key_value()?;
        Some((
            (first.secs(), last.secs()),
            (first.secs() + first_latency, last.secs() + last_latency),
        ))
    }
}

/// Both candidate views of a flow, before direction is known.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub nsi_anchored: AnchoredSeries,
    pub cmci_anchored: AnchoredSeries,
    pub leftover_nsi: Vec<f64>,
    pub leftover_cmci: Vec<f64>,
    pub seen_nsi: usize,
    pub seen_cmci: usize,
}

impl MatchResult {
    pub fn matches(&self) -> usize {
        self.nsi_anchored.latency.len()
    }

    /// Decides direction from the mean NSI-anchored latency.
    ///
    /// Returns `None` when nothing matched.
    pub fn direction(&self) -> Option<Direction> {
        if self.nsi_anchored.latency.is_empty() {
            return None;
        }
        let mean = self.nsi_anchored.latency.values().mean();
        Some(if mean > 0.0 {
            Direction::Downstream
        } else {
            Direction::Upstream
        })
    }

    /// Resolves into a directed flow with trimmed loss accounting.
    pub fn resolve(self, id: String) -> Option<CorrelatedFlow> {
        let direction = self.direction()?;
        let (mut series, sending, receiving) = match direction {
            Direction::Downstream => (self.nsi_anchored, self.leftover_nsi, self.leftover_cmci),
            Direction::Upstream => (self.cmci_anchored, self.leftover_cmci, self.leftover_nsi),
        };
        if direction == Direction::Upstream {
            series.negate();
        }

        let ((send_lo, send_hi), (recv_lo, recv_hi)) = series.match_span()?;
        let within = |lo: f64, hi: f64| move |t: &f64| *t >= lo && *t <= hi;
        let dropped_timestamps: Vec<f64> =
            sending.into_iter().filter(within(send_lo, send_hi)).collect();
        let unmatched_timestamps: Vec<f64> =
            receiving.into_iter().filter(within(recv_lo, recv_hi)).collect();

        if !unmatched_timestamps.is_empty() {
            debug!(
                "{} Missing packet timestamps: {:?}",
                id, unmatched_timestamps
            );
        }

        Some(CorrelatedFlow {
            id,
            direction,
            matched: series.latency.len() as u64,
            unmatched: unmatched_timestamps.len() as u64,
            dropped: dropped_timestamps.len() as u64,
            latency: series.latency,
            size: series.size,
            sanctioned: series.sanctioned,
            ce_size: series.ce_size,
            dscp: series.dscp,
            ecn: series.ecn,
            dropped_timestamps,
            unmatched_timestamps,
        })
    }
}

/// A flow after correlation, in its resolved direction.
///
/// Latencies are positive seconds keyed by the sending side's timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedFlow {
    pub id: String,
    pub direction: Direction,
    pub latency: BTreeMap<Timestamp, f64>,
    pub size: BTreeMap<Timestamp, u32>,
    pub sanctioned: BTreeMap<Timestamp, f64>,
    pub ce_size: BTreeMap<Timestamp, u32>,
    pub dscp: BTreeMap<u8, u64>,
    pub ecn: BTreeMap<Ecn, u64>,
    pub matched: u64,
    pub unmatched: u64,
    pub dropped: u64,
    pub dropped_timestamps: Vec<f64>,
    pub unmatched_timestamps: Vec<f64>,
}

impl CorrelatedFlow {
    /// Every packet the sending side put on the wire: matched + unmatched + dropped.
    pub fn total(&self) -> u64 {
        self.matched + self.unmatched + self.dropped
    }

    /// Count of packets received with the given ECN codepoint.
    pub fn ecn_count(&self, ecn: Ecn) -> u64 {
        self.ecn.get(&ecn).copied().unwrap_or(0)
    }
}

/// Runs the matching pass over one flow.
pub fn match_flow(flow: &Flow, nsi_interface: &str) -> MatchResult {
    let mut state = FlowState::new();
    let mut result = MatchResult::default();

    for packet in &flow.packets {
        let on_nsi = packet.interface == nsi_interface;
        if on_nsi {
            result.seen_nsi += 1;
        } else {
            result.seen_cmci += 1;
        }

        if let Some(pair) = state.observe(packet, on_nsi) {
            let latency = pair.latency();
            result.nsi_anchored.record(&pair.nsi, &pair.cmci, latency);
            result.cmci_anchored.record(&pair.cmci, &pair.nsi, latency);
        }
    }

    let (leftover_nsi, leftover_cmci) = state.into_leftovers();
    result.leftover_nsi = leftover_nsi;
    result.leftover_cmci = leftover_cmci;
    result
}

/// Correlates one flow; flows with no matches are logged and excluded.
pub fn correlate_flow(flow: &Flow, nsi_interface: &str) -> Option<CorrelatedFlow> {
    let id = flow.key.to_string();
    let result = match_flow(flow, nsi_interface);

    if result.matches() == 0 {
        match (result.seen_nsi, result.seen_cmci) {
            (n, 0) => info!(
                "Flow only captured on NSI interface, not included: {} -- {} pkts",
                id, n
            ),
            (0, n) => info!(
                "Flow only captured on CMCI interface, not included: {} -- {} pkts",
                id, n
            ),
            (n, c) => warn!(
                "Flow has no matching packets across interfaces, not included: {} -- {} NSI / {} CMCI pkts",
                id, n, c
            ),
        }
        return None;
    }

    result.resolve(id)
}

/// Correlated flows partitioned by direction.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub upstream: Vec<CorrelatedFlow>,
    pub downstream: Vec<CorrelatedFlow>,
    pub excluded: usize,
}

impl Correlation {
    /// Files a correlated flow (or an exclusion) under its direction.
    pub fn push(&mut self, flow: Option<CorrelatedFlow>) {
        match flow {
            Some(flow) if flow.direction == Direction::Upstream => self.upstream.push(flow),
            Some(flow) => self.downstream.push(flow),
            None => self.excluded += 1,
        }
    }

    pub fn flows(&self, direction: Direction) -> &[CorrelatedFlow] {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }
}

/// Sequentially correlates every flow.
pub fn correlate_all(flows: &[Flow], nsi_interface: &str) -> Correlation {
    let mut correlation = Correlation::default();
    for flow in flows {
        correlation.push(correlate_flow(flow, nsi_interface));
    }
    correlation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FlowKey, Protocol};

    fn packet(ts: f64, iface: &str, content: &str) -> FlowPacket {
        FlowPacket {
            timestamp: ts,
            interface: iface.to_string(),
            dscp: 0,
            ecn: Ecn::Ect1,
            frame_len: 1000,
            fingerprint: Fingerprint::compute(Protocol::Tcp, content),
        }
    }

    fn flow(mut packets: Vec<FlowPacket>) -> Flow {
        packets.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Flow {
            key: FlowKey::new(
                Protocol::Tcp,
                "10.0.0.1".parse().unwrap(),
                5000,
                "10.0.0.2".parse().unwrap(),
                80,
            ),
            packets,
        }
    }

    /// `n` packets on `first` at 10ms spacing, echoed on `second` after `delay`.
    fn shifted(n: usize, first: &str, second: &str, delay: f64, skip: &[usize]) -> Flow {
        let mut packets = Vec::new();
        for i in 0..n {
            let content = format!("payload{i}");
            let ts = i as f64 * 0.01;
            packets.push(packet(ts, first, &content));
            if !skip.contains(&i) {
                packets.push(packet(ts + delay, second, &content));
            }
        }
        flow(packets)
    }

    #[test]
    fn test_downstream_round_trip() {
        let f = shifted(50, "nsi", "cmci", 0.005, &[]);
        let c = correlate_flow(&f, "nsi").unwrap();

        assert_eq!(c.direction, Direction::Downstream);
        assert_eq!(c.matched, 50);
        assert_eq!((c.unmatched, c.dropped), (0, 0));
        assert!(c.latency.values().all(|l| (l - 0.005).abs() < 1e-9));
        // Keys are NSI timestamps.
        assert_eq!(c.latency.keys().next().unwrap().secs(), 0.0);
    }

    #[test]
    fn test_upstream_sign_flipped() {
        let f = shifted(20, "cmci", "nsi", 0.003, &[]);
        let c = correlate_flow(&f, "nsi").unwrap();

        assert_eq!(c.direction, Direction::Upstream);
        assert!(c.latency.values().all(|l| (l - 0.003).abs() < 1e-9));
        assert_eq!(c.total(), 20);
    }

    #[test]
    fn test_loss_on_receiving_side_is_drop() {
        let f = shifted(10, "nsi", "cmci", 0.002, &[4]);
        let c = correlate_flow(&f, "nsi").unwrap();

        assert_eq!(c.matched, 9);
        assert_eq!(c.dropped, 1);
        assert_eq!(c.unmatched, 0);
        assert_eq!(c.dropped_timestamps, vec![0.04]);
        assert!(!c.latency.contains_key(&Timestamp(0.04)));
    }

    #[test]
    fn test_loss_on_sending_capture_is_unmatched() {
        // The packet reached the CMCI but the NSI capture missed it.
        let mut packets = Vec::new();
        for i in 0..10 {
            let content = format!("payload{i}");
            let ts = i as f64 * 0.01;
            if i != 6 {
                packets.push(packet(ts, "nsi", &content));
            }
            packets.push(packet(ts + 0.002, "cmci", &content));
        }
        let c = correlate_flow(&flow(packets), "nsi").unwrap();

        assert_eq!(c.direction, Direction::Downstream);
        assert_eq!(c.matched, 9);
        assert_eq!(c.unmatched, 1);
        assert_eq!(c.dropped, 0);
        assert_eq!(c.total(), 10);
    }

    #[test]
    fn test_edge_packets_trimmed() {
        // First and last packets exist on one capture only: start/stop skew.
        let f = shifted(10, "nsi", "cmci", 0.002, &[0, 9]);
        let c = correlate_flow(&f, "nsi").unwrap();

        assert_eq!(c.matched, 8);
        assert_eq!(c.dropped, 0);
        assert_eq!(c.unmatched, 0);
    }

    #[test]
    fn test_repeated_fingerprints_match_in_order() {
        let f = flow(vec![
            packet(0.00, "nsi", "same"),
            packet(0.01, "nsi", "same"),
            packet(0.02, "cmci", "same"),
            packet(0.03, "cmci", "same"),
        ]);
        let c = correlate_flow(&f, "nsi").unwrap();

        assert_eq!(c.matched, 2);
        let latencies: Vec<f64> = c.latency.values().copied().collect();
        assert!((latencies[0] - 0.02).abs() < 1e-9);
        assert!((latencies[1] - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_colliding_anchor_timestamps_kept() {
        let f = flow(vec![
            packet(0.0, "nsi", "a"),
            packet(0.0, "nsi", "b"),
            packet(0.01, "cmci", "a"),
            packet(0.02, "cmci", "b"),
        ]);
        let c = correlate_flow(&f, "nsi").unwrap();
        assert_eq!(c.latency.len(), 2);
        assert_eq!(c.size.len(), 2);
    }

    #[test]
    fn test_receiving_side_markings() {
        let mut nsi = packet(0.0, "nsi", "x");
        nsi.ecn = Ecn::Ect1;
        nsi.dscp = 3;
        let mut cmci = packet(0.001, "cmci", "x");
        cmci.ecn = Ecn::Ce;
        cmci.dscp = 3;
        cmci.frame_len = 1200;

        let c = correlate_flow(&flow(vec![nsi, cmci]), "nsi").unwrap();
        assert_eq!(c.ecn_count(Ecn::Ce), 1);
        assert_eq!(c.ecn_count(Ecn::Ect1), 0);
        assert_eq!(c.dscp.get(&3), Some(&1));
        assert_eq!(c.ce_size.values().copied().collect::<Vec<_>>(), vec![1200]);
        assert_eq!(c.sanctioned.len(), 1);
    }

    #[test]
    fn test_single_interface_flow_excluded() {
        let f = flow(vec![packet(0.0, "nsi", "a"), packet(0.1, "nsi", "b")]);
        assert!(correlate_flow(&f, "nsi").is_none());

        let mut correlation = Correlation::default();
        correlation.push(correlate_flow(&f, "nsi"));
        assert_eq!(correlation.excluded, 1);
    }

    #[test]
    fn test_both_candidates_retained() {
        let f = shifted(5, "cmci", "nsi", 0.004, &[]);
        let result = match_flow(&f, "nsi");
        assert_eq!(result.nsi_anchored.latency.len(), 5);
        assert_eq!(result.cmci_anchored.latency.len(), 5);
        assert_eq!(result.direction(), Some(Direction::Upstream));
        assert!(result.nsi_anchored.latency.values().all(|l| *l < 0.0));
    }

    #[test]
    fn test_correlate_all_partitions() {
        let down = shifted(5, "nsi", "cmci", 0.001, &[]);
        let mut up = shifted(5, "cmci", "nsi", 0.001, &[]);
        up.key.src_port = 6000;
        let only = flow(vec![packet(0.0, "cmci", "z")]);

        let correlation = correlate_all(&[down, up, only], "nsi");
        assert_eq!(correlation.downstream.len(), 1);
        assert_eq!(correlation.upstream.len(), 1);
        assert_eq!(correlation.excluded, 1);
    }
}
