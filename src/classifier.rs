//! Flow classification and NAT-half reunification.
//!
//! Ordered packet records are grouped by [`FlowKey`]. Each packet keeps only
//! what correlation needs: timestamp, interface, DSCP/ECN, frame length and
//! its checksum-invariant [`Fingerprint`].
//!
//! A device performing NAT rewrites addresses and ports, so one logical flow
//! shows up as two keys, each seen on a single interface. After all input is
//! classified, [`FlowTable::reunify_nat_halves`] joins such halves:
//!
//! - anchors are single-interface flows seen on the designated interface
//! - a candidate is any unclaimed single-interface flow seen on a different
//!   interface with the same protocol and the same source OR destination
//!   address
//! - keys are traversed in sorted order and the first match wins; both
//!   halves are then claimed and never matched again
//!
//! Port correspondence and packet-count similarity are not checked unless
//! enabled in [`NatPolicy`]. With both off, two unrelated flows that share a
//! server address can be merged; that is an accepted risk of the heuristic.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace};

use crate::fingerprint::Fingerprint;
use crate::record::{Ecn, FlowKey, PacketRecord};

/// Per-packet data retained for correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowPacket {
    pub timestamp: f64,
    pub interface: String,
    pub dscp: u8,
    pub ecn: Ecn,
    pub frame_len: u32,
    pub fingerprint: Fingerprint,
}

/// All packets observed for one flow key, in timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub key: FlowKey,
    pub packets: Vec<FlowPacket>,
}

impl Flow {
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            packets: Vec::new(),
        }
    }

    /// Distinct interfaces this flow was captured on.
    pub fn interfaces(&self) -> BTreeSet<&str> {
        self.packets.iter().map(|p| p.interface.as_str()).collect()
    }

    /// The interface name if every packet was seen on the same one.
    pub fn single_interface(&self) -> Option<&str> {
        let first = self.packets.first()?.interface.as_str();
        self.packets
            .iter()
            .all(|p| p.interface == first)
            .then_some(first)
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    fn absorb(&mut self, other: Flow) {
        self.packets.extend(other.packets);
        self.packets
            .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    }
}

/// Optional checks that tighten NAT reunification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NatPolicy {
    /// Require the matching endpoint to also share its port.
    pub match_ports: bool,
    /// Reject pairs whose packet counts differ by more than this.
    pub max_packet_delta: Option<usize>,
}

impl NatPolicy {
    fn accepts(&self, anchor: &Flow, candidate: &Flow) -> bool {
        let a = &anchor.key;
        let b = &candidate.key;
        if a.protocol != b.protocol {
            return false;
        }

        let same_src = a.src_addr == b.src_addr && (!self.match_ports || a.src_port == b.src_port);
        let same_dst = a.dst_addr == b.dst_addr && (!self.match_ports || a.dst_port == b.dst_port);
        if !(same_src || same_dst) {
            return false;
        }

        match self.max_packet_delta {
            Some(delta) => anchor.packet_count().abs_diff(candidate.packet_count()) <= delta,
            None => true,
        }
    }
}

/// Classification counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    pub records: u64,
    pub skipped: u64,
    pub nat_joins: usize,
}

/// Flows keyed by identity, built from an ordered record stream.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: BTreeMap<FlowKey, Flow>,
    stats: ClassifyStats,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies every record; records without recoverable ports are skipped.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = PacketRecord>,
    {
        let mut table = Self::new();
        for record in records {
            table.ingest(&record);
        }
        table
    }

    /// Adds one record to its flow.
    ///
    /// Returns `false` (and counts a skip) when no flow key can be recovered.
    pub fn ingest(&mut self, record: &PacketRecord) -> bool {
        let key = match FlowKey::from_record(record) {
            Ok(key) => key,
            Err(e) => {
                trace!("Skipping record at {}: {}", record.timestamp, e);
                self.stats.skipped += 1;
                return false;
            }
        };
        self.stats.records += 1;

        let packet = FlowPacket {
            timestamp: record.timestamp,
            interface: record.interface.clone(),
            dscp: record.dscp,
            ecn: record.ecn,
            frame_len: record.frame_len,
            fingerprint: Fingerprint::compute(record.protocol, &record.payload),
        };
        self.flows
            .entry(key.clone())
            .or_insert_with(|| Flow::new(key))
            .packets
            .push(packet);
        true
    }

    /// Counts a line that never became a record.
    pub fn note_skipped(&mut self) {
        self.stats.skipped += 1;
    }

    /// Joins NAT-split flow halves anchored on `anchor_interface`.
    ///
    /// Returns the number of joins performed.
    pub fn reunify_nat_halves(&mut self, anchor_interface: &str, policy: &NatPolicy) -> usize {
        let single: Vec<(FlowKey, String)> = self
            .flows
            .iter()
            .filter_map(|(key, flow)| {
                flow.single_interface()
                    .map(|iface| (key.clone(), iface.to_string()))
            })
            .collect();

        let mut claimed: BTreeSet<FlowKey> = BTreeSet::new();
        let mut joins = 0;

        for (anchor_key, anchor_iface) in &single {
            if anchor_iface != anchor_interface || claimed.contains(anchor_key) {
                continue;
            }

            let partner = single.iter().find(|(key, iface)| {
                key != anchor_key
                    && iface != anchor_iface
                    && !claimed.contains(key)
                    && policy.accepts(&self.flows[anchor_key], &self.flows[key])
            });

            let Some((partner_key, partner_iface)) = partner else {
                continue;
            };
            let Some(half) = self.flows.remove(partner_key) else {
                continue;
            };

            if let Some(anchor) = self.flows.get_mut(anchor_key) {
                info!(
                    "NAT detected: joining {} {} {}pkts and {} {} {}pkts",
                    anchor_key,
                    anchor_iface,
                    anchor.packet_count(),
                    partner_key,
                    partner_iface,
                    half.packet_count()
                );
                anchor.absorb(half);
            }
            claimed.insert(anchor_key.clone());
            claimed.insert(partner_key.clone());
            joins += 1;
        }

        self.stats.nat_joins += joins;
        debug!("NAT reunification performed {} joins", joins);
        joins
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn stats(&self) -> &ClassifyStats {
        &self.stats
    }

    /// Consumes the table, yielding flows in key order.
    pub fn into_flows(self) -> Vec<Flow> {
        info!("{} flows found", self.flows.len());
        self.flows.into_values().collect()
    }
}
