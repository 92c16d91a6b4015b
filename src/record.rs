//! Packet records - the field-extracted view of one captured frame.
//!
//! Input lines are produced by the capture tool as whitespace-delimited
//! tuples in a fixed order:
//!
//! ```text
//! time_relative  interface  ip.src  ip.dst  ip.proto  dscp  ecn  ip.id  frame.len  payload
//! ```
//!
//! The payload is a hex dump whose first 8 characters hold the transport
//! source and destination ports for TCP/UDP.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::net::IpAddr;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ParseError;

/// Number of whitespace-delimited fields in a packet line.
pub const FIELD_COUNT: usize = 10;

/// Payload characters retained for fingerprinting and port recovery.
pub const PAYLOAD_PREFIX_CHARS: usize = 120;

/// Offset applied when two samples land on the same timestamp key.
pub const COLLISION_EPSILON: f64 = 1e-10;

/// A capture timestamp usable as an ordered map key.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Timestamp(pub f64);

impl Timestamp {
    pub fn secs(self) -> f64 {
        self.0
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for Timestamp {
    fn from(secs: f64) -> Self {
        Self(secs)
    }
}

/// Inserts `value` at `at`, nudging the key forward until it is unused.
///
/// Returns the key actually used. Keys stay strictly ordered, so two packets
/// sharing a capture timestamp both survive.
pub fn insert_unique<V>(map: &mut BTreeMap<Timestamp, V>, at: f64, value: V) -> Timestamp {
    let mut key = at;
    while map.contains_key(&Timestamp(key)) {
        let nudged = key + COLLISION_EPSILON;
        key = if nudged > key { nudged } else { key.next_up() };
    }
    map.insert(Timestamp(key), value);
    Timestamp(key)
}

/// IP protocol carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Unknown(u8),
}

impl Protocol {
    pub fn from_number(number: u8) -> Self {
        match number {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Unknown(_) => write!(f, "UNK"),
        }
    }
}

/// ECN codepoint from the IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Ecn {
    NotEct,
    Ect1,
    Ect0,
    Ce,
}

impl Ecn {
    pub fn from_codepoint(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::NotEct),
            1 => Ok(Self::Ect1),
            2 => Ok(Self::Ect0),
            3 => Ok(Self::Ce),
            other => Err(ParseError::EcnOutOfRange(other)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NotEct => "Not ECT",
            Self::Ect1 => "ECT1",
            Self::Ect0 => "ECT0",
            Self::Ce => "CE",
        }
    }
}

/// One packet observation at one vantage point.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub timestamp: f64,
    pub interface: String,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: Protocol,
    pub dscp: u8,
    pub ecn: Ecn,
    pub ip_id: String,
    pub frame_len: u32,
    /// Leading hex characters of the IP payload.
    pub payload: String,
}

impl PacketRecord {
    /// Parses a packet line, keeping at most `prefix_chars` payload characters.
    pub fn parse(line: &str, prefix_chars: usize) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < FIELD_COUNT {
            return Err(ParseError::TooFewFields {
                count: fields.len(),
                expected: FIELD_COUNT,
            });
        }

        let timestamp = parse_timestamp(fields[0])?;
        let src_addr = parse_addr("source", fields[2])?;
        let dst_addr = parse_addr("destination", fields[3])?;
        let protocol = Protocol::from_number(parse_number("protocol", fields[4])?);

        let dscp: u8 = parse_number("dscp", fields[5])?;
        if dscp > 63 {
            return Err(ParseError::DscpOutOfRange(dscp));
        }
        let ecn = Ecn::from_codepoint(parse_number("ecn", fields[6])?)?;
        let frame_len = parse_number("frame length", fields[8])?;

        // The payload is the last field; anything between is tool noise.
        let payload = fields[fields.len() - 1];
        let payload = match payload.char_indices().nth(prefix_chars) {
            Some((cut, _)) => &payload[..cut],
            None => payload,
        };

        Ok(Self {
            timestamp,
            interface: fields[1].to_string(),
            src_addr,
            dst_addr,
            protocol,
            dscp,
            ecn,
            ip_id: fields[7].to_string(),
            frame_len,
            payload: payload.to_string(),
        })
    }
}

impl FromStr for PacketRecord {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::parse(line, PAYLOAD_PREFIX_CHARS)
    }
}

/// Parses the leading timestamp field of a packet line.
pub fn parse_timestamp(field: &str) -> Result<f64, ParseError> {
    field
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| ParseError::InvalidTimestamp(field.to_string()))
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_addr(field: &'static str, value: &str) -> Result<IpAddr, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

/// Identity of a flow, recovered heuristically from the packet payload.
///
/// Ports come from the payload dump rather than a decoded transport header,
/// so two distinct flows can collide if the payload is not what we expect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(
        protocol: Protocol,
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
        }
    }

    /// Builds the key for a record. ICMP has no ports and uses 0/0.
    pub fn from_record(record: &PacketRecord) -> Result<Self, ParseError> {
        let (src_port, dst_port) = match record.protocol {
            Protocol::Icmp => (0, 0),
            _ => recover_ports(&record.payload)?,
        };
        Ok(Self::new(
            record.protocol,
            record.src_addr,
            src_port,
            record.dst_addr,
            dst_port,
        ))
    }

    /// Returns a display-friendly string representation.
    pub fn display(&self) -> String {
        format!(
            "{} [{} {}] to [{} {}]",
            self.protocol, self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Splits a reader into lines, replacing invalid UTF-8 instead of failing.
///
/// Trailing `\r` is stripped. Only genuine I/O failures surface as errors.
pub fn lossy_lines<R: BufRead>(reader: R) -> impl Iterator<Item = io::Result<String>> {
    reader.split(b'\n').map(|line| {
        line.map(|mut bytes| {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

/// Reads two big-endian 16-bit ports from the first 8 hex characters.
pub fn recover_ports(payload: &str) -> Result<(u16, u16), ParseError> {
    let invalid = || ParseError::InvalidPorts(payload.chars().take(8).collect());
    let prefix = payload
        .get(..8)
        .filter(|p| p.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(invalid)?;
    let src = u16::from_str_radix(&prefix[..4], 16).map_err(|_| invalid())?;
    let dst = u16::from_str_radix(&prefix[4..], 16).map_err(|_| invalid())?;
    Ok((src, dst))
}
