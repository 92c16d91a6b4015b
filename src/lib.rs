//! latency-monitor: per-flow one-way latency from two packet captures.
//!
//! Packets are observed on a network-side interface (NSI) and a customer-side
//! interface (CMCI) around a device under test. Matching the same packet on
//! both sides gives its transit latency; packets seen on only one side are
//! drops or missing captures.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │ Reorderer │──>│ Classifier │──>│ Correlator │──>│ Aggregator │──> CSV / report
//! │ (k-merge) │   │ (+NAT join)│   │ (per flow) │   │ (per dir.) │
//! └───────────┘   └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! Repeated runs are reduced with [`combine`]; long captures can be cut into
//! chunks with [`split`].

pub mod analyzer;
pub mod classifier;
pub mod combine;
pub mod config;
pub mod correlator;
pub mod error;
pub mod export;
pub mod fingerprint;
pub mod pipeline;
pub mod record;
pub mod reorder;
pub mod split;
pub mod summary;
