//! Chronological reordering of multi-interface capture output.
//!
//! When several interfaces are captured into one stream, the capture tool
//! writes each interface's packets in order but interleaves interfaces
//! arbitrarily. This module restores a global time order with an
//! incremental k-way merge: one FIFO per interface, and the head with the
//! smallest timestamp is released whenever the watermark policy allows it.
//!
//! Memory is bounded by how far the interfaces drift apart, not by capture
//! length.
//!
//! # Ordering caveat
//!
//! Interfaces are discovered as their first line arrives. Under the default
//! line-count watermark, output order can only be violated if an interface's
//! very first record arrives after the warm-up has elapsed.

use std::collections::VecDeque;
use std::io;

use tracing::{debug, trace};

use crate::record::{parse_timestamp, FIELD_COUNT};

/// Lines read before the line-count watermark starts releasing records.
pub const WARMUP_LINES: usize = 1000;

/// When buffered records may be released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Watermark {
    /// Merge once more than `n` lines have been read, and only while every
    /// known interface has a buffered record.
    LineCount(usize),
    /// Release a head record once the newest timestamp seen anywhere is more
    /// than this many seconds ahead of it, even if another FIFO is empty.
    MaxLateness(f64),
}

impl Default for Watermark {
    fn default() -> Self {
        Self::LineCount(WARMUP_LINES)
    }
}

/// A packet line tagged with the fields needed for ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedLine {
    pub timestamp: f64,
    pub interface: String,
    pub text: String,
}

impl TimedLine {
    /// Parses the ordering fields; lines under 10 fields are rejected.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let timestamp = parse_timestamp(fields.next()?).ok()?;
        let interface = fields.next()?.to_string();
        if fields.count() + 2 < FIELD_COUNT {
            return None;
        }
        Some(Self {
            timestamp,
            interface,
            text: line.trim().to_string(),
        })
    }
}

/// Counters kept by the reorderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub lines_read: usize,
    pub lines_skipped: usize,
    pub lines_emitted: usize,
    pub interfaces: usize,
}

/// Per-interface FIFOs merged incrementally.
#[derive(Debug)]
pub struct Reorderer {
    watermark: Watermark,
    /// Interfaces in discovery order; ties go to the earlier one.
    buffers: Vec<(String, VecDeque<TimedLine>)>,
    newest: f64,
    flushing: bool,
    stats: ReorderStats,
}

impl Reorderer {
    pub fn new(watermark: Watermark) -> Self {
        Self {
            watermark,
            buffers: Vec::new(),
            newest: f64::NEG_INFINITY,
            flushing: false,
            stats: ReorderStats::default(),
        }
    }

    /// Accepts one raw input line. Malformed lines are dropped silently.
    pub fn push_line(&mut self, line: &str) {
        self.stats.lines_read += 1;
        match TimedLine::parse(line) {
            Some(timed) => self.push(timed),
            None => {
                if !line.trim().is_empty() {
                    trace!("Skipping malformed line: {}", line.trim());
                }
                self.stats.lines_skipped += 1;
            }
        }
    }

    fn push(&mut self, timed: TimedLine) {
        self.newest = self.newest.max(timed.timestamp);
        match self
            .buffers
            .iter_mut()
            .find(|(name, _)| *name == timed.interface)
        {
            Some((_, fifo)) => fifo.push_back(timed),
            None => {
                debug!(
                    "Discovered interface '{}' after {} lines",
                    timed.interface, self.stats.lines_read
                );
                let name = timed.interface.clone();
                self.buffers.push((name, VecDeque::from([timed])));
                self.stats.interfaces = self.buffers.len();
            }
        }
    }

    /// Marks end of input; every remaining record becomes releasable.
    pub fn finish(&mut self) {
        self.flushing = true;
    }

    /// Pops the next record if the watermark allows it.
    pub fn pop_ready(&mut self) -> Option<TimedLine> {
        let index = self.lowest_head()?;
        let releasable = if self.flushing {
            true
        } else {
            match self.watermark {
                Watermark::LineCount(warmup) => {
                    self.stats.lines_read > warmup
                        && self.buffers.iter().all(|(_, fifo)| !fifo.is_empty())
                }
                Watermark::MaxLateness(lateness) => {
                    let head = self.buffers[index].1.front()?.timestamp;
                    self.newest - head > lateness
                }
            }
        };

        if !releasable {
            return None;
        }
        self.stats.lines_emitted += 1;
        self.buffers[index].1.pop_front()
    }

    /// Number of records currently buffered across all interfaces.
    pub fn buffered(&self) -> usize {
        self.buffers.iter().map(|(_, fifo)| fifo.len()).sum()
    }

    pub fn stats(&self) -> &ReorderStats {
        &self.stats
    }

    fn lowest_head(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, (_, fifo)) in self.buffers.iter().enumerate() {
            if let Some(head) = fifo.front() {
                if best.map_or(true, |(_, ts)| head.timestamp < ts) {
                    best = Some((index, head.timestamp));
                }
            }
        }
        best.map(|(index, _)| index)
    }
}

/// Pull-based adapter: reorders lines from `source` lazily.
pub struct ReorderedLines<I> {
    source: I,
    reorderer: Reorderer,
    exhausted: bool,
}

impl<I> ReorderedLines<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    pub fn new(source: I, watermark: Watermark) -> Self {
        Self {
            source,
            reorderer: Reorderer::new(watermark),
            exhausted: false,
        }
    }

    pub fn stats(&self) -> &ReorderStats {
        self.reorderer.stats()
    }
}

impl<I> Iterator for ReorderedLines<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = io::Result<TimedLine>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ready) = self.reorderer.pop_ready() {
                return Some(Ok(ready));
            }
            if self.exhausted {
                return None;
            }
            match self.source.next() {
                Some(Ok(line)) => self.reorderer.push_line(&line),
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.exhausted = true;
                    self.reorderer.finish();
                }
            }
        }
    }
}
