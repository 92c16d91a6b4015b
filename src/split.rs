//! Splits a time-ordered capture into fixed-duration chunk files.
//!
//! Line `t` goes to `<prefix><NNNNN>` where `NNNNN = ⌊t / duration⌋`, zero
//! padded to five digits. Input is expected to be time-ordered; the current
//! chunk file is closed as soon as a line for another chunk arrives.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, info, trace};

use crate::error::Result;
use crate::record::{lossy_lines, parse_timestamp};

/// Counters reported after a split.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitStats {
    pub lines_written: usize,
    pub lines_skipped: usize,
    pub files: Vec<PathBuf>,
}

/// Chunk file path for `index`.
pub fn chunk_path(prefix: &str, index: u64) -> PathBuf {
    PathBuf::from(format!("{}{:05}", prefix, index))
}

/// Writes each input line to its chunk file.
pub fn split_lines<R: BufRead>(input: R, duration: f64, prefix: &str) -> Result<SplitStats> {
    anyhow::ensure!(
        duration > 0.0 && duration.is_finite(),
        "Split duration must be positive, got {}",
        duration
    );

    let mut stats = SplitStats::default();
    let mut current: Option<(u64, BufWriter<File>)> = None;

    for line in lossy_lines(input) {
        let line = line.context("Failed to read input line")?;
        let Some(timestamp) = line
            .split_whitespace()
            .next()
            .and_then(|field| parse_timestamp(field).ok())
        else {
            trace!("Skipping line without timestamp: {}", line);
            stats.lines_skipped += 1;
            continue;
        };

        let index = (timestamp / duration).floor().max(0.0) as u64;
        if !matches!(&current, Some((open, _)) if *open == index) {
            if let Some((_, mut done)) = current.take() {
                done.flush()?;
            }
            let path = chunk_path(prefix, index);
            debug!("Opening chunk {}", path.display());
            // A revisited chunk is appended to rather than truncated.
            let seen = stats.files.contains(&path);
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .append(seen)
                .truncate(!seen)
                .open(&path)
                .with_context(|| format!("Failed to create chunk file: {}", path.display()))?;
            if !seen {
                stats.files.push(path);
            }
            current = Some((index, BufWriter::new(file)));
        }
        if let Some((_, writer)) = current.as_mut() {
            writeln!(writer, "{}", line)?;
            stats.lines_written += 1;
        }
    }

    if let Some((_, mut done)) = current {
        done.flush()?;
    }

    info!(
        "Split {} lines into {} files ({} skipped)",
        stats.lines_written,
        stats.files.len(),
        stats.lines_skipped
    );
    Ok(stats)
}
