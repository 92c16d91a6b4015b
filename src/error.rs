//! Domain-specific error types for latency-monitor.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while parsing a field-extracted packet line.
///
/// None of these abort a run: the offending line is skipped and counted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Line has {count} fields, expected at least {expected}")]
    TooFewFields { count: usize, expected: usize },

    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("Invalid {field} value '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Invalid {field} address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Cannot recover ports from payload prefix '{0}'")]
    InvalidPorts(String),

    #[error("ECN codepoint {0} out of range (0-3)")]
    EcnOutOfRange(u8),

    #[error("DSCP value {0} out of range (0-63)")]
    DscpOutOfRange(u8),
}

/// Errors that can occur while combining repeated experiment runs.
#[derive(Error, Debug)]
pub enum CombineError {
    #[error("No run directories containing '{file_name}' under {root}")]
    NoRuns { root: PathBuf, file_name: String },

    #[error("Results file {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
