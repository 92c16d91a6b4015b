//! latency-monitor: one-way latency, throughput and ECN marking per flow.
//!
//! Reads field-extracted packet lines captured on two interfaces around a
//! device under test and reports per-flow latency percentiles, drops and
//! marking rates.
//!
//! # Subcommands
//!
//! - `reorder`: restore global time order of a multi-interface capture (stdin → stdout)
//! - `analyze`: correlate both captures and write per-flow and per-direction tables
//! - `combine`: reduce repeated runs to means with 95% confidence intervals
//! - `split`: cut a time-ordered capture into fixed-duration chunk files
//! - `generate-config`: print the default TOML configuration

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use latency_monitor::combine::combine_runs;
use latency_monitor::config::Config;
use latency_monitor::export::{export_report, OutputFormat};
use latency_monitor::pipeline::{run_analysis, AnalyzeOptions};
use latency_monitor::record::lossy_lines;
use latency_monitor::reorder::ReorderedLines;
use latency_monitor::split::split_lines;

/// latency-monitor: per-flow latency from dual-vantage packet captures.
#[derive(Parser, Debug)]
#[command(name = "latency-monitor")]
#[command(version)]
#[command(about = "Measure per-flow one-way latency across a device under test")]
#[command(long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (writes to stderr).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reorder a multi-interface capture from stdin into time order on stdout.
    Reorder {
        /// Lines read before merging starts.
        #[arg(long)]
        warmup_lines: Option<usize>,

        /// Release records this many seconds behind the newest one instead.
        #[arg(long)]
        max_lateness: Option<f64>,
    },

    /// Correlate NSI and CMCI captures and write latency tables.
    Analyze {
        /// Label for the run report.
        name: String,

        /// CMCI interface name (NAT halves are anchored here).
        cmci: String,

        /// NSI interface name; every other interface is treated as CMCI.
        nsi: String,

        /// Existing directory the CSV tables are written to.
        output_dir: PathBuf,

        /// Read packet lines from this file instead of stdin.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Reorder input before classification.
        #[arg(long)]
        reorder: bool,

        /// Report format: text, json, jsonl.
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Flows reported individually per direction.
        #[arg(long)]
        max_flows: Option<usize>,

        /// Minimum packets for a flow to be reported individually.
        #[arg(long)]
        min_packets: Option<u64>,

        /// Seconds excluded from steady-state throughput.
        #[arg(long)]
        steady_state: Option<f64>,
    },

    /// Combine repeated runs into means with confidence intervals.
    Combine {
        /// Directory holding one subdirectory per run.
        root: PathBuf,

        /// Column rows are grouped by.
        #[arg(long)]
        group_column: Option<String>,
    },

    /// Split a time-ordered capture from stdin into fixed-duration files.
    Split {
        /// Chunk duration in seconds.
        duration: f64,

        /// Output file prefix; chunk index is appended.
        prefix: String,
    },

    /// Print the default configuration as TOML.
    GenerateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = cli.config.as_deref().map(Config::load);
    let verbose = cli.verbose || matches!(&loaded, Some(Ok(c)) if c.output.verbose);

    // stdout carries data, so logs go to stderr.
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut config = match loaded {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            warn!("Failed to load config: {:#}, using defaults", e);
            Config::default()
        }
        None => Config::default(),
    };

    match cli.command {
        Commands::Reorder {
            warmup_lines,
            max_lateness,
        } => {
            if let Some(lines) = warmup_lines {
                config.reorder.warmup_lines = lines;
            }
            if max_lateness.is_some() {
                config.reorder.max_lateness_secs = max_lateness;
            }
            config.validate()?;
            run_reorder(&config)
        }

        Commands::Analyze {
            name,
            cmci,
            nsi,
            output_dir,
            input,
            reorder,
            format,
            max_flows,
            min_packets,
            steady_state,
        } => {
            if let Some(format) = format {
                config.output.format = format;
            }
            if let Some(max) = max_flows {
                config.aggregate.max_flows = max;
            }
            if let Some(min) = min_packets {
                config.aggregate.min_packets = min;
            }
            if let Some(secs) = steady_state {
                config.aggregate.steady_state_secs = secs;
            }
            config.validate()?;

            let options = AnalyzeOptions {
                name,
                cmci_interface: cmci,
                nsi_interface: nsi,
                output_dir,
                reorder,
            };
            let source: Box<dyn BufRead> = match &input {
                Some(path) => Box::new(BufReader::new(
                    File::open(path)
                        .with_context(|| format!("Failed to open input: {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(io::stdin())),
            };

            let report = run_analysis(lossy_lines(source), &config, &options).await?;
            println!("{}", export_report(&report, config.output.format));
            Ok(())
        }

        Commands::Combine { root, group_column } => {
            if let Some(column) = group_column {
                config.combine.group_column = column;
            }
            config.validate()?;

            let results = combine_runs(&root, &config.combine)?;
            let out = root.join(&config.combine.output_file);
            results.write_csv(&out)?;
            info!(
                "Combined {} runs ({} test cases) into {}",
                results.runs,
                results.groups.len(),
                out.display()
            );
            Ok(())
        }

        Commands::Split { duration, prefix } => {
            let stats = split_lines(io::stdin().lock(), duration, &prefix)?;
            info!("Split complete: {} files", stats.files.len());
            Ok(())
        }

        Commands::GenerateConfig => {
            println!("{}", Config::generate_default());
            Ok(())
        }
    }
}

fn run_reorder(config: &Config) -> Result<()> {
    let stdin = io::stdin();
    let mut out = BufWriter::new(io::stdout().lock());
    let mut lines = ReorderedLines::new(lossy_lines(stdin.lock()), config.reorder.watermark());

    for line in lines.by_ref() {
        let line = line.context("Failed to read stdin")?;
        writeln!(out, "{}", line.text)?;
    }
    out.flush()?;

    let stats = lines.stats();
    info!(
        "Reordered {} lines from {} interfaces ({} skipped)",
        stats.lines_emitted, stats.interfaces, stats.lines_skipped
    );
    Ok(())
}
