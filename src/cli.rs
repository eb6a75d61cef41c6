//! CLI argument parsing for faultline

use crate::report::ReportFormat;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for aggregate reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormatArg {
    /// Human-readable table per process (default)
    Text,
    /// One row per bucket, for spreadsheets
    Csv,
    /// Machine-readable aggregate document
    Json,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(arg: ReportFormatArg) -> Self {
        match arg {
            ReportFormatArg::Text => ReportFormat::Text,
            ReportFormatArg::Csv => ReportFormat::Csv,
            ReportFormatArg::Json => ReportFormat::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(version)]
#[command(about = "Attribute page faults to source locations across a process tree", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a program with page fault capture and write a trace
    Record(RecordArgs),
    /// Correlate a recorded trace and write per-process reports
    Report(ReportArgs),
}

#[derive(clap::Args, Debug)]
pub struct RecordArgs {
    /// Where to write the trace
    #[arg(short = 'o', long = "output", value_name = "FILE", default_value = "trace.json")]
    pub output: PathBuf,

    /// Trace only the root process, not its descendants
    #[arg(long = "no-children")]
    pub no_children: bool,

    /// Kill the target process group after this many seconds
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// TOML file with capture settings
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// tracefs mount point (default: auto-detect)
    #[arg(long = "tracefs", value_name = "DIR")]
    pub tracefs: Option<PathBuf>,

    /// Keep the raw fault, sample and lineage streams
    #[arg(long = "keep-intermediate")]
    pub keep_intermediate: bool,

    /// Command to record (everything after --)
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct ReportArgs {
    /// Trace to read
    #[arg(short = 'i', long = "input", value_name = "FILE", default_value = "trace.json")]
    pub input: PathBuf,

    /// Output path; `[pid]` is replaced by each process id
    #[arg(
        short = 'o',
        long = "output",
        value_name = "PATTERN",
        default_value = "[pid]_results.txt"
    )]
    pub output: String,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: ReportFormatArg,

    /// Only attribute faults to locations starting with PREFIX (repeatable)
    #[arg(long = "include", value_name = "PREFIX")]
    pub include: Vec<String>,
}
