use anyhow::{Context, Result};
use clap::Parser;
use faultline::cli::{Cli, Command, RecordArgs, ReportArgs};
use faultline::config::CaptureConfig;
use faultline::error::FaultlineError;
use faultline::report::{write_reports, Trace};
use faultline::sample::SamplePolicy;
use faultline::session::{self, RecordOptions};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; anomalies stay visible at the default level
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// File settings first, then command-line overrides
fn capture_config(args: &RecordArgs) -> Result<CaptureConfig> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => CaptureConfig::default(),
    };
    if args.no_children {
        config.follow_forks = false;
    }
    if args.timeout.is_some() {
        config.timeout_secs = args.timeout;
    }
    if args.tracefs.is_some() {
        config.tracefs_root = args.tracefs.clone();
    }
    if args.keep_intermediate {
        config.keep_intermediate = true;
    }
    Ok(config)
}

fn run_record(args: RecordArgs) -> Result<i32> {
    let options = RecordOptions {
        config: capture_config(&args)?,
        command: args.command,
        output: args.output,
    };

    match session::record(&options) {
        Ok(outcome) => {
            eprintln!(
                "faultline: {} faults, {} samples, {} processes -> {}",
                outcome.trace.faults.len(),
                outcome.trace.frames.len(),
                outcome.trace.procs.processes().len(),
                options.output.display()
            );
            if !outcome.anomalies.is_empty() {
                eprintln!("faultline: {} unpaired or malformed fault records", outcome.anomalies.len());
            }
            if let Some(dir) = &outcome.work_dir {
                eprintln!("faultline: intermediate streams kept in {}", dir.display());
            }
            Ok(outcome.exit_code.unwrap_or(1))
        }
        Err(e @ (FaultlineError::ProcessTimeout { .. } | FaultlineError::Interrupted { .. })) => {
            // The trace is still written on these paths
            eprintln!("faultline: {} (partial trace in {})", e, options.output.display());
            Ok(1)
        }
        Err(e) => Err(e).context("recording failed"),
    }
}

fn run_report(args: ReportArgs) -> Result<i32> {
    let trace = Trace::load(&args.input)
        .with_context(|| format!("failed to load trace {}", args.input.display()))?;

    let report = if args.include.is_empty() {
        trace.correlate()
    } else {
        trace.correlate_with(&SamplePolicy::with_prefixes(args.include.iter()))
    };

    let written = write_reports(&report, &args.output, args.format.into())
        .context("failed to write report")?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(0)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let code = match args.command {
        Command::Record(record) => run_record(record)?,
        Command::Report(report) => run_report(report)?,
    };
    std::process::exit(code);
}
