//! Trace persistence and aggregate report rendering
//!
//! The `Trace` (raw faults, process lineage, location samples) is the on-disk
//! unit; aggregate tables are derived from it and can be rendered as text,
//! CSV or JSON. Every file is written to a temporary sibling and renamed into
//! place, so a failed write never leaves a partial canonical file.

use crate::correlate::{correlate, AggregateBucket, AggregateReport, ProcessReport};
use crate::error::{FaultlineError, Result};
use crate::fault::FaultEvent;
use crate::lineage::ProcessTree;
use crate::sample::{LocationSample, SamplePolicy};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Format identifier stored in every trace
pub const TRACE_FORMAT: &str = "faultline-trace-v1";

/// Placeholder replaced by the process id in per-process output paths
pub const PID_PLACEHOLDER: &str = "[pid]";

/// Root persisted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub version: String,
    pub format: String,
    pub faults: Vec<FaultEvent>,
    pub procs: ProcessTree,
    pub frames: Vec<LocationSample>,
}

impl Trace {
    pub fn new(procs: ProcessTree, faults: Vec<FaultEvent>, frames: Vec<LocationSample>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: TRACE_FORMAT.to_string(),
            faults,
            procs,
            frames,
        }
    }

    pub fn root(&self) -> u32 {
        self.procs.root()
    }

    /// Drop every event not belonging to the root process
    pub fn root_only(mut self) -> Self {
        let root = self.root();
        self.faults.retain(|f| f.pid == root);
        self.frames.retain(|s| s.pid == root);
        self.procs = self.procs.root_only();
        self
    }

    pub fn correlate(&self) -> AggregateReport {
        correlate(&self.faults, &self.frames, &self.procs)
    }

    /// Correlate after reducing samples with a sampler-side policy
    pub fn correlate_with(&self, policy: &SamplePolicy) -> AggregateReport {
        let frames = policy.retain(self.frames.clone());
        correlate(&self.faults, &frames, &self.procs)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FaultlineError::InvalidReport {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Write atomically as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        write_atomic(path, json.as_bytes())?;
        tracing::info!(
            path = %path.display(),
            faults = self.faults.len(),
            frames = self.frames.len(),
            "trace saved"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let invalid = |reason: String| FaultlineError::InvalidReport {
            path: path.to_path_buf(),
            reason,
        };
        let mut trace: Trace = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
        if trace.format != TRACE_FORMAT {
            return Err(invalid(format!(
                "expected format {}, found {}",
                TRACE_FORMAT, trace.format
            )));
        }
        trace.procs.reindex()?;
        Ok(trace)
    }
}

/// Write `bytes` to a temp file next to `path`, then rename over it
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let serialization = |source: std::io::Error| FaultlineError::Serialization {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(serialization)?;
    tmp.write_all(bytes).map_err(serialization)?;
    tmp.as_file().sync_all().map_err(serialization)?;
    tmp.persist(path).map_err(|e| serialization(e.error))?;
    Ok(())
}

/// Output format for aggregate tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Csv,
    Json,
}

/// Escape CSV field (handle commas, quotes, newlines)
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn cpu_list(bucket: &AggregateBucket, sep: &str) -> String {
    bucket
        .cpus
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

const CSV_HEADER: &str = "pid,bucket,file,line,cpus,minor,major,cow";

fn csv_row(bucket: &AggregateBucket) -> String {
    let (file, line) = match bucket.key.file_and_line() {
        Some((file, line)) => (file.to_string(), line.to_string()),
        None => (String::new(), String::new()),
    };
    [
        bucket.pid.to_string(),
        escape_field(bucket.key.as_str()),
        escape_field(&file),
        line,
        cpu_list(bucket, ";"),
        bucket.minor.to_string(),
        bucket.major.to_string(),
        bucket.cow.to_string(),
    ]
    .join(",")
}

fn text_section(process: &ProcessReport) -> String {
    let mut out = String::new();
    let parent = process
        .ppid
        .map(|p| format!(" (parent {}, created at {}us)", p, process.created_us.unwrap_or(0)))
        .unwrap_or_default();
    out.push_str(&format!("Process {}{}\n", process.pid, parent));

    let width = process
        .buckets
        .iter()
        .map(|b| b.key.as_str().len())
        .max()
        .unwrap_or(0)
        .max("location".len());
    out.push_str(&format!(
        "{:<width$}  {:>8}  {:>8}  {:>8}  cpus\n",
        "location", "minor", "major", "cow"
    ));
    out.push_str(&format!("{}\n", "-".repeat(width + 36)));
    for b in &process.buckets {
        out.push_str(&format!(
            "{:<width$}  {:>8}  {:>8}  {:>8}  {}\n",
            b.key.as_str(),
            b.minor,
            b.major,
            b.cow,
            cpu_list(b, ",")
        ));
    }
    let total = process.summary();
    out.push_str(&format!("{}\n", "-".repeat(width + 36)));
    out.push_str(&format!(
        "{:<width$}  {:>8}  {:>8}  {:>8}  {}\n",
        "total",
        total.minor,
        total.major,
        total.cow,
        cpu_list(&total, ",")
    ));
    out
}

/// Render one process's buckets
pub fn render_process(process: &ProcessReport, format: ReportFormat) -> Result<String> {
    Ok(match format {
        ReportFormat::Text => text_section(process),
        ReportFormat::Csv => {
            let mut out = format!("{}\n", CSV_HEADER);
            for b in &process.buckets {
                out.push_str(&csv_row(b));
                out.push('\n');
            }
            out
        }
        ReportFormat::Json => to_json(process)?,
    })
}

/// Render every process into a single document
pub fn render_report(report: &AggregateReport, format: ReportFormat) -> Result<String> {
    Ok(match format {
        ReportFormat::Text => report
            .processes
            .iter()
            .map(text_section)
            .collect::<Vec<_>>()
            .join("\n"),
        ReportFormat::Csv => {
            let mut out = format!("{}\n", CSV_HEADER);
            for b in report.rows() {
                out.push_str(&csv_row(b));
                out.push('\n');
            }
            out
        }
        ReportFormat::Json => to_json(report)?,
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| FaultlineError::InvalidReport {
        path: PathBuf::new(),
        reason: e.to_string(),
    })
}

/// Write the report; a `[pid]` placeholder in `pattern` yields one file per process
pub fn write_reports(
    report: &AggregateReport,
    pattern: &str,
    format: ReportFormat,
) -> Result<Vec<PathBuf>> {
    if pattern.contains(PID_PLACEHOLDER) {
        report
            .processes
            .iter()
            .map(|process| {
                let path = PathBuf::from(pattern.replace(PID_PLACEHOLDER, &process.pid.to_string()));
                write_atomic(&path, render_process(process, format)?.as_bytes())?;
                Ok(path)
            })
            .collect()
    } else {
        let path = PathBuf::from(pattern);
        write_atomic(&path, render_report(report, format)?.as_bytes())?;
        Ok(vec![path])
    }
}

impl AggregateReport {
    /// Load a report previously written with `ReportFormat::Json` as a single file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| FaultlineError::InvalidReport {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::ProcessRecord;
    use tempfile::TempDir;

    fn sample_trace() -> Trace {
        let tree = ProcessTree::from_records(100, [ProcessRecord::new(100, 101, 500)]).unwrap();
        let faults = vec![
            FaultEvent::new(100, 0, 90, 0xffff_ffff_ffff_f000, 0x255, 0, 0x6),
            FaultEvent::new(100, 1, 150, 0x7f00_0000_1000, 0, 0, 0x7),
            FaultEvent::new(101, 2, 550, 0x1000, 0x20, 0, 0x4),
            FaultEvent::new(101, 3, 700, 0x2000, 0, 0x400, 0x6),
        ];
        let frames = vec![
            LocationSample::new(100, 1, "main.py:3", 100),
            LocationSample::new(100, 2, "main.py:4", 200),
            LocationSample::new(101, 1, "a.py:10", 600),
        ];
        Trace::new(tree, faults, frames)
    }

    #[test]
    fn test_trace_roundtrip_preserves_precision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.json");
        let trace = sample_trace();
        trace.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"0xfffffffffffff000\""));
        assert!(text.contains("\"rels\""));

        let loaded = Trace::load(&path).unwrap();
        assert_eq!(loaded, trace);
        assert_eq!(loaded.procs.parent_of(101), Some(100));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.json");
        sample_trace().save(&path).unwrap();
        sample_trace().save(&path).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_save_into_missing_dir_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope").join("trace.json");
        let err = sample_trace().save(&path).unwrap_err();
        assert!(matches!(err, FaultlineError::Serialization { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_rejects_wrong_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.json");
        let mut trace = sample_trace();
        trace.format = "something-else".to_string();
        std::fs::write(&path, serde_json::to_string(&trace).unwrap()).unwrap();
        assert!(matches!(
            Trace::load(&path).unwrap_err(),
            FaultlineError::InvalidReport { .. }
        ));
    }

    #[test]
    fn test_root_only_drops_children() {
        let trace = sample_trace().root_only();
        assert!(trace.faults.iter().all(|f| f.pid == 100));
        assert!(trace.frames.iter().all(|s| s.pid == 100));
        assert!(trace.procs.records().is_empty());
        assert_eq!(trace.correlate().processes.len(), 1);
    }

    #[test]
    fn test_csv_rendering() {
        let report = sample_trace().correlate();
        let csv = render_report(&report, ReportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines.contains(&"100,startup,,,0,1,0,0"));
        assert!(lines.contains(&"100,main.py:4,main.py,4,1,0,0,1"));
        assert!(lines.contains(&"101,startup,,,2,0,1,0"));
    }

    #[test]
    fn test_text_rendering_has_totals() {
        let report = sample_trace().correlate();
        let text = render_process(report.process(101).unwrap(), ReportFormat::Text).unwrap();
        assert!(text.starts_with("Process 101 (parent 100, created at 500us)"));
        assert!(text.contains("a.py:10"));
        assert!(text.lines().last().unwrap().starts_with("total"));
    }

    #[test]
    fn test_per_pid_outputs() {
        let dir = TempDir::new().unwrap();
        let pattern = dir.path().join("[pid]_results.csv");
        let report = sample_trace().correlate();
        let paths =
            write_reports(&report, pattern.to_str().unwrap(), ReportFormat::Csv).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("100_results.csv"));
        assert!(paths[1].exists());
    }

    #[test]
    fn test_json_report_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let report = sample_trace().correlate();
        write_reports(&report, path.to_str().unwrap(), ReportFormat::Json).unwrap();
        assert_eq!(AggregateReport::load(&path).unwrap(), report);
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("plain"), "plain");
    }
}
