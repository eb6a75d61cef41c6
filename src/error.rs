//! Error taxonomy for capture, parsing and report persistence
//!
//! Parse anomalies and lifecycle violations are deliberately absent here:
//! they are recovered locally and surface as values (`ParseAnomaly`,
//! `LifecycleViolation`), never as `Err`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that terminate a capture or report run
#[derive(Error, Debug)]
pub enum FaultlineError {
    /// Wrong OS or architecture. Checked before anything else.
    #[error("Unsupported platform: {0}")]
    Platform(String),

    /// The kernel tracing facility is missing or unusable.
    #[error("Tracing facility unavailable: {what} (hint: {remedy})")]
    Configuration { what: String, remedy: String },

    /// Another capture session already owns the tracing control surface.
    #[error("Tracing control surface at {0} is owned by another capture session")]
    ConcurrentSession(PathBuf),

    /// The target exceeded its wall-clock bound and was killed.
    #[error("Process {pid} exceeded the {timeout:?} timeout and was terminated")]
    ProcessTimeout { pid: u32, timeout: Duration },

    /// The run was interrupted; the target tree was killed and the facility reset.
    #[error("Interrupted; target process group {pid} was terminated")]
    Interrupted { pid: u32 },

    /// Writing the persisted report failed. No canonical file was left behind.
    #[error("Failed to write report to {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted report could not be decoded.
    #[error("Invalid report format in {path}: {reason}")]
    InvalidReport { path: PathBuf, reason: String },

    #[error("Malformed sample on line {line_number}: {reason} ({line:?})")]
    SampleParse {
        line_number: usize,
        line: String,
        reason: String,
    },

    #[error("Malformed lineage record on line {line_number}: {reason} ({line:?})")]
    Lineage {
        line_number: usize,
        line: String,
        reason: String,
    },

    /// A process was reported as duplicated more than once.
    #[error("Process {child} already has parent {existing}, cannot re-parent to {parent}")]
    DuplicateChild { child: u32, existing: u32, parent: u32 },

    /// The root process showed up as somebody's child.
    #[error("Root process {root} cannot be a child of {parent}")]
    RootReparented { root: u32, parent: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used across the library
pub type Result<T> = std::result::Result<T, FaultlineError>;

impl FaultlineError {
    /// Build a configuration error with a remedial hint
    pub fn configuration(what: impl Into<String>, remedy: impl Into<String>) -> Self {
        Self::Configuration {
            what: what.into(),
            remedy: remedy.into(),
        }
    }

    /// True for errors that must abort before any child coordination begins
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Platform(_) | Self::Configuration { .. } | Self::ConcurrentSession(_)
        )
    }
}
