// Capture configuration
//
// Defaults work on a stock Linux box with tracefs mounted; a TOML file can
// override them and command-line flags override the file.

use crate::error::{FaultlineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where tracefs is normally mounted, newest layout first
pub const TRACEFS_CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Settings for one capture session
///
/// # Example
/// ```
/// use faultline::config::CaptureConfig;
///
/// let config = CaptureConfig::default();
/// assert_eq!(config.trace_clock, "mono");
/// assert!(config.follow_forks);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// tracefs mount point; `None` probes `TRACEFS_CANDIDATES`
    pub tracefs_root: Option<PathBuf>,

    /// Per-CPU ring buffer size in KiB
    ///
    /// Faults arrive in bursts (a fresh arena can touch thousands of pages);
    /// a buffer too small for one burst silently drops events.
    pub buffer_size_kb: u32,

    /// Kernel trace clock. Must match the clock the in-target sampler reads,
    /// otherwise fault and sample timestamps are not comparable.
    pub trace_clock: String,

    /// Also trace processes forked by the target
    pub follow_forks: bool,

    /// Wall-clock bound on the target, in seconds
    pub timeout_secs: Option<u64>,

    /// Directory for the intermediate streams; defaults to a fresh temp dir
    pub work_dir: Option<PathBuf>,

    /// Keep the raw fault, sample and lineage streams after the trace is written
    pub keep_intermediate: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tracefs_root: None,
            buffer_size_kb: 8192,
            trace_clock: "mono".to_string(),
            follow_forks: true,
            timeout_secs: None,
            work_dir: None,
            keep_intermediate: false,
        }
    }
}

impl CaptureConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| match e {
            FaultlineError::InvalidConfig(msg) => {
                FaultlineError::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| FaultlineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size_kb == 0 {
            return Err(FaultlineError::InvalidConfig(
                "buffer_size_kb must be > 0".to_string(),
            ));
        }
        if self.trace_clock.trim().is_empty() {
            return Err(FaultlineError::InvalidConfig(
                "trace_clock must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(FaultlineError::InvalidConfig(
                "timeout_secs must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The configured tracefs root, or the first mounted candidate
    pub fn resolve_tracefs(&self) -> Result<PathBuf> {
        if let Some(root) = &self.tracefs_root {
            return Ok(root.clone());
        }
        TRACEFS_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.join("tracing_on").exists())
            .ok_or_else(|| {
                FaultlineError::configuration(
                    "no tracefs mount found",
                    "mount -t tracefs nodev /sys/kernel/tracing (requires root)",
                )
            })
    }
}
