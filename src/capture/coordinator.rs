// Capture lifecycle: Idle -> Armed -> Enabled -> Disabled -> Reset
//
// Driven by "start"/"stop" messages from the launcher. Duplicates are
// reported and ignored. The facility is reset on every exit path, including
// drop, because a facility left enabled corrupts the next run.

use super::control::{ControlSurface, Knob, PROBE_DEFINITIONS};
use crate::config::CaptureConfig;
use crate::error::{FaultlineError, Result};
use crossbeam::channel::{Receiver, Sender};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Enabled,
    Disabled,
    Reset,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Reset => "reset",
        };
        f.write_str(s)
    }
}

/// Message from the launcher of the target process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSignal {
    /// The target is about to run; trace the tree rooted at `root_pid`
    Start { root_pid: u32 },
    /// The target tree has finished (or was killed)
    Stop,
}

/// A signal that arrived in a state where it means nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleViolation {
    DuplicateStart { state: CaptureState },
    DuplicateStop { state: CaptureState },
    /// Signal before `arm()`
    NotArmed { signal: CaptureSignal },
}

impl fmt::Display for LifecycleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStart { state } => write!(f, "duplicate start while {}", state),
            Self::DuplicateStop { state } => write!(f, "duplicate stop while {}", state),
            Self::NotArmed { signal } => write!(f, "{:?} received before the facility was armed", signal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: CaptureState, to: CaptureState },
    Ignored(LifecycleViolation),
}

/// What one session produced
#[derive(Debug)]
pub struct CaptureSummary {
    pub root_pid: Option<u32>,
    /// Lines written to the raw buffer
    pub lines: u64,
    pub raw_path: PathBuf,
    pub violations: Vec<LifecycleViolation>,
    /// Best-effort reset failures; never fatal
    pub reset_errors: Vec<String>,
}

/// Copy a line stream into `writer` until end-of-stream
///
/// Blocks on every read; there is no internal timeout. Returns the line count.
pub fn drain_lines<R: BufRead, W: Write>(mut reader: R, mut writer: W) -> io::Result<u64> {
    let mut line = String::new();
    let mut count = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

fn spawn_drain(
    stream: Box<dyn BufRead + Send>,
    path: &Path,
) -> io::Result<JoinHandle<io::Result<u64>>> {
    let file = File::create(path)?;
    std::thread::Builder::new()
        .name("faultline-drain".to_string())
        .spawn(move || {
            let mut writer = BufWriter::new(file);
            let count = drain_lines(stream, &mut writer)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(count)
        })
}

/// Owns the tracing facility for one capture session
pub struct CaptureCoordinator<S: ControlSurface> {
    surface: S,
    config: CaptureConfig,
    raw_path: PathBuf,
    state: CaptureState,
    root_pid: Option<u32>,
    drain: Option<JoinHandle<io::Result<u64>>>,
    lines: u64,
    drain_error: Option<io::Error>,
    violations: Vec<LifecycleViolation>,
}

impl<S: ControlSurface> CaptureCoordinator<S> {
    pub fn new(surface: S, config: CaptureConfig, raw_path: impl Into<PathBuf>) -> Self {
        Self {
            surface,
            config,
            raw_path: raw_path.into(),
            state: CaptureState::Idle,
            root_pid: None,
            drain: None,
            lines: 0,
            drain_error: None,
            violations: Vec::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn violations(&self) -> &[LifecycleViolation] {
        &self.violations
    }

    fn write(&mut self, knob: Knob, value: &str) -> Result<()> {
        self.surface.write(knob, value).map_err(|e| {
            FaultlineError::configuration(
                format!(
                    "cannot write {} under {}: {}",
                    knob.relative_path().display(),
                    self.surface.describe(),
                    e
                ),
                "run as root, or grant write access to tracefs",
            )
        })
    }

    /// Idle -> Armed: clear whatever a previous user left behind, then set up the probes
    pub fn arm(&mut self) -> Result<()> {
        if self.state != CaptureState::Idle {
            tracing::warn!(state = %self.state, "arm() outside idle state ignored");
            return Ok(());
        }

        self.clear_facility()
            .into_iter()
            .for_each(|e| tracing::debug!("pre-arm reset: {}", e));

        let buffer = self.config.buffer_size_kb.to_string();
        let clock = self.config.trace_clock.clone();
        self.write(Knob::TraceClock, &clock)?;
        self.write(Knob::BufferSizeKb, &buffer)?;
        self.write(Knob::KprobeEvents, PROBE_DEFINITIONS)?;
        self.write(Knob::ProbeEnable, "1")?;

        self.state = CaptureState::Armed;
        tracing::info!(clock = %clock, buffer_kb = %buffer, "tracing facility armed");
        Ok(())
    }

    /// Apply one launcher signal
    pub fn handle(&mut self, signal: CaptureSignal) -> Result<Transition> {
        let from = self.state;
        match (signal, from) {
            (CaptureSignal::Start { root_pid }, CaptureState::Armed) => {
                self.enable(root_pid)?;
            }
            (CaptureSignal::Stop, CaptureState::Armed) => {
                // Target never started; nothing was traced
                self.state = CaptureState::Disabled;
            }
            (CaptureSignal::Stop, CaptureState::Enabled) => {
                self.disable()?;
            }
            (CaptureSignal::Start { .. }, CaptureState::Idle)
            | (CaptureSignal::Stop, CaptureState::Idle) => {
                return Ok(self.ignore(LifecycleViolation::NotArmed { signal }));
            }
            (CaptureSignal::Start { .. }, state) => {
                return Ok(self.ignore(LifecycleViolation::DuplicateStart { state }));
            }
            (CaptureSignal::Stop, state) => {
                return Ok(self.ignore(LifecycleViolation::DuplicateStop { state }));
            }
        }
        Ok(Transition::Advanced {
            from,
            to: self.state,
        })
    }

    fn ignore(&mut self, violation: LifecycleViolation) -> Transition {
        tracing::warn!("ignoring signal: {}", violation);
        self.violations.push(violation);
        Transition::Ignored(violation)
    }

    /// Armed -> Enabled
    fn enable(&mut self, root_pid: u32) -> Result<()> {
        self.write(Knob::EventPid, &root_pid.to_string())?;
        let fork = if self.config.follow_forks { "1" } else { "0" };
        self.write(Knob::EventFork, fork)?;
        self.write(Knob::TracingOn, "1")?;

        let stream = self.surface.open_stream()?;
        self.drain = Some(spawn_drain(stream, &self.raw_path)?);
        self.root_pid = Some(root_pid);
        self.state = CaptureState::Enabled;
        tracing::info!(root_pid, raw = %self.raw_path.display(), "tracing enabled");
        Ok(())
    }

    /// Enabled -> Disabled. Waits for the drain to see end-of-stream.
    fn disable(&mut self) -> Result<()> {
        // The state moves first so a failed write still leads to reset
        self.state = CaptureState::Disabled;
        self.write(Knob::TracingOn, "0")?;
        if let Some(handle) = self.drain.take() {
            match handle.join() {
                Ok(Ok(lines)) => self.lines = lines,
                Ok(Err(e)) => {
                    tracing::error!("drain failed: {}", e);
                    self.drain_error = Some(e);
                }
                Err(_) => {
                    self.drain_error = Some(io::Error::other("drain thread panicked"));
                }
            }
        }
        tracing::info!(lines = self.lines, "tracing disabled");
        Ok(())
    }

    /// Every knob back to its inert value. Errors are collected, not raised.
    fn clear_facility(&mut self) -> Vec<String> {
        let steps = [
            (Knob::TracingOn, "0"),
            (Knob::CurrentTracer, "nop"),
            (Knob::AllEvents, "0"),
            (Knob::ProbeEnable, "0"),
            (Knob::EventPid, ""),
            (Knob::EventFork, "0"),
            (Knob::KprobeEvents, ""),
            (Knob::ClearBuffer, ""),
        ];
        steps
            .into_iter()
            .filter_map(|(knob, value)| {
                self.surface
                    .write(knob, value)
                    .err()
                    .map(|e| format!("{}: {}", knob.relative_path().display(), e))
            })
            .collect()
    }

    /// Any state -> Reset, best effort
    pub fn reset(&mut self) -> Vec<String> {
        if self.state == CaptureState::Reset {
            return Vec::new();
        }
        if self.state == CaptureState::Enabled {
            if let Err(e) = self.disable() {
                tracing::warn!("disable during reset failed: {}", e);
            }
        }
        let errors = self.clear_facility();
        for e in &errors {
            tracing::warn!("reset incomplete: {}", e);
        }
        self.state = CaptureState::Reset;
        tracing::debug!("tracing facility reset");
        errors
    }

    /// Run a whole session from a signal channel
    ///
    /// Each state reached is reported on `progress` so the launcher can hold
    /// the target until tracing is enabled. A closed signal channel counts as
    /// "stop". The facility is reset before returning, on success or error.
    pub fn run(
        mut self,
        signals: Receiver<CaptureSignal>,
        progress: Option<Sender<CaptureState>>,
    ) -> Result<CaptureSummary> {
        let outcome = self.run_inner(&signals, progress.as_ref());
        let reset_errors = self.reset();
        if let Some(tx) = &progress {
            let _ = tx.send(CaptureState::Reset);
        }
        outcome?;
        if let Some(e) = self.drain_error.take() {
            return Err(e.into());
        }
        Ok(CaptureSummary {
            root_pid: self.root_pid,
            lines: self.lines,
            raw_path: self.raw_path.clone(),
            violations: std::mem::take(&mut self.violations),
            reset_errors,
        })
    }

    fn run_inner(
        &mut self,
        signals: &Receiver<CaptureSignal>,
        progress: Option<&Sender<CaptureState>>,
    ) -> Result<()> {
        let notify = |state| {
            if let Some(tx) = progress {
                let _ = tx.send(state);
            }
        };

        self.arm()?;
        notify(self.state);

        while self.state != CaptureState::Disabled {
            let signal = signals.recv().unwrap_or_else(|_| {
                tracing::warn!("signal channel closed, stopping capture");
                CaptureSignal::Stop
            });
            if let Transition::Advanced { to, .. } = self.handle(signal)? {
                notify(to);
            }
        }
        Ok(())
    }
}

impl<S: ControlSurface> Drop for CaptureCoordinator<S> {
    fn drop(&mut self) {
        if !matches!(self.state, CaptureState::Idle | CaptureState::Reset) {
            self.reset();
        }
    }
}
