//! Record session orchestration
//!
//! Three parties take part in a capture: the coordinator thread owning the
//! tracing facility, the target process tree, and this orchestrator. The
//! target is forked but held at a gate until the coordinator reports that
//! tracing is enabled for its pid; it then execs the program. Once the target
//! and every descendant have exited (or were killed on timeout/interrupt) the
//! orchestrator sends "stop" unconditionally, waits for the facility reset,
//! and assembles the `Trace` from the three finalized streams.

use crate::capture::{
    CaptureCoordinator, CaptureSignal, CaptureState, CaptureSummary, ControlSurface, Tracefs,
};
use crate::config::CaptureConfig;
use crate::error::{FaultlineError, Result};
use crate::fault::{FaultParser, ParseAnomaly};
use crate::lineage::{LineageLog, ProcessTree};
use crate::report::Trace;
use crate::sample::SampleParser;
use crossbeam::channel::{self, Receiver, Sender};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::prctl;
use nix::sys::signal::{self, killpg, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::{BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Environment variables handed to the target's instrumentation
pub const ENV_LINEAGE_LOG: &str = "FAULTLINE_LINEAGE_LOG";
pub const ENV_SAMPLE_LOG: &str = "FAULTLINE_SAMPLE_LOG";
pub const ENV_ROOT_PID: &str = "FAULTLINE_ROOT_PID";
pub const ENV_TRACE_CLOCK: &str = "FAULTLINE_TRACE_CLOCK";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Fail early on platforms without the facility or the x86 error code
pub fn check_platform() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(FaultlineError::Platform(format!(
            "{} has no tracefs; faultline runs on Linux only",
            std::env::consts::OS
        )));
    }
    if !cfg!(target_arch = "x86_64") {
        return Err(FaultlineError::Platform(format!(
            "{}: fault classification relies on the x86-64 page fault error code",
            std::env::consts::ARCH
        )));
    }
    Ok(())
}

/// What to run and where to put the result
#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub command: Vec<String>,
    pub output: PathBuf,
    pub config: CaptureConfig,
}

/// Result of a finished recording
#[derive(Debug)]
pub struct RecordOutcome {
    pub trace: Trace,
    pub capture: CaptureSummary,
    pub anomalies: Vec<ParseAnomaly>,
    /// Exit code of the root process, `None` if it was killed
    pub exit_code: Option<i32>,
    pub work_dir: Option<PathBuf>,
}

/// Locations of the three intermediate streams
struct StreamPaths {
    raw: PathBuf,
    samples: PathBuf,
    lineage: PathBuf,
}

impl StreamPaths {
    fn in_dir(dir: &Path) -> Self {
        Self {
            raw: dir.join("faults.txt"),
            samples: dir.join("samples.txt"),
            lineage: dir.join("pids.txt"),
        }
    }

    fn remove(&self) {
        for path in [&self.raw, &self.samples, &self.lineage] {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), "could not remove intermediate: {}", e);
            }
        }
    }
}

/// Everything the forked child needs, prepared before `fork()`
///
/// Only async-signal-safe calls are allowed between fork and exec in a
/// multithreaded process, so nothing in the child allocates. The root pid
/// variable gets a fixed-width slot the child fills in with its own pid.
struct ExecPlan {
    program: CString,
    args: Vec<CString>,
    env: Vec<CString>,
    root_pid_entry: Vec<u8>,
}

/// Decimal width of the largest pid
const PID_DIGITS: usize = 10;

impl ExecPlan {
    fn new(command: &[String], extra_env: &[(&str, String)]) -> Result<Self> {
        let cstring = |s: &str| {
            CString::new(s).map_err(|_| {
                FaultlineError::InvalidConfig(format!("argument contains a NUL byte: {:?}", s))
            })
        };
        let program = cstring(command.first().ok_or_else(|| {
            FaultlineError::InvalidConfig("no command to record".to_string())
        })?)?;
        let args = command.iter().map(|a| cstring(a)).collect::<Result<Vec<_>>>()?;

        let overridden: Vec<&str> = extra_env
            .iter()
            .map(|(k, _)| *k)
            .chain(std::iter::once(ENV_ROOT_PID))
            .collect();
        let mut env = Vec::new();
        for (key, value) in std::env::vars() {
            if !overridden.contains(&key.as_str()) {
                env.push(cstring(&format!("{}={}", key, value))?);
            }
        }
        for (key, value) in extra_env {
            env.push(cstring(&format!("{}={}", key, value))?);
        }

        let mut root_pid_entry = format!("{}=", ENV_ROOT_PID).into_bytes();
        root_pid_entry.resize(root_pid_entry.len() + PID_DIGITS + 1, 0);
        Ok(Self {
            program,
            args,
            env,
            root_pid_entry,
        })
    }

    /// Write `pid` into the reserved slot, NUL-terminated. Does not allocate.
    fn fill_root_pid(&mut self, pid: u32) {
        let start = ENV_ROOT_PID.len() + 1;
        fill_decimal(&mut self.root_pid_entry[start..], pid);
    }
}

fn fill_decimal(slot: &mut [u8], mut value: u32) {
    let mut digits = [0u8; PID_DIGITS];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (value % 10) as u8;
        n += 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    for (dst, src) in slot.iter_mut().zip(digits[..n].iter().rev()) {
        *dst = *src;
    }
    slot[n] = 0;
}

/// Fork the target, parked until the gate is released
fn spawn_gated(plan: &mut ExecPlan) -> Result<(Pid, OwnedFd)> {
    let (gate_rx, gate_tx) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;

    let argv: Vec<*const libc::c_char> = plan
        .args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp: Vec<*const libc::c_char> = plan
        .env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(plan.root_pid_entry.as_ptr().cast()))
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Child => {
            let rx = gate_rx.as_raw_fd();
            let tx = gate_tx.as_raw_fd();
            unsafe {
                libc::close(tx);
                libc::setpgid(0, 0);
                let mut byte = 0u8;
                loop {
                    let n = libc::read(rx, (&mut byte as *mut u8).cast(), 1);
                    if n == 1 {
                        break;
                    }
                    if n < 0 && Errno::last() == Errno::EINTR {
                        continue;
                    }
                    // Launcher went away without releasing us
                    libc::_exit(125);
                }
                plan.fill_root_pid(libc::getpid() as u32);
                libc::execvpe(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(127)
            }
        }
        ForkResult::Parent { child } => {
            drop(gate_rx);
            // Also set from the parent so the group exists before anyone signals it
            let _ = nix::unistd::setpgid(child, child);
            Ok((child, gate_tx))
        }
    }
}

fn release_gate(gate: OwnedFd) -> Result<()> {
    let mut file = File::from(gate);
    file.write_all(b"1")?;
    Ok(())
}

/// How the wait for the target tree ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Completed,
    TimedOut,
    Interrupted,
}

/// Wait for the root and then for every descendant, killing the group on
/// timeout or interrupt. Running out of children is the normal end.
fn wait_for_tree(root: Pid, deadline: Option<Instant>) -> Result<(Option<i32>, WaitEnd)> {
    let mut exit_code = None;
    let mut end = WaitEnd::Completed;
    let mut killed = false;

    loop {
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        let interrupted = INTERRUPTED.load(Ordering::SeqCst);
        if (expired || interrupted) && !killed {
            end = if interrupted {
                WaitEnd::Interrupted
            } else {
                WaitEnd::TimedOut
            };
            tracing::warn!(pid = root.as_raw(), "killing target process group ({:?})", end);
            if let Err(e) = killpg(root, Signal::SIGKILL) {
                tracing::debug!("killpg: {}", e);
            }
            killed = true;
        }

        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(WAIT_POLL_INTERVAL),
            Ok(WaitStatus::Exited(pid, code)) => {
                tracing::debug!(pid = pid.as_raw(), code, "process exited");
                if pid == root {
                    exit_code = Some(code);
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                tracing::debug!(pid = pid.as_raw(), signal = ?sig, "process killed");
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break,
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }

    Ok((exit_code, end))
}

/// Process-wide settings a recording changes, put back on drop
///
/// SIGINT/SIGTERM are routed to a flag so the facility is always reset, and
/// the process becomes a child subreaper so orphaned descendants are reaped
/// by us instead of init.
struct ProcessGuard {
    previous: Vec<(Signal, SigAction)>,
    was_subreaper: bool,
}

impl ProcessGuard {
    fn install() -> Result<Self> {
        INTERRUPTED.store(false, Ordering::SeqCst);
        let mut guard = Self {
            previous: Vec::new(),
            was_subreaper: prctl::get_child_subreaper().map_err(std::io::Error::from)?,
        };
        let action = SigAction::new(
            SigHandler::Handler(on_interrupt),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            let old = unsafe { signal::sigaction(sig, &action) }.map_err(std::io::Error::from)?;
            guard.previous.push((sig, old));
        }
        prctl::set_child_subreaper(true).map_err(std::io::Error::from)?;
        Ok(guard)
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for (sig, old) in self.previous.drain(..).rev() {
            if let Err(e) = unsafe { signal::sigaction(sig, &old) } {
                tracing::warn!("failed to restore {} handler: {}", sig, e);
            }
        }
        if !self.was_subreaper {
            if let Err(e) = prctl::set_child_subreaper(false) {
                tracing::warn!("failed to clear child subreaper: {}", e);
            }
        }
    }
}

/// Wait for a coordinator progress report, or learn that it gave up
fn await_state(progress: &Receiver<CaptureState>, wanted: CaptureState) -> bool {
    for state in progress.iter() {
        if state == wanted {
            return true;
        }
        if state == CaptureState::Reset {
            return false;
        }
    }
    false
}

fn join_coordinator(handle: JoinHandle<Result<CaptureSummary>>) -> Result<CaptureSummary> {
    handle
        .join()
        .map_err(|_| FaultlineError::Io(std::io::Error::other("capture coordinator panicked")))?
}

/// Run a command under capture using the real tracing facility
pub fn record(options: &RecordOptions) -> Result<RecordOutcome> {
    check_platform()?;
    options.config.validate()?;
    let tracefs_root = options.config.resolve_tracefs()?;
    let surface = Tracefs::open(&tracefs_root)?;
    tracing::info!(tracefs = %tracefs_root.display(), "using tracing facility");
    record_with(surface, options)
}

/// Run a command under capture with an arbitrary control surface
pub fn record_with<S: ControlSurface + 'static>(
    surface: S,
    options: &RecordOptions,
) -> Result<RecordOutcome> {
    let config = &options.config;
    config.validate()?;

    let temp_dir;
    let work_dir = match &config.work_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            temp_dir = None;
            dir.clone()
        }
        None => {
            let dir = tempfile::Builder::new().prefix("faultline-").tempdir()?;
            let path = dir.path().to_path_buf();
            temp_dir = Some(dir);
            path
        }
    };
    let paths = StreamPaths::in_dir(&work_dir);
    File::create(&paths.samples)?;

    let extra_env = [
        (ENV_LINEAGE_LOG, paths.lineage.display().to_string()),
        (ENV_SAMPLE_LOG, paths.samples.display().to_string()),
        (ENV_TRACE_CLOCK, config.trace_clock.clone()),
    ];
    let mut plan = ExecPlan::new(&options.command, &extra_env)?;

    let _process_guard = ProcessGuard::install()?;

    let (sig_tx, sig_rx): (Sender<CaptureSignal>, Receiver<CaptureSignal>) = channel::unbounded();
    let (progress_tx, progress_rx) = channel::unbounded();
    let coordinator = CaptureCoordinator::new(surface, config.clone(), &paths.raw);
    let handle = std::thread::Builder::new()
        .name("faultline-capture".to_string())
        .spawn(move || coordinator.run(sig_rx, Some(progress_tx)))?;

    if !await_state(&progress_rx, CaptureState::Armed) {
        drop(sig_tx);
        return Err(join_coordinator(handle).err().unwrap_or_else(|| {
            FaultlineError::configuration("capture ended before arming", "see earlier warnings")
        }));
    }

    let (child, gate) = match spawn_gated(&mut plan) {
        Ok(spawned) => spawned,
        Err(e) => {
            let _ = sig_tx.send(CaptureSignal::Stop);
            let _ = join_coordinator(handle);
            return Err(e);
        }
    };
    let root_pid = child.as_raw() as u32;
    tracing::info!(root_pid, command = ?options.command, "target forked");

    let launched = LineageLog::create(&paths.lineage, root_pid)
        .map_err(FaultlineError::from)
        .and_then(|_| {
            let _ = sig_tx.send(CaptureSignal::Start { root_pid });
            if await_state(&progress_rx, CaptureState::Enabled) {
                release_gate(gate)
            } else {
                // Dropping the gate makes the child exit without exec
                drop(gate);
                Err(FaultlineError::configuration(
                    "tracing could not be enabled",
                    "see earlier warnings",
                ))
            }
        });

    let waited = wait_for_tree(child, config.timeout().map(|t| Instant::now() + t));

    // Stop is sent on every path, timeout and interrupt included
    let _ = sig_tx.send(CaptureSignal::Stop);
    drop(sig_tx);
    let capture = join_coordinator(handle);

    launched?;
    let (exit_code, end) = waited?;
    let capture = capture?;

    let outcome = assemble(&paths, root_pid, config, &options.output, capture, exit_code)?;

    let work_dir = if config.keep_intermediate {
        temp_dir.map(|d| d.keep()).or(Some(work_dir))
    } else {
        if temp_dir.is_none() {
            paths.remove();
        }
        None
    };

    match end {
        WaitEnd::Completed => Ok(RecordOutcome { work_dir, ..outcome }),
        WaitEnd::TimedOut => Err(FaultlineError::ProcessTimeout {
            pid: root_pid,
            timeout: config.timeout().unwrap_or_default(),
        }),
        WaitEnd::Interrupted => Err(FaultlineError::Interrupted { pid: root_pid }),
    }
}

/// Parse the finalized streams into a trace and persist it
fn assemble(
    paths: &StreamPaths,
    root_pid: u32,
    config: &CaptureConfig,
    output: &Path,
    capture: CaptureSummary,
    exit_code: Option<i32>,
) -> Result<RecordOutcome> {
    let parse = FaultParser::parse_reader(BufReader::new(File::open(&paths.raw)?))?;
    if !parse.anomalies.is_empty() {
        tracing::warn!(count = parse.anomalies.len(), "fault stream had anomalies");
    }

    let sample_text = std::fs::read_to_string(&paths.samples)?;
    let (frames, bad_samples) = SampleParser::parse_lenient(&sample_text);
    if !bad_samples.is_empty() {
        tracing::warn!(count = bad_samples.len(), "skipped malformed samples");
    }

    let tree = ProcessTree::load(&paths.lineage, Some(root_pid))?;
    let detached = tree.detached();
    if !detached.is_empty() {
        tracing::warn!(?detached, "lineage records not connected to the root process");
    }
    let mut trace = Trace::new(tree, parse.events, frames);
    if !config.follow_forks {
        trace = trace.root_only();
    }
    trace.save(output)?;

    Ok(RecordOutcome {
        trace,
        capture,
        anomalies: parse.anomalies,
        exit_code,
        work_dir: None,
    })
}
