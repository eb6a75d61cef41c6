// Kernel tracing control surface
//
// The surface is write-only: every knob is a tracefs file and the kernel gives
// no acknowledgment beyond the write() return value. The coordinator owns the
// ordering of writes; this module only knows where each knob lives.
//
// The kernel's trace_pipe reports EOF only once tracing is off and the reader
// has already consumed some data. A target that never faulted leaves a blocking
// read waiting forever, even after tracing_on is cleared. The pipe is therefore
// opened non-blocking and the reader polls a flag set by the tracing_on=0 write.
// An empty read after the flag is set means the ring buffer has drained, and
// the reader reports EOF so the drain thread can exit.

use crate::error::{FaultlineError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Kprobe group all faultline events live under
pub const PROBE_GROUP: &str = "faultline";

/// Entry and return probes on `handle_mm_fault(vma, address, flags, regs)`.
///
/// `error_code` is `regs->orig_ax` (offset 120 in x86-64 `pt_regs`), where the
/// page fault handler stashes the hardware error code. Kernel-initiated faults
/// pass a NULL `regs` and print `(fault)` instead, which parses as code 0.
pub const PROBE_DEFINITIONS: &str = "p:faultline/fault_entry handle_mm_fault address=%si:x64 flags=%dx:x32 error_code=+120(%cx):x64\n\
r:faultline/fault_exit handle_mm_fault ret=$retval:x32\n";

/// How long the pipe reader sleeps when the ring buffer is momentarily empty
const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Session lock shared by every faultline process on the host. Fixed rather
/// than under `$TMPDIR` so differing environments still contend on one file.
pub const SESSION_LOCK_PATH: &str = "/tmp/faultline-tracefs.lock";

/// One control toggle of the tracing facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Knob {
    TracingOn,
    /// tracer plugin (function, function_graph, ...); `nop` for events only
    CurrentTracer,
    /// enable switch of every event group
    AllEvents,
    TraceClock,
    BufferSizeKb,
    /// pid filter for events
    EventPid,
    /// add forked children to the pid filter automatically
    EventFork,
    KprobeEvents,
    /// enable switch of the faultline event group
    ProbeEnable,
    /// writing truncates the ring buffer
    ClearBuffer,
}

impl Knob {
    /// Path relative to the tracefs root
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::TracingOn => PathBuf::from("tracing_on"),
            Self::CurrentTracer => PathBuf::from("current_tracer"),
            Self::AllEvents => Path::new("events").join("enable"),
            Self::TraceClock => PathBuf::from("trace_clock"),
            Self::BufferSizeKb => PathBuf::from("buffer_size_kb"),
            Self::EventPid => PathBuf::from("set_event_pid"),
            Self::EventFork => PathBuf::from("options/event-fork"),
            Self::KprobeEvents => PathBuf::from("kprobe_events"),
            Self::ProbeEnable => Path::new("events").join(PROBE_GROUP).join("enable"),
            Self::ClearBuffer => PathBuf::from("trace"),
        }
    }
}

/// A write-only configuration sink plus the stream it produces
pub trait ControlSurface: Send {
    fn write(&mut self, knob: Knob, value: &str) -> io::Result<()>;

    /// Open the event stream. It reports end-of-stream once tracing has been
    /// switched off and everything buffered has been read.
    fn open_stream(&mut self) -> io::Result<Box<dyn BufRead + Send>>;

    /// Human-readable location, for error messages
    fn describe(&self) -> String;
}

/// The real facility, mounted at a tracefs root
pub struct Tracefs {
    root: PathBuf,
    stopped: Arc<AtomicBool>,
    _session_lock: Flock<File>,
}

impl Tracefs {
    /// Check the facility is usable and take exclusive ownership of it
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_lock(root, SESSION_LOCK_PATH)
    }

    /// [`Tracefs::open`] with an explicit session lock file
    pub fn open_with_lock(root: impl AsRef<Path>, lock_path: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.join("tracing_on").exists() {
            return Err(FaultlineError::configuration(
                format!("{} is not a tracefs mount", root.display()),
                "mount -t tracefs nodev /sys/kernel/tracing (requires root)",
            ));
        }
        if !root.join("kprobe_events").exists() {
            return Err(FaultlineError::configuration(
                format!("{}/kprobe_events is missing", root.display()),
                "use a kernel built with CONFIG_KPROBE_EVENTS=y",
            ));
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path.as_ref())?;
        let session_lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| FaultlineError::ConcurrentSession(root.clone()))?;

        tracing::debug!(
            root = %root.display(),
            lock = %lock_path.as_ref().display(),
            "acquired tracefs session lock"
        );
        Ok(Self {
            root,
            stopped: Arc::new(AtomicBool::new(false)),
            _session_lock: session_lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ControlSurface for Tracefs {
    fn write(&mut self, knob: Knob, value: &str) -> io::Result<()> {
        let path = self.root.join(knob.relative_path());
        tracing::trace!(path = %path.display(), value, "tracefs write");
        let mut file = OpenOptions::new().write(true).truncate(true).open(&path)?;
        file.write_all(value.as_bytes())?;
        if knob == Knob::TracingOn {
            self.stopped.store(value.trim() == "0", Ordering::SeqCst);
        }
        Ok(())
    }

    fn open_stream(&mut self) -> io::Result<Box<dyn BufRead + Send>> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(self.root.join("trace_pipe"))?;
        Ok(Box::new(BufReader::new(TracePipe {
            file,
            stopped: Arc::clone(&self.stopped),
        })))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// `trace_pipe` never reports EOF by itself; this adapter does once tracing
/// is off and a non-blocking read finds the ring buffer empty.
struct TracePipe {
    file: File,
    stopped: Arc<AtomicBool>,
}

impl Read for TracePipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Sampled before the read: an empty read after the stop was
            // observed means nothing emitted before the stop is still pending
            let stopped = self.stopped.load(Ordering::SeqCst);
            match self.file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if stopped {
                        return Ok(0);
                    }
                    std::thread::sleep(PIPE_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// In-memory surface: records every write and serves a channel-fed stream
///
/// The stream ends when `tracing_on` is switched off and every line sent
/// before that has been read, matching the kernel pipe's behavior.
pub struct MemorySurface {
    writes: Arc<Mutex<Vec<(Knob, String)>>>,
    feed: Option<Sender<String>>,
    stream: Option<Receiver<String>>,
    fail_on: Option<Knob>,
}

impl MemorySurface {
    /// The surface plus a sender for lines the "kernel" emits
    pub fn new() -> (Self, Sender<String>) {
        let (tx, rx) = channel::unbounded();
        (
            Self {
                writes: Arc::new(Mutex::new(Vec::new())),
                feed: Some(tx.clone()),
                stream: Some(rx),
                fail_on: None,
            },
            tx,
        )
    }

    /// Make writes to `knob` fail with `PermissionDenied`
    pub fn failing_on(mut self, knob: Knob) -> Self {
        self.fail_on = Some(knob);
        self
    }

    /// Shared view of the write log
    pub fn write_log(&self) -> Arc<Mutex<Vec<(Knob, String)>>> {
        Arc::clone(&self.writes)
    }
}

impl ControlSurface for MemorySurface {
    fn write(&mut self, knob: Knob, value: &str) -> io::Result<()> {
        if self.fail_on == Some(knob) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("write to {} denied", knob.relative_path().display()),
            ));
        }
        if let Ok(mut writes) = self.writes.lock() {
            writes.push((knob, value.to_string()));
        }
        if knob == Knob::TracingOn && value.trim() == "0" {
            // Drop our sender; the stream ends once external senders are gone too
            self.feed = None;
        }
        Ok(())
    }

    fn open_stream(&mut self) -> io::Result<Box<dyn BufRead + Send>> {
        let rx = self
            .stream
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "stream already open"))?;
        Ok(Box::new(BufReader::new(ChannelReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        })))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct ChannelReader {
    rx: Receiver<String>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(mut line) => {
                    if !line.ends_with('\n') {
                        line.push('\n');
                    }
                    self.pending = line.into_bytes();
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
