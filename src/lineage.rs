//! Process lineage: who duplicated whom, and when
//!
//! The launcher and the forked processes append `ppid,pid,timestamp_us`
//! records to a shared log as duplications happen. The root process is not a
//! record; it is supplied by the caller or declared by a single-field header
//! line at the top of the log.

use crate::error::{FaultlineError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// One process-duplication event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    #[serde(rename = "timestamp")]
    pub timestamp_us: u64,
}

impl ProcessRecord {
    pub fn new(ppid: u32, pid: u32, timestamp_us: u64) -> Self {
        Self {
            pid,
            ppid,
            timestamp_us,
        }
    }

    /// Render in the log's wire format
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.ppid, self.pid, self.timestamp_us)
    }
}

/// Parsed form of one log line
enum LogLine {
    Root(u32),
    Record(ProcessRecord),
}

fn parse_log_line(line: &str, line_number: usize) -> Result<Option<LogLine>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let fail = |reason: &str| FaultlineError::Lineage {
        line_number,
        line: line.to_string(),
        reason: reason.to_string(),
    };
    let fields: Vec<&str> = trimmed.split(',').map(str::trim).collect();
    match fields.as_slice() {
        [root] => root
            .parse()
            .map(|pid| Some(LogLine::Root(pid)))
            .map_err(|_| fail("root pid is not a number")),
        [ppid, pid, ts] => {
            let ppid = ppid.parse().map_err(|_| fail("parent pid is not a number"))?;
            let pid = pid.parse().map_err(|_| fail("child pid is not a number"))?;
            let ts = ts.parse().map_err(|_| fail("timestamp is not a number"))?;
            Ok(Some(LogLine::Record(ProcessRecord::new(ppid, pid, ts))))
        }
        _ => Err(fail("expected ppid,pid,timestamp")),
    }
}

/// A traced process tree rooted at the launched target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTree {
    root: u32,
    #[serde(rename = "rels")]
    records: Vec<ProcessRecord>,
    #[serde(skip)]
    parents: HashMap<u32, u32>,
}

impl ProcessTree {
    pub fn new(root: u32) -> Self {
        Self {
            root,
            records: Vec::new(),
            parents: HashMap::new(),
        }
    }

    pub fn from_records<I>(root: u32, records: I) -> Result<Self>
    where
        I: IntoIterator<Item = ProcessRecord>,
    {
        let mut tree = Self::new(root);
        for record in records {
            tree.insert(record)?;
        }
        Ok(tree)
    }

    /// Build from the wire format
    ///
    /// `root` is the externally supplied root; a header line may supply it
    /// instead, and the two must agree when both are present.
    pub fn parse_log<R: BufRead>(reader: R, root: Option<u32>) -> Result<Self> {
        let mut declared = root;
        let mut records = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            match parse_log_line(&line, idx + 1)? {
                Some(LogLine::Root(pid)) => match declared {
                    Some(existing) if existing != pid => {
                        return Err(FaultlineError::Lineage {
                            line_number: idx + 1,
                            line,
                            reason: format!("root {} conflicts with supplied root {}", pid, existing),
                        });
                    }
                    _ => declared = Some(pid),
                },
                Some(LogLine::Record(record)) => records.push(record),
                None => {}
            }
        }

        let root = declared.ok_or_else(|| FaultlineError::Lineage {
            line_number: 0,
            line: String::new(),
            reason: "no root process supplied or declared".to_string(),
        })?;
        Self::from_records(root, records)
    }

    pub fn parse_str(text: &str, root: Option<u32>) -> Result<Self> {
        Self::parse_log(text.as_bytes(), root)
    }

    pub fn load(path: impl AsRef<Path>, root: Option<u32>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::parse_log(io::BufReader::new(file), root)
    }

    /// Append one duplication event. A process has exactly one parent.
    pub fn insert(&mut self, record: ProcessRecord) -> Result<()> {
        if record.pid == self.root {
            return Err(FaultlineError::RootReparented {
                root: self.root,
                parent: record.ppid,
            });
        }
        if let Some(&existing) = self.parents.get(&record.pid) {
            return Err(FaultlineError::DuplicateChild {
                child: record.pid,
                existing,
                parent: record.ppid,
            });
        }
        self.parents.insert(record.pid, record.ppid);
        self.records.push(record);
        Ok(())
    }

    /// Restore the child -> parent index after deserialization
    pub(crate) fn reindex(&mut self) -> Result<()> {
        let records = std::mem::take(&mut self.records);
        self.parents.clear();
        for record in records {
            self.insert(record)?;
        }
        Ok(())
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Records in log order
    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn parent_of(&self, pid: u32) -> Option<u32> {
        self.parents.get(&pid).copied()
    }

    pub fn contains(&self, pid: u32) -> bool {
        pid == self.root || self.parents.contains_key(&pid)
    }

    /// Creation timestamp; `None` for the root and unknown processes
    pub fn creation_time(&self, pid: u32) -> Option<u64> {
        self.records
            .iter()
            .find(|r| r.pid == pid)
            .map(|r| r.timestamp_us)
    }

    /// Root first, then every recorded process by creation time
    pub fn processes(&self) -> Vec<u32> {
        let mut by_creation: Vec<&ProcessRecord> = self.records.iter().collect();
        by_creation.sort_by_key(|r| r.timestamp_us);
        std::iter::once(self.root)
            .chain(by_creation.into_iter().map(|r| r.pid))
            .collect()
    }

    /// Recorded processes whose parent chain never reaches the root, in log
    /// order. Their parent's own duplication record was lost or never written.
    pub fn detached(&self) -> Vec<u32> {
        self.records
            .iter()
            .map(|r| r.pid)
            .filter(|&pid| !self.is_descendant(pid))
            .collect()
    }

    /// True if `pid` is the root or reaches it through recorded parents
    fn is_descendant(&self, pid: u32) -> bool {
        let mut current = pid;
        // Bounded by the record count so a malformed cycle cannot spin forever
        for _ in 0..=self.records.len() {
            if current == self.root {
                return true;
            }
            match self.parents.get(&current) {
                Some(&parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// The same tree with every descendant dropped
    pub fn root_only(&self) -> Self {
        Self::new(self.root)
    }
}

/// Append-only destination for duplication events
pub trait LineageSink {
    fn record(&mut self, record: ProcessRecord) -> io::Result<()>;
}

/// File-backed lineage log, shared by every process of the traced tree
pub struct LineageLog {
    path: PathBuf,
    file: File,
}

impl LineageLog {
    /// Truncate `path` and declare `root` in the header line
    pub fn create(path: impl AsRef<Path>, root: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)?;
        writeln!(file, "{}", root)?;
        drop(file);
        Self::open(path)
    }

    /// Open an existing log for appending
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineageSink for LineageLog {
    fn record(&mut self, record: ProcessRecord) -> io::Result<()> {
        // One write per record so concurrent appenders never interleave within a line
        let line = format!("{}\n", record.to_line());
        self.file.write_all(line.as_bytes())
    }
}

/// In-process lineage log for producers running as threads
#[derive(Clone)]
pub struct ChannelLineage {
    tx: Sender<ProcessRecord>,
}

impl ChannelLineage {
    pub fn pair() -> (Self, Receiver<ProcessRecord>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }

    /// Finalize once every sender has been dropped
    pub fn collect(root: u32, rx: Receiver<ProcessRecord>) -> Result<ProcessTree> {
        ProcessTree::from_records(root, rx.iter())
    }
}

impl LineageSink for ChannelLineage {
    fn record(&mut self, record: ProcessRecord) -> io::Result<()> {
        self.tx
            .send(record)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "lineage receiver dropped"))
    }
}
