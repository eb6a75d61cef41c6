//! Fault-to-location correlation
//!
//! For each process the time-ordered stream of counted faults is cut into
//! contiguous windows: `startup` (before the first sample tick, or at/before the
//! process's creation), one window per tick (closed upper bound at the tick's
//! timestamp) accumulated into that tick's location, and `teardown` (after the
//! last tick). Every counted fault lands in exactly one bucket.

use crate::fault::{FaultCategory, FaultEvent};
use crate::lineage::ProcessTree;
use crate::sample::LocationSample;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Aggregation key within one process
///
/// Serialized as `"startup"`, `"teardown"` or `{"location": "file:line"}`, so a
/// program location that happens to be named `startup` stays a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketKey {
    Startup,
    Location(String),
    Teardown,
}

impl BucketKey {
    /// Display name; locations print as themselves
    pub fn as_str(&self) -> &str {
        match self {
            Self::Startup => "startup",
            Self::Location(loc) => loc,
            Self::Teardown => "teardown",
        }
    }

    /// Split a `file:line` location; synthetic keys have neither
    pub fn file_and_line(&self) -> Option<(&str, u32)> {
        let Self::Location(loc) = self else {
            return None;
        };
        let (file, line) = loc.rsplit_once(':')?;
        Some((file, line.parse().ok()?))
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault counts attributed to one (process, key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub pid: u32,
    #[serde(rename = "bucket")]
    pub key: BucketKey,
    pub cpus: BTreeSet<u32>,
    pub minor: u64,
    pub major: u64,
    pub cow: u64,
}

impl AggregateBucket {
    pub fn new(pid: u32, key: BucketKey) -> Self {
        Self {
            pid,
            key,
            cpus: BTreeSet::new(),
            minor: 0,
            major: 0,
            cow: 0,
        }
    }

    /// Accumulate one fault: counts add up, CPUs union
    pub fn add(&mut self, fault: &FaultEvent) {
        match fault.category() {
            FaultCategory::Minor => self.minor += 1,
            FaultCategory::Major => self.major += 1,
            FaultCategory::Cow => self.cow += 1,
            FaultCategory::Ignore => return,
        }
        self.cpus.insert(fault.cpu);
    }

    pub fn total(&self) -> u64 {
        self.minor + self.major + self.cow
    }
}

/// All buckets of one process, `startup` first and `teardown` last
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_us: Option<u64>,
    pub buckets: Vec<AggregateBucket>,
}

impl ProcessReport {
    pub fn bucket(&self, key: &BucketKey) -> Option<&AggregateBucket> {
        self.buckets.iter().find(|b| &b.key == key)
    }

    pub fn startup(&self) -> Option<&AggregateBucket> {
        self.bucket(&BucketKey::Startup)
    }

    pub fn teardown(&self) -> Option<&AggregateBucket> {
        self.bucket(&BucketKey::Teardown)
    }

    /// Bucket of a sampled program location
    pub fn location(&self, loc: &str) -> Option<&AggregateBucket> {
        self.buckets
            .iter()
            .find(|b| matches!(&b.key, BucketKey::Location(l) if l == loc))
    }

    /// Totals across every bucket of the process
    pub fn summary(&self) -> AggregateBucket {
        let mut sum = AggregateBucket::new(self.pid, BucketKey::Location("total".to_string()));
        for b in &self.buckets {
            sum.minor += b.minor;
            sum.major += b.major;
            sum.cow += b.cow;
            sum.cpus.extend(b.cpus.iter().copied());
        }
        sum
    }
}

/// Derived per-process aggregate table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub root: u32,
    pub processes: Vec<ProcessReport>,
}

impl AggregateReport {
    pub fn process(&self, pid: u32) -> Option<&ProcessReport> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Flat table rows in report order
    pub fn rows(&self) -> impl Iterator<Item = &AggregateBucket> {
        self.processes.iter().flat_map(|p| p.buckets.iter())
    }
}

/// Buckets in first-occurrence order
struct BucketSet {
    pid: u32,
    buckets: Vec<AggregateBucket>,
    index: HashMap<String, usize>,
}

impl BucketSet {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            buckets: vec![AggregateBucket::new(pid, BucketKey::Startup)],
            index: HashMap::new(),
        }
    }

    fn startup(&mut self) -> &mut AggregateBucket {
        &mut self.buckets[0]
    }

    fn location(&mut self, location: &str) -> &mut AggregateBucket {
        let idx = match self.index.get(location) {
            Some(&idx) => idx,
            None => {
                let idx = self.buckets.len();
                self.buckets.push(AggregateBucket::new(
                    self.pid,
                    BucketKey::Location(location.to_string()),
                ));
                self.index.insert(location.to_string(), idx);
                idx
            }
        };
        &mut self.buckets[idx]
    }

    fn finish(mut self, teardown: AggregateBucket) -> Vec<AggregateBucket> {
        self.buckets.push(teardown);
        self.buckets
    }
}

/// Consecutive samples sharing a sample id collapse to their first entry
fn ticks<'a>(samples: &[&'a LocationSample]) -> Vec<&'a LocationSample> {
    let mut out: Vec<&LocationSample> = Vec::new();
    for &s in samples {
        match out.last() {
            Some(last) if last.sample_id == s.sample_id => {
                if last.location != s.location {
                    tracing::debug!(
                        pid = s.pid,
                        sample_id = s.sample_id,
                        kept = %last.location,
                        dropped = %s.location,
                        "tick has more than one location, keeping the first"
                    );
                }
            }
            _ => out.push(s),
        }
    }
    out
}

/// Bucket one process's faults
///
/// `faults` must be this process's counted faults sorted by timestamp.
fn correlate_process(
    pid: u32,
    creation_us: Option<u64>,
    faults: &[&FaultEvent],
    samples: &[&LocationSample],
) -> Vec<AggregateBucket> {
    let ticks = ticks(samples);
    let first_tick = ticks.first().map(|t| t.timestamp_us);
    let mut set = BucketSet::new(pid);
    let mut idx = 0;

    while let Some(fault) = faults.get(idx) {
        let before_creation = creation_us.is_some_and(|c| fault.timestamp_us <= c);
        let before_first_tick = first_tick.is_some_and(|t| fault.timestamp_us < t);
        if !(before_creation || before_first_tick) {
            break;
        }
        set.startup().add(fault);
        idx += 1;
    }

    for tick in &ticks {
        let bucket = set.location(&tick.location);
        while let Some(fault) = faults.get(idx) {
            if fault.timestamp_us > tick.timestamp_us {
                break;
            }
            bucket.add(fault);
            idx += 1;
        }
    }

    let mut teardown = AggregateBucket::new(pid, BucketKey::Teardown);
    for fault in &faults[idx..] {
        teardown.add(fault);
    }
    set.finish(teardown)
}

/// Build the aggregate table for a whole capture
///
/// Processes are reported root first, then by creation time. Processes seen
/// in the fault or sample streams but absent from the lineage follow in pid
/// order with no creation cutoff.
pub fn correlate(
    faults: &[FaultEvent],
    samples: &[LocationSample],
    tree: &ProcessTree,
) -> AggregateReport {
    let mut faults_by_pid: HashMap<u32, Vec<&FaultEvent>> = HashMap::new();
    for fault in faults.iter().filter(|f| f.is_counted()) {
        faults_by_pid.entry(fault.pid).or_default().push(fault);
    }
    for list in faults_by_pid.values_mut() {
        list.sort_by_key(|f| f.timestamp_us);
    }

    let mut samples_by_pid: HashMap<u32, Vec<&LocationSample>> = HashMap::new();
    for sample in samples {
        samples_by_pid.entry(sample.pid).or_default().push(sample);
    }

    let mut order = tree.processes();
    let mut strays: Vec<u32> = faults_by_pid
        .keys()
        .chain(samples_by_pid.keys())
        .copied()
        .filter(|pid| !tree.contains(*pid))
        .collect();
    strays.sort_unstable();
    strays.dedup();
    if !strays.is_empty() {
        tracing::warn!(
            count = strays.len(),
            "processes with events but no lineage record: {:?}",
            strays
        );
    }
    order.extend(strays);

    let processes = order
        .into_iter()
        .map(|pid| {
            let created_us = tree.creation_time(pid);
            let buckets = correlate_process(
                pid,
                created_us,
                faults_by_pid.get(&pid).map(Vec::as_slice).unwrap_or(&[]),
                samples_by_pid.get(&pid).map(Vec::as_slice).unwrap_or(&[]),
            );
            ProcessReport {
                pid,
                ppid: tree.parent_of(pid),
                created_us,
                buckets,
            }
        })
        .collect();

    AggregateReport {
        root: tree.root(),
        processes,
    }
}
