//! Page fault record parsing and classification
//!
//! The kernel reports one fault as two trace lines: an entry line carrying the
//! faulting address, the fault flags and the hardware error code, and a later
//! return line carrying the `VM_FAULT_*` bits. `FaultParser` pairs them by
//! `(pid, cpu)` in arrival order and classifies each completed pair once.
//!
//! Minor vs. copy-on-write is decided by the x86 error code (`0x7`: user-mode
//! write to a present page). A flag-based heuristic (`FAULT_FLAG_WRITE` or
//! `VM_FAULT_DONE_COW`) exists but over-reports cow on first-touch writes; if a
//! platform ever lacks the error code, that heuristic is the fallback to revisit.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::BufRead;
use std::sync::LazyLock;

/// `VM_FAULT_*` return bits and `FAULT_FLAG_*` flag bits from `include/linux/mm_types.h`
pub mod bits {
    pub const VM_FAULT_OOM: u64 = 0x000001;
    pub const VM_FAULT_SIGBUS: u64 = 0x000002;
    pub const VM_FAULT_MAJOR: u64 = 0x000004;
    pub const VM_FAULT_HWPOISON: u64 = 0x000010;
    pub const VM_FAULT_HWPOISON_LARGE: u64 = 0x000020;
    pub const VM_FAULT_SIGSEGV: u64 = 0x000040;
    pub const VM_FAULT_RETRY: u64 = 0x000400;
    pub const VM_FAULT_FALLBACK: u64 = 0x000800;
    pub const VM_FAULT_DONE_COW: u64 = 0x001000;

    /// Terminal outcomes the kernel never accounts as a fault
    pub const VM_FAULT_ERROR: u64 = VM_FAULT_OOM
        | VM_FAULT_SIGBUS
        | VM_FAULT_SIGSEGV
        | VM_FAULT_HWPOISON
        | VM_FAULT_HWPOISON_LARGE
        | VM_FAULT_FALLBACK;

    pub const FAULT_FLAG_WRITE: u64 = 1 << 0;
    pub const FAULT_FLAG_TRIED: u64 = 1 << 5;
    pub const FAULT_FLAG_USER: u64 = 1 << 6;

    /// x86 page fault error code: present | write | user
    pub const ERROR_CODE_COW: u64 = 0x7;
}

/// Accounting category of a completed fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultCategory {
    Ignore,
    Minor,
    Major,
    Cow,
}

impl FaultCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Cow => "cow",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Same policy as the kernel's `mm_account_fault()`: retried and failed faults are not counted
pub fn should_trace(ret: u64) -> bool {
    ret & bits::VM_FAULT_RETRY == 0 && ret & bits::VM_FAULT_ERROR == 0
}

/// Classify a completed fault. Pure function of its three bit fields.
pub fn classify(flags: u64, ret: u64, error_code: u64) -> FaultCategory {
    if !should_trace(ret) {
        FaultCategory::Ignore
    } else if error_code == bits::ERROR_CODE_COW {
        FaultCategory::Cow
    } else if ret & bits::VM_FAULT_MAJOR != 0 || flags & bits::FAULT_FLAG_TRIED != 0 {
        FaultCategory::Major
    } else {
        FaultCategory::Minor
    }
}

/// A fault whose entry and return lines have both been seen
///
/// The category is derived from the bit fields at construction and on
/// deserialization; it cannot be set independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FaultRecord", into = "FaultRecord")]
pub struct FaultEvent {
    pub pid: u32,
    pub cpu: u32,
    pub timestamp_us: u64,
    pub address: u64,
    pub flags: u64,
    pub ret: u64,
    pub error_code: u64,
    category: FaultCategory,
}

impl FaultEvent {
    /// Complete a pending entry with its return bits
    pub fn complete(entry: &FaultEntry, ret: u64) -> Self {
        Self::new(
            entry.pid,
            entry.cpu,
            entry.timestamp_us,
            entry.address,
            entry.flags,
            ret,
            entry.error_code,
        )
    }

    pub fn new(
        pid: u32,
        cpu: u32,
        timestamp_us: u64,
        address: u64,
        flags: u64,
        ret: u64,
        error_code: u64,
    ) -> Self {
        Self {
            pid,
            cpu,
            timestamp_us,
            address,
            flags,
            ret,
            error_code,
            category: classify(flags, ret, error_code),
        }
    }

    pub fn category(&self) -> FaultCategory {
        self.category
    }

    /// True if this fault takes part in accounting
    pub fn is_counted(&self) -> bool {
        self.category != FaultCategory::Ignore
    }
}

/// On-disk shape of a fault: hex strings for the bit fields so no precision is lost
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FaultRecord {
    pid: u32,
    cpu: u32,
    timestamp: u64,
    #[serde(with = "hex_u64")]
    address: u64,
    #[serde(with = "hex_u64")]
    flags: u64,
    #[serde(with = "hex_u64")]
    ret: u64,
    #[serde(with = "hex_u64")]
    error_code: u64,
    #[serde(rename = "type")]
    category: FaultCategory,
}

impl From<FaultRecord> for FaultEvent {
    fn from(r: FaultRecord) -> Self {
        let event = FaultEvent::new(
            r.pid,
            r.cpu,
            r.timestamp,
            r.address,
            r.flags,
            r.ret,
            r.error_code,
        );
        if event.category != r.category {
            tracing::debug!(
                pid = r.pid,
                timestamp = r.timestamp,
                stored = %r.category,
                derived = %event.category,
                "stored fault category disagrees with its bits, using derived"
            );
        }
        event
    }
}

impl From<FaultEvent> for FaultRecord {
    fn from(e: FaultEvent) -> Self {
        Self {
            pid: e.pid,
            cpu: e.cpu,
            timestamp: e.timestamp_us,
            address: e.address,
            flags: e.flags,
            ret: e.ret,
            error_code: e.error_code,
            category: e.category,
        }
    }
}

/// Serialize a `u64` as a `0x`-prefixed hex string
pub(crate) mod hex_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid hex value {:?}", s)))
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

/// `<comm>-<pid> [(<tgid>)] [<cpu>] [<irq flags>] <secs>.<frac>:`
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-(\d+)\s+(?:\(\s*[\d-]+\)\s+)?\[(\d+)\]\s+(?:[^\s:]+\s+)?(\d+)\.(\d+):")
        .expect("valid header regex")
});
static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\baddress=(0x[0-9a-fA-F]+)").expect("valid address regex"));
static FLAGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bflags=(0x[0-9a-fA-F]+)").expect("valid flags regex"));
static ERROR_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\berror_code=(0x[0-9a-fA-F]+)").expect("valid error_code regex")
});
static RET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bret=(0x[0-9a-fA-F]+|\d+)").expect("valid ret regex"));

/// The entry half of a fault, waiting for its return line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEntry {
    pub pid: u32,
    pub cpu: u32,
    pub timestamp_us: u64,
    pub address: u64,
    pub flags: u64,
    pub error_code: u64,
}

/// Shape of one raw trace line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Entry(FaultEntry),
    Return { pid: u32, cpu: u32, ret: u64 },
    /// Recognized header but a numeric field did not fit
    Malformed(String),
    /// Anything else the trace stream carries
    Unrelated,
}

/// Convert `<secs>.<frac>` to microseconds, normalizing the fraction to six digits
fn timestamp_micros(secs: &str, frac: &str) -> Option<u64> {
    let secs: u64 = secs.parse().ok()?;
    let mut micros = String::with_capacity(6);
    micros.extend(frac.chars().take(6));
    while micros.len() < 6 {
        micros.push('0');
    }
    let micros: u64 = micros.parse().ok()?;
    secs.checked_mul(1_000_000)?.checked_add(micros)
}

fn parse_ret(s: &str) -> Option<u64> {
    parse_hex(s).or_else(|| s.parse().ok())
}

/// Event name of the entry probe, as printed in the trace stream
pub const ENTRY_EVENT: &str = "fault_entry";
/// Event name of the return probe
pub const EXIT_EVENT: &str = "fault_exit";

/// Name of the event following the header, e.g. `fault_entry` in `...: fault_entry: (...)`
fn event_name<'a>(line: &'a str, header_end: usize) -> Option<&'a str> {
    let rest = line[header_end..].trim_start();
    let (name, _) = rest.split_once(':')?;
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some(name)
}

/// Recognize a single trace line
///
/// Only the two faultline probes are accepted; any other event that reaches
/// the stream (a tracepoint left enabled by someone else, for instance) is
/// unrelated even if it carries an `address=` field.
pub fn parse_line(line: &str) -> RawLine {
    let Some(header) = HEADER_RE.captures(line) else {
        return RawLine::Unrelated;
    };
    let header_end = header.get(0).map_or(0, |m| m.end());
    let event = event_name(line, header_end);
    if event != Some(ENTRY_EVENT) && event != Some(EXIT_EVENT) {
        return RawLine::Unrelated;
    }
    let (Ok(pid), Ok(cpu)) = (header[1].parse::<u32>(), header[2].parse::<u32>()) else {
        return RawLine::Malformed("pid or cpu out of range".to_string());
    };

    if event == Some(ENTRY_EVENT) {
        let Some(address) = ADDRESS_RE.captures(line) else {
            return RawLine::Malformed("entry without address".to_string());
        };
        let Some(timestamp_us) = timestamp_micros(&header[3], &header[4]) else {
            return RawLine::Malformed("timestamp out of range".to_string());
        };
        let Some(address) = parse_hex(&address[1]) else {
            return RawLine::Malformed("address out of range".to_string());
        };
        let flags = FLAGS_RE
            .captures(line)
            .and_then(|c| parse_hex(&c[1]))
            .unwrap_or(0);
        let error_code = ERROR_CODE_RE
            .captures(line)
            .and_then(|c| parse_hex(&c[1]))
            .unwrap_or(0);
        return RawLine::Entry(FaultEntry {
            pid,
            cpu,
            timestamp_us,
            address,
            flags,
            error_code,
        });
    }

    match RET_RE.captures(line).map(|c| parse_ret(&c[1])) {
        Some(Some(ret)) => RawLine::Return { pid, cpu, ret },
        Some(None) => RawLine::Malformed("return value out of range".to_string()),
        None => RawLine::Malformed("return without ret".to_string()),
    }
}

/// What went wrong with a line that could not be turned into a fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyKind {
    /// A return line with no unpaired entry for its `(pid, cpu)`
    DanglingReturn { pid: u32, cpu: u32, ret: u64 },
    /// An entry line whose return never arrived before the stream ended
    UnpairedEntry { pid: u32, cpu: u32 },
    Malformed(String),
}

/// A skipped line, kept with enough context to diagnose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAnomaly {
    pub line_number: usize,
    pub line: String,
    pub kind: AnomalyKind,
}

impl fmt::Display for ParseAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AnomalyKind::DanglingReturn { pid, cpu, ret } => write!(
                f,
                "line {}: return ret={:#x} has no pending entry for pid={} cpu={}: {}",
                self.line_number, ret, pid, cpu, self.line
            ),
            AnomalyKind::UnpairedEntry { pid, cpu } => write!(
                f,
                "line {}: entry for pid={} cpu={} never returned: {}",
                self.line_number, pid, cpu, self.line
            ),
            AnomalyKind::Malformed(reason) => {
                write!(f, "line {}: {}: {}", self.line_number, reason, self.line)
            }
        }
    }
}

enum Slot {
    Pending { entry: FaultEntry, line_number: usize, line: String },
    Complete(FaultEvent),
}

/// Result of a full parse pass
#[derive(Debug, Default)]
pub struct FaultParse {
    /// Completed faults in entry-arrival order
    pub events: Vec<FaultEvent>,
    pub anomalies: Vec<ParseAnomaly>,
}

/// Pairing context for one capture stream
///
/// Owned by the caller; two captures never share pairing state.
#[derive(Default)]
pub struct FaultParser {
    slots: Vec<Slot>,
    pending: HashMap<(u32, u32), VecDeque<usize>>,
    anomalies: Vec<ParseAnomaly>,
    line_number: usize,
}

impl FaultParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next line of the stream
    pub fn feed_line(&mut self, line: &str) {
        self.line_number += 1;
        let line = line.trim_end();

        match parse_line(line) {
            RawLine::Entry(entry) => {
                let idx = self.slots.len();
                self.pending
                    .entry((entry.pid, entry.cpu))
                    .or_default()
                    .push_back(idx);
                self.slots.push(Slot::Pending {
                    entry,
                    line_number: self.line_number,
                    line: line.to_string(),
                });
            }
            RawLine::Return { pid, cpu, ret } => {
                let idx = self
                    .pending
                    .get_mut(&(pid, cpu))
                    .and_then(|queue| queue.pop_front());
                match idx {
                    Some(idx) => self.complete(idx, ret),
                    None => self.anomaly(line, AnomalyKind::DanglingReturn { pid, cpu, ret }),
                }
            }
            RawLine::Malformed(reason) => self.anomaly(line, AnomalyKind::Malformed(reason)),
            RawLine::Unrelated => {}
        }
    }

    fn complete(&mut self, idx: usize, ret: u64) {
        let event = match &self.slots[idx] {
            Slot::Pending { entry, .. } => FaultEvent::complete(entry, ret),
            Slot::Complete(_) => return,
        };
        self.slots[idx] = Slot::Complete(event);
    }

    fn anomaly(&mut self, line: &str, kind: AnomalyKind) {
        let anomaly = ParseAnomaly {
            line_number: self.line_number,
            line: line.to_string(),
            kind,
        };
        tracing::warn!("{}", anomaly);
        self.anomalies.push(anomaly);
    }

    /// Number of entries still waiting for their return line
    pub fn pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// End the stream: completed faults in entry order, unpaired entries become anomalies
    pub fn finish(mut self) -> FaultParse {
        let mut events = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Slot::Complete(event) => events.push(event),
                Slot::Pending {
                    entry,
                    line_number,
                    line,
                } => {
                    let anomaly = ParseAnomaly {
                        line_number,
                        line,
                        kind: AnomalyKind::UnpairedEntry {
                            pid: entry.pid,
                            cpu: entry.cpu,
                        },
                    };
                    tracing::warn!("{}", anomaly);
                    self.anomalies.push(anomaly);
                }
            }
        }
        self.anomalies.sort_by_key(|a| a.line_number);
        FaultParse {
            events,
            anomalies: self.anomalies,
        }
    }

    /// Parse a whole stream
    pub fn parse_reader<R: BufRead>(reader: R) -> std::io::Result<FaultParse> {
        let mut parser = Self::new();
        for line in reader.lines() {
            parser.feed_line(&line?);
        }
        Ok(parser.finish())
    }

    pub fn parse_str(text: &str) -> FaultParse {
        let mut parser = Self::new();
        for line in text.lines() {
            parser.feed_line(line);
        }
        parser.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, cpu: u32, ts: &str, fields: &str) -> String {
        format!(
            "         python3-{pid}     [{cpu:03}] d..1.  {ts}: fault_entry: (handle_mm_fault+0x0/0x2d0) {fields}"
        )
    }

    fn ret(pid: u32, cpu: u32, ts: &str, ret: &str) -> String {
        format!(
            "         python3-{pid}     [{cpu:03}] d..1.  {ts}: fault_exit: (do_user_addr_fault+0x1c3/0x6b0 <- handle_mm_fault) ret={ret}"
        )
    }

    #[test]
    fn test_cow_scenario() {
        let text = [
            entry(100, 2, "1.000010", "address=0x7f1234567000 flags=0x255 error_code=0x7"),
            ret(100, 2, "1.000012", "0x0"),
        ]
        .join("\n");
        let parse = FaultParser::parse_str(&text);
        assert_eq!(parse.events.len(), 1);
        assert!(parse.anomalies.is_empty());
        let fault = &parse.events[0];
        assert_eq!(fault.pid, 100);
        assert_eq!(fault.cpu, 2);
        assert_eq!(fault.timestamp_us, 1_000_010);
        assert_eq!(fault.address, 0x7f1234567000);
        assert_eq!(fault.category(), FaultCategory::Cow);
    }

    #[test]
    fn test_tried_flag_is_major() {
        let text = [
            entry(100, 1, "2.000000", "address=0x1000 flags=0x20 error_code=0x0"),
            ret(100, 1, "2.000001", "0x0"),
        ]
        .join("\n");
        let parse = FaultParser::parse_str(&text);
        assert_eq!(parse.events[0].category(), FaultCategory::Major);
    }

    #[test]
    fn test_dangling_return_is_anomaly() {
        let text = [
            ret(100, 3, "1.000000", "0x0"),
            entry(100, 1, "1.000005", "address=0x2000 flags=0x0 error_code=0x6"),
            ret(100, 1, "1.000006", "0x0"),
        ]
        .join("\n");
        let parse = FaultParser::parse_str(&text);
        assert_eq!(parse.events.len(), 1);
        assert_eq!(parse.events[0].category(), FaultCategory::Minor);
        assert_eq!(parse.anomalies.len(), 1);
        assert_eq!(parse.anomalies[0].line_number, 1);
        assert_eq!(
            parse.anomalies[0].kind,
            AnomalyKind::DanglingReturn {
                pid: 100,
                cpu: 3,
                ret: 0
            }
        );
    }

    #[test]
    fn test_pairing_is_fifo_per_pid_cpu() {
        let text = [
            entry(7, 0, "1.000001", "address=0x1000 error_code=0x6"),
            entry(8, 1, "1.000002", "address=0x2000 error_code=0x7"),
            entry(7, 0, "1.000003", "address=0x3000 error_code=0x6"),
            ret(8, 1, "1.000004", "0x0"),
            ret(7, 0, "1.000005", "0x4"),
            ret(7, 0, "1.000006", "0x400"),
        ]
        .join("\n");
        let parse = FaultParser::parse_str(&text);
        assert!(parse.anomalies.is_empty());
        let cats: Vec<_> = parse.events.iter().map(|e| (e.address, e.category())).collect();
        assert_eq!(
            cats,
            vec![
                (0x1000, FaultCategory::Major),
                (0x2000, FaultCategory::Cow),
                (0x3000, FaultCategory::Ignore),
            ]
        );
    }

    #[test]
    fn test_unpaired_entry_reported_at_finish() {
        let text = entry(5, 0, "3.5", "address=0x1000");
        let parse = FaultParser::parse_str(&text);
        assert!(parse.events.is_empty());
        assert_eq!(
            parse.anomalies[0].kind,
            AnomalyKind::UnpairedEntry { pid: 5, cpu: 0 }
        );
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        let text = "# tracer: nop\n#\n  <idle>-0  [001] d.h2. 10.000000: sched_switch: prev_comm=swapper\n";
        let parse = FaultParser::parse_str(text);
        assert!(parse.events.is_empty());
        assert!(parse.anomalies.is_empty());
    }

    #[test]
    fn test_timestamp_normalization() {
        assert_eq!(timestamp_micros("1", "000010"), Some(1_000_010));
        assert_eq!(timestamp_micros("3", "5"), Some(3_500_000));
        assert_eq!(timestamp_micros("12", "123456789"), Some(12_123_456));
    }

    #[test]
    fn test_header_with_tgid_and_no_irq_flags() {
        let line = "bash-4242 (   4242) [000] 55.000001: fault_entry: (handle_mm_fault+0x0/0x2d0) address=0x55d0 flags=0x0 error_code=0x6";
        match parse_line(line) {
            RawLine::Entry(e) => {
                assert_eq!(e.pid, 4242);
                assert_eq!(e.cpu, 0);
                assert_eq!(e.timestamp_us, 55_000_001);
                assert_eq!(e.error_code, 0x6);
                assert_eq!(e.flags, 0);
            }
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_fault_events_do_not_pair() {
        // A tracepoint enabled outside faultline carries address= too
        let text = [
            "bash-7 [001] d..1. 1.000001: page_fault_user: address=0x55d0 ip=0x4010 error_code=0x6".to_string(),
            entry(7, 1, "1.000002", "address=0x1000 flags=0x20 error_code=0x6"),
            ret(7, 1, "1.000003", "0x0"),
        ]
        .join("\n");
        let parse = FaultParser::parse_str(&text);
        assert!(parse.anomalies.is_empty());
        assert_eq!(parse.events.len(), 1);
        assert_eq!(parse.events[0].address, 0x1000);
        assert_eq!(parse.events[0].category(), FaultCategory::Major);
    }

    #[test]
    fn test_kprobe_lines_missing_fields_are_malformed() {
        let no_address = "x-1 [000] .... 1.0: fault_entry: (handle_mm_fault+0x0/0x2d0) flags=0x0";
        assert!(matches!(parse_line(no_address), RawLine::Malformed(_)));
        let no_ret = "x-1 [000] .... 1.0: fault_exit: (x <- handle_mm_fault)";
        assert!(matches!(parse_line(no_ret), RawLine::Malformed(_)));
        let other = "x-1 [000] .... 1.0: fault_entry_other: address=0x1";
        assert_eq!(parse_line(other), RawLine::Unrelated);
    }

    #[test]
    fn test_decimal_return_value() {
        let line = "python3-9 [003] ..... 1.000000: fault_exit: (x <- handle_mm_fault) ret=1024";
        assert_eq!(
            parse_line(line),
            RawLine::Return {
                pid: 9,
                cpu: 3,
                ret: bits::VM_FAULT_RETRY
            }
        );
    }

    #[test]
    fn test_pid_overflow_is_malformed() {
        let text = ret(0, 0, "1.0", "0x0").replace("python3-0", "python3-99999999999");
        let parse = FaultParser::parse_str(&text);
        assert!(matches!(parse.anomalies[0].kind, AnomalyKind::Malformed(_)));
    }

    #[test]
    fn test_classify_error_bits_ignored() {
        for ret in [
            bits::VM_FAULT_OOM,
            bits::VM_FAULT_SIGBUS,
            bits::VM_FAULT_SIGSEGV,
            bits::VM_FAULT_HWPOISON,
            bits::VM_FAULT_HWPOISON_LARGE,
            bits::VM_FAULT_FALLBACK,
            bits::VM_FAULT_RETRY | bits::VM_FAULT_MAJOR,
        ] {
            assert_eq!(classify(0, ret, 0x7), FaultCategory::Ignore);
        }
    }

    #[test]
    fn test_classify_precedence() {
        // cow wins over major
        assert_eq!(classify(bits::FAULT_FLAG_TRIED, bits::VM_FAULT_MAJOR, 0x7), FaultCategory::Cow);
        assert_eq!(classify(0, bits::VM_FAULT_MAJOR, 0x6), FaultCategory::Major);
        assert_eq!(classify(bits::FAULT_FLAG_WRITE, bits::VM_FAULT_DONE_COW, 0x6), FaultCategory::Minor);
    }

    #[test]
    fn test_fault_event_serializes_hex() {
        let e = FaultEvent::new(1, 2, 3, 0xdeadbeef, 0x255, 0x4, 0x6);
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"address\":\"0xdeadbeef\""));
        assert!(json.contains("\"type\":\"major\""));
        let back: FaultEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_stored_category_is_rederived() {
        let json = r#"{"pid":1,"cpu":0,"timestamp":5,"address":"0x10","flags":"0x0","ret":"0x400","error_code":"0x7","type":"cow"}"#;
        let e: FaultEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.category(), FaultCategory::Ignore);
    }
}
