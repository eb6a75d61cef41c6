//! Execution-location sample parsing
//!
//! The in-target sampler emits one line per location entry:
//! `pid,sample_id,source_location,timestamp_us`. Several entries may share a
//! `sample_id` when the sampler records a whole call chain at one tick; the
//! source location itself may contain commas, so it is everything between the
//! second comma and the last one.

use crate::error::{FaultlineError, Result};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// Where one traced process was executing at one instant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationSample {
    pub pid: u32,
    pub sample_id: u64,
    pub location: String,
    #[serde(rename = "timestamp")]
    pub timestamp_us: u64,
}

impl LocationSample {
    pub fn new(pid: u32, sample_id: u64, location: impl Into<String>, timestamp_us: u64) -> Self {
        Self {
            pid,
            sample_id,
            location: location.into(),
            timestamp_us,
        }
    }

    /// Render in the sampler's wire format
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{}",
            self.pid, self.sample_id, self.location, self.timestamp_us
        )
    }
}

/// Parser for the sampler's line format
pub struct SampleParser;

impl SampleParser {
    /// Parse one line. Blank lines yield `None`.
    pub fn parse_line(line: &str, line_number: usize) -> Result<Option<LocationSample>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let fail = |reason: &str| FaultlineError::SampleParse {
            line_number,
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let mut head = trimmed.splitn(3, ',');
        let pid = head.next().ok_or_else(|| fail("missing pid"))?;
        let sample_id = head.next().ok_or_else(|| fail("missing sample id"))?;
        let rest = head.next().ok_or_else(|| fail("missing location"))?;
        let (location, timestamp) = rest
            .rsplit_once(',')
            .ok_or_else(|| fail("missing timestamp"))?;

        let pid: u32 = pid.trim().parse().map_err(|_| fail("pid is not a number"))?;
        let sample_id: u64 = sample_id
            .trim()
            .parse()
            .map_err(|_| fail("sample id is not a number"))?;
        let timestamp_us: u64 = timestamp
            .trim()
            .parse()
            .map_err(|_| fail("timestamp is not a number"))?;
        let location = location.trim();
        if location.is_empty() {
            return Err(fail("empty source location"));
        }

        Ok(Some(LocationSample {
            pid,
            sample_id,
            location: location.to_string(),
            timestamp_us,
        }))
    }

    /// Parse a whole stream, failing on the first malformed line
    pub fn parse_str(text: &str) -> Result<Vec<LocationSample>> {
        let mut samples = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if let Some(sample) = Self::parse_line(line, idx + 1)? {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    pub fn parse_reader<R: BufRead>(reader: R) -> Result<Vec<LocationSample>> {
        let mut samples = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            if let Some(sample) = Self::parse_line(&line?, idx + 1)? {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    /// Parse a whole stream, skipping malformed lines and returning them alongside
    pub fn parse_lenient(text: &str) -> (Vec<LocationSample>, Vec<FaultlineError>) {
        let mut samples = Vec::new();
        let mut errors = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            match Self::parse_line(line, idx + 1) {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("skipping sample: {}", e);
                    errors.push(e);
                }
            }
        }
        (samples, errors)
    }
}

/// Which locations count as "code we care about"
///
/// Applied sampler-side: of each tick's entries only the first matching one
/// is kept, so the correlation engine sees at most one location per tick.
#[derive(Debug, Clone, Default)]
pub struct SamplePolicy {
    include: Vec<String>,
}

impl SamplePolicy {
    /// Keep the first entry of every tick
    pub fn any() -> Self {
        Self::default()
    }

    /// Keep locations starting with one of the given prefixes
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, location: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|p| location.starts_with(p.as_str()))
    }

    /// Reduce each tick (consecutive entries sharing pid and sample id) to its first match
    pub fn retain(&self, samples: Vec<LocationSample>) -> Vec<LocationSample> {
        let mut kept: Vec<LocationSample> = Vec::new();
        let mut current: Option<(u32, u64, bool)> = None;

        for sample in samples {
            let tick = (sample.pid, sample.sample_id);
            let satisfied = match current {
                Some((pid, id, satisfied)) if (pid, id) == tick => satisfied,
                _ => false,
            };
            let take = !satisfied && self.matches(&sample.location);
            current = Some((tick.0, tick.1, satisfied || take));
            if take {
                kept.push(sample);
            }
        }

        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_line() {
        let s = SampleParser::parse_line("101,3,a.py:10,600", 1).unwrap().unwrap();
        assert_eq!(s, LocationSample::new(101, 3, "a.py:10", 600));
    }

    #[test]
    fn test_location_with_commas() {
        let s = SampleParser::parse_line("1,2,f(a, b) at x.py:3,99", 1)
            .unwrap()
            .unwrap();
        assert_eq!(s.location, "f(a, b) at x.py:3");
        assert_eq!(s.timestamp_us, 99);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let samples = SampleParser::parse_str("\n1,1,a.py:1,10\n   \n1,2,a.py:2,20\n").unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].sample_id, 2);
    }

    #[test]
    fn test_malformed_line_identified() {
        let err = SampleParser::parse_str("1,1,a.py:1,10\n1,x,a.py:2,20\n").unwrap_err();
        match err {
            FaultlineError::SampleParse {
                line_number,
                line,
                reason,
            } => {
                assert_eq!(line_number, 2);
                assert_eq!(line, "1,x,a.py:2,20");
                assert!(reason.contains("sample id"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_fields() {
        assert!(SampleParser::parse_line("1,2", 1).is_err());
        assert!(SampleParser::parse_line("1,2,loc", 1).is_err());
        assert!(SampleParser::parse_line("1,2, ,5", 1).is_err());
        assert!(SampleParser::parse_line("-1,2,loc,5", 1).is_err());
    }

    #[test]
    fn test_lenient_collects_errors() {
        let (samples, errors) = SampleParser::parse_lenient("1,1,a,10\nbad\n1,2,b,20\n");
        assert_eq!(samples.len(), 2);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_to_line_parses_back() {
        let s = LocationSample::new(7, 8, "lib/x.py:42", 1234);
        let back = SampleParser::parse_line(&s.to_line(), 1).unwrap().unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_policy_keeps_first_match_per_tick() {
        let samples = vec![
            LocationSample::new(1, 1, "/usr/lib/python3/os.py:10", 100),
            LocationSample::new(1, 1, "app/main.py:5", 100),
            LocationSample::new(1, 1, "app/util.py:9", 100),
            LocationSample::new(1, 2, "/usr/lib/python3/re.py:1", 200),
            LocationSample::new(1, 3, "app/main.py:6", 300),
        ];
        let kept = SamplePolicy::with_prefixes(["app/"]).retain(samples);
        let locations: Vec<_> = kept.iter().map(|s| s.location.as_str()).collect();
        assert_eq!(locations, vec!["app/main.py:5", "app/main.py:6"]);
    }

    #[test]
    fn test_policy_any_keeps_first_entry() {
        let samples = vec![
            LocationSample::new(1, 1, "a:1", 100),
            LocationSample::new(1, 1, "b:1", 100),
            LocationSample::new(2, 1, "c:1", 100),
        ];
        let kept = SamplePolicy::any().retain(samples);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].pid, 2);
    }
}
