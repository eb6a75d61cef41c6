//! faultline - page fault attribution for process trees
//!
//! Captures kernel page fault events for a program and all of its
//! descendants, pairs them with location samples taken inside the target,
//! and aggregates minor, major and copy-on-write faults per process and per
//! source location.

pub mod capture;
pub mod cli;
pub mod config;
pub mod correlate;
pub mod error;
pub mod fault;
pub mod lineage;
pub mod report;
pub mod sample;
pub mod session;

pub use correlate::{correlate, AggregateBucket, AggregateReport, BucketKey, ProcessReport};
pub use error::{FaultlineError, Result};
pub use fault::{classify, FaultCategory, FaultEvent, FaultParser};
pub use lineage::{ProcessRecord, ProcessTree};
pub use report::{ReportFormat, Trace};
pub use sample::{LocationSample, SampleParser, SamplePolicy};
