//! Property-based tests for classification and correlation
//!
//! Properties covered:
//! 1. Classification is a pure function of its three bit fields
//! 2. Faults the kernel does not account are never counted in any bucket
//! 3. Every counted fault lands in exactly one bucket of its own process
//! 4. Duplicate lifecycle signals leave the coordinator unchanged

use faultline::fault::{bits, classify, should_trace};
use faultline::lineage::{ProcessRecord, ProcessTree};
use faultline::{correlate, BucketKey, FaultCategory, FaultEvent, LocationSample};
use proptest::prelude::*;

fn fault_strategy(pids: Vec<u32>) -> impl Strategy<Value = FaultEvent> {
    (
        prop::sample::select(pids),
        0u32..8,
        0u64..10_000,
        any::<u64>(),
        0u64..0x80,
        prop::sample::select(vec![
            0,
            bits::VM_FAULT_MAJOR,
            bits::VM_FAULT_RETRY,
            bits::VM_FAULT_OOM,
            bits::VM_FAULT_SIGSEGV,
            bits::VM_FAULT_MAJOR | bits::VM_FAULT_RETRY,
            bits::VM_FAULT_DONE_COW,
        ]),
        0u64..0x20,
    )
        .prop_map(|(pid, cpu, ts, address, flags, ret, error_code)| {
            FaultEvent::new(pid, cpu, ts, address, flags, ret, error_code)
        })
}

fn sample_strategy(pids: Vec<u32>) -> impl Strategy<Value = LocationSample> {
    (
        prop::sample::select(pids),
        0u64..50,
        prop::sample::select(vec!["a.py:1", "a.py:2", "b.py:7", "lib/c.py:30"]),
        0u64..10_000,
    )
        .prop_map(|(pid, id, loc, ts)| LocationSample::new(pid, id, loc, ts))
}

fn tree() -> ProcessTree {
    ProcessTree::from_records(
        1,
        [ProcessRecord::new(1, 2, 2_000), ProcessRecord::new(2, 3, 5_000)],
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_classification_is_pure(flags in any::<u64>(), ret in any::<u64>(), code in any::<u64>()) {
        let first = classify(flags, ret, code);
        prop_assert_eq!(first, classify(flags, ret, code));
        prop_assert_eq!(first == FaultCategory::Ignore, !should_trace(ret));
    }

    #[test]
    fn prop_cow_only_from_error_code(flags in any::<u64>(), code in any::<u64>()) {
        let category = classify(flags, 0, code);
        if category == FaultCategory::Cow {
            prop_assert_eq!(code, bits::ERROR_CODE_COW);
        }
    }

    #[test]
    fn prop_ignored_faults_never_counted(
        faults in prop::collection::vec(fault_strategy(vec![1, 2, 3]), 0..60),
        samples in prop::collection::vec(sample_strategy(vec![1, 2, 3]), 0..30),
    ) {
        let counted: Vec<FaultEvent> = faults.iter().filter(|f| f.is_counted()).cloned().collect();
        let all = correlate(&faults, &samples, &tree());
        let only_counted = correlate(&counted, &samples, &tree());
        prop_assert_eq!(all, only_counted);
    }

    #[test]
    fn prop_partition(
        mut faults in prop::collection::vec(fault_strategy(vec![1, 2, 3, 9]), 0..80),
        mut samples in prop::collection::vec(sample_strategy(vec![1, 2, 3]), 0..40),
    ) {
        samples.sort_by_key(|s| (s.pid, s.timestamp_us));
        faults.reverse();
        let report = correlate(&faults, &samples, &tree());

        for pid in [1u32, 2, 3, 9] {
            let expected = faults
                .iter()
                .filter(|f| f.pid == pid && f.category() != FaultCategory::Ignore)
                .count() as u64;
            let got = report.process(pid).map(|p| p.summary().total()).unwrap_or(0);
            prop_assert_eq!(got, expected, "pid {}", pid);
        }
        for process in &report.processes {
            prop_assert!(process.buckets.iter().all(|b| b.pid == process.pid));
            prop_assert_eq!(process.buckets.first().map(|b| &b.key), Some(&BucketKey::Startup));
            prop_assert_eq!(process.buckets.last().map(|b| &b.key), Some(&BucketKey::Teardown));
        }
    }

    #[test]
    fn prop_correlation_is_deterministic(
        faults in prop::collection::vec(fault_strategy(vec![1, 2]), 0..40),
        samples in prop::collection::vec(sample_strategy(vec![1, 2]), 0..20),
    ) {
        prop_assert_eq!(
            correlate(&faults, &samples, &tree()),
            correlate(&faults, &samples, &tree())
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_duplicate_signals_are_idempotent(extra_starts in 1usize..4, extra_stops in 1usize..4) {
        use faultline::capture::{CaptureCoordinator, CaptureSignal, CaptureState, MemorySurface, Transition};
        use faultline::config::CaptureConfig;

        let dir = tempfile::TempDir::new().unwrap();
        let (surface, feed) = MemorySurface::new();
        let log = surface.write_log();
        let mut coord = CaptureCoordinator::new(surface, CaptureConfig::default(), dir.path().join("raw"));
        coord.arm().unwrap();

        coord.handle(CaptureSignal::Start { root_pid: 10 }).unwrap();
        let writes_after_start = log.lock().unwrap().len();
        for _ in 0..extra_starts {
            let t = coord.handle(CaptureSignal::Start { root_pid: 10 }).unwrap();
            prop_assert!(matches!(t, Transition::Ignored(_)));
        }
        prop_assert_eq!(coord.state(), CaptureState::Enabled);
        prop_assert_eq!(log.lock().unwrap().len(), writes_after_start);

        drop(feed);
        coord.handle(CaptureSignal::Stop).unwrap();
        let writes_after_stop = log.lock().unwrap().len();
        for _ in 0..extra_stops {
            coord.handle(CaptureSignal::Stop).unwrap();
        }
        prop_assert_eq!(coord.state(), CaptureState::Disabled);
        prop_assert_eq!(log.lock().unwrap().len(), writes_after_stop);
        prop_assert_eq!(coord.violations().len(), extra_starts + extra_stops);
        coord.reset();
    }
}
