/// Correlation and fault parsing benchmarks
///
/// Measures bucketing cost as the number of faults and ticks per process
/// grows, and the throughput of pairing raw trace lines.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use faultline::fault::FaultParser;
use faultline::lineage::{ProcessRecord, ProcessTree};
use faultline::{correlate, FaultEvent, LocationSample};

const PROCESSES: u32 = 4;

/// Faults spread evenly over `PROCESSES` pids with one tick every 100us
fn workload(faults_per_process: u64) -> (Vec<FaultEvent>, Vec<LocationSample>, ProcessTree) {
    let mut faults = Vec::new();
    let mut samples = Vec::new();
    for pid in 1..=PROCESSES {
        for i in 0..faults_per_process {
            let ts = 1_000 + i * 10;
            let error_code = if i % 7 == 0 { 0x7 } else { 0x6 };
            let ret = if i % 13 == 0 { 0x4 } else { 0x0 };
            faults.push(FaultEvent::new(pid, (i % 8) as u32, ts, i << 12, 0x255, ret, error_code));
        }
        for tick in 0..faults_per_process / 10 {
            let location = format!("app/module_{}.py:{}", tick % 17, tick % 50);
            samples.push(LocationSample::new(pid, tick, location, 1_000 + tick * 100));
        }
    }
    let tree = ProcessTree::from_records(
        1,
        (2..=PROCESSES).map(|pid| ProcessRecord::new(pid - 1, pid, 900)),
    )
    .unwrap();
    (faults, samples, tree)
}

fn bench_correlate(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlate");
    for size in [1_000u64, 10_000, 100_000] {
        let (faults, samples, tree) = workload(size);
        group.throughput(Throughput::Elements(faults.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| correlate(black_box(&faults), black_box(&samples), black_box(&tree)))
        });
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut text = String::new();
    for i in 0..20_000u64 {
        let cpu = i % 8;
        text.push_str(&format!(
            "app-100 [{cpu:03}] d..1. 1.{:06}: fault_entry: (handle_mm_fault+0x0/0x2d0) address={:#x} flags=0x255 error_code=0x6\n",
            i * 3,
            i << 12
        ));
        text.push_str(&format!(
            "app-100 [{cpu:03}] d..1. 1.{:06}: fault_exit: (do_user_addr_fault+0x1c3/0x6b0 <- handle_mm_fault) ret=0x0\n",
            i * 3 + 1
        ));
    }

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(20_000));
    group.bench_function("pair_20k", |b| b.iter(|| FaultParser::parse_str(black_box(&text))));
    group.finish();
}

criterion_group!(benches, bench_correlate, bench_parse);
criterion_main!(benches);
