//! Benchmarks for memtrail.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use memtrail::report::aggregate;
use memtrail::{
    Allocation, AllocationRecord, AllocatorKind, Destination, Tracker, TrackerConfig,
};

fn bench_record_events(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.memtrail");
    let config = TrackerConfig { memory_snapshot_every: 0, ..TrackerConfig::embedded() };
    let tracker = Tracker::start(Destination::path(&path), config).unwrap();

    let mut group = c.benchmark_group("record_events");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("alloc_free_pairs_1000x", |b| {
        b.iter(|| {
            for i in 0..500u64 {
                memtrail::record_allocation(AllocatorKind::Malloc, 0x10_0000 + i, 64);
                memtrail::record_allocation(AllocatorKind::Free, 0x10_0000 + i, 0);
            }
        })
    });

    group.finish();
    tracker.stop().unwrap();
}

fn synthetic_events(count: u64) -> Vec<Allocation> {
    (0..count)
        .map(|i| Allocation {
            record: AllocationRecord {
                thread_id: i % 4,
                address: 0x1000 + i * 16,
                size: 32 + (i % 7) * 8,
                kind: AllocatorKind::Malloc,
                line: 0,
                native_frame_id: 0,
                generation: 0,
            },
            stack_id: (i % 32) as u32,
            n_allocations: 1,
        })
        .collect()
}

fn bench_aggregation(c: &mut Criterion) {
    let events = synthetic_events(100_000);

    let mut group = c.benchmark_group("aggregation");
    group.throughput(Throughput::Elements(events.len() as u64));

    group.bench_function("high_watermark_100k", |b| {
        b.iter(|| black_box(aggregate::find_high_watermark(&events)))
    });

    group.bench_function("leak_snapshot_100k", |b| {
        b.iter(|| black_box(aggregate::leak_snapshot(&events, true)))
    });

    group.finish();
}

criterion_group!(benches, bench_record_events, bench_aggregation);
criterion_main!(benches);
