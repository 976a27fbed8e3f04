//! Watch change aggregation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidal_bench::{acked_aggregator, random_document};
use tidal_sync_protocol::{
    ResumeToken, SnapshotVersion, TargetId, TargetStateChange, WatchChange,
    WatchTargetChangeState,
};

/// Benchmark a snapshot carrying `n` new documents for one target.
fn bench_document_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_changes");

    for count in [10usize, 100, 1000] {
        let changes: Vec<WatchChange> = (0..count)
            .map(|i| WatchChange::document(vec![TargetId::new(2)], vec![], random_document("c0", i, 5)))
            .collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &changes, |b, changes| {
            b.iter(|| {
                let (mut aggregator, metadata) = acked_aggregator(1);
                for change in changes {
                    if let WatchChange::Document(change) = change {
                        aggregator.handle_document_change(change, &metadata);
                    }
                }
                let event =
                    aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
                black_box(event);
            });
        });
    }
    group.finish();
}

/// Benchmark a global snapshot marker over many targets.
fn bench_snapshot_over_targets(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_over_targets");

    for targets in [1usize, 50, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(targets), &targets, |b, &targets| {
            b.iter(|| {
                let (mut aggregator, metadata) = acked_aggregator(targets);
                let current = TargetStateChange {
                    state: WatchTargetChangeState::Current,
                    target_ids: vec![],
                    resume_token: ResumeToken::from("v5"),
                    cause: None,
                };
                aggregator.handle_target_change(&current, &metadata);
                let event =
                    aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
                black_box(event);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_document_changes, bench_snapshot_over_targets);

criterion_main!(benches);
