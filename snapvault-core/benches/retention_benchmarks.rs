/*!
Benchmarks for retention evaluation and reconciliation over large listings.
*/

use chrono::{DateTime, TimeDelta, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rayon::prelude::*;
use snapvault_core::gaps::remote_name_set;
use snapvault_core::{evaluate, find_gaps, reconcile, Location, NameResolver, RetentionPolicy, SnapshotRecord};

// Hourly snapshots going back `len` hours
fn hourly_listing(now: DateTime<Utc>, location: Location, len: usize) -> Vec<SnapshotRecord> {
    (0..len)
        .map(|i| {
            SnapshotRecord::new(format!("snapshot-{i:06}.db.zst"), location)
                .modified(now - TimeDelta::hours(i as i64))
                .with_size(64 * 1024 * 1024)
        })
        .collect()
}

fn benchmark_evaluate(c: &mut Criterion) {
    let now = Utc::now();
    let policy = RetentionPolicy::default();
    let mut group = c.benchmark_group("evaluate");

    for len in [100usize, 1_000, 10_000, 100_000] {
        let records = hourly_listing(now, Location::Local, len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &records, |b, records| {
            b.iter(|| evaluate(black_box(records), black_box(&policy), now))
        });
    }

    group.finish();
}

fn benchmark_reconcile(c: &mut Criterion) {
    let now = Utc::now();
    let policy = RetentionPolicy::default();
    let mut group = c.benchmark_group("reconcile");

    for len in [1_000usize, 10_000, 50_000] {
        let local = hourly_listing(now, Location::Local, len);
        // Remote lags the local tier by a quarter of the listing
        let remote = hourly_listing(now, Location::Remote, len)
            .into_iter()
            .skip(len / 4)
            .collect::<Vec<_>>();
        group.throughput(Throughput::Elements((local.len() + remote.len()) as u64));
        group.bench_function(BenchmarkId::from_parameter(len), |b| {
            b.iter(|| reconcile(black_box(&local), black_box(&remote), &policy, now))
        });
    }

    group.finish();
}

fn benchmark_gap_scan(c: &mut Criterion) {
    let now = Utc::now();
    let local = hourly_listing(now, Location::Local, 20_000);
    let remote: Vec<_> = local
        .iter()
        .step_by(2)
        .map(|record| SnapshotRecord {
            location: Location::Remote,
            ..record.clone()
        })
        .collect();
    let verdict = evaluate(&local, &RetentionPolicy::keep_last(10_000), now);

    c.bench_function("find_gaps_20k", |b| {
        b.iter(|| {
            let names = remote_name_set(black_box(&remote));
            find_gaps(black_box(&local), Some(&names), &verdict)
        })
    });
}

fn benchmark_parallel_evaluations(c: &mut Criterion) {
    let now = Utc::now();
    let listings: Vec<_> = (0..16)
        .map(|_| hourly_listing(now, Location::Local, 5_000))
        .collect();
    let policy = RetentionPolicy::default();

    c.bench_function("evaluate_16_listings_parallel", |b| {
        b.iter(|| {
            listings
                .par_iter()
                .map(|records| evaluate(records, &policy, now).kept().count())
                .sum::<usize>()
        })
    });
}

fn benchmark_name_resolution(c: &mut Criterion) {
    let resolver = NameResolver::default();
    c.bench_function("resolve_raw_fallback", |b| {
        b.iter(|| resolver.resolve(black_box("snapshot-000001.db"), |name| Ok(name.ends_with(".db"))))
    });
}

criterion_group!(
    benches,
    benchmark_evaluate,
    benchmark_reconcile,
    benchmark_gap_scan,
    benchmark_parallel_evaluations,
    benchmark_name_resolution
);
criterion_main!(benches);
