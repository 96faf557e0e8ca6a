//! Benchmarks for history queries and flushes.
//!
//! Each group builds a registry holding a few hundred persisted windows spread
//! over several depths, then measures one operation against it.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use op_history::{
    HistoricalMode, HistoricalRegistry, ManualClock, OpFilter, PersistenceParams,
    RegistryConfig, UidState,
};
use std::sync::Arc;
use tempfile::TempDir;

const START: i64 = 1_000_000;
const BASE: i64 = 1_000;
const WINDOWS: usize = 300;

fn populated_registry(temp: &TempDir) -> (Arc<ManualClock>, HistoricalRegistry) {
    let clock = Arc::new(ManualClock::new(START));
    let registry = HistoricalRegistry::open(
        RegistryConfig::new(
            temp.path().join("history"),
            PersistenceParams::new(HistoricalMode::EnabledActive, BASE, 4),
        ),
        clock.clone(),
    )
    .unwrap();

    for window in 0..WINDOWS {
        for uid in 0..4u32 {
            registry.record_access(
                (window % 8) as u32,
                10_000 + uid,
                "com.example",
                UidState::Foreground,
            );
            registry.record_duration(1, 10_000 + uid, "com.other", UidState::Top, 50);
        }
        clock.advance(BASE);
        registry.roll_over();
        registry.persist_pending_history();
    }
    (clock, registry)
}

fn benchmark_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let temp = TempDir::new().unwrap();
    let (clock, registry) = populated_registry(&temp);
    let now = START + WINDOWS as i64 * BASE;
    clock.set(now);

    let ranges = [
        ("last_window", now - BASE, now),
        ("last_minute", now - 60_000, now),
        ("everything", i64::MIN, i64::MAX),
    ];
    for (name, begin, end) in ranges {
        group.bench_with_input(BenchmarkId::from_parameter(name), &(begin, end), |b, &(begin, end)| {
            b.iter(|| registry.query(black_box(&OpFilter::all()), begin, end));
        });
    }

    let filter = OpFilter::all().uid(10_001).ops(vec![3]);
    group.bench_function("filtered_everything", |b| {
        b.iter(|| registry.query(black_box(&filter), i64::MIN, i64::MAX));
    });

    group.bench_function("intervals_everything", |b| {
        b.iter(|| registry.query_intervals(black_box(&OpFilter::all()), i64::MIN, i64::MAX));
    });

    group.finish();
}

fn benchmark_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    group.sample_size(20);

    let temp = TempDir::new().unwrap();
    let (clock, registry) = populated_registry(&temp);
    group.bench_function("one_window", |b| {
        b.iter(|| {
            registry.record_access(42, 10_000, "com.example", UidState::Top);
            clock.advance(BASE);
            registry.roll_over();
            black_box(registry.persist_pending_history())
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_query, benchmark_flush);
criterion_main!(benches);
