//! Hybrid logical clock benchmarks.
//!
//! Benchmarks for:
//! - Local timestamp generation
//! - Merging remote timestamps, trusted and checked
//! - Contended `now()` across threads

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meridian_mvcc::{HybridClock, ManualClock};

/// Benchmark `now()` on the system clock.
fn bench_now(c: &mut Criterion) {
    let clock = HybridClock::system(Duration::from_millis(250));
    c.bench_function("clock/now", |b| b.iter(|| black_box(clock.now())));
}

/// Benchmark merging timestamps from another node.
fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock/update");
    let manual = Arc::new(ManualClock::new(1_000_000));
    let clock = HybridClock::new(manual.clone(), Duration::from_millis(250));

    group.bench_function("trusted", |b| {
        b.iter(|| {
            manual.increment(1);
            let remote = clock.peek().next();
            black_box(clock.update_trusted(remote))
        });
    });
    group.bench_function("checked", |b| {
        b.iter(|| {
            manual.increment(1);
            let remote = clock.peek().next();
            black_box(clock.check_and_update(remote).is_ok())
        });
    });

    group.finish();
}

/// Benchmark `now()` contended by several threads.
fn bench_now_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock/now_contended");
    const CALLS: usize = 10_000;

    for threads in [2, 4, 8].iter() {
        group.throughput(Throughput::Elements((*threads * CALLS) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let clock = Arc::new(HybridClock::system(Duration::ZERO));
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let clock = Arc::clone(&clock);
                        thread::spawn(move || {
                            for _ in 0..CALLS {
                                black_box(clock.now());
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_now, bench_update, bench_now_contended);
criterion_main!(benches);
