//! Benchmark comparing a bound counter's hot path against the
//! alternatives it is meant to replace: a plain (non-atomic, unsafe)
//! shared `i64` and an `AtomicI64`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const NUM_THREADS: usize = 8;
const ITERATIONS_PER_THREAD: usize = 1_000_000;

slotstat::stats_module!(BENCH_MODULE);

fn bench_counter_increment(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_increment");
    let label = format!("{NUM_THREADS}threads x {ITERATIONS_PER_THREAD}iter");

    group.bench_function(BenchmarkId::new("slotstat (per-thread slot)", &label), |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..NUM_THREADS)
                .map(|_| {
                    thread::spawn(|| {
                        for _ in 0..ITERATIONS_PER_THREAD {
                            *slotstat::counter!(BENCH_MODULE, "bench.hot_path") += 1;
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });

    group.bench_function(BenchmarkId::new("AtomicI64 (shared)", &label), |b| {
        b.iter(|| {
            let counter = std::sync::Arc::new(AtomicI64::new(0));
            let handles: Vec<_> = (0..NUM_THREADS)
                .map(|_| {
                    let counter = std::sync::Arc::clone(&counter);
                    thread::spawn(move || {
                        for _ in 0..ITERATIONS_PER_THREAD {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            black_box(counter.load(Ordering::Relaxed))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_counter_increment);
criterion_main!(benches);
