//! Contended writers against shared recorders.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vitals_engine::{
    MetricsRegistry, Rate, RateRecorder, Rated, RatedTimerRecorder, Recorder, SummaryRate, TimerRecorder,
};

const UPDATES_PER_THREAD: u64 = 10_000;

fn bench_contended_rate(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_rate");
    for threads in [1_u64, 2, 4, 8] {
        group.throughput(Throughput::Elements(threads * UPDATES_PER_THREAD));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let rate = Arc::new(RateRecorder::new("contended"));
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        scope.spawn(|| {
                            for _ in 0..UPDATES_PER_THREAD {
                                rate.update();
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_contended_timer(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_rated_timer");
    for threads in [1_u64, 4, 8] {
        group.throughput(Throughput::Elements(threads * UPDATES_PER_THREAD));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let timer: Arc<RatedTimerRecorder> = Arc::new(Rated::new(TimerRecorder::new("latency")));
            b.iter(|| {
                thread::scope(|scope| {
                    for t in 0..threads {
                        let timer = &timer;
                        scope.spawn(move || {
                            for i in 0..UPDATES_PER_THREAD {
                                timer.record(Duration::from_micros(t * 100 + i % 50));
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_summary_read(c: &mut Criterion) {
    let mut builder = MetricsRegistry::builder();
    for i in 0..32 {
        let rate = builder.register(RateRecorder::new(format!("rate_{i}")));
        rate.update();
    }
    let registry = Arc::new(builder.build().expect("unique names"));
    let summary = SummaryRate::new("all", Arc::clone(&registry));

    c.bench_function("summary_total_over_32", |b| b.iter(|| summary.total_rate()));
}

criterion_group!(benches, bench_contended_rate, bench_contended_timer, bench_summary_read);
criterion_main!(benches);
