//! Single-threaded hot paths of the recorders.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vitals_engine::{
    ArrivalsRecorder, Gauge, Gauge64Recorder, MetricsInterval, NormativeTimerRecorder, Rate,
    RateRecorder, Reservoir, TimerRecorder,
};

fn bench_rate(c: &mut Criterion) {
    let rate = RateRecorder::new("bench_rate");
    let mut group = c.benchmark_group("rate");
    group.throughput(Throughput::Elements(1));
    group.bench_function("update", |b| b.iter(|| rate.update()));
    group.bench_function("last_rate", |b| {
        b.iter(|| black_box(rate.last_rate(MetricsInterval::Minute)))
    });
    group.bench_function("mean_rate", |b| {
        b.iter(|| black_box(rate.mean_rate(MetricsInterval::Hour)))
    });
    group.finish();
}

fn bench_gauges(c: &mut Criterion) {
    let gauge = Gauge64Recorder::new("bench_gauge");
    let timer = TimerRecorder::new("bench_timer");
    let mut value = 0_i64;

    let mut group = c.benchmark_group("gauge");
    group.throughput(Throughput::Elements(1));
    group.bench_function("accept_i64", |b| {
        b.iter(|| {
            value = value.wrapping_add(7) % 1_000;
            gauge.accept(black_box(value));
        })
    });
    group.bench_function("timer_update", |b| {
        b.iter(|| timer.update(black_box(Duration::from_micros(250))))
    });
    group.bench_function("quantile_p99", |b| b.iter(|| black_box(gauge.quantile(0.99))));
    group.finish();
}

fn bench_reservoir(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservoir");
    for capacity in [256_usize, 4096] {
        let reservoir = Reservoir::new(capacity).expect("capacity within bounds");
        for i in 0..capacity * 4 {
            reservoir.observe(i as f64);
        }
        group.bench_with_input(BenchmarkId::new("observe", capacity), &reservoir, |b, r| {
            b.iter(|| r.observe(black_box(42.0)))
        });
        group.bench_with_input(BenchmarkId::new("quantile", capacity), &reservoir, |b, r| {
            b.iter(|| black_box(r.quantile(0.9)))
        });
    }
    group.finish();
}

fn bench_classifiers(c: &mut Criterion) {
    let normative = NormativeTimerRecorder::new(
        "bench_sla",
        Duration::from_millis(5),
        Duration::from_millis(100),
    )
    .expect("valid range");
    let arrivals = ArrivalsRecorder::new("bench_arrivals", 8).expect("positive channels");

    let mut group = c.benchmark_group("classifiers");
    group.bench_function("normative_accept", |b| {
        b.iter(|| black_box(normative.accept(black_box(Duration::from_millis(40)))))
    });
    group.bench_function("arrivals_update", |b| {
        b.iter(|| arrivals.update(black_box(Duration::from_millis(12))))
    });
    group.finish();
}

criterion_group!(benches, bench_rate, bench_gauges, bench_reservoir, bench_classifiers);
criterion_main!(benches);
