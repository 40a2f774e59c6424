//! Rate monitor hot-path benchmarks
//!
//! `observe` runs on every read and write; `tick` runs once per connection
//! per heartbeat.
//!
//! Run with: `cargo bench -p sluice-core --bench rate_monitor`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::{Duration, Instant};

use sluice_core::rate::{MinDataRate, MinimumRateMonitor, RateDirection};

fn bench_observe(c: &mut Criterion) {
    let rate = MinDataRate::new(240.0, Duration::from_secs(5)).expect("valid rate");
    let mut monitor = MinimumRateMonitor::new(rate, RateDirection::Inbound);
    monitor.start(Instant::now());

    c.bench_function("rate_monitor/observe", |b| {
        b.iter(|| monitor.observe(black_box(4096)))
    });
}

fn bench_tick(c: &mut Criterion) {
    let rate = MinDataRate::new(240.0, Duration::ZERO).expect("valid rate");
    let t0 = Instant::now();

    c.bench_function("rate_monitor/tick", |b| {
        let mut monitor = MinimumRateMonitor::new(rate, RateDirection::Inbound);
        monitor.start(t0);
        let mut now = t0;
        b.iter(|| {
            now += Duration::from_secs(1);
            monitor.observe(1024);
            black_box(monitor.tick(now))
        })
    });
}

// A heartbeat walks every connection on the loop; 10k is a busy loop.
fn bench_heartbeat_walk(c: &mut Criterion) {
    let rate = MinDataRate::new(240.0, Duration::ZERO).expect("valid rate");
    let t0 = Instant::now();
    let mut monitors: Vec<_> = (0..10_000)
        .map(|_| {
            let mut m = MinimumRateMonitor::new(rate, RateDirection::Inbound);
            m.start(t0);
            m
        })
        .collect();

    c.bench_function("rate_monitor/heartbeat_10k", |b| {
        let mut now = t0;
        b.iter(|| {
            now += Duration::from_secs(1);
            let mut violations = 0usize;
            for m in monitors.iter_mut() {
                m.observe(512);
                if m.tick(now).is_violation() {
                    violations += 1;
                }
            }
            black_box(violations)
        })
    });
}

criterion_group!(benches, bench_observe, bench_tick, bench_heartbeat_walk);
criterion_main!(benches);
