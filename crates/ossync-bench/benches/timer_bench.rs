//! Timer service benchmarks.

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ossync_core::config::TimerConfig;
use ossync_core::{ManualClock, TimerService};

/// Service on a frozen clock, so nothing scheduled in a bench ever fires.
fn frozen_service() -> TimerService {
    let config = TimerConfig {
        max_poll_interval: Duration::from_millis(50),
        skew_slack: Duration::from_secs(60),
    };
    TimerService::start(config, Arc::new(ManualClock::new(1_000_000)))
}

fn bench_add_cancel(c: &mut Criterion) {
    let timers = frozen_service();
    let mut group = c.benchmark_group("timer_add_cancel");

    group.bench_function("one_shot", |b| {
        b.iter(|| {
            let id = timers.add_request(10_000, |_| {});
            criterion::black_box(timers.cancel_request(id));
        });
    });

    group.bench_function("persistent", |b| {
        b.iter(|| {
            let id = timers.add_persistent_request(10_000, |_| {});
            criterion::black_box(timers.cancel_request(id));
        });
    });

    group.finish();
    timers.shutdown();
}

fn bench_queue_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_insert_at_depth");

    for &depth in &[0usize, 100, 1000] {
        let timers = frozen_service();
        let backlog: Vec<_> = (0..depth)
            .map(|i| timers.add_request(5_000 + (i as u32 % 10_000), |_| {}))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let id = timers.add_request(7_500, |_| {});
                timers.cancel_request(id);
            });
        });
        for id in backlog {
            timers.cancel_request(id);
        }
        timers.shutdown();
    }
    group.finish();
}

criterion_group!(benches, bench_add_cancel, bench_queue_depth);
criterion_main!(benches);
