//! Semaphore and event benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ossync_core::sem::ids::USER_BASE;
use ossync_core::{LockTimeout, Mes, MesStatus, MesWait, Sem, SemKind, SemMutex, SemNumber};

fn user_sem(offset: u32) -> SemNumber {
    SemNumber::new(USER_BASE.get() + offset)
}

fn bench_lock_unlock(c: &mut Criterion) {
    let mut group = c.benchmark_group("sem_lock_unlock");

    for (label, kind) in [("plain", SemKind::Plain), ("timed", SemKind::Timed)] {
        let sem = Sem::create(user_sem(10), kind);
        group.bench_with_input(BenchmarkId::new("indefinite", label), &sem, |b, sem| {
            b.iter(|| {
                let status = sem.lock(LockTimeout::Indefinite);
                criterion::black_box(status);
                sem.unlock();
            });
        });
        group.bench_with_input(BenchmarkId::new("try_enter", label), &sem, |b, sem| {
            b.iter(|| {
                let guard = sem.try_enter();
                criterion::black_box(guard.is_some());
            });
        });
    }
    group.finish();
}

fn bench_sem_mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("sem_mutex");

    let counter = SemMutex::new(user_sem(11), 0u64);
    group.bench_function("uncontended_increment", |b| {
        b.iter(|| {
            *counter.lock() += 1;
        });
    });

    group.bench_function("parking_lot_baseline", |b| {
        let counter = parking_lot::Mutex::new(0u64);
        b.iter(|| {
            *counter.lock() += 1;
        });
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("sem_contended");
    group.sample_size(20);

    for threads in [2usize, 4] {
        group.bench_with_input(BenchmarkId::new("1000x_each", threads), &threads, |b, &n| {
            b.iter(|| {
                let counter = Arc::new(SemMutex::new(user_sem(12), 0u64));
                let workers: Vec<_> = (0..n)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        std::thread::spawn(move || {
                            for _ in 0..1000 {
                                *counter.lock() += 1;
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    worker.join().unwrap();
                }
                criterion::black_box(*counter.lock());
            });
        });
    }
    group.finish();
}

fn bench_mes(c: &mut Criterion) {
    let mut group = c.benchmark_group("mes");

    let mes = Mes::new();
    group.bench_function("post_then_wait", |b| {
        b.iter(|| {
            mes.post();
            let status = mes.wait(MesWait::Zero);
            assert_eq!(status, MesStatus::Posted);
        });
    });

    group.bench_function("wait_zero_unposted", |b| {
        b.iter(|| criterion::black_box(mes.wait(MesWait::Zero)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_unlock,
    bench_sem_mutex,
    bench_contended,
    bench_mes
);
criterion_main!(benches);
