//! Semaphore statistics with the platform installed at `InstrumentLevel::Stats`.

use std::sync::Arc;
use std::sync::mpsc;

use ossync_core::sem::ids::USER_BASE;
use ossync_core::{
    InstrumentLevel, LockStatus, LockTimeout, Platform, PlatformConfig, PlatformError, Sem,
    SemKind, SemMutex, SemNumber,
};

fn install_stats() -> &'static Platform {
    let config = PlatformConfig {
        instrument: InstrumentLevel::Stats,
        ..PlatformConfig::default()
    };
    match Platform::install(config) {
        Ok(platform) => platform,
        Err(PlatformError::AlreadyInstalled) => Platform::get(),
        Err(err) => panic!("install failed: {err}"),
    }
}

fn user(n: u32) -> SemNumber {
    SemNumber::new(USER_BASE.get() + n)
}

#[test]
fn every_semaphore_is_wrapped() {
    install_stats();
    for kind in [SemKind::Plain, SemKind::Timed] {
        let sem = Sem::create(user(60), kind);
        assert_eq!(sem.strategy(), "instrumented");
    }
}

#[test]
fn instances_sharing_a_number_share_counters() {
    let platform = install_stats();
    let number = user(61);
    let a = Sem::create(number, SemKind::Plain);
    let b = Sem::create(number, SemKind::Timed);
    drop(a.enter());
    drop(b.enter());
    drop(b.enter());

    let snap = platform.stats().get(number).expect("counters registered");
    assert_eq!(snap.instances, 2);
    assert_eq!(snap.calls, 3);
    assert_eq!(snap.waits, 0);
    assert_eq!(snap.subsystem, "user");
    assert!(snap.created_at.contains("instrument_test.rs"), "{}", snap.created_at);
}

#[test]
fn failed_zero_timeout_lock_counts_a_try_failure() {
    let platform = install_stats();
    let number = user(62);
    let sem = Arc::new(Sem::create(number, SemKind::Plain));
    let holder = Arc::clone(&sem);
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let t = std::thread::spawn(move || {
        let _g = holder.enter();
        held_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    held_rx.recv().unwrap();
    assert_eq!(sem.lock(LockTimeout::Zero), LockStatus::Timeout);
    release_tx.send(()).unwrap();
    t.join().unwrap();

    let snap = platform.stats().get(number).unwrap();
    assert_eq!(snap.try_failures, 1);
    assert_eq!(snap.calls, 2);
}

#[test]
fn contention_is_counted_as_waits() {
    let platform = install_stats();
    let number = user(63);
    let total = Arc::new(SemMutex::new(number, 0_u64));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let total = Arc::clone(&total);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let mut n = total.lock();
                    *n += 1;
                    std::hint::spin_loop();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(*total.lock(), 8_000);

    let snap = platform.stats().get(number).unwrap();
    assert_eq!(snap.calls, 8_001);
    assert!(snap.waits <= snap.calls);
}

#[test]
fn snapshots_serialize_to_json() {
    let platform = install_stats();
    drop(Sem::create(user(64), SemKind::Plain));
    let stats = platform.sem_stats();
    let json = serde_json::to_value(&stats).unwrap();
    let entry = json
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["number"] == USER_BASE.get() + 64)
        .expect("entry for the new number");
    assert_eq!(entry["instances"], 1);
    assert_eq!(entry["subsystem"], "user");
}
