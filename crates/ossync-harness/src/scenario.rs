//! Stress scenarios run against `ossync-core`.
//!
//! Each scenario drives the library under load and returns a serializable
//! report with a `passed` verdict; [`crate::runner`] turns reports into
//! JSONL logs and an artifact index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use ossync_core::sem::ids::USER_BASE;
use ossync_core::sem::SemStatSnapshot;
use ossync_core::thread;
use ossync_core::{
    InstrumentLevel, LockStatus, LockTimeout, MesWait, Platform, RequestId, Sem, SemKind,
    SemNumber, StackSize, TimerEvent, TimerService,
};

use crate::HarnessError;

/// A finished scenario.
pub trait Report: Serialize {
    fn scenario(&self) -> &'static str;
    fn passed(&self) -> bool;
    /// One-line summary for the terminal.
    fn summary(&self) -> String;
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn require(name: &'static str, value: u64) -> Result<(), HarnessError> {
    if value == 0 {
        return Err(HarnessError::InvalidArgument(format!("{name} must be positive")));
    }
    Ok(())
}

/// Run `count` library-managed worker threads to completion. Each worker is
/// registered with the platform for its whole life, so slot teardown and
/// lock-order release run on exit exactly as they do for library threads.
fn run_workers<F>(
    scenario: &'static str,
    count: usize,
    mut entry: impl FnMut(usize) -> F,
) -> Result<(), HarnessError>
where
    F: FnOnce() + Send + 'static,
{
    let handles: Vec<_> = (0..count)
        .map(|i| {
            let mut handle = thread::init(format!("{scenario}-{i}"), StackSize::Default, entry(i));
            handle.enable();
            handle
        })
        .collect();

    let mut panicked = 0;
    for handle in handles {
        handle.wait_exit(MesWait::Indefinite);
        if handle.destroy().is_err() {
            panicked += 1;
        }
    }
    if panicked > 0 {
        return Err(HarnessError::WorkerPanicked {
            scenario,
            count: panicked,
        });
    }
    Ok(())
}

/// Deterministic PRNG for reproducible workloads.
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: u32, high_inclusive: u32) -> u32 {
        let span = u64::from(high_inclusive.saturating_sub(low)) + 1;
        low + (self.next_u64() % span) as u32
    }
}

// ---------------------------------------------------------------------------
// mutex-storm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct MutexStormParams {
    pub threads: usize,
    pub iterations: u64,
    pub kind: SemKind,
    /// Every n-th attempt uses a zero timeout; 0 disables them.
    pub try_every: u64,
}

impl Default for MutexStormParams {
    fn default() -> Self {
        Self {
            threads: 8,
            iterations: 10_000,
            kind: SemKind::Plain,
            try_every: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MutexStormReport {
    pub threads: usize,
    pub iterations: u64,
    pub kind: String,
    pub entries: u64,
    pub timeouts: u64,
    /// Largest number of threads ever observed inside the critical section.
    pub max_inside: usize,
    pub elapsed_ms: u64,
    pub passed: bool,
}

impl Report for MutexStormReport {
    fn scenario(&self) -> &'static str {
        "mutex-storm"
    }

    fn passed(&self) -> bool {
        self.passed
    }

    fn summary(&self) -> String {
        format!(
            "{} threads x {} iterations: {} entries, {} zero-timeout misses, max inside {} ({} ms)",
            self.threads,
            self.iterations,
            self.entries,
            self.timeouts,
            self.max_inside,
            self.elapsed_ms
        )
    }
}

pub fn mutex_storm(params: MutexStormParams) -> Result<MutexStormReport, HarnessError> {
    require("threads", params.threads as u64)?;
    require("iterations", params.iterations)?;

    let sem = Arc::new(Sem::create(SemNumber::new(USER_BASE.get() + 90), params.kind));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    run_workers("mutex-storm", params.threads, |_| {
        let sem = Arc::clone(&sem);
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        let entries = Arc::clone(&entries);
        let timeouts = Arc::clone(&timeouts);
        move || {
            for i in 0..params.iterations {
                let timeout = if params.try_every != 0 && i % params.try_every == 0 {
                    LockTimeout::Zero
                } else {
                    LockTimeout::Indefinite
                };
                if sem.lock(timeout) == LockStatus::Timeout {
                    timeouts.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                entries.fetch_add(1, Ordering::Relaxed);
                std::hint::spin_loop();
                inside.fetch_sub(1, Ordering::SeqCst);
                sem.unlock();
            }
        }
    })?;

    let entries = entries.load(Ordering::SeqCst) as u64;
    let timeouts = timeouts.load(Ordering::SeqCst) as u64;
    let max_inside = max_inside.load(Ordering::SeqCst);
    let expected = params.threads as u64 * params.iterations;
    Ok(MutexStormReport {
        threads: params.threads,
        iterations: params.iterations,
        kind: format!("{:?}", params.kind).to_ascii_lowercase(),
        entries,
        timeouts,
        max_inside,
        elapsed_ms: elapsed_ms(start),
        passed: max_inside == 1 && entries + timeouts == expected,
    })
}

// ---------------------------------------------------------------------------
// timer-storm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct TimerStormParams {
    pub requests: usize,
    pub max_timeout_ms: u32,
    pub seed: u64,
    /// How long to wait for stragglers past the largest deadline.
    pub grace: Duration,
}

impl Default for TimerStormParams {
    fn default() -> Self {
        Self {
            requests: 1_000,
            max_timeout_ms: 100,
            seed: 0x0551_0C_5EED,
            grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerStormReport {
    pub requests: usize,
    pub max_timeout_ms: u32,
    pub seed: u64,
    pub fired: usize,
    pub duplicates: usize,
    pub missing: usize,
    /// Firings whose deadline precedes the one fired before them.
    pub order_violations: usize,
    /// Firings observed before their deadline.
    pub early: usize,
    /// Worst firing delay past the deadline, in clock milliseconds.
    pub max_lateness_ms: u64,
    pub elapsed_ms: u64,
    pub passed: bool,
}

impl Report for TimerStormReport {
    fn scenario(&self) -> &'static str {
        "timer-storm"
    }

    fn passed(&self) -> bool {
        self.passed
    }

    fn summary(&self) -> String {
        format!(
            "{} requests: {} fired, {} missing, {} duplicates, {} out of order, max lateness {} ms",
            self.requests,
            self.fired,
            self.missing,
            self.duplicates,
            self.order_violations,
            self.max_lateness_ms
        )
    }
}

pub fn timer_storm(
    timers: &TimerService,
    params: TimerStormParams,
) -> Result<TimerStormReport, HarnessError> {
    require("requests", params.requests as u64)?;
    require("max_timeout_ms", u64::from(params.max_timeout_ms))?;

    let fired = Arc::new(Mutex::new(Vec::<TimerEvent>::with_capacity(params.requests)));
    let mut rng = XorShift64::new(params.seed);
    let start = Instant::now();

    let mut scheduled = Vec::with_capacity(params.requests);
    for _ in 0..params.requests {
        let sink = Arc::clone(&fired);
        let timeout = rng.gen_range(1, params.max_timeout_ms);
        scheduled.push(timers.add_request(timeout, move |ev| sink.lock().push(*ev)));
    }

    let limit = Duration::from_millis(u64::from(params.max_timeout_ms)) + params.grace;
    while fired.lock().len() < params.requests && start.elapsed() < limit {
        std::thread::sleep(Duration::from_millis(5));
    }
    // Let any duplicate firing surface before counting.
    std::thread::sleep(Duration::from_millis(50));

    let events = fired.lock().clone();
    let mut seen: HashMap<RequestId, usize> = HashMap::with_capacity(events.len());
    for ev in &events {
        *seen.entry(ev.id).or_default() += 1;
    }
    let duplicates = seen.values().filter(|n| **n > 1).map(|n| n - 1).sum();
    let missing = scheduled.iter().filter(|id| !seen.contains_key(id)).count();
    let order_violations = events
        .windows(2)
        .filter(|pair| pair[1].deadline_ms < pair[0].deadline_ms)
        .count();
    let early = events.iter().filter(|e| e.fired_at_ms < e.deadline_ms).count();
    let max_lateness_ms = events
        .iter()
        .map(|e| e.fired_at_ms.saturating_sub(e.deadline_ms))
        .max()
        .unwrap_or(0);

    Ok(TimerStormReport {
        requests: params.requests,
        max_timeout_ms: params.max_timeout_ms,
        seed: params.seed,
        fired: events.len(),
        duplicates,
        missing,
        order_violations,
        early,
        max_lateness_ms,
        elapsed_ms: elapsed_ms(start),
        passed: duplicates == 0 && missing == 0 && order_violations == 0 && early == 0,
    })
}

// ---------------------------------------------------------------------------
// persistent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PersistentParams {
    pub period_ms: u32,
    pub window: Duration,
}

impl Default for PersistentParams {
    fn default() -> Self {
        Self {
            period_ms: 20,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistentReport {
    pub period_ms: u32,
    pub window_ms: u64,
    pub id: RequestId,
    pub fired: usize,
    /// Lower bound on firings expected over the window.
    pub expected_min: usize,
    /// Every firing carried the id the request was scheduled under.
    pub stable_id: bool,
    pub fired_after_cancel: usize,
    pub passed: bool,
}

impl Report for PersistentReport {
    fn scenario(&self) -> &'static str {
        "persistent"
    }

    fn passed(&self) -> bool {
        self.passed
    }

    fn summary(&self) -> String {
        format!(
            "{} every {} ms over {} ms: fired {} (expected >= {}), {} after cancel",
            self.id,
            self.period_ms,
            self.window_ms,
            self.fired,
            self.expected_min,
            self.fired_after_cancel
        )
    }
}

pub fn persistent(
    timers: &TimerService,
    params: PersistentParams,
) -> Result<PersistentReport, HarnessError> {
    require("period_ms", u64::from(params.period_ms))?;
    let window_ms = u64::try_from(params.window.as_millis()).unwrap_or(u64::MAX);
    require("window", window_ms)?;

    let ids = Arc::new(Mutex::new(Vec::<RequestId>::new()));
    let sink = Arc::clone(&ids);
    let id = timers.add_persistent_request(params.period_ms, move |ev| sink.lock().push(ev.id));
    std::thread::sleep(params.window);
    timers.cancel_request(id);

    // One firing may already be running when the cancel lands.
    std::thread::sleep(Duration::from_millis(u64::from(params.period_ms) + 50));
    let settled = ids.lock().len();
    std::thread::sleep(Duration::from_millis(u64::from(params.period_ms) * 3));
    let after = ids.lock().clone();

    let fired = settled;
    let fired_after_cancel = after.len() - settled;
    let stable_id = after.iter().all(|fired_id| *fired_id == id);
    // Allow for scheduling jitter: half the ideal count.
    let expected_min = ((window_ms / u64::from(params.period_ms)) / 2).max(1) as usize;

    Ok(PersistentReport {
        period_ms: params.period_ms,
        window_ms,
        id,
        fired,
        expected_min,
        stable_id,
        fired_after_cancel,
        passed: fired >= expected_min && stable_id && fired_after_cancel == 0,
    })
}

// ---------------------------------------------------------------------------
// sem-stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SemStatsParams {
    pub threads: usize,
    pub iterations: u64,
    /// Distinct semaphore numbers the workload spreads over.
    pub sems: u32,
}

impl Default for SemStatsParams {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 5_000,
            sems: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemStatsReport {
    pub threads: usize,
    pub iterations: u64,
    pub stats: Vec<SemStatSnapshot>,
    /// Acquisitions the workload performed on its own semaphores.
    pub expected_calls: u64,
    pub observed_calls: u64,
    pub passed: bool,
}

impl Report for SemStatsReport {
    fn scenario(&self) -> &'static str {
        "sem-stats"
    }

    fn passed(&self) -> bool {
        self.passed
    }

    fn summary(&self) -> String {
        let waits: u64 = self.stats.iter().map(|s| s.waits).sum();
        format!(
            "{} numbers tracked, {} calls on workload sems (expected {}), {} waits overall",
            self.stats.len(),
            self.observed_calls,
            self.expected_calls,
            waits
        )
    }
}

/// Contended workload on instrumented semaphores. Requires the platform to
/// be installed with [`InstrumentLevel::Stats`].
pub fn sem_stats(params: SemStatsParams) -> Result<SemStatsReport, HarnessError> {
    require("threads", params.threads as u64)?;
    require("iterations", params.iterations)?;
    require("sems", u64::from(params.sems))?;
    let platform = Platform::get();
    if platform.config().instrument != InstrumentLevel::Stats {
        return Err(HarnessError::InstrumentationOff);
    }

    let first = USER_BASE.get() + 50;
    let numbers: Vec<SemNumber> = (0..params.sems).map(|i| SemNumber::new(first + i)).collect();
    let sems: Arc<Vec<Sem>> = Arc::new(
        numbers
            .iter()
            .map(|n| Sem::create(*n, SemKind::Plain))
            .collect(),
    );

    run_workers("sem-stats", params.threads, |t| {
        let sems = Arc::clone(&sems);
        move || {
            let mut rng = XorShift64::new(0xC0FF_EE00 + t as u64);
            for _ in 0..params.iterations {
                let idx = rng.gen_range(0, (sems.len() - 1) as u32) as usize;
                let _guard = sems[idx].enter();
                std::hint::spin_loop();
            }
        }
    })?;

    let stats = platform.sem_stats();
    let observed_calls = stats
        .iter()
        .filter(|s| numbers.iter().any(|n| n.get() == s.number))
        .map(|s| s.calls)
        .sum();
    let expected_calls = params.threads as u64 * params.iterations;
    Ok(SemStatsReport {
        threads: params.threads,
        iterations: params.iterations,
        stats,
        expected_calls,
        observed_calls,
        passed: observed_calls >= expected_calls,
    })
}
