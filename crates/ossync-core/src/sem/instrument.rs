//! Statistics decorator for semaphores.
//!
//! [`Instrumented`] wraps any [`RawSem`] and always takes the slow path:
//! try first, count a wait when the try fails, then block. Counters are kept
//! per semaphore number in a [`SemStatsRegistry`] owned by the
//! [`Platform`](crate::Platform), so every instance sharing a number feeds the
//! same totals.

use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::ids::SemNumber;
use super::raw::RawSem;

/// Counters shared by all semaphores with one number.
#[derive(Debug)]
pub struct SemCounters {
    number: SemNumber,
    first_site: &'static Location<'static>,
    instances: AtomicU64,
    calls: AtomicU64,
    waits: AtomicU64,
    try_failures: AtomicU64,
}

impl SemCounters {
    fn new(number: SemNumber, site: &'static Location<'static>) -> Self {
        Self {
            number,
            first_site: site,
            instances: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            try_failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SemStatSnapshot {
        SemStatSnapshot {
            number: self.number.get(),
            name: self.number.name(),
            subsystem: self.number.subsystem(),
            created_at: format!("{}:{}", self.first_site.file(), self.first_site.line()),
            instances: self.instances.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            try_failures: self.try_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time statistics for one semaphore number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SemStatSnapshot {
    pub number: u32,
    pub name: Option<&'static str>,
    pub subsystem: &'static str,
    /// Creation site of the first instrumented instance.
    pub created_at: String,
    pub instances: u64,
    /// Lock attempts, blocking and non-blocking.
    pub calls: u64,
    /// Blocking attempts that found the semaphore held.
    pub waits: u64,
    /// Non-blocking attempts that returned `Timeout`.
    pub try_failures: u64,
}

#[derive(Debug, Default)]
pub struct SemStatsRegistry {
    by_number: Mutex<BTreeMap<SemNumber, Arc<SemCounters>>>,
}

impl SemStatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `number`, created on first use.
    pub fn counters(
        &self,
        number: SemNumber,
        site: &'static Location<'static>,
    ) -> Arc<SemCounters> {
        let mut map = self.by_number.lock();
        let counters = map
            .entry(number)
            .or_insert_with(|| Arc::new(SemCounters::new(number, site)));
        counters.instances.fetch_add(1, Ordering::Relaxed);
        Arc::clone(counters)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<SemStatSnapshot> {
        self.by_number
            .lock()
            .values()
            .map(|c| c.snapshot())
            .collect()
    }

    #[must_use]
    pub fn get(&self, number: SemNumber) -> Option<SemStatSnapshot> {
        self.by_number.lock().get(&number).map(|c| c.snapshot())
    }
}

/// Counting decorator around a backing primitive.
pub struct Instrumented<R> {
    inner: R,
    counters: Arc<SemCounters>,
}

impl<R: RawSem> Instrumented<R> {
    pub fn new(inner: R, counters: Arc<SemCounters>) -> Self {
        Self { inner, counters }
    }

    #[must_use]
    pub fn counters(&self) -> &SemCounters {
        &self.counters
    }
}

#[allow(unsafe_code)]
impl<R: RawSem> RawSem for Instrumented<R> {
    fn acquire(&self) {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.try_acquire() {
            return;
        }
        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        self.inner.acquire();
    }

    fn try_acquire(&self) -> bool {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let acquired = self.inner.try_acquire();
        if !acquired {
            self.counters.try_failures.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    unsafe fn release(&self) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.release() };
    }

    fn strategy(&self) -> &'static str {
        "instrumented"
    }
}
