//! Central timeout scheduler.
//!
//! One dedicated thread services every pending request. Requests are indexed
//! twice under the scheduler's semaphore: by id for cancellation, and by
//! `(deadline, id)` for firing order. The thread sleeps on an auto-reset
//! event until the nearest deadline (never longer than
//! [`TimerConfig::max_poll_interval`]), fires everything due, and goes back
//! to sleep. Adding a request posts the event so a nearer deadline is picked
//! up at once.
//!
//! Callbacks run with the scheduler's semaphore released, so they may add and
//! cancel requests. A persistent request is re-armed, keeping its id, before
//! its callback runs. An ephemeral request stays visible as "firing" until
//! its callback returns; cancelling it then returns 0 and only marks it.
//! Destructors run once, outside the semaphore, when a request is finally
//! discarded.
//!
//! The clock may jump. A reading behind the last one, or ahead of it by more
//! than the expected sleep plus [`TimerConfig::skew_slack`], is treated as a
//! clock adjustment: every pending request restarts its full timeout from the
//! new "now".

pub mod clock;
mod request;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

pub use clock::{Clock, ManualClock, SystemClock};
pub use request::{RequestId, TimerEvent};

use self::request::{Body, Callback, Destructor, IdAllocator, Phase, Record};
use crate::config::TimerConfig;
use crate::fatal::{self, Fatal};
use crate::sem::ids::TIMER_QUEUE;
use crate::sem::{Mes, MesWait, SemMutex};
use crate::thread::{self, StackSize, ThreadHandle, native_thread_id};

const THREAD_NAME: &str = "ossync-timer";

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

struct State {
    by_id: BTreeMap<RequestId, Record>,
    /// Pending records only.
    by_deadline: BTreeSet<(u64, RequestId)>,
    ids: IdAllocator,
    last_now: u64,
    expected_wait: u64,
    shutdown: bool,
}

impl State {
    fn new(now: u64) -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_deadline: BTreeSet::new(),
            ids: IdAllocator::default(),
            last_now: now,
            expected_wait: 0,
            shutdown: false,
        }
    }

    /// Index a pending record, returning the record it replaced.
    fn insert(&mut self, id: RequestId, record: Record) -> Option<Record> {
        self.by_deadline.insert((record.deadline(), id));
        self.by_id.insert(id, record)
    }

    fn remove_pending(&mut self, id: RequestId) -> Option<Record> {
        let record = self.by_id.remove(&id)?;
        self.by_deadline.remove(&(record.deadline(), id));
        Some(record)
    }

    fn rebase(&mut self, now: u64) {
        for record in self.by_id.values_mut() {
            if record.phase == Phase::Pending {
                record.start_ms = now;
            }
        }
        self.by_deadline = self
            .by_id
            .iter()
            .filter(|(_, r)| r.phase == Phase::Pending)
            .map(|(id, r)| (r.deadline(), *id))
            .collect();
    }
}

struct Inner {
    state: SemMutex<State>,
    wake: Mes,
    clock: Arc<dyn Clock>,
    config: TimerConfig,
    thread_id: AtomicU64,
}

impl Inner {
    fn on_timer_thread(&self) -> bool {
        self.thread_id.load(Ordering::Acquire) == native_thread_id()
    }

    fn run(&self) {
        self.thread_id.store(native_thread_id(), Ordering::Release);
        let slack = duration_ms(self.config.skew_slack);
        let max_poll = duration_ms(self.config.max_poll_interval).max(1);

        let mut state = self.state.lock();
        while !state.shutdown {
            let now = self.clock.now_ms();
            let expected_by = state
                .last_now
                .saturating_add(state.expected_wait)
                .saturating_add(slack);
            if now < state.last_now || now > expected_by {
                tracing::warn!(
                    last_now = state.last_now,
                    now,
                    pending = state.by_deadline.len(),
                    "clock adjustment detected; restarting pending timeouts"
                );
                state.rebase(now);
            }

            let mut retired = Vec::new();
            while !state.shutdown {
                let Some(&(deadline, id)) = state.by_deadline.first() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                state.by_deadline.pop_first();
                let Some(record) = state.by_id.get_mut(&id) else {
                    fatal::raise(Fatal::TimerInvariant("deadline entry without a record"));
                };
                let body = Arc::clone(&record.body);
                let timeout_ms = record.timeout_ms;
                if id.is_persistent() {
                    let fresh = Record {
                        start_ms: now,
                        timeout_ms,
                        phase: Phase::Pending,
                        body: Arc::clone(&body),
                    };
                    retired.extend(state.insert(id, fresh));
                } else {
                    record.phase = Phase::Firing { cancelled: false };
                }

                let event = TimerEvent {
                    id,
                    deadline_ms: deadline,
                    fired_at_ms: now,
                    timeout_ms,
                };
                state.unlocked(|| {
                    fire(&body, &event);
                    drop(body);
                });

                if !id.is_persistent() {
                    retired.extend(state.by_id.remove(&id));
                }
            }
            if state.shutdown {
                state.unlocked(|| drop(retired));
                break;
            }

            let before_wait = self.clock.now_ms();
            let wait = state
                .by_deadline
                .first()
                .map_or(max_poll, |(deadline, _)| {
                    deadline.saturating_sub(before_wait).min(max_poll)
                });
            state.last_now = before_wait;
            state.expected_wait = wait;
            state.unlocked(|| {
                drop(retired);
                let _ = self.wake.wait(MesWait::For(Duration::from_millis(wait)));
            });
        }
    }
}

/// Run a callback. An ordinary panic is logged and the scheduler carries on;
/// a fatal assertion aborts the process.
fn fire(body: &Body, event: &TimerEvent) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body.call(event))) {
        if fatal::is_fatal_payload(payload.as_ref()) {
            fatal::escalate("a timer callback", payload.as_ref());
        }
        tracing::error!(id = %event.id, deadline_ms = event.deadline_ms, "timer callback panicked");
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct TimerService {
    inner: Arc<Inner>,
    thread: Mutex<Option<ThreadHandle>>,
}

impl TimerService {
    /// Spawn the scheduler thread.
    #[track_caller]
    #[must_use]
    pub fn start(config: TimerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        let inner = Arc::new(Inner {
            state: SemMutex::new(TIMER_QUEUE, State::new(now)),
            wake: Mes::new(),
            clock,
            config,
            thread_id: AtomicU64::new(0),
        });
        let worker = Arc::clone(&inner);
        let mut handle = thread::init(THREAD_NAME, StackSize::Default, move || worker.run());
        handle.enable();
        tracing::debug!(
            max_poll_ms = duration_ms(config.max_poll_interval),
            skew_slack_ms = duration_ms(config.skew_slack),
            "timer service started"
        );
        Self {
            inner,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// [`start`](Self::start) on the wall clock with default tuning.
    #[track_caller]
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::start(TimerConfig::default(), Arc::new(SystemClock))
    }

    /// Fire `callback` once after `timeout_ms` (0 is treated as 1).
    #[track_caller]
    pub fn add_request(
        &self,
        timeout_ms: u32,
        callback: impl Fn(&TimerEvent) + Send + Sync + 'static,
    ) -> RequestId {
        self.schedule(timeout_ms, false, Box::new(callback), None)
    }

    /// Fire `callback` every `timeout_ms` until cancelled.
    #[track_caller]
    pub fn add_persistent_request(
        &self,
        timeout_ms: u32,
        callback: impl Fn(&TimerEvent) + Send + Sync + 'static,
    ) -> RequestId {
        self.schedule(timeout_ms, true, Box::new(callback), None)
    }

    /// [`add_request`](Self::add_request) with a destructor run after the
    /// firing or on cancel/shutdown.
    #[track_caller]
    pub fn add_request_with_destructor(
        &self,
        timeout_ms: u32,
        callback: impl Fn(&TimerEvent) + Send + Sync + 'static,
        destructor: impl FnOnce() + Send + 'static,
    ) -> RequestId {
        self.schedule(timeout_ms, false, Box::new(callback), Some(Box::new(destructor)))
    }

    /// [`add_persistent_request`](Self::add_persistent_request) with a
    /// destructor run on cancel/shutdown.
    #[track_caller]
    pub fn add_persistent_request_with_destructor(
        &self,
        timeout_ms: u32,
        callback: impl Fn(&TimerEvent) + Send + Sync + 'static,
        destructor: impl FnOnce() + Send + 'static,
    ) -> RequestId {
        self.schedule(timeout_ms, true, Box::new(callback), Some(Box::new(destructor)))
    }

    #[track_caller]
    fn schedule(
        &self,
        timeout_ms: u32,
        persistent: bool,
        callback: Callback,
        destructor: Option<Destructor>,
    ) -> RequestId {
        let body = Arc::new(Body::new(callback, destructor));
        let mut state = self.inner.state.lock();
        if state.shutdown {
            drop(state);
            fatal::raise(Fatal::TimerInvariant("request added after shutdown"));
        }
        let now = self.inner.clock.now_ms();
        let id = {
            let State { by_id, ids, .. } = &mut *state;
            ids.allocate(persistent, |id| by_id.contains_key(&id))
        };
        state.insert(
            id,
            Record {
                start_ms: now,
                timeout_ms: timeout_ms.max(1),
                phase: Phase::Pending,
                body,
            },
        );
        drop(state);
        self.inner.wake.post();
        id
    }

    /// Cancel `id`, returning the milliseconds it had left. A request whose
    /// callback is already running is only marked and reports 0, as does an
    /// unknown id.
    pub fn cancel_request(&self, id: RequestId) -> u32 {
        let mut state = self.inner.state.lock();
        let now = self.inner.clock.now_ms();
        let phase = state.by_id.get(&id).map(|r| r.phase);
        let (remaining, retired) = match phase {
            None => (0, None),
            Some(Phase::Firing { .. }) => {
                if let Some(record) = state.by_id.get_mut(&id) {
                    record.phase = Phase::Firing { cancelled: true };
                }
                (0, None)
            }
            Some(Phase::Pending) => {
                let retired = state.remove_pending(id);
                let remaining = retired
                    .as_ref()
                    .map_or(0, |r| r.deadline().saturating_sub(now));
                (u32::try_from(remaining).unwrap_or(u32::MAX), retired)
            }
        };
        drop(state);
        drop(retired);
        remaining
    }

    /// False for unknown and cancelled ids.
    #[must_use]
    pub fn request_is_valid(&self, id: RequestId) -> bool {
        self.inner
            .state
            .lock()
            .by_id
            .get(&id)
            .is_some_and(|r| r.phase != Phase::Firing { cancelled: true })
    }

    /// Requests waiting for their deadline.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().by_deadline.len()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Stop the scheduler thread and discard every request, running
    /// destructors. Idempotent. Fatal from inside a timer callback.
    #[track_caller]
    pub fn shutdown(&self) {
        if self.inner.on_timer_thread() {
            fatal::raise(Fatal::TimerInvariant("shutdown from a timer callback"));
        }
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.inner.state.lock().shutdown = true;
        self.inner.wake.post();
        let _ = handle.wait_exit(MesWait::Indefinite);
        if handle.destroy().is_err() {
            tracing::error!("timer thread terminated by a panic");
        }

        let drained = {
            let mut state = self.inner.state.lock();
            state.by_deadline.clear();
            std::mem::take(&mut state.by_id)
        };
        let discarded = drained.len();
        drop(drained);
        tracing::debug!(discarded, "timer service stopped");
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if self.inner.on_timer_thread() {
            // Dropped by one of its own callbacks: the thread cannot join
            // itself, so only ask it to stop.
            self.inner.state.lock().shutdown = true;
            self.inner.wake.post();
            return;
        }
        self.shutdown();
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn fast_config() -> TimerConfig {
        TimerConfig {
            max_poll_interval: Duration::from_millis(10),
            skew_slack: Duration::from_secs(60),
        }
    }

    fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn zero_timeout_is_normalized_to_one() {
        let clock = Arc::new(ManualClock::new(1_000));
        let timers = TimerService::start(fast_config(), clock.clone());
        let id = timers.add_request(0, |_| {});
        assert_eq!(timers.cancel_request(id), 1);
    }

    #[test]
    fn manual_clock_drives_firing() {
        let clock = Arc::new(ManualClock::new(1_000));
        let timers = TimerService::start(fast_config(), clock.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let id = timers.add_request(500, move |ev| sink.lock().push(*ev));

        std::thread::sleep(Duration::from_millis(40));
        assert!(fired.lock().is_empty());
        clock.advance(Duration::from_millis(500));
        assert!(wait_until(Duration::from_secs(2), || fired.lock().len() == 1));

        let ev = fired.lock()[0];
        assert_eq!(ev.id, id);
        assert_eq!(ev.deadline_ms, 1_500);
        assert_eq!(ev.fired_at_ms, 1_500);
        assert!(wait_until(Duration::from_secs(1), || !timers.request_is_valid(id)));
    }

    #[test]
    fn cancelling_the_running_callback_marks_and_returns_zero() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = Arc::new(TimerService::start(fast_config(), clock.clone()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let id = timers.add_request(10, move |_| {
            entered_tx.send(()).unwrap();
            let _ = release_rx.lock().recv();
        });
        clock.advance(Duration::from_millis(10));
        entered_rx.recv().unwrap();

        assert!(timers.request_is_valid(id));
        assert_eq!(timers.cancel_request(id), 0);
        assert!(!timers.request_is_valid(id));
        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || timers.cancel_request(id) == 0
            && timers.pending_count() == 0));
    }

    #[test]
    fn callbacks_may_schedule_more_requests() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = Arc::new(TimerService::start(fast_config(), clock.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        let chained = {
            let timers = Arc::downgrade(&timers);
            let hits = Arc::clone(&hits);
            move |_: &TimerEvent| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(timers) = timers.upgrade() {
                    let hits = Arc::clone(&hits);
                    timers.add_request(5, move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }
        };
        timers.add_request(5, chained);
        clock.advance(Duration::from_millis(5));
        assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1
            && timers.pending_count() == 1));
        clock.advance(Duration::from_millis(5));
        assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn panicking_callback_does_not_stop_the_scheduler() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = TimerService::start(fast_config(), clock.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        timers.add_request(1, |_| panic!("callback failure"));
        timers.add_request(2, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        clock.advance(Duration::from_millis(2));
        assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1));
        assert!(timers.is_running());
    }

    #[test]
    fn shutdown_is_idempotent_and_runs_destructors() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = TimerService::start(fast_config(), clock.clone());
        let destroyed = Arc::new(AtomicUsize::new(0));
        for persistent in [false, true] {
            let d = Arc::clone(&destroyed);
            if persistent {
                timers.add_persistent_request_with_destructor(1_000, |_| {}, move || {
                    d.fetch_add(1, Ordering::SeqCst);
                });
            } else {
                timers.add_request_with_destructor(1_000, |_| {}, move || {
                    d.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        timers.shutdown();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert!(!timers.is_running());
        assert_eq!(timers.pending_count(), 0);
        timers.shutdown();
    }

    #[test]
    fn shutdown_from_callback_is_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = Arc::new(TimerService::start(fast_config(), clock.clone()));
        let outcome = Arc::new(Mutex::new(None));
        {
            let weak = Arc::downgrade(&timers);
            let outcome = Arc::clone(&outcome);
            timers.add_request(1, move |_| {
                let Some(timers) = weak.upgrade() else { return };
                let caught = panic::catch_unwind(AssertUnwindSafe(|| timers.shutdown()));
                *outcome.lock() = Some(caught.is_err());
            });
        }
        clock.advance(Duration::from_millis(1));
        assert!(wait_until(Duration::from_secs(1), || outcome.lock().is_some()));
        assert_eq!(*outcome.lock(), Some(true));
        assert!(timers.is_running());
    }
}
