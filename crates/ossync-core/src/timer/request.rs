//! Request ids and records.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::fatal::{self, Fatal};

/// Id of a scheduled request. Ephemeral and persistent requests draw from
/// disjoint ranges told apart by the high bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(u32);

impl RequestId {
    /// Never handed out.
    pub const UNUSED: Self = Self(0);
    pub const PERSISTENT_BIT: u32 = 0x8000_0000;
    const COUNTER_MAX: u32 = Self::PERSISTENT_BIT - 1;

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_persistent(self) -> bool {
        self.0 & Self::PERSISTENT_BIT != 0
    }

    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.0 == Self::UNUSED.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_persistent() {
            write!(f, "P{}", self.0 & !Self::PERSISTENT_BIT)
        } else {
            write!(f, "E{}", self.0)
        }
    }
}

/// Two wrapping counters, one per range. Counters run `1..=0x7FFF_FFFF` so
/// neither range yields [`RequestId::UNUSED`].
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next_ephemeral: u32,
    next_persistent: u32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next_ephemeral: 1,
            next_persistent: 1,
        }
    }
}

impl IdAllocator {
    #[cfg(test)]
    pub(crate) fn starting_at(next_ephemeral: u32, next_persistent: u32) -> Self {
        Self {
            next_ephemeral,
            next_persistent,
        }
    }

    /// Next id of the requested range that `is_live` rejects.
    #[track_caller]
    pub(crate) fn allocate(
        &mut self,
        persistent: bool,
        is_live: impl Fn(RequestId) -> bool,
    ) -> RequestId {
        let (counter, bit) = if persistent {
            (&mut self.next_persistent, RequestId::PERSISTENT_BIT)
        } else {
            (&mut self.next_ephemeral, 0)
        };
        for _ in 0..RequestId::COUNTER_MAX {
            let id = RequestId(*counter | bit);
            *counter = if *counter >= RequestId::COUNTER_MAX {
                1
            } else {
                *counter + 1
            };
            if !is_live(id) {
                return id;
            }
        }
        fatal::raise(Fatal::TimerInvariant("request id space exhausted"))
    }
}

/// What a callback is told about the firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerEvent {
    pub id: RequestId,
    /// Deadline the request fired for, in clock milliseconds.
    pub deadline_ms: u64,
    /// Clock reading when the scheduler picked it up.
    pub fired_at_ms: u64,
    pub timeout_ms: u32,
}

pub(crate) type Callback = Box<dyn Fn(&TimerEvent) + Send + Sync>;
pub(crate) type Destructor = Box<dyn FnOnce() + Send>;

/// Callback and destructor of one request, shared by the scheduler and an
/// in-flight firing. The destructor runs when the last reference drops.
pub(crate) struct Body {
    callback: Callback,
    destructor: Mutex<Option<Destructor>>,
}

impl Body {
    pub(crate) fn new(callback: Callback, destructor: Option<Destructor>) -> Self {
        Self {
            callback,
            destructor: Mutex::new(destructor),
        }
    }

    pub(crate) fn call(&self, event: &TimerEvent) {
        (self.callback)(event);
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if let Some(destructor) = self.destructor.get_mut().take() {
            destructor();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Pending,
    /// Popped and handed to the callback; `cancelled` is set by a cancel that
    /// lost the race.
    Firing { cancelled: bool },
}

pub(crate) struct Record {
    pub(crate) start_ms: u64,
    pub(crate) timeout_ms: u32,
    pub(crate) phase: Phase,
    pub(crate) body: std::sync::Arc<Body>,
}

impl Record {
    pub(crate) fn deadline(&self) -> u64 {
        self.start_ms.saturating_add(u64::from(self.timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ranges_are_disjoint_and_skip_unused() {
        let mut ids = IdAllocator::default();
        let e = ids.allocate(false, |_| false);
        let p = ids.allocate(true, |_| false);
        assert_eq!(e.get(), 1);
        assert!(!e.is_persistent());
        assert_eq!(p.get(), RequestId::PERSISTENT_BIT | 1);
        assert!(p.is_persistent());
        assert_eq!(e.to_string(), "E1");
        assert_eq!(p.to_string(), "P1");
    }

    #[test]
    fn counters_wrap_past_unused() {
        let mut ids = IdAllocator::starting_at(RequestId::COUNTER_MAX, RequestId::COUNTER_MAX);
        assert_eq!(ids.allocate(false, |_| false).get(), RequestId::COUNTER_MAX);
        assert_eq!(ids.allocate(false, |_| false).get(), 1);
        assert_eq!(ids.allocate(true, |_| false).get(), u32::MAX);
        assert_eq!(
            ids.allocate(true, |_| false).get(),
            RequestId::PERSISTENT_BIT | 1
        );
    }

    #[test]
    fn live_ids_are_skipped_after_wrap() {
        let live: HashSet<u32> = [1, 2, 3].into_iter().collect();
        let mut ids = IdAllocator::starting_at(RequestId::COUNTER_MAX, 1);
        assert_eq!(
            ids.allocate(false, |id| live.contains(&id.get())).get(),
            RequestId::COUNTER_MAX
        );
        assert_eq!(ids.allocate(false, |id| live.contains(&id.get())).get(), 4);
    }

    #[test]
    fn destructor_runs_once_on_last_drop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let body = Arc::new(Body::new(
            Box::new(|_| {}),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        ));
        let in_flight = Arc::clone(&body);
        drop(body);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        drop(in_flight);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deadline_saturates() {
        let record = Record {
            start_ms: u64::MAX - 5,
            timeout_ms: 100,
            phase: Phase::Pending,
            body: Arc::new(Body::new(Box::new(|_| {}), None)),
        };
        assert_eq!(record.deadline(), u64::MAX);
    }
}
