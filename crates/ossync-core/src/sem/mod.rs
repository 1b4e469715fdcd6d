//! Non-reentrant semaphores.
//!
//! A [`Sem`] is a mutex identified by a [`SemNumber`] from the central
//! enumeration in [`ids`]. Acquisition is either indefinite or a zero-timeout
//! try; there is no bounded wait. The owning thread is always tracked so that
//! re-locking by the holder and unlocking by anybody else are caught as fatal
//! assertions rather than undefined behavior.
//!
//! In debug builds (or with the `lock-order` feature) every acquisition is
//! checked against the calling thread's [`lockorder`](crate::lockorder)
//! stack. With [`InstrumentLevel::Stats`](crate::InstrumentLevel) the backing
//! primitive is wrapped in the counting [`Instrumented`] decorator.

pub mod ids;
pub mod instrument;
pub mod mes;
pub mod raw;

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

pub use ids::SemNumber;
pub use instrument::{Instrumented, SemCounters, SemStatSnapshot, SemStatsRegistry};
pub use mes::{Mes, MesStatus, MesWait};
#[cfg(unix)]
pub use raw::NamedMutex;
pub use raw::{EventMutex, FastMutex, RawSem};

use crate::config::InstrumentLevel;
use crate::fatal::{self, Fatal, ResourceError};
use crate::lockorder;
use crate::platform::Platform;
use crate::thread::native_thread_id;

const NO_OWNER: u64 = 0;

// ---------------------------------------------------------------------------
// Kinds, timeouts, status
// ---------------------------------------------------------------------------

/// Backing flavor chosen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemKind {
    /// Native fast mutex.
    Plain,
    /// Waiters park on an auto-reset event instead of the mutex itself.
    Timed,
}

/// Acquisition timeout. Only the two extremes are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    Indefinite,
    Zero,
}

impl LockTimeout {
    /// Wire value of [`LockTimeout::Indefinite`].
    pub const INDEFINITE_MS: u32 = u32::MAX;

    /// Map a millisecond timeout. Anything but `u32::MAX` or `0` is fatal.
    #[track_caller]
    #[must_use]
    pub fn from_millis(ms: u32) -> Self {
        match ms {
            Self::INDEFINITE_MS => Self::Indefinite,
            0 => Self::Zero,
            other => fatal::raise(Fatal::InvalidTimeout(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LockStatus {
    Acquired,
    Timeout,
}

// ---------------------------------------------------------------------------
// Sem
// ---------------------------------------------------------------------------

pub struct Sem {
    raw: Box<dyn RawSem>,
    number: SemNumber,
    kind: SemKind,
    owner: AtomicU64,
    created_at: &'static Location<'static>,
}

impl Sem {
    /// Create a process-local semaphore. The backing is chosen from `kind`
    /// and the installed instrumentation level.
    #[track_caller]
    #[must_use]
    pub fn create(number: SemNumber, kind: SemKind) -> Self {
        let site = Location::caller();
        let platform = Platform::get();
        let raw: Box<dyn RawSem> = match (kind, platform.config().instrument) {
            (SemKind::Plain, InstrumentLevel::Off) => Box::new(FastMutex::new()),
            (SemKind::Timed, InstrumentLevel::Off) => Box::new(EventMutex::new()),
            (SemKind::Plain, InstrumentLevel::Stats) => Box::new(Instrumented::new(
                FastMutex::new(),
                platform.stats().counters(number, site),
            )),
            (SemKind::Timed, InstrumentLevel::Stats) => Box::new(Instrumented::new(
                EventMutex::new(),
                platform.stats().counters(number, site),
            )),
        };
        Self::with_raw(number, kind, raw, site)
    }

    /// Open a cross-process semaphore by name. Failure to open is fatal via
    /// the out-of-resources path.
    #[cfg(unix)]
    #[track_caller]
    #[must_use]
    pub fn create_named(number: SemNumber, name: &str) -> Self {
        let site = Location::caller();
        let named = match NamedMutex::open(name) {
            Ok(named) => named,
            Err(source) => fatal::out_of_resources(ResourceError::NamedSem {
                name: name.to_owned(),
                source,
            }),
        };
        let platform = Platform::get();
        let raw: Box<dyn RawSem> = match platform.config().instrument {
            InstrumentLevel::Off => Box::new(named),
            InstrumentLevel::Stats => Box::new(Instrumented::new(
                named,
                platform.stats().counters(number, site),
            )),
        };
        Self::with_raw(number, SemKind::Plain, raw, site)
    }

    /// Wrap a caller-supplied backing primitive.
    #[track_caller]
    #[must_use]
    pub fn create_with(number: SemNumber, kind: SemKind, raw: Box<dyn RawSem>) -> Self {
        Self::with_raw(number, kind, raw, Location::caller())
    }

    /// The bootstrap semaphore. Built without consulting the platform, which
    /// owns it.
    pub(crate) fn bootstrap() -> Self {
        Self::with_raw(
            SemNumber::BOOTSTRAP,
            SemKind::Plain,
            Box::new(FastMutex::new()),
            Location::caller(),
        )
    }

    fn with_raw(
        number: SemNumber,
        kind: SemKind,
        raw: Box<dyn RawSem>,
        created_at: &'static Location<'static>,
    ) -> Self {
        Self {
            raw,
            number,
            kind,
            owner: AtomicU64::new(NO_OWNER),
            created_at,
        }
    }

    #[must_use]
    pub fn number(&self) -> SemNumber {
        self.number
    }

    #[must_use]
    pub fn kind(&self) -> SemKind {
        self.kind
    }

    /// Where the semaphore was created.
    #[must_use]
    pub fn created_at(&self) -> &'static Location<'static> {
        self.created_at
    }

    /// Backing strategy name (`fast`, `event`, `named`, `instrumented`).
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        self.raw.strategy()
    }

    /// Whether the calling thread holds this semaphore.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == native_thread_id()
    }

    /// Acquire.
    ///
    /// [`LockTimeout::Zero`] returns [`LockStatus::Timeout`] when the
    /// semaphore is held, including by the caller. An indefinite lock by the
    /// holder would self-deadlock and is fatal instead.
    #[track_caller]
    pub fn lock(&self, timeout: LockTimeout) -> LockStatus {
        let me = native_thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            match timeout {
                LockTimeout::Zero => return LockStatus::Timeout,
                LockTimeout::Indefinite => fatal::raise(Fatal::Relock {
                    number: self.number,
                    owner: me,
                }),
            }
        }

        let checked = lockorder::is_enabled() && !self.number.is_order_exempt();
        if checked {
            lockorder::enter_check(self.number);
        }

        match timeout {
            LockTimeout::Indefinite => self.raw.acquire(),
            LockTimeout::Zero => {
                if !self.raw.try_acquire() {
                    return LockStatus::Timeout;
                }
            }
        }

        self.owner.store(me, Ordering::Relaxed);
        if checked {
            lockorder::enter(self.number);
        }
        LockStatus::Acquired
    }

    /// Release. Only the holder may unlock.
    #[allow(unsafe_code)]
    #[track_caller]
    pub fn unlock(&self) {
        let me = native_thread_id();
        let owner = self.owner.load(Ordering::Relaxed);
        if owner != me {
            fatal::raise(Fatal::UnlockByNonHolder {
                number: self.number,
                caller: me,
                owner,
            });
        }
        if lockorder::is_enabled() && !self.number.is_order_exempt() {
            lockorder::exit(self.number);
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        // SAFETY: ownership by this thread was verified above.
        unsafe { self.raw.release() };
    }

    /// Block until acquired and return a guard that unlocks on drop.
    #[track_caller]
    pub fn enter(&self) -> SemGuard<'_> {
        let _ = self.lock(LockTimeout::Indefinite);
        SemGuard {
            sem: self,
            _not_send: PhantomData,
        }
    }

    /// Zero-timeout [`enter`](Self::enter).
    #[track_caller]
    pub fn try_enter(&self) -> Option<SemGuard<'_>> {
        match self.lock(LockTimeout::Zero) {
            LockStatus::Acquired => Some(SemGuard {
                sem: self,
                _not_send: PhantomData,
            }),
            LockStatus::Timeout => None,
        }
    }
}

impl fmt::Debug for Sem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sem")
            .field("number", &self.number)
            .field("kind", &self.kind)
            .field("strategy", &self.raw.strategy())
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field(
                "created_at",
                &format_args!("{}:{}", self.created_at.file(), self.created_at.line()),
            )
            .finish()
    }
}

impl Drop for Sem {
    fn drop(&mut self) {
        let owner = *self.owner.get_mut();
        if owner != NO_OWNER {
            tracing::warn!(
                sem = %self.number,
                owner,
                created_at = %format_args!("{}:{}", self.created_at.file(), self.created_at.line()),
                "semaphore destroyed while held"
            );
        }
    }
}

/// Held [`Sem`]. Unlocks on drop; bound to the acquiring thread.
#[must_use = "dropping the guard releases the semaphore immediately"]
pub struct SemGuard<'a> {
    sem: &'a Sem,
    _not_send: PhantomData<*const ()>,
}

impl SemGuard<'_> {
    #[must_use]
    pub fn sem(&self) -> &Sem {
        self.sem
    }
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        self.sem.unlock();
    }
}

// ---------------------------------------------------------------------------
// SemMutex
// ---------------------------------------------------------------------------

/// Data protected by a [`Sem`].
pub struct SemMutex<T: ?Sized> {
    sem: Sem,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `sem`.
#[allow(unsafe_code)]
unsafe impl<T: ?Sized + Send> Send for SemMutex<T> {}
// SAFETY: as above; only one guard exists at a time.
#[allow(unsafe_code)]
unsafe impl<T: ?Sized + Send> Sync for SemMutex<T> {}

impl<T> SemMutex<T> {
    #[track_caller]
    #[must_use]
    pub fn new(number: SemNumber, value: T) -> Self {
        Self::with_sem(Sem::create(number, SemKind::Plain), value)
    }

    #[must_use]
    pub fn with_sem(sem: Sem, value: T) -> Self {
        Self {
            sem,
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SemMutex<T> {
    #[track_caller]
    pub fn lock(&self) -> SemMutexGuard<'_, T> {
        let _ = self.sem.lock(LockTimeout::Indefinite);
        SemMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<SemMutexGuard<'_, T>> {
        match self.sem.lock(LockTimeout::Zero) {
            LockStatus::Acquired => Some(SemMutexGuard {
                mutex: self,
                _not_send: PhantomData,
            }),
            LockStatus::Timeout => None,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[must_use]
    pub fn sem(&self) -> &Sem {
        &self.sem
    }
}

impl<T: ?Sized> fmt::Debug for SemMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemMutex").field("sem", &self.sem).finish_non_exhaustive()
    }
}

#[must_use = "dropping the guard releases the semaphore immediately"]
pub struct SemMutexGuard<'a, T: ?Sized> {
    mutex: &'a SemMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> SemMutexGuard<'_, T> {
    /// Run `f` with the semaphore released, then re-acquire it. The lock is
    /// re-taken even if `f` unwinds, so the guard's own drop stays balanced.
    #[track_caller]
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        struct Relock<'b>(&'b Sem);
        impl Drop for Relock<'_> {
            fn drop(&mut self) {
                let _ = self.0.lock(LockTimeout::Indefinite);
            }
        }

        self.mutex.sem.unlock();
        let _relock = Relock(&self.mutex.sem);
        f()
    }
}

#[allow(unsafe_code)]
impl<T: ?Sized> Deref for SemMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the semaphore.
        unsafe { &*self.mutex.data.get() }
    }
}

#[allow(unsafe_code)]
impl<T: ?Sized> DerefMut for SemMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the semaphore exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SemMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.sem.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn user(n: u32) -> SemNumber {
        SemNumber::new(ids::USER_BASE.get() + n)
    }

    #[test]
    fn timeout_from_millis_maps_extremes() {
        assert_eq!(LockTimeout::from_millis(u32::MAX), LockTimeout::Indefinite);
        assert_eq!(LockTimeout::from_millis(0), LockTimeout::Zero);
    }

    #[test]
    #[should_panic(expected = "neither indefinite nor zero")]
    fn bounded_timeout_is_fatal() {
        let _ = LockTimeout::from_millis(250);
    }

    #[test]
    fn zero_timeout_succeeds_when_free_and_times_out_when_held() {
        let sem = Arc::new(Sem::create(user(1), SemKind::Plain));
        assert_eq!(sem.lock(LockTimeout::Zero), LockStatus::Acquired);
        assert!(sem.is_held_by_current());

        let other = Arc::clone(&sem);
        let status = std::thread::spawn(move || other.lock(LockTimeout::Zero))
            .join()
            .unwrap();
        assert_eq!(status, LockStatus::Timeout);
        sem.unlock();
        assert!(!sem.is_held_by_current());
    }

    #[test]
    fn zero_timeout_by_holder_reports_timeout() {
        let sem = Sem::create(user(2), SemKind::Plain);
        let _guard = sem.enter();
        assert_eq!(sem.lock(LockTimeout::Zero), LockStatus::Timeout);
    }

    #[test]
    #[should_panic(expected = "re-entered by its holder")]
    fn indefinite_relock_is_fatal() {
        let sem = Sem::create(user(3), SemKind::Plain);
        let _ = sem.lock(LockTimeout::Indefinite);
        let _ = sem.lock(LockTimeout::Indefinite);
    }

    #[test]
    fn unlock_by_non_holder_is_fatal() {
        let sem = Arc::new(Sem::create(user(4), SemKind::Plain));
        let _ = sem.lock(LockTimeout::Indefinite);
        let other = Arc::clone(&sem);
        let result = std::thread::spawn(move || other.unlock()).join();
        let payload = result.expect_err("foreign unlock must panic");
        let msg = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(msg.contains("held by"), "{msg}");
        sem.unlock();
    }

    #[test]
    fn timed_kind_excludes_and_hands_over() {
        let sem = Arc::new(Sem::create(user(5), SemKind::Timed));
        assert_eq!(sem.strategy(), "event");
        let guard = sem.enter();
        let other = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || {
            let _g = other.enter();
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
        assert!(sem.try_enter().is_some());
    }

    #[test]
    fn guard_releases_on_drop() {
        let sem = Sem::create(user(6), SemKind::Plain);
        {
            let _g = sem.enter();
            assert!(sem.is_held_by_current());
        }
        assert!(sem.try_enter().is_some());
    }

    #[test]
    fn sem_mutex_serializes_increments() {
        let counter = Arc::new(SemMutex::new(user(7), 0_u64));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let mut g = counter.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *g += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4_000);
    }

    #[test]
    fn unlocked_releases_for_the_closure_and_relocks() {
        let m = SemMutex::new(user(8), Vec::<u32>::new());
        let mut g = m.lock();
        g.push(1);
        let was_free = g.unlocked(|| m.sem().try_enter().is_some());
        assert!(was_free);
        assert!(m.sem().is_held_by_current());
        g.push(2);
        drop(g);
        assert_eq!(m.into_inner(), vec![1, 2]);
    }

    #[test]
    fn unlocked_relocks_after_unwind() {
        let m = SemMutex::new(user(9), 0_u32);
        let mut g = m.lock();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            g.unlocked(|| panic!("callback failed"));
        }));
        assert!(caught.is_err());
        assert!(m.sem().is_held_by_current());
        *g += 1;
        drop(g);
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn records_creation_site() {
        let line = line!() + 1;
        let sem = Sem::create(user(10), SemKind::Plain);
        assert_eq!(sem.created_at().line(), line);
        assert!(sem.created_at().file().ends_with("mod.rs"));
        assert!(format!("{sem:?}").contains("810"));
    }

    #[cfg(unix)]
    #[test]
    fn named_sem_excludes_between_instances() {
        let name = format!("ossync-sem-test-{}", std::process::id());
        let a = Sem::create_named(user(11), &name);
        let b = Arc::new(Sem::create_named(user(11), &name));
        let _ga = a.enter();
        let other = Arc::clone(&b);
        let status = std::thread::spawn(move || {
            let status = other.lock(LockTimeout::Zero);
            if status == LockStatus::Acquired {
                other.unlock();
            }
            status
        })
        .join()
        .unwrap();
        assert_eq!(status, LockStatus::Timeout);
    }
}
