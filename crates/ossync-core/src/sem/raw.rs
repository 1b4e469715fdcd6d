//! Backing primitives behind [`Sem`](super::Sem).
//!
//! - [`FastMutex`]: `parking_lot` raw mutex. Default for plain semaphores.
//! - [`EventMutex`]: lock flag plus an auto-reset [`Mes`]. Backs timed-wait
//!   semaphores, whose waiters park on the event rather than the mutex.
//! - [`NamedMutex`]: POSIX named semaphore, shared across processes.
//!
//! The statistics decorator lives in [`instrument`](super::instrument).

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::RawMutex as _;

use super::mes::{Mes, MesWait};

/// Lock/try/release over a native primitive. No ownership tracking here;
/// [`Sem`](super::Sem) does that once for every backing.
pub trait RawSem: Send + Sync {
    /// Block until acquired.
    fn acquire(&self);

    /// Acquire without blocking.
    fn try_acquire(&self) -> bool;

    /// Release.
    ///
    /// # Safety
    ///
    /// The primitive must be held; the caller has already checked ownership.
    unsafe fn release(&self);

    /// Short name for diagnostics.
    fn strategy(&self) -> &'static str;
}

pub struct FastMutex(parking_lot::RawMutex);

impl FastMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self(parking_lot::RawMutex::INIT)
    }
}

impl Default for FastMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSem for FastMutex {
    #[inline]
    fn acquire(&self) {
        self.0.lock();
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.0.try_lock()
    }

    #[inline]
    unsafe fn release(&self) {
        // SAFETY: caller guarantees the mutex is held.
        unsafe { self.0.unlock() };
    }

    fn strategy(&self) -> &'static str {
        "fast"
    }
}

#[derive(Default)]
pub struct EventMutex {
    locked: AtomicBool,
    wake: Mes,
}

impl EventMutex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RawSem for EventMutex {
    fn acquire(&self) {
        while !self.try_acquire() {
            // A release between the failed try and this wait leaves the event
            // posted, so the wakeup is not lost.
            self.wake.wait(MesWait::Indefinite);
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn release(&self) {
        self.locked.store(false, Ordering::Release);
        self.wake.post();
    }

    fn strategy(&self) -> &'static str {
        "event"
    }
}

/// Cross-process semaphore with an initial count of one.
///
/// The creating handle unlinks the name on drop; other processes keep their
/// own open handles.
#[cfg(unix)]
pub struct NamedMutex {
    handle: *mut libc::sem_t,
    name: std::ffi::CString,
    owner_of_name: bool,
}

// SAFETY: POSIX semaphores are designed for concurrent use from any thread;
// the handle is only passed to sem_* calls.
#[cfg(unix)]
unsafe impl Send for NamedMutex {}
#[cfg(unix)]
unsafe impl Sync for NamedMutex {}

#[cfg(unix)]
impl NamedMutex {
    /// Open (creating if needed) the named semaphore.
    pub fn open(name: &str) -> std::io::Result<Self> {
        let c_name = std::ffi::CString::new(normalize_name(name))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_name is a valid NUL-terminated string; O_CREAT|O_EXCL with
        // mode and initial value per sem_open(3).
        let created = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if created != libc::SEM_FAILED {
            return Ok(Self {
                handle: created,
                name: c_name,
                owner_of_name: true,
            });
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }

        // SAFETY: as above; opening an existing semaphore takes no mode.
        let existing = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if existing == libc::SEM_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            handle: existing,
            name: c_name,
            owner_of_name: false,
        })
    }

    #[must_use]
    pub fn name(&self) -> &std::ffi::CStr {
        &self.name
    }
}

#[cfg(unix)]
fn normalize_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    }
}

#[cfg(unix)]
impl RawSem for NamedMutex {
    fn acquire(&self) {
        loop {
            // SAFETY: handle came from a successful sem_open and is open.
            if unsafe { libc::sem_wait(self.handle) } == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                crate::fatal::out_of_resources(crate::ResourceError::NamedSem {
                    name: self.name.to_string_lossy().into_owned(),
                    source: err,
                });
            }
        }
    }

    fn try_acquire(&self) -> bool {
        loop {
            // SAFETY: handle came from a successful sem_open and is open.
            if unsafe { libc::sem_trywait(self.handle) } == 0 {
                return true;
            }
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return false;
            }
        }
    }

    unsafe fn release(&self) {
        // SAFETY: handle is open; the caller holds the count we return.
        unsafe { libc::sem_post(self.handle) };
    }

    fn strategy(&self) -> &'static str {
        "named"
    }
}

#[cfg(unix)]
impl Drop for NamedMutex {
    fn drop(&mut self) {
        // SAFETY: handle is open and dropped exactly once.
        unsafe { libc::sem_close(self.handle) };
        if self.owner_of_name {
            // SAFETY: name is a valid C string.
            unsafe { libc::sem_unlink(self.name.as_ptr()) };
        }
    }
}
