//! Fatal assertion and out-of-resources reporting.
//!
//! Nothing in this crate returns an error for a broken contract. Re-locking a
//! held semaphore, unlocking from the wrong thread, acquiring out of order, an
//! invalid thread-state transition: each is a programming error and continuing
//! risks silent corruption. They are reported here with the caller's
//! file/line and then terminate according to the installed [`FatalPolicy`].
//!
//! Failure to obtain an OS resource the layer cannot run without (a thread, a
//! named semaphore) goes through the separate [`out_of_resources`] path.
//!
//! Under [`FatalPolicy::Panic`] the raising thread unwinds, so its own callers
//! (and tests) can observe the failure. The unwind never gets past a thread
//! boundary: the thread shim and the timer callback guard hand a fatal payload
//! to [`escalate`], which aborts the process.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::config::FatalPolicy;
use crate::sem::SemNumber;
use crate::thread::{Slot, ThreadState};

/// Contract violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("semaphore {number} re-entered by its holder (thread {owner})")]
    Relock { number: SemNumber, owner: u64 },
    #[error("semaphore {number} released by thread {caller} but held by {owner}")]
    UnlockByNonHolder {
        number: SemNumber,
        caller: u64,
        owner: u64,
    },
    #[error("semaphore number {0} is outside the reserved id space")]
    InvalidSemNumber(u32),
    #[error("lock timeout {0}ms is neither indefinite nor zero")]
    InvalidTimeout(u32),
    #[error("lock order violation: acquiring {requested} while holding {held}")]
    LockOrder {
        held: SemNumber,
        requested: SemNumber,
    },
    #[error("lock order stack overflow at {0} entries")]
    LockStackOverflow(usize),
    #[error("released semaphore {0} is not on the lock order stack")]
    LockStackMissing(SemNumber),
    #[error("thread-local slot index {0} is out of range")]
    InvalidSlot(usize),
    #[error("thread-local slots re-entered from inside a slot access")]
    SlotReentered,
    #[error("thread-local slot {0:?} re-entered while lent to an enclosing access")]
    SlotLent(Slot),
    #[error("thread '{name}' cannot move from {from} to {to}")]
    InvalidThreadTransition {
        name: String,
        from: ThreadState,
        to: ThreadState,
    },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("thread {0} is already registered")]
    AlreadyRegistered(u64),
    #[error("thread {0} is not registered")]
    NotRegistered(u64),
    #[error("timer invariant violated: {0}")]
    TimerInvariant(&'static str),
}

/// The OS refused a resource this layer has no degraded mode without.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("cannot spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open named semaphore '{name}': {source}")]
    NamedSem {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

const KIND_ASSERTION: &str = "fatal assertion";
const KIND_RESOURCES: &str = "out of resources";

const POLICY_PANIC: u8 = 0;
const POLICY_ABORT: u8 = 1;

static POLICY: AtomicU8 = AtomicU8::new(POLICY_PANIC);

pub(crate) fn set_policy(policy: FatalPolicy) {
    let raw = match policy {
        FatalPolicy::Panic => POLICY_PANIC,
        FatalPolicy::Abort => POLICY_ABORT,
    };
    POLICY.store(raw, Ordering::Release);
}

/// Currently installed policy.
#[must_use]
pub fn policy() -> FatalPolicy {
    match POLICY.load(Ordering::Acquire) {
        POLICY_ABORT => FatalPolicy::Abort,
        _ => FatalPolicy::Panic,
    }
}

/// Report a contract violation at the caller's location and terminate.
#[cold]
#[track_caller]
pub fn raise(fatal: Fatal) -> ! {
    let location = Location::caller();
    tracing::error!(
        file = location.file(),
        line = location.line(),
        "fatal assertion: {fatal}"
    );
    terminate(KIND_ASSERTION, location, &fatal)
}

/// Report an OS resource failure at the caller's location and terminate.
#[cold]
#[track_caller]
pub fn out_of_resources(error: ResourceError) -> ! {
    let location = Location::caller();
    tracing::error!(
        file = location.file(),
        line = location.line(),
        "out of resources: {error}"
    );
    terminate(KIND_RESOURCES, location, &error)
}

/// Whether a caught panic payload was produced by [`raise`] or
/// [`out_of_resources`].
#[must_use]
pub fn is_fatal_payload(payload: &(dyn Any + Send)) -> bool {
    let message = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied());
    message.is_some_and(|m| {
        [KIND_ASSERTION, KIND_RESOURCES]
            .iter()
            .any(|kind| m.strip_prefix("ossync ").is_some_and(|rest| rest.starts_with(kind)))
    })
}

/// Abort after a fatal payload reached `boundary` (a thread shim or the timer
/// callback guard). The message itself was already reported when it was raised.
#[cold]
pub(crate) fn escalate(boundary: &str, payload: &(dyn Any + Send)) -> ! {
    let message = payload
        .downcast_ref::<String>()
        .map_or("<non-string payload>", String::as_str);
    tracing::error!(boundary, "fatal error reached a thread boundary, aborting");
    eprintln!("ossync: fatal error reached {boundary}, aborting: {message}");
    std::process::abort()
}

fn terminate(kind: &str, location: &Location<'_>, what: &dyn fmt::Display) -> ! {
    match policy() {
        FatalPolicy::Abort => {
            eprintln!(
                "ossync {kind} at {}:{}: {what}",
                location.file(),
                location.line()
            );
            std::process::abort()
        }
        FatalPolicy::Panic => panic!(
            "ossync {kind} at {}:{}: {what}",
            location.file(),
            location.line()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_ids() {
        let msg = Fatal::LockOrder {
            held: SemNumber::new(100),
            requested: SemNumber::new(50),
        }
        .to_string();
        assert!(msg.contains("lock order violation"));
        assert!(msg.contains("100"));
        assert!(msg.contains("50"));

        let msg = Fatal::InvalidThreadTransition {
            name: "log-writer".to_owned(),
            from: ThreadState::Init,
            to: ThreadState::Disabled,
        }
        .to_string();
        assert!(msg.contains("log-writer"));
        assert!(msg.contains("init"));
        assert!(msg.contains("disabled"));
    }

    #[test]
    #[should_panic(expected = "fatal assertion at")]
    fn raise_panics_with_location_under_default_policy() {
        raise(Fatal::InvalidSlot(99));
    }

    #[test]
    #[should_panic(expected = "out of resources")]
    fn out_of_resources_panics_under_default_policy() {
        out_of_resources(ResourceError::ThreadSpawn {
            name: "worker".to_owned(),
            source: std::io::Error::other("no more threads"),
        });
    }

    #[test]
    fn fatal_payloads_are_recognized() {
        let caught: std::thread::Result<()> =
            std::panic::catch_unwind(|| raise(Fatal::InvalidSlot(42)));
        let payload = caught.expect_err("raise unwinds under the panic policy");
        assert!(is_fatal_payload(payload.as_ref()));

        let caught: std::thread::Result<()> = std::panic::catch_unwind(|| {
            out_of_resources(ResourceError::ThreadSpawn {
                name: "w".to_owned(),
                source: std::io::Error::other("none left"),
            })
        });
        assert!(is_fatal_payload(caught.expect_err("unwinds").as_ref()));

        let caught: std::thread::Result<()> =
            std::panic::catch_unwind(|| panic!("ordinary failure"));
        assert!(!is_fatal_payload(caught.expect_err("unwinds").as_ref()));
        let caught: std::thread::Result<()> =
            std::panic::catch_unwind(|| std::panic::panic_any(7_u32));
        assert!(!is_fatal_payload(caught.expect_err("unwinds").as_ref()));
    }

    #[test]
    fn resource_error_keeps_its_source() {
        use std::error::Error as _;
        let err = ResourceError::NamedSem {
            name: "/ossync-x".to_owned(),
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/ossync-x"));
    }
}
