//! OS thread lifecycle, the live-thread registry and thread-local slots.
//!
//! A [`ThreadHandle`] moves through `Init -> Enabled -> Exited`. `Disabled`
//! exists only where the OS can suspend a thread, which no std target can;
//! asking for it is a fatal [`Fatal::Unsupported`].
//!
//! Spawned threads run inside a shim that attaches them to the registry,
//! runs the entry closure with unwinding caught (a fatal assertion is not
//! caught: it aborts the process), then performs the explicit
//! exit step: lock-order stack release, slot teardown, registry removal and
//! live-count decrement, and finally the completion event the owner waits on.
//! Threads the layer did not create join and leave through [`register`] and
//! [`unregister`].

pub mod ident;
pub mod stack_range;
pub mod tls;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;

pub use ident::native_thread_id;
pub use stack_range::StackRangeTls;
pub use tls::{SLOT_COUNT, Slot, SlotTable};

use crate::fatal::{self, Fatal, ResourceError};
use crate::lockorder;
use crate::platform::{Platform, PlatformCaps, TlsBackend};
use crate::sem::{Mes, MesStatus, MesWait};

// ---------------------------------------------------------------------------
// States and sizes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Init,
    Enabled,
    Disabled,
    Exited,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Exited => "exited",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackSize {
    /// The platform's configured default.
    #[default]
    Default,
    Bytes(usize),
}

impl StackSize {
    #[must_use]
    pub fn resolve(self, default: usize) -> usize {
        match self {
            Self::Default => default,
            Self::Bytes(bytes) => bytes,
        }
    }
}

/// How a thread joined the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadOrigin {
    Spawned,
    Registered,
}

/// Registry entry of a live thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: u64,
    pub name: String,
    pub origin: ThreadOrigin,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

type Entry = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    name: String,
    state: Mutex<ThreadState>,
    native_id: AtomicU64,
    done: Mes,
    outcome: Mutex<Option<std::thread::Result<()>>>,
}

/// Owner's handle on a thread created by [`init`].
pub struct ThreadHandle {
    shared: Arc<Shared>,
    stack_size: usize,
    entry: Option<Entry>,
    join: Option<JoinHandle<()>>,
}

/// Prepare a thread without starting it.
#[must_use]
pub fn init(
    name: impl Into<String>,
    stack: StackSize,
    entry: impl FnOnce() + Send + 'static,
) -> ThreadHandle {
    let default = Platform::get().config().default_stack_size;
    ThreadHandle {
        shared: Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(ThreadState::Init),
            native_id: AtomicU64::new(0),
            done: Mes::new(),
            outcome: Mutex::new(None),
        }),
        stack_size: stack.resolve(default),
        entry: Some(Box::new(entry)),
        join: None,
    }
}

impl ThreadHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        *self.shared.state.lock()
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// OS id, once the thread has started.
    #[must_use]
    pub fn native_id(&self) -> Option<u64> {
        match self.shared.native_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    #[track_caller]
    fn transition(&self, from: ThreadState, to: ThreadState) {
        let mut state = self.shared.state.lock();
        if *state != from {
            let current = *state;
            drop(state);
            fatal::raise(Fatal::InvalidThreadTransition {
                name: self.shared.name.clone(),
                from: current,
                to,
            });
        }
        *state = to;
    }

    /// Start the OS thread. Only valid from `Init`.
    #[track_caller]
    pub fn enable(&mut self) {
        self.transition(ThreadState::Init, ThreadState::Enabled);
        let entry = self.entry.take().unwrap_or_else(|| Box::new(|| {}));
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .stack_size(self.stack_size)
            .spawn(move || run_shim(&shared, entry));
        match spawned {
            Ok(join) => self.join = Some(join),
            Err(source) => fatal::out_of_resources(ResourceError::ThreadSpawn {
                name: self.shared.name.clone(),
                source,
            }),
        }
    }

    /// Suspend the thread.
    #[track_caller]
    pub fn disable(&mut self) {
        if !PlatformCaps::SUSPEND {
            fatal::raise(Fatal::Unsupported("thread suspension"));
        }
        self.transition(ThreadState::Enabled, ThreadState::Disabled);
    }

    /// Wait for the thread to finish its exit step.
    #[track_caller]
    pub fn wait_exit(&self, timeout: MesWait) -> MesStatus {
        match self.state() {
            ThreadState::Exited => return MesStatus::Posted,
            ThreadState::Init => fatal::raise(Fatal::InvalidThreadTransition {
                name: self.shared.name.clone(),
                from: ThreadState::Init,
                to: ThreadState::Exited,
            }),
            ThreadState::Enabled | ThreadState::Disabled => {}
        }
        self.shared.done.wait(timeout)
    }

    /// Wait for exit and reclaim the thread. Returns the entry's panic
    /// payload if it unwound.
    pub fn destroy(mut self) -> std::thread::Result<()> {
        if let Some(join) = self.join.take() {
            join.join()?;
        }
        self.shared.outcome.lock().take().unwrap_or(Ok(()))
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("native_id", &self.native_id())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

fn run_shim(shared: &Shared, entry: Entry) {
    attach_current(&shared.name, ThreadOrigin::Spawned);
    let id = native_thread_id();
    shared.native_id.store(id, Ordering::Release);
    tracing::debug!(thread = %shared.name, id, "thread started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
    if let Err(payload) = &outcome {
        if fatal::is_fatal_payload(payload.as_ref()) {
            fatal::escalate("the thread shim", payload.as_ref());
        }
        tracing::error!(thread = %shared.name, id, "thread entry panicked");
    }

    detach_current(false);
    tracing::debug!(thread = %shared.name, id, "thread exited");

    *shared.outcome.lock() = Some(outcome);
    *shared.state.lock() = ThreadState::Exited;
    shared.done.post();
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[track_caller]
fn attach_current(name: &str, origin: ThreadOrigin) {
    let platform = Platform::get();
    let id = native_thread_id();
    {
        let mut boot = platform.bootstrap();
        if boot.threads.iter().any(|t| t.id == id) {
            drop(boot);
            fatal::raise(Fatal::AlreadyRegistered(id));
        }
        boot.threads.push(ThreadInfo {
            id,
            name: name.to_owned(),
            origin,
        });
    }
    // A range left on this stack by an earlier thread is evicted here.
    if let TlsBackend::StackRange(ranges) = platform.tls_backend() {
        ranges.attach_current();
    }
    platform.thread_attached();
}

#[track_caller]
fn detach_current(strict: bool) {
    let platform = Platform::get();
    let id = native_thread_id();

    lockorder::release_current();
    tls::teardown_current();

    let (found, table) = {
        let mut boot = platform.bootstrap();
        let before = boot.threads.len();
        boot.threads.retain(|t| t.id != id);
        let found = boot.threads.len() != before;
        let table = match platform.tls_backend() {
            TlsBackend::StackRange(ranges) => ranges.detach_current(),
            TlsBackend::Native => None,
        };
        (found, table)
    };
    drop(table);

    if found {
        platform.thread_detached();
    } else if strict {
        fatal::raise(Fatal::NotRegistered(id));
    }
}

/// Attach a thread this layer did not create. Registering twice is fatal.
#[track_caller]
pub fn register(name: &str) {
    attach_current(name, ThreadOrigin::Registered);
    tracing::debug!(thread = name, id = native_thread_id(), "thread registered");
}

/// Detach the calling thread: drops its slot values and removes it from the
/// registry. Fatal if it was never registered.
#[track_caller]
pub fn unregister() {
    detach_current(true);
    tracing::debug!(id = native_thread_id(), "thread unregistered");
}

#[must_use]
pub fn is_registered() -> bool {
    let id = native_thread_id();
    Platform::get().bootstrap().threads.iter().any(|t| t.id == id)
}

/// Number of threads currently attached.
#[must_use]
pub fn live_count() -> usize {
    Platform::get().live_count()
}

#[must_use]
pub fn live_threads() -> Vec<ThreadInfo> {
    Platform::get().bootstrap().threads.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountOnDrop(Arc<AtomicUsize>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn state_names_are_lowercase() {
        assert_eq!(ThreadState::Init.to_string(), "init");
        assert_eq!(ThreadState::Exited.to_string(), "exited");
    }

    #[test]
    fn default_stack_resolves_to_configured_size() {
        assert_eq!(StackSize::Default.resolve(1 << 18), 1 << 18);
        assert_eq!(StackSize::Bytes(1 << 20).resolve(1 << 18), 1 << 20);
        let handle = init("sized", StackSize::Default, || {});
        assert_eq!(
            handle.stack_size(),
            Platform::get().config().default_stack_size
        );
    }

    #[test]
    fn lifecycle_runs_entry_and_reaches_exited() {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let mut handle = init("lifecycle", StackSize::Bytes(128 * 1024), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(handle.state(), ThreadState::Init);
        assert_eq!(handle.native_id(), None);

        handle.enable();
        assert_eq!(handle.wait_exit(MesWait::Indefinite), MesStatus::Posted);
        assert_eq!(handle.state(), ThreadState::Exited);
        assert!(handle.native_id().is_some());
        assert_eq!(handle.wait_exit(MesWait::Zero), MesStatus::Posted);
        assert!(handle.destroy().is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn running_thread_is_registered_until_exit() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let mut handle = init("registry-entry", StackSize::Default, move || {
            let _ = rx.recv();
        });
        handle.enable();
        while handle.native_id().is_none() {
            std::thread::yield_now();
        }
        let id = handle.native_id();
        assert_eq!(handle.wait_exit(MesWait::Zero), MesStatus::Timeout);
        let entry = live_threads().into_iter().find(|t| Some(t.id) == id);
        assert_eq!(
            entry.map(|t| (t.name, t.origin)),
            Some(("registry-entry".to_owned(), ThreadOrigin::Spawned))
        );

        tx.send(()).unwrap();
        handle.wait_exit(MesWait::Indefinite);
        assert!(live_threads().iter().all(|t| Some(t.id) != id));
        handle.destroy().unwrap();
    }

    #[test]
    fn entry_panic_is_returned_by_destroy() {
        let mut handle = init("panicker", StackSize::Default, || panic!("entry failed"));
        handle.enable();
        assert_eq!(
            handle.wait_exit(MesWait::For(Duration::from_secs(5))),
            MesStatus::Posted
        );
        let payload = handle.destroy().expect_err("panic propagated");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"entry failed"));
    }

    #[test]
    fn exit_step_drops_slot_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = CountOnDrop(Arc::clone(&drops));
        let mut handle = init("slot-owner", StackSize::Default, move || {
            tls::set(Slot::ScratchAlloc, value);
        });
        handle.enable();
        handle.wait_exit(MesWait::Indefinite);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        handle.destroy().unwrap();
    }

    #[test]
    #[should_panic(expected = "cannot move from enabled to enabled")]
    fn enabling_twice_is_fatal() {
        let mut handle = init("twice", StackSize::Default, || {});
        handle.enable();
        handle.enable();
    }

    #[test]
    #[should_panic(expected = "thread suspension is not supported")]
    fn disable_is_unsupported() {
        let mut handle = init("suspend", StackSize::Default, || {});
        handle.enable();
        handle.disable();
    }

    #[test]
    fn register_and_unregister_external_thread() {
        std::thread::spawn(|| {
            assert!(!is_registered());
            register("external");
            assert!(is_registered());
            let me = native_thread_id();
            assert!(live_threads()
                .iter()
                .any(|t| t.id == me && t.origin == ThreadOrigin::Registered));
            unregister();
            assert!(!is_registered());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn double_register_is_fatal() {
        std::thread::spawn(|| {
            register("dup");
            let second = panic::catch_unwind(|| register("dup"));
            unregister();
            assert!(second.is_err());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn unregister_without_register_is_fatal() {
        unregister();
    }
}
