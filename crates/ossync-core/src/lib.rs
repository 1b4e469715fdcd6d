//! # ossync-core
//!
//! Concurrency and timing core of the ossync portability layer.
//!
//! Every higher engine layer (lock manager, cache, log writer, replication,
//! RPC) builds on four pieces provided here:
//!
//! - [`sem`]: non-reentrant mutexes identified by a centrally assigned
//!   [`SemNumber`](sem::SemNumber), plus the auto-reset event [`Mes`](sem::Mes).
//! - [`lockorder`]: per-thread stack of held semaphore numbers that rejects
//!   out-of-order acquisition in debug builds.
//! - [`thread`]: OS thread lifecycle, the live-thread registry and a small
//!   fixed set of thread-local slots.
//! - [`timer`]: one background thread firing timeout callbacks in deadline
//!   order.
//!
//! Process-wide state lives behind one explicit handle, [`Platform`], which is
//! installed once at startup.
//!
//! Contract violations are never returned as errors. They go through
//! [`fatal`], which logs and terminates (or panics, the default policy).

#![deny(unsafe_code)]

pub mod config;
pub mod fatal;
pub mod lockorder;
pub mod platform;
pub mod sem;
pub mod thread;
pub mod timer;

pub use config::{
    ConfigError, FatalPolicy, InstrumentLevel, PlatformConfig, TimerConfig, TlsStrategy,
};
pub use fatal::{Fatal, ResourceError};
pub use platform::{Platform, PlatformCaps, PlatformError};
pub use sem::{LockStatus, LockTimeout, Mes, MesStatus, MesWait, Sem, SemKind, SemMutex, SemNumber};
pub use thread::{Slot, StackSize, ThreadHandle, ThreadInfo, ThreadOrigin, ThreadState};
pub use timer::{Clock, ManualClock, RequestId, SystemClock, TimerEvent, TimerService};
