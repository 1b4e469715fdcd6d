//! Native thread ids.

#![allow(unsafe_code)]

use std::cell::Cell;

thread_local! {
    static CACHED_ID: Cell<u64> = const { Cell::new(0) };
}

/// OS id of the calling thread. Never zero.
///
/// `gettid` on Linux, `pthread_self` on other unix targets, a process-local
/// counter elsewhere. Used for diagnostics and semaphore ownership; the dense
/// ids of the stack-range slot store are unrelated.
#[must_use]
pub fn native_thread_id() -> u64 {
    CACHED_ID
        .try_with(|cached| {
            let id = cached.get();
            if id != 0 {
                return id;
            }
            let id = os_thread_id();
            cached.set(id);
            id
        })
        .unwrap_or_else(|_| os_thread_id())
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    tid as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
fn os_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    let handle = unsafe { libc::pthread_self() };
    handle as usize as u64
}

#[cfg(not(unix))]
fn os_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
