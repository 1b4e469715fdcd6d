//! Per-thread lock-order stack.
//!
//! Every thread keeps a bounded stack of the semaphore numbers it holds.
//! Acquiring a number lower than the one on top is a lock-order violation and
//! fatal, with one tolerated exception: [`CACHE_LRU`] may be taken while
//! [`CACHE_HASH`] is on top. Numbers [`SemNumber::NO_CHECK`] and
//! [`SemNumber::BOOTSTRAP`] are never recorded.
//!
//! The stack lives in the [`Slot::LockOrderStack`] thread-local slot and is
//! created on first use. Each stack is also linked into a process-wide list
//! (under the bootstrap semaphore) so [`held_locks_report`] can show what
//! every thread holds.
//!
//! All entry points are no-ops unless `debug_assertions` or the `lock-order`
//! feature is enabled.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::fatal::{self, Fatal};
use crate::platform::Platform;
use crate::sem::SemNumber;
use crate::sem::ids::{CACHE_HASH, CACHE_LRU};
use crate::thread::{self, Slot, tls};

/// Deepest nesting a thread may reach.
pub const CAPACITY: usize = 32;

/// Reverse pairs `(held, requested)` that are allowed.
const WHITELIST: &[(SemNumber, SemNumber)] = &[(CACHE_HASH, CACHE_LRU)];

/// Whether order checking is compiled in.
#[inline]
#[must_use]
pub const fn is_enabled() -> bool {
    cfg!(any(debug_assertions, feature = "lock-order"))
}

fn is_whitelisted(held: SemNumber, requested: SemNumber) -> bool {
    WHITELIST.contains(&(held, requested))
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Numbers held by one thread, in acquisition order. Released entries below
/// the top are cleared in place and compacted once they reach the top.
#[derive(Debug, Default)]
pub struct OrderStack {
    entries: Vec<Option<SemNumber>>,
}

impl OrderStack {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(CAPACITY),
        }
    }

    /// Topmost still-held number.
    #[must_use]
    pub fn top(&self) -> Option<SemNumber> {
        self.entries.iter().rev().find_map(|e| *e)
    }

    /// The violation acquiring `number` would cause, if any.
    #[must_use]
    pub fn check(&self, number: SemNumber) -> Option<Fatal> {
        let held = self.top()?;
        (held > number && !is_whitelisted(held, number)).then_some(Fatal::LockOrder {
            held,
            requested: number,
        })
    }

    #[track_caller]
    pub fn push(&mut self, number: SemNumber) {
        if self.entries.len() >= CAPACITY {
            fatal::raise(Fatal::LockStackOverflow(CAPACITY));
        }
        self.entries.push(Some(number));
    }

    /// Clear the topmost entry equal to `number`, then drop cleared entries
    /// off the top.
    #[track_caller]
    pub fn remove(&mut self, number: SemNumber) {
        let Some(pos) = self.entries.iter().rposition(|e| *e == Some(number)) else {
            fatal::raise(Fatal::LockStackMissing(number));
        };
        self.entries[pos] = None;
        while matches!(self.entries.last(), Some(None)) {
            self.entries.pop();
        }
    }

    #[must_use]
    pub fn contains(&self, number: SemNumber) -> bool {
        self.entries.contains(&Some(number))
    }

    /// Held numbers, bottom first.
    #[must_use]
    pub fn held(&self) -> Vec<SemNumber> {
        self.entries.iter().filter_map(|e| *e).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}

type SharedStack = Arc<Mutex<OrderStack>>;

/// Entry of the process-wide diagnostic list.
#[derive(Debug)]
pub(crate) struct OrderLink {
    thread_id: u64,
    thread_name: Option<String>,
    stack: Weak<Mutex<OrderStack>>,
}

// ---------------------------------------------------------------------------
// Thread-level entry points
// ---------------------------------------------------------------------------

fn current_stack() -> SharedStack {
    if let Some(stack) = tls::get::<SharedStack>(Slot::LockOrderStack) {
        return stack;
    }
    let stack: SharedStack = Arc::new(Mutex::new(OrderStack::new()));
    // Slot storage may be gone during thread-local destruction; the checks
    // then run against a throwaway stack.
    if tls::store(Slot::LockOrderStack, Box::new(Arc::clone(&stack))) {
        link(&stack);
    }
    stack
}

fn link(stack: &SharedStack) {
    let link = OrderLink {
        thread_id: thread::native_thread_id(),
        thread_name: std::thread::current().name().map(str::to_owned),
        stack: Arc::downgrade(stack),
    };
    let mut boot = Platform::get().bootstrap();
    boot.order_stacks.retain(|l| l.stack.strong_count() > 0);
    boot.order_stacks.push(link);
}

/// Fatal if acquiring `number` would violate the order.
#[track_caller]
pub fn enter_check(number: SemNumber) {
    if !is_enabled() || number.is_order_exempt() {
        return;
    }
    let violation = current_stack().lock().check(number);
    if let Some(violation) = violation {
        fatal::raise(violation);
    }
}

/// Record `number` as held.
#[track_caller]
pub fn enter(number: SemNumber) {
    if !is_enabled() || number.is_order_exempt() {
        return;
    }
    current_stack().lock().push(number);
}

/// Record `number` as released. Fatal if it was never recorded.
#[track_caller]
pub fn exit(number: SemNumber) {
    if !is_enabled() || number.is_order_exempt() {
        return;
    }
    current_stack().lock().remove(number);
}

#[must_use]
pub fn find(number: SemNumber) -> bool {
    is_enabled() && current_stack().lock().contains(number)
}

#[must_use]
pub fn not_found(number: SemNumber) -> bool {
    !find(number)
}

/// Numbers the calling thread holds, bottom first.
#[must_use]
pub fn held() -> Vec<SemNumber> {
    if !is_enabled() {
        return Vec::new();
    }
    current_stack().lock().held()
}

/// Drop the calling thread's stack and unlink it. Called on thread exit.
pub(crate) fn release_current() {
    if !is_enabled() {
        return;
    }
    let Some(stack) = tls::take::<SharedStack>(Slot::LockOrderStack) else {
        return;
    };
    let leftover = stack.lock().held();
    if !leftover.is_empty() {
        tracing::warn!(
            thread = thread::native_thread_id(),
            held = ?leftover,
            "thread exiting with semaphores still held"
        );
    }
    let this = Arc::downgrade(&stack);
    let mut boot = Platform::get().bootstrap();
    boot.order_stacks
        .retain(|l| l.stack.strong_count() > 0 && !Weak::ptr_eq(&l.stack, &this));
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// What one thread holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLocks {
    pub thread_id: u64,
    pub thread_name: Option<String>,
    pub held: Vec<SemNumber>,
}

/// Snapshot of every linked thread that currently holds at least one
/// semaphore.
#[must_use]
pub fn held_locks_report() -> Vec<HeldLocks> {
    if !is_enabled() {
        return Vec::new();
    }
    let stacks: Vec<(u64, Option<String>, SharedStack)> = {
        let boot = Platform::get().bootstrap();
        boot.order_stacks
            .iter()
            .filter_map(|l| {
                l.stack
                    .upgrade()
                    .map(|s| (l.thread_id, l.thread_name.clone(), s))
            })
            .collect()
    };
    stacks
        .into_iter()
        .filter_map(|(thread_id, thread_name, stack)| {
            let held = stack.lock().held();
            (!held.is_empty()).then_some(HeldLocks {
                thread_id,
                thread_name,
                held,
            })
        })
        .collect()
}
