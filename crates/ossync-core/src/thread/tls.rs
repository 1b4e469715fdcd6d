//! Fixed thread-local slots.
//!
//! Each thread owns one [`SlotTable`] with [`SLOT_COUNT`] type-erased values,
//! created on first access. Values are dropped when the thread exits through
//! the thread shim or [`unregister`](super::unregister), which runs their
//! destructors.
//!
//! Two backing stores exist, chosen by [`TlsStrategy`](crate::TlsStrategy):
//! native `thread_local!` storage, or the
//! [`StackRangeTls`](super::stack_range::StackRangeTls) fallback that finds
//! the calling thread's table by the address of a stack local.
//!
//! [`with`] lends the slot's value out of the table for the duration of its
//! closure, so the closure may use other slots and take semaphores (whose
//! lock-order stack lives in a slot). Touching the lent slot itself from
//! inside is a fatal assertion.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;

use crate::fatal::{self, Fatal};
use crate::platform::{Platform, TlsBackend};

/// Number of slots per thread.
pub const SLOT_COUNT: usize = 8;

/// Teardown passes. A value's destructor may store into a slot again; such
/// values are dropped on the next pass, up to this bound.
const DESTRUCTOR_ITERATIONS: usize = 4;

// ---------------------------------------------------------------------------
// Slot indices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Per-thread fault/trap handler context.
    TrapHandler = 0,
    /// Scratch allocator for short-lived buffers.
    ScratchAlloc = 1,
    /// Held-semaphore stack used by lock-order checking.
    LockOrderStack = 2,
    /// Query text buffer of the executing statement.
    SqlBuffer = 3,
    /// Memory accounting context.
    AllocContext = 4,
    /// Event a sleeping thread parks on.
    SleepEvent = 5,
    Reserved6 = 6,
    Reserved7 = 7,
}

impl Slot {
    pub const ALL: [Slot; SLOT_COUNT] = [
        Slot::TrapHandler,
        Slot::ScratchAlloc,
        Slot::LockOrderStack,
        Slot::SqlBuffer,
        Slot::AllocContext,
        Slot::SleepEvent,
        Slot::Reserved6,
        Slot::Reserved7,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Slot for a raw index. Out of range is fatal.
    #[track_caller]
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        match Self::ALL.get(index) {
            Some(slot) => *slot,
            None => fatal::raise(Fatal::InvalidSlot(index)),
        }
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

type SlotValue = Box<dyn Any + Send>;

/// One thread's slot values.
#[derive(Default)]
pub struct SlotTable {
    values: [Option<SlotValue>; SLOT_COUNT],
    lent: [bool; SLOT_COUNT],
}

impl SlotTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    fn check_not_lent(&self, slot: Slot) {
        if self.lent[slot.index()] {
            fatal::raise(Fatal::SlotLent(slot));
        }
    }

    /// Store `value`, returning the previous occupant.
    #[track_caller]
    pub fn replace(&mut self, slot: Slot, value: SlotValue) -> Option<SlotValue> {
        self.check_not_lent(slot);
        self.values[slot.index()].replace(value)
    }

    #[track_caller]
    pub fn get_mut<T: Any>(&mut self, slot: Slot) -> Option<&mut T> {
        self.check_not_lent(slot);
        self.values[slot.index()].as_mut()?.downcast_mut::<T>()
    }

    /// Remove the value if it has type `T`; a value of another type stays.
    #[track_caller]
    pub fn take_as<T: Any>(&mut self, slot: Slot) -> Option<T> {
        self.check_not_lent(slot);
        let value = self.values[slot.index()].take()?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.values[slot.index()] = Some(value);
                None
            }
        }
    }

    /// Move the value out while a caller borrows it; the slot stays reserved
    /// until [`restore`](Self::restore).
    #[track_caller]
    fn lend(&mut self, slot: Slot) -> Option<SlotValue> {
        self.check_not_lent(slot);
        let value = self.values[slot.index()].take()?;
        self.lent[slot.index()] = true;
        Some(value)
    }

    fn restore(&mut self, slot: Slot, value: SlotValue) {
        self.lent[slot.index()] = false;
        self.values[slot.index()] = Some(value);
    }

    /// Remove every value not currently lent.
    pub fn take_all(&mut self) -> Vec<SlotValue> {
        self.values.iter_mut().filter_map(Option::take).collect()
    }

    #[must_use]
    pub fn is_occupied(&self, slot: Slot) -> bool {
        self.values[slot.index()].is_some() || self.lent[slot.index()]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let occupied: Vec<Slot> = Slot::ALL
            .into_iter()
            .filter(|s| self.is_occupied(*s))
            .collect();
        f.debug_struct("SlotTable")
            .field("occupied", &occupied)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Backend dispatch
// ---------------------------------------------------------------------------

thread_local! {
    static NATIVE: RefCell<Option<SlotTable>> = const { RefCell::new(None) };
}

/// Run `f` on the calling thread's table, or on `None` once the thread's
/// storage has been destroyed.
fn with_table<R>(f: impl FnOnce(Option<&mut SlotTable>) -> R) -> R {
    match Platform::get().tls_backend() {
        TlsBackend::Native => {
            if NATIVE.try_with(|_| ()).is_err() {
                return f(None);
            }
            NATIVE.with(|cell| match cell.try_borrow_mut() {
                Ok(mut table) => f(Some(table.get_or_insert_with(SlotTable::default))),
                Err(_) => fatal::raise(Fatal::SlotReentered),
            })
        }
        TlsBackend::StackRange(ranges) => {
            let table = ranges.current_table();
            let Some(mut guard) = table.try_lock() else {
                fatal::raise(Fatal::SlotReentered);
            };
            f(Some(&mut guard))
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Store `value` in `slot`, dropping any previous value. Returns `false` if
/// the thread's storage is already gone.
pub fn set<T: Any + Send>(slot: Slot, value: T) -> bool {
    store(slot, Box::new(value))
}

pub(crate) fn store(slot: Slot, value: SlotValue) -> bool {
    let outcome = with_table(|table| match table {
        Some(table) => Ok(table.replace(slot, value)),
        None => Err(value),
    });
    // Previous values are dropped here, outside the table borrow.
    outcome.is_ok()
}

/// Puts a lent value back, also when the borrowing closure unwinds.
struct Loan {
    slot: Slot,
    value: Option<SlotValue>,
}

impl Drop for Loan {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        let slot = self.slot;
        // Storage destroyed meanwhile: the value is dropped here instead.
        let orphan = with_table(|table| match table {
            Some(table) => {
                table.restore(slot, value);
                None
            }
            None => Some(value),
        });
        drop(orphan);
    }
}

/// Borrow the value in `slot` as `T`. `f` sees `None` if the slot is empty,
/// holds another type, or the thread's storage is gone.
///
/// The table is not borrowed while `f` runs; only `slot` is. `f` may use
/// other slots and take semaphores, but touching `slot` again is fatal.
#[track_caller]
pub fn with<T: Any, R>(slot: Slot, f: impl FnOnce(Option<&mut T>) -> R) -> R {
    let lent = with_table(|table| table.and_then(|t| t.lend(slot)));
    let Some(value) = lent else {
        return f(None);
    };
    let mut loan = Loan {
        slot,
        value: Some(value),
    };
    f(loan.value.as_mut().and_then(|v| v.downcast_mut::<T>()))
}

/// Clone of the value in `slot`.
#[track_caller]
#[must_use]
pub fn get<T: Any + Clone>(slot: Slot) -> Option<T> {
    with(slot, |value: Option<&mut T>| value.map(|v| v.clone()))
}

/// Remove and return the value in `slot` if it has type `T`.
#[track_caller]
pub fn take<T: Any>(slot: Slot) -> Option<T> {
    with_table(|table| table.and_then(|t| t.take_as::<T>(slot)))
}

#[must_use]
pub fn is_occupied(slot: Slot) -> bool {
    with_table(|table| table.is_some_and(|t| t.is_occupied(slot)))
}

/// Drop every value of the calling thread's table.
pub(crate) fn teardown_current() {
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let values = with_table(|table| table.map(SlotTable::take_all).unwrap_or_default());
        if values.is_empty() {
            break;
        }
        drop(values);
    }
}
