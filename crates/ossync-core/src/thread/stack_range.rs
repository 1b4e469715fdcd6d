//! Stack-address thread identification.
//!
//! Fallback for targets whose native thread-local storage is unusable: every
//! attached thread's stack occupies a disjoint address range, so the address
//! of any local variable identifies the running thread. Ranges are kept
//! sorted by start address and searched with a binary search. Each range maps
//! to a dense id indexing that thread's [`SlotTable`].
//!
//! Each range also records the native id of the thread that attached it.
//! Threads that attached lazily never detach, and the C runtime hands their
//! stacks to later threads, so a range found for the wrong owner is stale: it
//! is evicted (its values dropped) and the caller attaches afresh.

#![allow(unsafe_code)]

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::ident::native_thread_id;
use super::tls::SlotTable;
use crate::config::DEFAULT_STACK_SIZE;

type SharedTable = Arc<Mutex<SlotTable>>;

/// Half-open `[lo, hi)` stack range of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRange {
    pub lo: usize,
    pub hi: usize,
    pub dense_id: usize,
    /// Native id of the attaching thread.
    pub owner: u64,
}

impl StackRange {
    fn overlaps(&self, lo: usize, hi: usize) -> bool {
        self.lo < hi && lo < self.hi
    }
}

#[derive(Debug, Default)]
struct RangeTable {
    ranges: Vec<StackRange>,
    tables: Vec<Option<SharedTable>>,
    free_ids: Vec<usize>,
}

impl RangeTable {
    fn search(&self, addr: usize) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.hi <= addr);
        self.ranges
            .get(idx)
            .filter(|r| r.lo <= addr)
            .map(|_| idx)
    }

    fn release_id(&mut self, dense_id: usize) -> Option<SharedTable> {
        let table = self.tables.get_mut(dense_id)?.take();
        self.free_ids.push(dense_id);
        table
    }
}

#[derive(Debug, Default)]
pub struct StackRangeTls {
    inner: RwLock<RangeTable>,
}

impl StackRangeTls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `[lo, hi)` as the stack of thread `owner`. Overlapping stale
    /// ranges are evicted and their tables returned so the caller can drop
    /// them outside any lock.
    pub fn attach(&self, lo: usize, hi: usize, owner: u64) -> (StackRange, Vec<SharedTable>) {
        let mut inner = self.inner.write();

        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(inner.ranges.len() + 1);
        for range in std::mem::take(&mut inner.ranges) {
            if range.overlaps(lo, hi) {
                evicted.extend(inner.release_id(range.dense_id));
            } else {
                kept.push(range);
            }
        }
        inner.ranges = kept;

        let dense_id = match inner.free_ids.pop() {
            Some(id) => id,
            None => {
                inner.tables.push(None);
                inner.tables.len() - 1
            }
        };
        inner.tables[dense_id] = Some(Arc::new(Mutex::new(SlotTable::new())));

        let range = StackRange {
            lo,
            hi,
            dense_id,
            owner,
        };
        let at = inner.ranges.partition_point(|r| r.lo < lo);
        inner.ranges.insert(at, range);
        (range, evicted)
    }

    /// Forget the range containing `addr` if `owner` attached it, returning
    /// its table.
    pub fn detach(&self, addr: usize, owner: u64) -> Option<SharedTable> {
        let mut inner = self.inner.write();
        let idx = inner.search(addr)?;
        if inner.ranges[idx].owner != owner {
            return None;
        }
        let range = inner.ranges.remove(idx);
        inner.release_id(range.dense_id)
    }

    #[must_use]
    pub fn range_of(&self, addr: usize) -> Option<StackRange> {
        let inner = self.inner.read();
        inner.search(addr).map(|idx| inner.ranges[idx])
    }

    /// Table of the range containing `addr`, if `owner` attached it.
    #[must_use]
    pub fn lookup(&self, addr: usize, owner: u64) -> Option<SharedTable> {
        let inner = self.inner.read();
        let idx = inner.search(addr)?;
        let range = inner.ranges[idx];
        if range.owner != owner {
            return None;
        }
        inner.tables.get(range.dense_id).and_then(Clone::clone)
    }

    /// Table for `owner` running at `addr`, attaching `bounds()` when no live
    /// range of `owner` covers `addr`. A stale range in the way is evicted and
    /// its values dropped before this returns.
    pub fn table_for(
        &self,
        addr: usize,
        owner: u64,
        bounds: impl FnOnce() -> (usize, usize),
    ) -> SharedTable {
        if let Some(table) = self.lookup(addr, owner) {
            return table;
        }
        let (lo, hi) = bounds();
        let (range, evicted) = self.attach(lo, hi, owner);
        tracing::debug!(
            lo,
            hi,
            owner,
            dense_id = range.dense_id,
            evicted = evicted.len(),
            "attached thread stack range"
        );
        let table = self
            .lookup(addr, owner)
            .unwrap_or_else(|| Arc::new(Mutex::new(SlotTable::new())));
        drop(evicted);
        table
    }

    /// Table of the calling thread, attaching it on first use.
    pub fn current_table(&self) -> SharedTable {
        self.table_for(stack_marker(), native_thread_id(), current_stack_bounds)
    }

    /// Attach the calling thread's stack unless it already owns a range here.
    pub(crate) fn attach_current(&self) {
        drop(self.current_table());
    }

    pub(crate) fn detach_current(&self) -> Option<SharedTable> {
        self.detach(stack_marker(), native_thread_id())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address of a local in the calling frame.
#[inline(never)]
#[must_use]
pub fn stack_marker() -> usize {
    let marker = 0_u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// `[lo, hi)` of the calling thread's stack.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_stack_bounds() -> (usize, usize) {
    // SAFETY: attr is initialized by pthread_getattr_np before use and
    // destroyed exactly once; out-pointers are valid locals.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return estimated_stack_bounds();
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return estimated_stack_bounds();
        }
        let lo = addr as usize;
        (lo, lo.saturating_add(size))
    }
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_stack_bounds() -> (usize, usize) {
    estimated_stack_bounds()
}

/// Stacks grow down on every supported target: assume the default size below
/// the current frame and one page above it.
fn estimated_stack_bounds() -> (usize, usize) {
    let here = stack_marker();
    (here.saturating_sub(DEFAULT_STACK_SIZE), here.saturating_add(4096))
}
