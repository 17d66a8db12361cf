//! Exclusive leaf latches.
//!
//! A latch is held only for the duration of a structural read or write of one
//! leaf and never across a lock wait. At most one leaf latch is held per
//! thread; the per-thread counter lets callers assert that no latch leaked.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use super::bin::BinState;

/// Shared reference to one leaf.
pub(crate) type BinRef = Arc<Mutex<BinState>>;

thread_local! {
    static LATCHES_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Number of leaf latches held by the current thread.
pub fn latches_held() -> usize {
    LATCHES_HELD.with(Cell::get)
}

/// RAII guard over a latched leaf.
pub(crate) struct BinLatch {
    guard: ArcMutexGuard<RawMutex, BinState>,
}

impl BinLatch {
    pub(crate) fn acquire(bin: &BinRef) -> Self {
        let guard = bin.lock_arc();
        LATCHES_HELD.with(|held| held.set(held.get() + 1));
        Self { guard }
    }

    /// The leaf this latch protects.
    pub(crate) fn bin(&self) -> &BinRef {
        ArcMutexGuard::mutex(&self.guard)
    }

    pub(crate) fn is(&self, bin: &BinRef) -> bool {
        Arc::ptr_eq(self.bin(), bin)
    }
}

impl Deref for BinLatch {
    type Target = BinState;

    fn deref(&self) -> &BinState {
        &self.guard
    }
}

impl DerefMut for BinLatch {
    fn deref_mut(&mut self) -> &mut BinState {
        &mut self.guard
    }
}

impl Drop for BinLatch {
    fn drop(&mut self) {
        LATCHES_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}
