//! Leaf nodes (BINs): ordered slots, duplicate sets and the registry of
//! cursors positioned on the leaf.

use std::cmp::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::comparator::KeyOrder;
use super::latch::{BinLatch, BinRef};
use crate::types::NodeId;

/// Where a cursor points. Shared between the cursor and every leaf it is
/// registered on so structural changes can shift it.
#[derive(Default)]
pub(crate) struct Position {
    pub(crate) bin: Option<BinRef>,
    pub(crate) index: isize,
    /// `Some` while positioned inside a duplicate set; the index may sit one
    /// past either end of the set.
    pub(crate) dup: Option<isize>,
}

impl Position {
    fn on(&self, bin: &BinRef) -> bool {
        self.bin.as_ref().is_some_and(|current| Arc::ptr_eq(current, bin))
    }
}

pub(crate) type PositionCell = Arc<Mutex<Position>>;

/// A record node.
#[derive(Clone, Debug)]
pub(crate) struct Ln {
    pub(crate) id: NodeId,
    pub(crate) data: Vec<u8>,
    pub(crate) deleted: bool,
}

impl Ln {
    pub(crate) fn new(id: NodeId, data: &[u8]) -> Self {
        Self {
            id,
            data: data.to_vec(),
            deleted: false,
        }
    }
}

/// Records sharing one key, ordered by the duplicate comparator.
#[derive(Clone, Debug)]
pub(crate) struct DupSet {
    /// Lock target serializing changes to the set's membership.
    pub(crate) count_id: NodeId,
    pub(crate) entries: Vec<Ln>,
}

impl DupSet {
    /// Largest entry with data <= `data`, or -1; plus whether it matched exactly.
    pub(crate) fn find(&self, data: &[u8], order: &dyn KeyOrder) -> (isize, bool) {
        let idx = self
            .entries
            .partition_point(|ln| order.compare(&ln.data, data) != Ordering::Greater);
        let exact = idx > 0 && order.compare(&self.entries[idx - 1].data, data) == Ordering::Equal;
        (idx as isize - 1, exact)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.entries.iter().filter(|ln| !ln.deleted).count()
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Target {
    Single(Ln),
    Dups(DupSet),
}

#[derive(Clone, Debug)]
pub(crate) struct Slot {
    pub(crate) key: Vec<u8>,
    pub(crate) target: Target,
}

impl Slot {
    pub(crate) fn is_live(&self) -> bool {
        match &self.target {
            Target::Single(ln) => !ln.deleted,
            Target::Dups(set) => set.entries.iter().any(|ln| !ln.deleted),
        }
    }

    pub(crate) fn ln(&self, dup: Option<isize>) -> Option<&Ln> {
        match (&self.target, dup) {
            (Target::Single(ln), _) => Some(ln),
            (Target::Dups(set), Some(d)) if d >= 0 => set.entries.get(d as usize),
            (Target::Dups(_), _) => None,
        }
    }

    pub(crate) fn ln_mut(&mut self, dup: Option<isize>) -> Option<&mut Ln> {
        match (&mut self.target, dup) {
            (Target::Single(ln), _) => Some(ln),
            (Target::Dups(set), Some(d)) if d >= 0 => set.entries.get_mut(d as usize),
            (Target::Dups(_), _) => None,
        }
    }

    pub(crate) fn dups(&self) -> Option<&DupSet> {
        match &self.target {
            Target::Dups(set) => Some(set),
            Target::Single(_) => None,
        }
    }

    pub(crate) fn find_ln_mut(&mut self, id: NodeId) -> Option<&mut Ln> {
        match &mut self.target {
            Target::Single(ln) => (ln.id == id).then_some(ln),
            Target::Dups(set) => set.entries.iter_mut().find(|ln| ln.id == id),
        }
    }
}

/// Contents of one leaf.
pub(crate) struct BinState {
    pub(crate) id: u64,
    /// Lower bound of keys routed to this leaf; `None` for the first leaf.
    pub(crate) low_key: Option<Vec<u8>>,
    pub(crate) slots: Vec<Slot>,
    cursors: Vec<Weak<Mutex<Position>>>,
}

impl BinState {
    pub(crate) fn new(id: u64, low_key: Option<Vec<u8>>) -> Self {
        Self {
            id,
            low_key,
            slots: Vec::new(),
            cursors: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Largest slot with key <= `key`, or -1; plus whether it matched exactly.
    pub(crate) fn find_entry(&self, key: &[u8], order: &dyn KeyOrder) -> (isize, bool) {
        let idx = self
            .slots
            .partition_point(|slot| order.compare(&slot.key, key) != Ordering::Greater);
        let exact = idx > 0 && order.compare(&self.slots[idx - 1].key, key) == Ordering::Equal;
        (idx as isize - 1, exact)
    }

    pub(crate) fn slot(&self, index: isize) -> Option<&Slot> {
        usize::try_from(index).ok().and_then(|i| self.slots.get(i))
    }

    pub(crate) fn slot_mut(&mut self, index: isize) -> Option<&mut Slot> {
        usize::try_from(index).ok().and_then(|i| self.slots.get_mut(i))
    }

    pub(crate) fn registered_cursors(&self) -> usize {
        self.cursors.iter().filter(|cell| cell.strong_count() > 0).count()
    }
}

impl BinLatch {
    /// Adds `cell` to this leaf's cursor registry.
    pub(crate) fn register(&mut self, cell: &PositionCell) {
        let weak = Arc::downgrade(cell);
        if !self.cursors.iter().any(|existing| existing.ptr_eq(&weak)) {
            self.cursors.push(weak);
        }
    }

    /// Visits every cursor currently positioned on this leaf, dropping stale
    /// registrations along the way.
    fn for_each_cursor(&mut self, mut f: impl FnMut(&mut Position)) {
        let this = Arc::clone(self.bin());
        self.cursors.retain(|weak| {
            let Some(cell) = weak.upgrade() else {
                return false;
            };
            let mut pos = cell.lock();
            if !pos.on(&this) {
                return false;
            }
            f(&mut pos);
            true
        });
    }

    pub(crate) fn insert_slot(&mut self, index: usize, slot: Slot) {
        self.slots.insert(index, slot);
        let index = index as isize;
        self.for_each_cursor(|pos| {
            if pos.index >= index {
                pos.index += 1;
            }
        });
    }

    pub(crate) fn insert_dup(&mut self, index: usize, dup_index: usize, ln: Ln) {
        if let Some(Target::Dups(set)) = self.slots.get_mut(index).map(|slot| &mut slot.target) {
            set.entries.insert(dup_index, ln);
        }
        let (index, dup_index) = (index as isize, dup_index as isize);
        self.for_each_cursor(|pos| {
            if pos.index == index {
                if let Some(d) = pos.dup.as_mut() {
                    if *d >= dup_index {
                        *d += 1;
                    }
                }
            }
        });
    }

    pub(crate) fn remove_slot(&mut self, index: usize) -> Slot {
        let slot = self.slots.remove(index);
        let index = index as isize;
        self.for_each_cursor(|pos| {
            if pos.index > index {
                pos.index -= 1;
            }
        });
        slot
    }

    pub(crate) fn remove_dup(&mut self, index: usize, dup_index: usize) {
        if let Some(Target::Dups(set)) = self.slots.get_mut(index).map(|slot| &mut slot.target) {
            set.entries.remove(dup_index);
        }
        let (index, dup_index) = (index as isize, dup_index as isize);
        self.for_each_cursor(|pos| {
            if pos.index == index {
                if let Some(d) = pos.dup.as_mut() {
                    if *d > dup_index {
                        *d -= 1;
                    }
                }
            }
        });
    }

    /// True when a cursor sits on the slot (and, if given, the duplicate).
    pub(crate) fn has_cursor_at(&mut self, index: usize, dup: Option<usize>) -> bool {
        let (index, dup) = (index as isize, dup.map(|d| d as isize));
        let mut found = false;
        self.for_each_cursor(|pos| {
            if pos.index == index && (dup.is_none() || pos.dup == dup) {
                found = true;
            }
        });
        found
    }

    /// Moves slots `at..` into `right`, carrying their cursors along.
    pub(crate) fn split_into(&mut self, at: usize, right: &mut BinLatch) {
        let moved = self.slots.split_off(at);
        right.slots = moved;
        let target = Arc::clone(right.bin());
        let at = at as isize;
        let mut carried = Vec::new();
        let this = Arc::clone(self.bin());
        self.cursors.retain(|weak| {
            let Some(cell) = weak.upgrade() else {
                return false;
            };
            let mut pos = cell.lock();
            if !pos.on(&this) {
                return false;
            }
            if pos.index >= at {
                pos.index -= at;
                pos.bin = Some(Arc::clone(&target));
                drop(pos);
                carried.push(cell);
                return false;
            }
            true
        });
        for cell in carried {
            right.register(&cell);
        }
    }
}
