//! Positioned reference into a tree: (leaf, slot, optional duplicate index).
//!
//! Positioning calls return with the target leaf latched so the caller can
//! read the record without a second search; every other entry point releases
//! the latch before returning, on success and on error. Record locks are
//! first tried without waiting while latched; a denied request drops the
//! latch, waits, relatches and rechecks the slot.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::bin::{DupSet, Ln, Position, PositionCell, Slot, Target};
use super::latch::{BinLatch, BinRef};
use super::tree::{RecordUndo, Tree};
use crate::primitives::concurrency::{LockGrant, LockType, Locker};
use crate::primitives::wal::LogKind;
use crate::types::{CairnError, Entry, Lookup, NodeId, OperationStatus, Result};

/// Outcome of a positioning primitive: finished, or a range lock waited on
/// a concurrent insert and the whole operation must start over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step<T> {
    Done(T),
    Restart,
}

impl<T> Step<T> {
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Done(value) => Step::Done(f(value)),
            Step::Restart => Step::Restart,
        }
    }
}

/// Unwraps a [`Step`], returning `Ok(Step::Restart)` from the enclosing function.
macro_rules! step {
    ($e:expr) => {
        match $e {
            $crate::storage::btree::node_cursor::Step::Done(value) => value,
            $crate::storage::btree::node_cursor::Step::Restart => {
                return Ok($crate::storage::btree::node_cursor::Step::Restart)
            }
        }
    };
}
pub(crate) use step;

/// Search semantics for keyed positioning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Exact key.
    Set,
    /// Smallest key >= the given key.
    SetRange,
    /// Exact key and data.
    Both,
    /// Exact key, smallest data >= the given data.
    BothRange,
}

impl SearchMode {
    /// True for the exact-match modes.
    pub fn is_exact(self) -> bool {
        matches!(self, SearchMode::Set | SearchMode::Both)
    }

    /// True for the modes that match data as well as key.
    pub fn matches_data(self) -> bool {
        matches!(self, SearchMode::Both | SearchMode::BothRange)
    }

    /// The range counterpart of an exact mode.
    pub fn as_range(self) -> SearchMode {
        match self {
            SearchMode::Set => SearchMode::SetRange,
            SearchMode::Both => SearchMode::BothRange,
            other => other,
        }
    }
}

/// What `search_and_position` established.
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SearchFlags {
    pub(crate) found: bool,
    pub(crate) exact_key: bool,
    pub(crate) exact_data: bool,
    /// Landed on the final slot of the final leaf during a range search.
    pub(crate) found_last: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CursorState {
    Uninitialized,
    Initialized,
    Closed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NodeSel {
    Record,
    DupCount,
}

pub(crate) struct NodeCursorImpl {
    tree: Arc<Tree>,
    locker: Arc<Locker>,
    retain_locks: bool,
    pos: PositionCell,
    latch: Option<BinLatch>,
    state: CursorState,
}

impl NodeCursorImpl {
    pub(crate) fn new(tree: Arc<Tree>, locker: Arc<Locker>, retain_locks: bool) -> Self {
        Self {
            tree,
            locker,
            retain_locks,
            pos: Arc::new(Mutex::new(Position {
                bin: None,
                index: -1,
                dup: None,
            })),
            latch: None,
            state: CursorState::Uninitialized,
        }
    }

    pub(crate) fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub(crate) fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state == CursorState::Initialized
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    fn bin(&self) -> Option<BinRef> {
        self.pos.lock().bin.clone()
    }

    fn index(&self) -> isize {
        self.pos.lock().index
    }

    fn dup(&self) -> Option<isize> {
        self.pos.lock().dup
    }

    fn set_index(&self, index: isize) {
        self.pos.lock().index = index;
    }

    fn set_dup(&self, dup: Option<isize>) {
        self.pos.lock().dup = dup;
    }

    /// Slot and duplicate index, for diagnostics and tests.
    pub(crate) fn position(&self) -> (isize, Option<isize>) {
        let pos = self.pos.lock();
        (pos.index, pos.dup)
    }

    fn attach(&mut self, mut latch: BinLatch, index: isize, dup: Option<isize>) {
        latch.register(&self.pos);
        {
            let mut pos = self.pos.lock();
            pos.bin = Some(Arc::clone(latch.bin()));
            pos.index = index;
            pos.dup = dup;
        }
        self.latch = Some(latch);
        self.state = CursorState::Initialized;
    }

    /// Latches the current leaf, following the cursor if a split moved it.
    /// Returns false when the cursor has no leaf.
    pub(crate) fn latch_bin(&mut self) -> bool {
        if self.latch.is_some() {
            return true;
        }
        loop {
            let Some(bin) = self.bin() else {
                return false;
            };
            let latch = BinLatch::acquire(&bin);
            if self.pos.lock().bin.as_ref().is_some_and(|b| latch.is(b)) {
                self.latch = Some(latch);
                return true;
            }
        }
    }

    pub(crate) fn release_bins(&mut self) {
        self.latch = None;
    }

    fn latched(&mut self) -> Result<&mut BinLatch> {
        self.latch
            .as_mut()
            .ok_or(CairnError::Corruption("cursor leaf not latched"))
    }

    fn current_slot(&mut self) -> Result<&Slot> {
        let index = self.index();
        self.latched()?
            .slot(index)
            .ok_or(CairnError::Corruption("cursor slot out of range"))
    }

    fn current_slot_mut(&mut self) -> Result<&mut Slot> {
        let index = self.index();
        self.latched()?
            .slot_mut(index)
            .ok_or(CairnError::Corruption("cursor slot out of range"))
    }

    fn current_ln(&mut self) -> Result<&Ln> {
        let dup = self.dup();
        self.current_slot()?
            .ln(dup)
            .ok_or(CairnError::CursorNotInitialized)
    }

    fn current_ln_mut(&mut self) -> Result<&mut Ln> {
        let dup = self.dup();
        self.current_slot_mut()?
            .ln_mut(dup)
            .ok_or(CairnError::CursorNotInitialized)
    }

    fn current_node(&mut self, sel: NodeSel) -> Result<NodeId> {
        match sel {
            NodeSel::Record => self.current_ln().map(|ln| ln.id),
            NodeSel::DupCount => self
                .current_slot()?
                .dups()
                .map(|set| set.count_id)
                .ok_or(CairnError::Corruption("slot has no duplicate set")),
        }
    }

    /// Locks the node at the current position. Latched on entry and on a
    /// `Done` exit; unlatched on `Restart` and on error.
    fn lock_at(&mut self, sel: NodeSel, lock_type: Option<LockType>) -> Result<Step<LockGrant>> {
        let Some(lock_type) = lock_type else {
            return Ok(Step::Done(LockGrant::NoneNeeded));
        };
        loop {
            let node = self.current_node(sel)?;
            let grant = self.locker.lock(node, Some(lock_type), true)?;
            if grant != LockGrant::Denied {
                return Ok(Step::Done(grant));
            }
            self.release_bins();
            self.tree.stats().inc_latch_lock_waits();
            let grant = self.locker.lock(node, Some(lock_type), false)?;
            if grant == LockGrant::Restart {
                return Ok(Step::Restart);
            }
            if !self.latch_bin() {
                self.locker.revert(node, grant);
                return Err(CairnError::Corruption("cursor lost its leaf during a lock wait"));
            }
            if self.current_node(sel)? == node {
                return Ok(Step::Done(grant));
            }
            trace!(node = %node, "cursor.lock.slot_changed");
            self.locker.revert(node, grant);
        }
    }

    fn lock_for_write(&mut self, sel: NodeSel) -> Result<()> {
        match self.lock_at(sel, Some(LockType::Write))? {
            Step::Done(_) => Ok(()),
            Step::Restart => Err(CairnError::Corruption("write lock reported a range restart")),
        }
    }

    fn lock_new(&self, node: NodeId) -> Result<()> {
        match self.locker.lock(node, Some(LockType::Write), true)? {
            LockGrant::Denied | LockGrant::Restart => {
                Err(CairnError::Corruption("fresh record node already locked"))
            }
            _ => Ok(()),
        }
    }

    /// Reads the record under the cursor after locking it. Requires the latch;
    /// on a duplicate-set slot without a duplicate position, steps onto the
    /// first (or last) duplicate.
    fn fetch_current_latched(&mut self, lock_type: Option<LockType>, first: bool) -> Result<Step<Lookup>> {
        let index = self.index();
        let dup_len = match self.latched()?.slot(index) {
            None => return Ok(Step::Done(Lookup::NotFound)),
            Some(slot) => slot.dups().map(|set| set.entries.len() as isize),
        };
        if let Some(len) = dup_len {
            match self.dup() {
                None => {
                    if len == 0 {
                        return Ok(Step::Done(Lookup::NotFound));
                    }
                    self.set_dup(Some(if first { 0 } else { len - 1 }));
                }
                Some(d) if d < 0 || d >= len => return Ok(Step::Done(Lookup::NotFound)),
                Some(_) => {}
            }
        }
        step!(self.lock_at(NodeSel::Record, lock_type)?);
        let key = self.current_slot()?.key.clone();
        let ln = self.current_ln()?;
        if ln.deleted {
            return Ok(Step::Done(Lookup::KeyEmpty));
        }
        Ok(Step::Done(Lookup::Found(Entry {
            key,
            data: ln.data.clone(),
        })))
    }

    /// [`Self::fetch_current_latched`] followed by releasing the latch.
    pub(crate) fn fetch_current(&mut self, lock_type: Option<LockType>, first: bool) -> Result<Step<Lookup>> {
        let result = self.fetch_current_latched(lock_type, first);
        self.release_bins();
        result
    }

    pub(crate) fn get_current(&mut self, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
        if !self.latch_bin() {
            return Ok(Step::Done(Lookup::NotFound));
        }
        self.fetch_current(lock_type, true)
    }

    /// Positions on the first or last slot of the tree and leaves it latched.
    pub(crate) fn position_first_or_last(&mut self, first: bool) {
        self.release_bins();
        let latch = self.tree.edge_bin(first);
        let index = if first { 0 } else { latch.len() as isize - 1 };
        self.attach(latch, index, None);
    }

    /// Moves one live record forward or backward, crossing leaves as needed.
    /// The flag reports whether the key changed.
    pub(crate) fn get_next(
        &mut self,
        forward: bool,
        lock_type: Option<LockType>,
    ) -> Result<Step<(Lookup, bool)>> {
        let result = self.get_next_latched(forward, lock_type);
        self.release_bins();
        result
    }

    fn get_next_latched(&mut self, forward: bool, lock_type: Option<LockType>) -> Result<Step<(Lookup, bool)>> {
        if !self.latch_bin() {
            return Ok(Step::Done((Lookup::NotFound, false)));
        }
        loop {
            if self.dup().is_some() {
                if let Some(entry) = step!(self.move_within_dups(forward, lock_type)?) {
                    return Ok(Step::Done((Lookup::Found(entry), false)));
                }
                self.set_dup(None);
                if !self.latch_bin() {
                    return Ok(Step::Done((Lookup::NotFound, false)));
                }
            }
            let len = self.latched()?.len() as isize;
            let index = self.index() + if forward { 1 } else { -1 };
            if (0..len).contains(&index) {
                self.set_index(index);
                if let Lookup::Found(entry) = step!(self.fetch_current_latched(lock_type, forward)?) {
                    return Ok(Step::Done((Lookup::Found(entry), true)));
                }
                if !self.latch_bin() {
                    return Ok(Step::Done((Lookup::NotFound, false)));
                }
                continue;
            }
            let boundary = {
                let latch = self.latched()?;
                let edge = if forward {
                    latch.slots.last()
                } else {
                    latch.slots.first()
                };
                edge.map(|slot| slot.key.clone())
                    .or_else(|| latch.low_key.clone())
            };
            self.set_index(if forward { len } else { -1 });
            self.release_bins();
            let next = if forward {
                self.tree.next_bin(boundary.as_deref())
            } else {
                self.tree.prev_bin(boundary.as_deref())
            };
            let Some(latch) = next else {
                return Ok(Step::Done((Lookup::NotFound, false)));
            };
            let index = if forward { -1 } else { latch.len() as isize };
            trace!(tree = %self.tree.name(), bin = latch.id, "cursor.cross_leaf");
            self.attach(latch, index, None);
        }
    }

    /// Steps within the current duplicate set, skipping tombstones. `None`
    /// when the set is exhausted in that direction. Latched in and out.
    fn move_within_dups(&mut self, forward: bool, lock_type: Option<LockType>) -> Result<Step<Option<Entry>>> {
        loop {
            let index = self.index();
            let len = match self.latched()?.slot(index).and_then(Slot::dups) {
                Some(set) => set.entries.len() as isize,
                None => return Ok(Step::Done(None)),
            };
            let Some(current) = self.dup() else {
                return Ok(Step::Done(None));
            };
            let next = current + if forward { 1 } else { -1 };
            if next < 0 || next >= len {
                self.set_dup(Some(next.clamp(-1, len)));
                return Ok(Step::Done(None));
            }
            self.set_dup(Some(next));
            if let Lookup::Found(entry) = step!(self.fetch_current_latched(lock_type, forward)?) {
                return Ok(Step::Done(Some(entry)));
            }
            if !self.latch_bin() {
                return Ok(Step::Done(None));
            }
        }
    }

    /// Next or previous record with the same key.
    pub(crate) fn get_next_duplicate(&mut self, forward: bool, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
        let result = self.get_next_duplicate_latched(forward, lock_type);
        self.release_bins();
        result
    }

    fn get_next_duplicate_latched(&mut self, forward: bool, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
        if !self.latch_bin() || self.dup().is_none() {
            return Ok(Step::Done(Lookup::NotFound));
        }
        Ok(Step::Done(
            match step!(self.move_within_dups(forward, lock_type)?) {
                Some(entry) => Lookup::Found(entry),
                None => Lookup::NotFound,
            },
        ))
    }

    /// Next or previous record with a different key.
    pub(crate) fn get_next_no_dup(&mut self, forward: bool, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
        self.set_dup(None);
        Ok(Step::Done(step!(self.get_next(forward, lock_type)?).0))
    }

    /// First duplicate of the current key.
    pub(crate) fn get_first_duplicate(&mut self, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
        if !self.latch_bin() {
            return Ok(Step::Done(Lookup::NotFound));
        }
        self.set_dup(None);
        self.fetch_current(lock_type, true)
    }

    /// Positions on `key` (and `data` for the data-matching modes). Returns
    /// with the leaf latched unless the result is a restart or an error.
    pub(crate) fn search_and_position(
        &mut self,
        key: &[u8],
        data: Option<&[u8]>,
        mode: SearchMode,
        lock_type: Option<LockType>,
    ) -> Result<Step<SearchFlags>> {
        self.release_bins();
        let (latch, is_last) = self.tree.search(key);
        let (index, exact) = latch.find_entry(key, self.tree.key_order().as_ref());
        let len = latch.len() as isize;
        self.attach(latch, index, None);
        let mut flags = SearchFlags {
            found_last: mode == SearchMode::SetRange
                && !self.tree.duplicates()
                && is_last
                && index >= 0
                && index == len - 1,
            ..SearchFlags::default()
        };
        if index < 0 || !exact {
            flags.found = !mode.is_exact();
            return Ok(Step::Done(flags));
        }
        flags.exact_key = true;
        let Some(data) = data.filter(|_| mode.matches_data()) else {
            flags.found = true;
            return Ok(Step::Done(flags));
        };
        let dup_order = Arc::clone(self.tree.dup_order());
        if self.tree.duplicates() {
            let (d, exact_data) = self
                .current_slot()?
                .dups()
                .map(|set| set.find(data, dup_order.as_ref()))
                .ok_or(CairnError::Corruption("duplicate tree slot without a duplicate set"))?;
            self.set_dup(Some(d));
            flags.exact_data = exact_data;
            flags.found = !mode.is_exact() || exact_data;
        } else {
            step!(self.lock_at(NodeSel::Record, lock_type)?);
            let cmp = dup_order.compare(&self.current_ln()?.data, data);
            flags.exact_data = if mode.is_exact() {
                cmp == Ordering::Equal
            } else {
                cmp != Ordering::Less
            };
            flags.found = flags.exact_data;
        }
        Ok(Step::Done(flags))
    }

    /// Inserts `key`/`data`. Without `allow_duplicates` an existing live key
    /// yields `KeyExist`; with it, only an identical key/data pair does. On
    /// `KeyExist` the cursor is left on the existing record.
    pub(crate) fn put_ln(&mut self, key: &[u8], data: &[u8], allow_duplicates: bool) -> Result<OperationStatus> {
        self.release_bins();
        let result = self.insert_latched(key, data, allow_duplicates);
        let bin = self.latch.as_ref().map(|latch| Arc::clone(latch.bin()));
        self.release_bins();
        if let (Ok(OperationStatus::Success), Some(bin)) = (&result, bin) {
            self.tree.maybe_split(&bin);
        }
        result
    }

    fn insert_latched(&mut self, key: &[u8], data: &[u8], allow_duplicates: bool) -> Result<OperationStatus> {
        let (mut latch, _) = self.tree.search(key);
        let (index, exact) = latch.find_entry(key, self.tree.key_order().as_ref());
        if !exact {
            let at = (index + 1) as usize;
            let ln = Ln::new(self.tree.next_node_id(), data);
            let id = ln.id;
            self.lock_new(id)?;
            let (target, dup) = if self.tree.duplicates() {
                let set = DupSet {
                    count_id: self.tree.next_node_id(),
                    entries: vec![ln],
                };
                (Target::Dups(set), Some(0))
            } else {
                (Target::Single(ln), None)
            };
            latch.insert_slot(
                at,
                Slot {
                    key: key.to_vec(),
                    target,
                },
            );
            self.attach(latch, at as isize, dup);
            self.record_write(LogKind::Insert, key, data, id, data.to_vec(), true)?;
            return Ok(OperationStatus::Success);
        }
        self.attach(latch, index, None);
        if !self.tree.duplicates() {
            self.lock_for_write(NodeSel::Record)?;
            return self.reuse_if_deleted(key, data);
        }
        self.lock_for_write(NodeSel::DupCount)?;
        let dup_order = Arc::clone(self.tree.dup_order());
        let (live, first_live, (d, exact_data)) = {
            let set = self
                .current_slot()?
                .dups()
                .ok_or(CairnError::Corruption("duplicate tree slot without a duplicate set"))?;
            (
                set.live_count(),
                set.entries.iter().position(|ln| !ln.deleted),
                set.find(data, dup_order.as_ref()),
            )
        };
        if !allow_duplicates && live > 0 {
            self.set_dup(first_live.map(|d| d as isize));
            return Ok(OperationStatus::KeyExist);
        }
        if exact_data {
            self.set_dup(Some(d));
            self.lock_for_write(NodeSel::Record)?;
            return self.reuse_if_deleted(key, data);
        }
        let at = (d + 1) as usize;
        let ln = Ln::new(self.tree.next_node_id(), data);
        let id = ln.id;
        self.lock_new(id)?;
        let index = self.index() as usize;
        self.latched()?.insert_dup(index, at, ln);
        self.set_dup(Some(at as isize));
        self.record_write(LogKind::Insert, key, data, id, data.to_vec(), true)?;
        Ok(OperationStatus::Success)
    }

    /// Write-locked record under the cursor: revive it if it is a tombstone.
    fn reuse_if_deleted(&mut self, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        let ln = self.current_ln_mut()?;
        if !ln.deleted {
            return Ok(OperationStatus::KeyExist);
        }
        let id = ln.id;
        let before = std::mem::replace(&mut ln.data, data.to_vec());
        ln.deleted = false;
        self.record_write(LogKind::Insert, key, data, id, before, true)?;
        Ok(OperationStatus::Success)
    }

    fn record_write(
        &self,
        kind: LogKind,
        key: &[u8],
        data: &[u8],
        ln: NodeId,
        before_data: Vec<u8>,
        before_deleted: bool,
    ) -> Result<()> {
        if self.locker.is_transactional() {
            self.locker.add_undo(Box::new(RecordUndo {
                tree: Arc::clone(&self.tree),
                key: key.to_vec(),
                ln,
                before_data,
                before_deleted,
            }));
        }
        match kind {
            LogKind::Insert => self.tree.stats().inc_inserts(),
            LogKind::Update => self.tree.stats().inc_updates(),
            LogKind::Delete => self.tree.stats().inc_deletes(),
            LogKind::Commit | LogKind::Abort => {}
        }
        self.tree.log_mutation(kind, self.locker.id(), key, data)
    }

    /// Replaces the data of the record under the cursor. Returns the previous
    /// record on success.
    pub(crate) fn put_current(&mut self, data: &[u8]) -> Result<(OperationStatus, Option<Entry>)> {
        let result = self.put_current_latched(data);
        self.release_bins();
        result
    }

    fn put_current_latched(&mut self, data: &[u8]) -> Result<(OperationStatus, Option<Entry>)> {
        if !self.latch_bin() {
            return Err(CairnError::CursorNotInitialized);
        }
        self.lock_for_write(NodeSel::Record)?;
        let duplicates = self.tree.duplicates();
        let dup_order = Arc::clone(self.tree.dup_order());
        let key = self.current_slot()?.key.clone();
        let ln = self.current_ln_mut()?;
        if ln.deleted {
            return Ok((OperationStatus::KeyEmpty, None));
        }
        if duplicates && dup_order.compare(&ln.data, data) != Ordering::Equal {
            return Err(CairnError::InvalidArgument(
                "cannot replace a duplicate with data that sorts differently",
            ));
        }
        let id = ln.id;
        let old = std::mem::replace(&mut ln.data, data.to_vec());
        self.record_write(LogKind::Update, &key, data, id, old.clone(), false)?;
        Ok((OperationStatus::Success, Some(Entry { key, data: old })))
    }

    /// Marks the record under the cursor deleted.
    pub(crate) fn delete(&mut self) -> Result<OperationStatus> {
        let result = self.delete_latched();
        self.release_bins();
        result
    }

    fn delete_latched(&mut self) -> Result<OperationStatus> {
        if !self.latch_bin() {
            return Err(CairnError::CursorNotInitialized);
        }
        self.lock_for_write(NodeSel::Record)?;
        if self.current_ln()?.deleted {
            return Ok(OperationStatus::KeyEmpty);
        }
        if self.tree.duplicates() {
            self.lock_for_write(NodeSel::DupCount)?;
            if self.current_ln()?.deleted {
                return Ok(OperationStatus::KeyEmpty);
            }
        }
        let key = self.current_slot()?.key.clone();
        let ln = self.current_ln_mut()?;
        ln.deleted = true;
        let (id, data) = (ln.id, ln.data.clone());
        self.record_write(LogKind::Delete, &key, &data, id, data.clone(), false)?;
        Ok(OperationStatus::Success)
    }

    /// Live records sharing the current key.
    pub(crate) fn count(&mut self, lock_type: Option<LockType>) -> Result<Step<usize>> {
        let result = self.count_latched(lock_type);
        self.release_bins();
        result
    }

    fn count_latched(&mut self, lock_type: Option<LockType>) -> Result<Step<usize>> {
        if !self.latch_bin() {
            return Err(CairnError::CursorNotInitialized);
        }
        if !self.tree.duplicates() {
            return Ok(Step::Done(1));
        }
        step!(self.lock_at(NodeSel::DupCount, lock_type.map(LockType::without_range))?);
        let live = self
            .current_slot()?
            .dups()
            .map(DupSet::live_count)
            .unwrap_or(0);
        Ok(Step::Done(live))
    }

    /// Copies this cursor, registering the copy on the same leaf. Lockers of
    /// non-transactional cursors are not shared unless locks are retained.
    /// Must be called without the latch held.
    pub(crate) fn clone_cursor(&self) -> NodeCursorImpl {
        let locker = if self.retain_locks {
            Arc::clone(&self.locker)
        } else {
            self.locker.new_non_txn_locker()
        };
        self.clone_with_locker(locker)
    }

    /// Copies this cursor's position onto a cursor owned by `locker`.
    pub(crate) fn clone_with_locker(&self, locker: Arc<Locker>) -> NodeCursorImpl {
        let mut clone = NodeCursorImpl::new(Arc::clone(&self.tree), locker, self.retain_locks);
        loop {
            let Some(bin) = self.bin() else {
                return clone;
            };
            let latch = BinLatch::acquire(&bin);
            let (index, dup, same) = {
                let pos = self.pos.lock();
                (pos.index, pos.dup, pos.bin.as_ref().is_some_and(|b| latch.is(b)))
            };
            if !same {
                continue;
            }
            clone.attach(latch, index, dup);
            clone.release_bins();
            clone.state = self.state;
            return clone;
        }
    }

    /// Range-insert locks the record that follows `key`/`data`, or the EOF
    /// node when nothing follows, so serializable readers that scanned the
    /// gap block the insert.
    pub(crate) fn lock_next_key_for_insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        let mode = if self.tree.duplicates() {
            SearchMode::BothRange
        } else {
            SearchMode::SetRange
        };
        let lock_type = Some(LockType::RangeInsert);
        let mut locked = false;
        if let Step::Done(flags) = self.search_and_position(key, Some(data), mode, lock_type)? {
            if flags.found && !flags.found_last {
                let next = if flags.exact_key {
                    match self.get_next(true, lock_type)? {
                        Step::Done((lookup, _)) => Step::Done(lookup),
                        Step::Restart => Step::Restart,
                    }
                } else {
                    self.get_next_no_dup(true, lock_type)?
                };
                locked = matches!(next, Step::Done(Lookup::Found(_)));
            }
        }
        self.release_bins();
        if !locked {
            self.lock_eof(LockType::RangeInsert)?;
        }
        Ok(())
    }

    /// Locks the tree's end-of-file node.
    pub(crate) fn lock_eof(&self, lock_type: LockType) -> Result<Step<()>> {
        match self.locker.lock(self.tree.eof_id(), Some(lock_type), false)? {
            LockGrant::Restart => Ok(Step::Restart),
            _ => Ok(Step::Done(())),
        }
    }

    /// Forgets the position.
    pub(crate) fn reset(&mut self) {
        self.release_bins();
        let mut pos = self.pos.lock();
        pos.bin = None;
        pos.index = -1;
        pos.dup = None;
        drop(pos);
        if self.state != CursorState::Closed {
            self.state = CursorState::Uninitialized;
        }
    }

    /// Forgets the position and, for non-transactional cursors that do not
    /// retain locks, releases every lock taken through this cursor's locker.
    pub(crate) fn close(&mut self) {
        self.reset();
        self.state = CursorState::Closed;
        if !self.retain_locks {
            self.locker.release_non_txn_locks();
        }
    }

    /// True when a live record appeared between this cursor's position and
    /// `moved`'s, in the direction of travel, so the move may have skipped it.
    /// Tombstones are not evidence. Must be called without latches held.
    pub(crate) fn insertion_skipped(&self, moved: &NodeCursorImpl, forward: bool, no_dup: bool) -> bool {
        let (Some(orig_bin), Some(moved_bin)) = (self.bin(), moved.bin()) else {
            return false;
        };
        if Arc::ptr_eq(&orig_bin, &moved_bin) {
            let latch = BinLatch::acquire(&orig_bin);
            let from = self.position_on(&latch);
            let to = moved.position_on(&latch);
            return match (from, to) {
                (Some(from), Some(to)) => live_between(&latch, forward, Some(from), Some(to), no_dup),
                _ => false,
            };
        }
        let after_orig = {
            let latch = BinLatch::acquire(&orig_bin);
            match self.position_on(&latch) {
                Some(from) => live_between(&latch, forward, Some(from), None, no_dup),
                None => false,
            }
        };
        if after_orig {
            return true;
        }
        let latch = BinLatch::acquire(&moved_bin);
        match moved.position_on(&latch) {
            Some(to) => live_between(&latch, forward, None, Some(to), no_dup),
            None => false,
        }
    }

    fn position_on(&self, latch: &BinLatch) -> Option<(isize, Option<isize>)> {
        let pos = self.pos.lock();
        pos.bin
            .as_ref()
            .is_some_and(|b| latch.is(b))
            .then_some((pos.index, pos.dup))
    }
}

/// Live records of one leaf strictly between `from` and `to` in the direction
/// of travel; `None` bounds mean the leaf edge. With `no_dup` the remaining
/// duplicates of `from`'s own key are not considered.
fn live_between(
    latch: &BinLatch,
    forward: bool,
    from: Option<(isize, Option<isize>)>,
    to: Option<(isize, Option<isize>)>,
    no_dup: bool,
) -> bool {
    let beyond = |rec: (isize, isize), bound: (isize, Option<isize>), skip_same_key: bool| -> bool {
        let slot_order = if forward {
            rec.0.cmp(&bound.0)
        } else {
            bound.0.cmp(&rec.0)
        };
        match slot_order {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                !skip_same_key
                    && bound.1.is_some_and(|d| if forward { rec.1 > d } else { rec.1 < d })
            }
        }
    };
    let short_of = |rec: (isize, isize), bound: (isize, Option<isize>)| -> bool {
        let slot_order = if forward {
            rec.0.cmp(&bound.0)
        } else {
            bound.0.cmp(&rec.0)
        };
        match slot_order {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => bound.1.is_some_and(|d| if forward { rec.1 < d } else { rec.1 > d }),
        }
    };
    for (i, slot) in latch.slots.iter().enumerate() {
        let records: Vec<(isize, bool)> = match &slot.target {
            Target::Single(ln) => vec![(0, !ln.deleted)],
            Target::Dups(set) => set
                .entries
                .iter()
                .enumerate()
                .map(|(d, ln)| (d as isize, !ln.deleted))
                .collect(),
        };
        for (d, live) in records {
            if !live {
                continue;
            }
            let rec = (i as isize, d);
            let after_from = from.map_or(true, |bound| beyond(rec, bound, no_dup));
            let before_to = to.map_or(true, |bound| short_of(rec, bound));
            if after_from && before_to {
                return true;
            }
        }
    }
    false
}
