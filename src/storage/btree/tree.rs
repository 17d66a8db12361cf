//! Ordered list of leaves with leaf-level latching, splitting and tombstone
//! compaction.
//!
//! Lock order: the leaf index lock, then at most one leaf latch. A thread
//! holding a leaf latch never waits for the index lock or for a record lock.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::bin::{BinState, Target};
use super::comparator::{byte_order, SharedOrder};
use super::latch::{BinLatch, BinRef};
use super::stats::TreeStats;
use crate::primitives::concurrency::{LockManager, Undo};
use crate::primitives::wal::{LogKind, LogRecord, LogSink};
use crate::types::{CairnError, LockerId, NodeId, Result, TreeId};

/// Default maximum number of slots per leaf before it splits.
pub const DEFAULT_MAX_ENTRIES_PER_BIN: usize = 128;

/// Per-tree structural settings.
#[derive(Clone)]
pub struct TreeConfig {
    /// Keys may own sorted duplicate sets.
    pub duplicates: bool,
    /// Order over keys.
    pub key_order: SharedOrder,
    /// Order over duplicate data.
    pub dup_order: SharedOrder,
    /// Leaf capacity.
    pub max_entries_per_bin: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            duplicates: false,
            key_order: byte_order(),
            dup_order: byte_order(),
            max_entries_per_bin: DEFAULT_MAX_ENTRIES_PER_BIN,
        }
    }
}

impl std::fmt::Debug for TreeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeConfig")
            .field("duplicates", &self.duplicates)
            .field("key_order", &self.key_order.name())
            .field("dup_order", &self.dup_order.name())
            .field("max_entries_per_bin", &self.max_entries_per_bin)
            .finish()
    }
}

/// Allocates lockable node ids for one environment.
#[derive(Default, Debug)]
pub struct NodeIds {
    next: AtomicU64,
}

impl NodeIds {
    /// Returns a fresh id.
    pub fn next(&self) -> NodeId {
        NodeId(self.next.fetch_add(1, AtomicOrdering::Relaxed) + 1)
    }
}

struct BinEntry {
    low_key: Option<Vec<u8>>,
    bin: BinRef,
}

/// Shape of a tree at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSummary {
    /// Number of leaves.
    pub leaves: u64,
    /// Number of key slots.
    pub slots: u64,
    /// Records not marked deleted.
    pub live_records: u64,
    /// Tombstones awaiting compaction.
    pub deleted_records: u64,
    /// Slots holding a duplicate set.
    pub dup_sets: u64,
    /// Largest duplicate set, counting tombstones.
    pub max_dup_set: u64,
}

/// One ordered key space.
pub struct Tree {
    id: TreeId,
    name: String,
    config: TreeConfig,
    bins: RwLock<Vec<BinEntry>>,
    eof_id: NodeId,
    node_ids: Arc<NodeIds>,
    next_bin_id: AtomicU64,
    stats: TreeStats,
    log: Arc<dyn LogSink>,
}

impl Tree {
    /// Creates an empty tree with a single empty leaf.
    pub fn new(
        id: TreeId,
        name: impl Into<String>,
        config: TreeConfig,
        node_ids: Arc<NodeIds>,
        log: Arc<dyn LogSink>,
    ) -> Arc<Self> {
        let first: BinRef = Arc::new(Mutex::new(BinState::new(0, None)));
        Arc::new(Self {
            id,
            name: name.into(),
            eof_id: node_ids.next(),
            config,
            bins: RwLock::new(vec![BinEntry {
                low_key: None,
                bin: first,
            }]),
            node_ids,
            next_bin_id: AtomicU64::new(1),
            stats: TreeStats::default(),
            log,
        })
    }

    /// Tree id.
    pub fn id(&self) -> TreeId {
        self.id
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural settings.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// True when keys own duplicate sets.
    pub fn duplicates(&self) -> bool {
        self.config.duplicates
    }

    /// Lock target standing for "past the last key".
    pub fn eof_id(&self) -> NodeId {
        self.eof_id
    }

    /// Counters.
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    pub(crate) fn key_order(&self) -> &SharedOrder {
        &self.config.key_order
    }

    pub(crate) fn dup_order(&self) -> &SharedOrder {
        &self.config.dup_order
    }

    pub(crate) fn next_node_id(&self) -> NodeId {
        self.node_ids.next()
    }

    fn route(&self, bins: &[BinEntry], key: Option<&[u8]>) -> usize {
        let Some(key) = key else {
            return 0;
        };
        let order = &self.config.key_order;
        bins[1..].partition_point(|entry| {
            entry
                .low_key
                .as_deref()
                .is_some_and(|low| order.compare(low, key) != std::cmp::Ordering::Greater)
        })
    }

    /// Latches the leaf that owns `key`. The flag reports whether it is the
    /// last leaf.
    pub(crate) fn search(&self, key: &[u8]) -> (BinLatch, bool) {
        self.stats.inc_leaf_searches();
        let bins = self.bins.read();
        let idx = self.route(&bins, Some(key));
        let latch = BinLatch::acquire(&bins[idx].bin);
        (latch, idx + 1 == bins.len())
    }

    /// Latches the first or last leaf.
    pub(crate) fn edge_bin(&self, first: bool) -> BinLatch {
        self.stats.inc_leaf_searches();
        let bins = self.bins.read();
        let idx = if first { 0 } else { bins.len() - 1 };
        BinLatch::acquire(&bins[idx].bin)
    }

    /// Latches the leaf following the one that owns `after`
    /// (`None` meaning the first leaf).
    pub(crate) fn next_bin(&self, after: Option<&[u8]>) -> Option<BinLatch> {
        let bins = self.bins.read();
        let idx = self.route(&bins, after) + 1;
        bins.get(idx).map(|entry| BinLatch::acquire(&entry.bin))
    }

    /// Latches the leaf preceding the one that owns `before`.
    pub(crate) fn prev_bin(&self, before: Option<&[u8]>) -> Option<BinLatch> {
        let before = before?;
        let bins = self.bins.read();
        let idx = self.route(&bins, Some(before));
        idx.checked_sub(1)
            .map(|prev| BinLatch::acquire(&bins[prev].bin))
    }

    /// Splits `bin` in half when it exceeds capacity. Must be called without
    /// any latch held.
    pub(crate) fn maybe_split(&self, bin: &BinRef) {
        if bin.lock().len() <= self.config.max_entries_per_bin {
            return;
        }
        let mut bins = self.bins.write();
        let Some(idx) = bins.iter().position(|entry| Arc::ptr_eq(&entry.bin, bin)) else {
            return;
        };
        let mut left = BinLatch::acquire(bin);
        if left.len() <= self.config.max_entries_per_bin {
            return;
        }
        let at = left.len() / 2;
        let low_key = left.slots[at].key.clone();
        let right_id = self.next_bin_id.fetch_add(1, AtomicOrdering::Relaxed);
        let right_bin: BinRef = Arc::new(Mutex::new(BinState::new(right_id, Some(low_key.clone()))));
        {
            let mut right = BinLatch::acquire(&right_bin);
            left.split_into(at, &mut right);
        }
        bins.insert(
            idx + 1,
            BinEntry {
                low_key: Some(low_key),
                bin: right_bin,
            },
        );
        self.stats.inc_leaf_splits();
        debug!(tree = %self.name, left = left.id, right = right_id, at, "tree.split");
    }

    /// Physically removes tombstones that nobody holds a lock on and no
    /// cursor points at. Returns the number of records removed.
    pub fn compress(&self, locks: &LockManager) -> usize {
        let bins: Vec<BinRef> = self
            .bins
            .read()
            .iter()
            .map(|entry| Arc::clone(&entry.bin))
            .collect();
        let mut removed = 0usize;
        for bin in bins {
            let mut latch = BinLatch::acquire(&bin);
            let mut i = latch.len();
            while i > 0 {
                i -= 1;
                let removable = match &latch.slots[i].target {
                    Target::Single(ln) => {
                        let (id, deleted) = (ln.id, ln.deleted);
                        deleted && !locks.is_locked(id) && !latch.has_cursor_at(i, None)
                    }
                    Target::Dups(set) => {
                        let candidates: Vec<(usize, NodeId)> = set
                            .entries
                            .iter()
                            .enumerate()
                            .rev()
                            .filter(|(_, ln)| ln.deleted)
                            .map(|(d, ln)| (d, ln.id))
                            .collect();
                        let count_id = set.count_id;
                        for (d, id) in candidates {
                            if !locks.is_locked(id) && !latch.has_cursor_at(i, Some(d)) {
                                latch.remove_dup(i, d);
                                removed += 1;
                            }
                        }
                        let empty = latch.slots[i].dups().is_some_and(|set| set.entries.is_empty());
                        if empty && !locks.is_locked(count_id) && !latch.has_cursor_at(i, None) {
                            latch.remove_slot(i);
                        }
                        false
                    }
                };
                if removable {
                    latch.remove_slot(i);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.stats.add_compacted(removed as u64);
            debug!(tree = %self.name, removed, "tree.compress");
        }
        removed
    }

    /// Restores one record to an earlier state; used by transaction abort.
    pub(crate) fn restore(
        &self,
        key: &[u8],
        ln: NodeId,
        before_data: Vec<u8>,
        before_deleted: bool,
    ) -> Result<()> {
        let (mut latch, _) = self.search(key);
        let (index, exact) = latch.find_entry(key, self.config.key_order.as_ref());
        if !exact {
            return Err(CairnError::Corruption("undo target key missing"));
        }
        let target = latch
            .slot_mut(index)
            .and_then(|slot| slot.find_ln_mut(ln))
            .ok_or(CairnError::Corruption("undo target record missing"))?;
        target.data = before_data;
        target.deleted = before_deleted;
        trace!(tree = %self.name, node = %ln, deleted = before_deleted, "tree.restore");
        Ok(())
    }

    pub(crate) fn log_mutation(&self, kind: LogKind, locker: LockerId, key: &[u8], data: &[u8]) -> Result<()> {
        self.log
            .append(&LogRecord::mutation(kind, self.id, locker, key, data))
            .map(|_| ())
    }

    /// Counts leaves, slots and records, latching one leaf at a time.
    pub fn summary(&self) -> TreeSummary {
        let bins: Vec<BinRef> = self
            .bins
            .read()
            .iter()
            .map(|entry| Arc::clone(&entry.bin))
            .collect();
        let mut summary = TreeSummary {
            leaves: bins.len() as u64,
            ..TreeSummary::default()
        };
        for bin in bins {
            let latch = BinLatch::acquire(&bin);
            for slot in &latch.slots {
                summary.slots += 1;
                match &slot.target {
                    Target::Single(ln) => {
                        if ln.deleted {
                            summary.deleted_records += 1;
                        } else {
                            summary.live_records += 1;
                        }
                    }
                    Target::Dups(set) => {
                        summary.dup_sets += 1;
                        summary.max_dup_set = summary.max_dup_set.max(set.entries.len() as u64);
                        let live = set.live_count() as u64;
                        summary.live_records += live;
                        summary.deleted_records += set.entries.len() as u64 - live;
                    }
                }
            }
        }
        summary
    }
}

/// Compensation for one record write, replayed on abort.
pub(crate) struct RecordUndo {
    pub(crate) tree: Arc<Tree>,
    pub(crate) key: Vec<u8>,
    pub(crate) ln: NodeId,
    pub(crate) before_data: Vec<u8>,
    pub(crate) before_deleted: bool,
}

impl Undo for RecordUndo {
    fn undo(self: Box<Self>) -> Result<()> {
        let RecordUndo {
            tree,
            key,
            ln,
            before_data,
            before_deleted,
        } = *self;
        tree.restore(&key, ln, before_data, before_deleted)
    }
}
