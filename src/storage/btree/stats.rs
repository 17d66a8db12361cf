use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStatsSnapshot {
    /// Root-to-leaf searches performed
    pub leaf_searches: u64,
    /// Leaf splits performed
    pub leaf_splits: u64,
    /// Records inserted (including undeleted tombstones)
    pub inserts: u64,
    /// Records replaced in place
    pub updates: u64,
    /// Records marked deleted
    pub deletes: u64,
    /// Tombstones physically removed by compaction
    pub compacted: u64,
    /// Lock waits taken after a latched attempt was denied
    pub latch_lock_waits: u64,
}

/// Thread-safe counters for one tree.
#[derive(Default)]
pub struct TreeStats {
    leaf_searches: AtomicU64,
    leaf_splits: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    compacted: AtomicU64,
    latch_lock_waits: AtomicU64,
}

impl TreeStats {
    /// Returns the current count of leaf searches.
    pub fn leaf_searches(&self) -> u64 {
        self.leaf_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inserts(&self) {
        self.inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_updates(&self) {
        self.updates.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_deletes(&self) {
        self.deletes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_compacted(&self, count: u64) {
        self.compacted.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_latch_lock_waits(&self) {
        self.latch_lock_waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            leaf_searches: self.leaf_searches(),
            leaf_splits: self.leaf_splits(),
            inserts: self.inserts.load(AtomicOrdering::Relaxed),
            updates: self.updates.load(AtomicOrdering::Relaxed),
            deletes: self.deletes.load(AtomicOrdering::Relaxed),
            compacted: self.compacted.load(AtomicOrdering::Relaxed),
            latch_lock_waits: self.latch_lock_waits.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits the current counters via `tracing`.
    pub fn emit_tracing(&self, tree: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "cairn::tree",
            tree,
            leaf_searches = snapshot.leaf_searches,
            leaf_splits = snapshot.leaf_splits,
            inserts = snapshot.inserts,
            updates = snapshot.updates,
            deletes = snapshot.deletes,
            compacted = snapshot.compacted,
            latch_lock_waits = snapshot.latch_lock_waits,
            "tree stats snapshot"
        );
    }
}
