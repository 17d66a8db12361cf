use crate::storage::btree::{Tree, TreeStatsSnapshot, TreeSummary};

/// Shape and activity of one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Leaves, slots and records at the time of the call.
    pub tree: TreeSummary,
    /// Counters accumulated since the tree was created.
    pub counters: TreeStatsSnapshot,
}

impl DatabaseStats {
    pub(crate) fn collect(tree: &Tree) -> Self {
        Self {
            tree: tree.summary(),
            counters: tree.stats().snapshot(),
        }
    }

    /// Share of slots that are tombstones awaiting compaction.
    pub fn deleted_ratio(&self) -> f64 {
        let total = self.tree.live_records + self.tree.deleted_records;
        if total == 0 {
            0.0
        } else {
            self.tree.deleted_records as f64 / total as f64
        }
    }

    /// Emits the stats via `tracing`.
    pub fn emit_tracing(&self, db: &str) {
        tracing::info!(
            target: "cairn::db",
            db,
            leaves = self.tree.leaves,
            slots = self.tree.slots,
            live_records = self.tree.live_records,
            deleted_records = self.tree.deleted_records,
            dup_sets = self.tree.dup_sets,
            max_dup_set = self.tree.max_dup_set,
            leaf_splits = self.counters.leaf_splits,
            compacted = self.counters.compacted,
            "db stats snapshot"
        );
    }
}
