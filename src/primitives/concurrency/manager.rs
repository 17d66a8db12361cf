//! Environment-wide lock table with blocking waits, deadlock detection and
//! range-restart signalling.
//!
//! All state lives behind one `parking_lot::Mutex`; waiters park on a single
//! condition variable that is notified on every release. Lock requests are
//! never made while a leaf latch is held (see `storage::btree::latch`).

use std::collections::hash_map::Entry as MapEntry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::lock::{conflict, upgrade, LockConflict, LockType, LockUpgrade};
use crate::types::{CairnError, LockerId, NodeId, Result};

/// Outcome of a lock request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockGrant {
    /// Newly granted; revert by releasing.
    New,
    /// An existing lock was promoted; revert by restoring `from`.
    Promotion {
        /// Type held before the promotion.
        from: LockType,
    },
    /// Already held at a sufficient strength.
    Existing,
    /// A non-blocking request found a conflict.
    Denied,
    /// A range request waited on an insert-intent lock. Nothing is held;
    /// the caller must restart its operation.
    Restart,
    /// No lock was needed (read-uncommitted access).
    NoneNeeded,
}

impl LockGrant {
    /// True when the lock (or an equivalent) is now held.
    pub fn is_held(self) -> bool {
        matches!(
            self,
            LockGrant::New | LockGrant::Promotion { .. } | LockGrant::Existing
        )
    }
}

/// Identity presented with a lock request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockRequester {
    /// Owner of the lock once granted.
    pub id: LockerId,
    /// Locker whose held locks never conflict with this request.
    pub buddy: Option<LockerId>,
}

#[derive(Copy, Clone, Debug)]
struct Owner {
    locker: LockerId,
    lock_type: LockType,
}

#[derive(Default, Debug)]
struct LockEntry {
    owners: SmallVec<[Owner; 2]>,
    waiters: usize,
}

impl LockEntry {
    fn is_idle(&self) -> bool {
        self.owners.is_empty() && self.waiters == 0
    }
}

#[derive(Default)]
struct LockTable {
    locks: FxHashMap<NodeId, LockEntry>,
    waiting: FxHashMap<LockerId, NodeId>,
}

impl LockTable {
    fn drop_if_idle(&mut self, node: NodeId) {
        if let MapEntry::Occupied(entry) = self.locks.entry(node) {
            if entry.get().is_idle() {
                entry.remove();
            }
        }
    }

    /// Strongest conflict between `requested` and locks held by others.
    fn conflicts(&self, node: NodeId, requester: LockRequester, requested: LockType) -> LockConflict {
        let Some(entry) = self.locks.get(&node) else {
            return LockConflict::Allow;
        };
        let mut verdict = LockConflict::Allow;
        for owner in &entry.owners {
            if owner.locker == requester.id || Some(owner.locker) == requester.buddy {
                continue;
            }
            match conflict(requested, owner.lock_type) {
                LockConflict::Block => return LockConflict::Block,
                LockConflict::Restart => verdict = LockConflict::Restart,
                LockConflict::Allow => {}
            }
        }
        verdict
    }

    /// Walks the waits-for graph from `node`, looking for a path back to the requester.
    fn would_deadlock(&self, requester: LockRequester, node: NodeId) -> bool {
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(entry) = self.locks.get(&current) else {
                continue;
            };
            for owner in &entry.owners {
                if owner.locker == requester.id {
                    if current != node {
                        return true;
                    }
                    continue;
                }
                if Some(owner.locker) == requester.buddy {
                    if current != node {
                        return true;
                    }
                    continue;
                }
                if let Some(next) = self.waiting.get(&owner.locker) {
                    stack.push(*next);
                }
            }
        }
        false
    }
}

/// Point-in-time view of lock manager counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    /// Locks currently held across all lockers.
    pub held_locks: u64,
    /// Held locks of a shared type.
    pub held_read_locks: u64,
    /// Held locks of an exclusive type.
    pub held_write_locks: u64,
    /// Lockers currently waiting.
    pub waiting_lockers: u64,
    /// Lock requests served.
    pub requests: u64,
    /// Requests that had to wait.
    pub waits: u64,
    /// Non-blocking requests that were denied.
    pub denials: u64,
    /// Requests that ended in a deadlock error.
    pub deadlocks: u64,
    /// Requests that ended in a timeout.
    pub timeouts: u64,
    /// Range requests that reported a restart.
    pub restarts: u64,
}

#[derive(Default)]
struct LockCounters {
    requests: AtomicU64,
    waits: AtomicU64,
    denials: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
    restarts: AtomicU64,
}

impl LockCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Lock table shared by every locker of one environment.
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    counters: LockCounters,
    serializable_active: AtomicUsize,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            counters: LockCounters::default(),
            serializable_active: AtomicUsize::new(0),
        }
    }

    /// Requests `lock_type` on `node`.
    ///
    /// With `no_wait` a conflict yields [`LockGrant::Denied`]. Otherwise the
    /// caller blocks until the conflict clears, the timeout elapses
    /// ([`CairnError::LockTimeout`]) or waiting would close a cycle
    /// ([`CairnError::Deadlock`]). A range request that had to wait on an
    /// insert-intent lock returns [`LockGrant::Restart`] without holding anything.
    pub fn lock(
        &self,
        node: NodeId,
        requester: LockRequester,
        lock_type: LockType,
        no_wait: bool,
        timeout: Duration,
    ) -> Result<LockGrant> {
        LockCounters::bump(&self.counters.requests);
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        let mut restart_pending = false;
        loop {
            let held = table.locks.get(&node).and_then(|entry| {
                entry
                    .owners
                    .iter()
                    .find(|owner| owner.locker == requester.id)
                    .map(|owner| owner.lock_type)
            });
            let target = match held {
                Some(current) => match upgrade(current, lock_type) {
                    LockUpgrade::Existing => return Ok(LockGrant::Existing),
                    LockUpgrade::Promote(next) => next,
                },
                None => lock_type,
            };
            let verdict = table.conflicts(node, requester, target);
            if verdict == LockConflict::Allow {
                if restart_pending {
                    LockCounters::bump(&self.counters.restarts);
                    table.drop_if_idle(node);
                    trace!(locker = %requester.id, node = %node, "lock.restart");
                    return Ok(LockGrant::Restart);
                }
                let entry = table.locks.entry(node).or_default();
                let grant = match entry
                    .owners
                    .iter_mut()
                    .find(|owner| owner.locker == requester.id)
                {
                    Some(owner) => {
                        let from = owner.lock_type;
                        owner.lock_type = target;
                        LockGrant::Promotion { from }
                    }
                    None => {
                        entry.owners.push(Owner {
                            locker: requester.id,
                            lock_type: target,
                        });
                        LockGrant::New
                    }
                };
                trace!(
                    locker = %requester.id,
                    node = %node,
                    lock_type = %target,
                    "lock.granted"
                );
                return Ok(grant);
            }
            if no_wait {
                LockCounters::bump(&self.counters.denials);
                table.drop_if_idle(node);
                return Ok(LockGrant::Denied);
            }
            if verdict == LockConflict::Restart {
                restart_pending = true;
            }
            if table.would_deadlock(requester, node) {
                LockCounters::bump(&self.counters.deadlocks);
                table.drop_if_idle(node);
                debug!(locker = %requester.id, node = %node, "lock.deadlock");
                return Err(CairnError::Deadlock {
                    locker: requester.id,
                    node,
                });
            }
            LockCounters::bump(&self.counters.waits);
            table.locks.entry(node).or_default().waiters += 1;
            table.waiting.insert(requester.id, node);
            let timed_out = self.released.wait_until(&mut table, deadline).timed_out();
            table.waiting.remove(&requester.id);
            if let Some(entry) = table.locks.get_mut(&node) {
                entry.waiters = entry.waiters.saturating_sub(1);
            }
            if timed_out && table.conflicts(node, requester, target) != LockConflict::Allow {
                LockCounters::bump(&self.counters.timeouts);
                table.drop_if_idle(node);
                debug!(
                    locker = %requester.id,
                    node = %node,
                    timeout_ms = timeout.as_millis() as u64,
                    "lock.timeout"
                );
                return Err(CairnError::LockTimeout {
                    locker: requester.id,
                    node,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Releases `locker`'s lock on `node`. Returns false when none was held.
    pub fn release(&self, node: NodeId, locker: LockerId) -> bool {
        let mut table = self.table.lock();
        let removed = match table.locks.get_mut(&node) {
            Some(entry) => {
                let before = entry.owners.len();
                entry.owners.retain(|owner| owner.locker != locker);
                before != entry.owners.len()
            }
            None => false,
        };
        table.drop_if_idle(node);
        drop(table);
        if removed {
            self.released.notify_all();
        }
        removed
    }

    /// Releases every listed lock owned by `locker`.
    pub fn release_all(&self, locker: LockerId, nodes: impl IntoIterator<Item = NodeId>) {
        let mut table = self.table.lock();
        for node in nodes {
            if let Some(entry) = table.locks.get_mut(&node) {
                entry.owners.retain(|owner| owner.locker != locker);
            }
            table.drop_if_idle(node);
        }
        drop(table);
        self.released.notify_all();
    }

    /// Sets the type of a held lock, used to undo a promotion or to demote
    /// a write lock to its read counterpart.
    pub fn set_type(&self, node: NodeId, locker: LockerId, lock_type: LockType) {
        let mut table = self.table.lock();
        if let Some(owner) = table
            .locks
            .get_mut(&node)
            .and_then(|entry| entry.owners.iter_mut().find(|owner| owner.locker == locker))
        {
            owner.lock_type = lock_type;
        }
        drop(table);
        self.released.notify_all();
    }

    /// Owners of `node` and their lock types.
    pub fn owners(&self, node: NodeId) -> Vec<(LockerId, LockType)> {
        let table = self.table.lock();
        table
            .locks
            .get(&node)
            .map(|entry| {
                entry
                    .owners
                    .iter()
                    .map(|owner| (owner.locker, owner.lock_type))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when anyone holds a lock on `node`.
    pub fn is_locked(&self, node: NodeId) -> bool {
        let table = self.table.lock();
        table
            .locks
            .get(&node)
            .is_some_and(|entry| !entry.owners.is_empty())
    }

    pub(crate) fn register_serializable(&self) {
        self.serializable_active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unregister_serializable(&self) {
        self.serializable_active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of active serializable transactions.
    pub fn serializable_active(&self) -> usize {
        self.serializable_active.load(Ordering::Acquire)
    }

    /// Snapshot of the lock table and counters.
    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        let mut stats = LockStats {
            waiting_lockers: table.waiting.len() as u64,
            requests: self.counters.requests.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            denials: self.counters.denials.load(Ordering::Relaxed),
            deadlocks: self.counters.deadlocks.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            ..LockStats::default()
        };
        for entry in table.locks.values() {
            for owner in &entry.owners {
                stats.held_locks += 1;
                if owner.lock_type.is_write() {
                    stats.held_write_locks += 1;
                } else {
                    stats.held_read_locks += 1;
                }
            }
        }
        stats
    }

    /// Emits the current counters as a tracing event.
    pub fn emit_tracing(&self) {
        let stats = self.stats();
        tracing::info!(
            target: "cairn::lock",
            held_locks = stats.held_locks,
            waiting_lockers = stats.waiting_lockers,
            requests = stats.requests,
            waits = stats.waits,
            deadlocks = stats.deadlocks,
            timeouts = stats.timeouts,
            restarts = stats.restarts,
            "lock stats snapshot"
        );
    }
}
