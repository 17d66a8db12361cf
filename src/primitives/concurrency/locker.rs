//! Lock owners: transactions, auto-commit transactions, per-operation basic
//! lockers and buddy lockers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::lock::LockType;
use super::manager::{LockGrant, LockManager, LockRequester};
use crate::types::{CairnError, LockerId, NodeId, Result};

/// Compensating action recorded by a transactional write.
pub trait Undo: Send {
    /// Restores the state that existed before the write.
    fn undo(self: Box<Self>) -> Result<()>;
}

/// Ownership model of a [`Locker`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockerKind {
    /// User transaction; locks held until commit or abort.
    Txn,
    /// Transaction wrapping one single-shot write; ends with the operation.
    AutoTxn,
    /// Non-transactional locker; locks released at the end of each operation.
    Basic,
    /// Non-transactional locker whose requests never conflict with its buddy.
    Buddy,
}

/// Lifecycle of a transactional locker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// Accepting operations.
    Open,
    /// Committed; locks released.
    Committed,
    /// Aborted; writes undone and locks released.
    Aborted,
}

/// Isolation and timeout settings shared by lockers of one family.
#[derive(Copy, Clone, Debug)]
pub struct LockerSettings {
    /// Lock wait timeout.
    pub lock_timeout: Duration,
    /// Serializable (phantom-free) isolation.
    pub serializable: bool,
    /// Reads take no locks by default.
    pub read_uncommitted: bool,
}

impl Default for LockerSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
            serializable: false,
            read_uncommitted: false,
        }
    }
}

/// Hands out locker ids for one environment.
#[derive(Default, Debug)]
pub struct LockerIds {
    next: AtomicU64,
}

impl LockerIds {
    /// Returns a fresh id.
    pub fn next(&self) -> LockerId {
        LockerId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Owner of a set of locks and, when transactional, an undo log.
pub struct Locker {
    id: LockerId,
    kind: LockerKind,
    buddy: Option<LockerId>,
    settings: LockerSettings,
    manager: Arc<LockManager>,
    ids: Arc<LockerIds>,
    held: Mutex<FxHashMap<NodeId, LockType>>,
    undo: Mutex<Vec<Box<dyn Undo>>>,
    state: Mutex<TxnState>,
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl Locker {
    fn build(
        kind: LockerKind,
        buddy: Option<LockerId>,
        settings: LockerSettings,
        manager: Arc<LockManager>,
        ids: Arc<LockerIds>,
    ) -> Arc<Self> {
        let serializable = settings.serializable && matches!(kind, LockerKind::Txn | LockerKind::AutoTxn);
        if serializable {
            manager.register_serializable();
        }
        Arc::new(Self {
            id: ids.next(),
            kind,
            buddy,
            settings: LockerSettings {
                serializable,
                ..settings
            },
            manager,
            ids,
            held: Mutex::new(FxHashMap::default()),
            undo: Mutex::new(Vec::new()),
            state: Mutex::new(TxnState::Open),
        })
    }

    /// Creates a user transaction.
    pub fn txn(manager: Arc<LockManager>, ids: Arc<LockerIds>, settings: LockerSettings) -> Arc<Self> {
        Self::build(LockerKind::Txn, None, settings, manager, ids)
    }

    /// Creates an auto-commit transaction for one operation.
    pub fn auto_txn(manager: Arc<LockManager>, ids: Arc<LockerIds>, settings: LockerSettings) -> Arc<Self> {
        Self::build(LockerKind::AutoTxn, None, settings, manager, ids)
    }

    /// Creates a non-transactional locker.
    pub fn basic(manager: Arc<LockManager>, ids: Arc<LockerIds>, settings: LockerSettings) -> Arc<Self> {
        Self::build(LockerKind::Basic, None, settings, manager, ids)
    }

    /// Locker id.
    pub fn id(&self) -> LockerId {
        self.id
    }

    /// Ownership model.
    pub fn kind(&self) -> LockerKind {
        self.kind
    }

    /// Owning lock manager.
    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    /// Settings this locker was created with.
    pub fn settings(&self) -> LockerSettings {
        self.settings
    }

    /// True for user and auto-commit transactions.
    pub fn is_transactional(&self) -> bool {
        matches!(self.kind, LockerKind::Txn | LockerKind::AutoTxn)
    }

    /// True when this locker runs with serializable isolation.
    pub fn is_serializable(&self) -> bool {
        self.settings.serializable
    }

    /// True when reads default to read-uncommitted.
    pub fn read_uncommitted_default(&self) -> bool {
        self.settings.read_uncommitted
    }

    /// Current transaction state.
    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    /// Fails once the transaction has ended.
    pub fn check_open(&self) -> Result<()> {
        match self.state() {
            TxnState::Open => Ok(()),
            _ => Err(CairnError::TransactionClosed(self.id)),
        }
    }

    /// Locker for a cloned cursor: transactions share themselves, basic
    /// lockers hand out a fresh locker so the clone's locks can be released
    /// independently of the original's. The fresh locker never conflicts
    /// with this one, so a clone can write the record its original holds.
    pub fn new_non_txn_locker(self: &Arc<Self>) -> Arc<Locker> {
        match self.kind {
            LockerKind::Txn | LockerKind::AutoTxn => Arc::clone(self),
            LockerKind::Basic => Self::build(
                LockerKind::Basic,
                Some(self.id),
                self.settings,
                Arc::clone(&self.manager),
                Arc::clone(&self.ids),
            ),
            LockerKind::Buddy => Self::build(
                LockerKind::Buddy,
                self.buddy,
                self.settings,
                Arc::clone(&self.manager),
                Arc::clone(&self.ids),
            ),
        }
    }

    /// A locker whose requests ignore conflicts with this one.
    pub fn new_buddy(self: &Arc<Self>) -> Arc<Locker> {
        Self::build(
            LockerKind::Buddy,
            Some(self.id),
            LockerSettings {
                serializable: false,
                ..self.settings
            },
            Arc::clone(&self.manager),
            Arc::clone(&self.ids),
        )
    }

    /// True when another serializable transaction is running.
    pub fn other_serializable_active(&self) -> bool {
        let own = usize::from(self.settings.serializable);
        self.manager.serializable_active() > own
    }

    /// Requests a lock; `None` means no lock is needed.
    pub fn lock(&self, node: NodeId, lock_type: Option<LockType>, no_wait: bool) -> Result<LockGrant> {
        let Some(lock_type) = lock_type else {
            return Ok(LockGrant::NoneNeeded);
        };
        let requester = LockRequester {
            id: self.id,
            buddy: self.buddy,
        };
        let grant = self
            .manager
            .lock(node, requester, lock_type, no_wait, self.settings.lock_timeout)?;
        if matches!(grant, LockGrant::New | LockGrant::Promotion { .. }) {
            let mut held = self.held.lock();
            let current = held.get(&node).copied();
            let next = match current {
                Some(_) => self
                    .manager
                    .owners(node)
                    .into_iter()
                    .find(|(owner, _)| *owner == self.id)
                    .map(|(_, ty)| ty)
                    .unwrap_or(lock_type),
                None => lock_type,
            };
            held.insert(node, next);
        }
        Ok(grant)
    }

    /// Undoes a grant made by this locker: releases a new lock or restores a
    /// promoted one to its previous type.
    pub fn revert(&self, node: NodeId, grant: LockGrant) {
        match grant {
            LockGrant::New => self.release_lock(node),
            LockGrant::Promotion { from } => {
                self.manager.set_type(node, self.id, from);
                self.held.lock().insert(node, from);
            }
            _ => {}
        }
    }

    /// Releases one lock.
    pub fn release_lock(&self, node: NodeId) {
        if self.held.lock().remove(&node).is_some() {
            self.manager.release(node, self.id);
        }
    }

    /// Demotes a write lock to the matching read lock.
    pub fn demote_lock(&self, node: NodeId) {
        let mut held = self.held.lock();
        if let Some(ty) = held.get_mut(&node) {
            let demoted = match *ty {
                LockType::Write => LockType::Read,
                LockType::RangeWrite => LockType::RangeRead,
                other => other,
            };
            *ty = demoted;
            self.manager.set_type(node, self.id, demoted);
        }
    }

    /// Type of the lock this locker holds on `node`.
    pub fn held_lock_type(&self, node: NodeId) -> Option<LockType> {
        self.held.lock().get(&node).copied()
    }

    /// Number of locks held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release_all(&self) {
        let nodes: Vec<NodeId> = self.held.lock().drain().map(|(node, _)| node).collect();
        if !nodes.is_empty() {
            self.manager.release_all(self.id, nodes);
        }
    }

    /// Releases everything held by a non-transactional locker.
    pub fn release_non_txn_locks(&self) {
        if !self.is_transactional() {
            self.release_all();
        }
    }

    /// Records a compensating action for abort.
    pub fn add_undo(&self, undo: Box<dyn Undo>) {
        if self.is_transactional() {
            self.undo.lock().push(undo);
        }
    }

    /// Number of recorded undo actions.
    pub fn undo_len(&self) -> usize {
        self.undo.lock().len()
    }

    fn finish(&self, next: TxnState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != TxnState::Open {
            return Err(CairnError::TransactionClosed(self.id));
        }
        *state = next;
        drop(state);
        if self.settings.serializable {
            self.manager.unregister_serializable();
        }
        Ok(())
    }

    /// Commits: forgets the undo log and releases every lock.
    pub fn commit(&self) -> Result<()> {
        self.finish(TxnState::Committed)?;
        self.undo.lock().clear();
        self.release_all();
        debug!(locker = %self.id, "txn.commit");
        Ok(())
    }

    /// Aborts: runs the undo log newest-first, then releases every lock.
    pub fn abort(&self) -> Result<()> {
        self.finish(TxnState::Aborted)?;
        let actions: Vec<Box<dyn Undo>> = std::mem::take(&mut *self.undo.lock());
        let mut first_err = None;
        for action in actions.into_iter().rev() {
            if let Err(err) = action.undo() {
                warn!(locker = %self.id, error = %err, "txn.abort.undo_failed");
                first_err.get_or_insert(err);
            }
        }
        self.release_all();
        debug!(locker = %self.id, "txn.abort");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ends one operation: auto-commit transactions commit on success and
    /// abort otherwise, non-transactional lockers drop their locks, user
    /// transactions are untouched.
    pub fn operation_end(&self, success: bool) -> Result<()> {
        match self.kind {
            LockerKind::AutoTxn => {
                if success {
                    self.commit()
                } else {
                    self.abort()
                }
            }
            LockerKind::Basic | LockerKind::Buddy => {
                self.release_all();
                Ok(())
            }
            LockerKind::Txn => Ok(()),
        }
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        if self.is_transactional() && *self.state.get_mut() == TxnState::Open {
            if let Err(err) = self.abort() {
                warn!(locker = %self.id, error = %err, "txn.drop.abort_failed");
            }
        } else {
            self.release_all();
        }
    }
}
