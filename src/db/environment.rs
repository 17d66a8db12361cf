//! The environment: lock table, log, named trees and the trigger latch
//! shared by every handle.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use super::config::{DatabaseConfig, EnvironmentConfig, SecondaryConfig, TransactionConfig};
use super::database::{Database, DatabaseInner, HandleKind};
use super::secondary::SecondaryDatabase;
use super::transaction::Transaction;
use super::triggers::TriggerRegistry;
use crate::primitives::concurrency::{LockManager, LockStats, Locker, LockerIds, LockerKind, LockerSettings};
use crate::primitives::wal::{LogKind, LogRecord, LogSink, NoopLog, WalStats};
use crate::storage::btree::{byte_order, NodeIds, Tree, TreeConfig};
use crate::types::{CairnError, HandleId, Result, TreeId};

/// Lifecycle of an environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnvState {
    /// Accepting operations.
    Open,
    /// A fatal error was seen; every later call fails.
    Invalid(String),
    /// Closed by the caller.
    Closed,
}

impl EnvState {
    fn check(&self) -> Result<()> {
        match self {
            EnvState::Open => Ok(()),
            EnvState::Invalid(reason) => Err(CairnError::EnvironmentInvalid(reason.clone())),
            EnvState::Closed => Err(CairnError::EnvironmentClosed),
        }
    }

    /// Only an open environment can become invalid; returns whether it did.
    fn invalidate(&mut self, reason: String) -> bool {
        if *self == EnvState::Open {
            *self = EnvState::Invalid(reason);
            true
        } else {
            false
        }
    }
}

struct TreeEntry {
    tree: Arc<Tree>,
    kind: HandleKind,
    sorted_duplicates: bool,
    transactional: bool,
}

struct EnvInner {
    config: EnvironmentConfig,
    locks: Arc<LockManager>,
    locker_ids: Arc<LockerIds>,
    node_ids: Arc<NodeIds>,
    log: Arc<dyn LogSink>,
    trees: Mutex<FxHashMap<String, TreeEntry>>,
    next_tree: AtomicU32,
    next_handle: AtomicU64,
    triggers: TriggerRegistry,
    handles: Mutex<FxHashMap<HandleId, Weak<DatabaseInner>>>,
    state: Mutex<EnvState>,
}

/// Shared context of a set of databases. Cheap to clone.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Opens an environment whose log discards every record.
    pub fn open(config: EnvironmentConfig) -> Result<Self> {
        Self::with_log(config, Arc::new(NoopLog::default()))
    }

    /// Opens an environment writing mutations and transaction outcomes to
    /// `log`.
    pub fn with_log(config: EnvironmentConfig, log: Arc<dyn LogSink>) -> Result<Self> {
        config.validate()?;
        info!(
            transactional = config.transactional,
            lock_timeout_ms = config.lock_timeout_ms,
            serializable = config.txn_serializable_isolation,
            "env.open"
        );
        Ok(Self {
            inner: Arc::new(EnvInner {
                config,
                locks: Arc::new(LockManager::new()),
                locker_ids: Arc::new(LockerIds::default()),
                node_ids: Arc::new(NodeIds::default()),
                log,
                trees: Mutex::new(FxHashMap::default()),
                next_tree: AtomicU32::new(0),
                next_handle: AtomicU64::new(0),
                triggers: TriggerRegistry::default(),
                handles: Mutex::new(FxHashMap::default()),
                state: Mutex::new(EnvState::Open),
            }),
        })
    }

    /// Settings the environment was opened with.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    /// Fails once the environment is closed or invalid.
    pub fn check_open(&self) -> Result<()> {
        self.inner.state.lock().check()
    }

    /// False after a fatal error.
    pub fn is_valid(&self) -> bool {
        !matches!(*self.inner.state.lock(), EnvState::Invalid(_))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnvState {
        self.inner.state.lock().clone()
    }

    /// Opens a primary database handle, creating the tree when allowed.
    pub fn open_database(&self, name: &str, config: DatabaseConfig) -> Result<Database> {
        let result = self.open_handle(name, config, HandleKind::Primary);
        self.check_result(result)
    }

    /// Opens a secondary index over `primary`.
    pub fn open_secondary_database(
        &self,
        name: &str,
        primary: &Database,
        config: SecondaryConfig,
    ) -> Result<SecondaryDatabase> {
        let result = SecondaryDatabase::open(self, name, primary, config);
        self.check_result(result)
    }

    pub(crate) fn open_handle(&self, name: &str, config: DatabaseConfig, kind: HandleKind) -> Result<Database> {
        self.check_open()?;
        config.validate()?;
        if config.transactional && !self.inner.config.transactional {
            return Err(CairnError::Config(format!(
                "database {name} is transactional but the environment is not"
            )));
        }
        let tree = {
            let mut trees = self.inner.trees.lock();
            match trees.get(name) {
                Some(entry) => {
                    if config.exclusive_create {
                        return Err(CairnError::DatabaseExists(name.to_string()));
                    }
                    check_matches(name, entry, kind, &config)?;
                    Arc::clone(&entry.tree)
                }
                None => {
                    if !config.allow_create {
                        return Err(CairnError::DatabaseNotFound(name.to_string()));
                    }
                    let id = TreeId(self.inner.next_tree.fetch_add(1, Ordering::Relaxed) + 1);
                    let tree_config = TreeConfig {
                        duplicates: config.sorted_duplicates,
                        key_order: config.key_order.clone().unwrap_or_else(byte_order),
                        dup_order: config.dup_order.clone().unwrap_or_else(byte_order),
                        max_entries_per_bin: self.inner.config.max_entries_per_bin,
                    };
                    let tree = Tree::new(
                        id,
                        name,
                        tree_config,
                        Arc::clone(&self.inner.node_ids),
                        Arc::clone(&self.inner.log),
                    );
                    debug!(db = name, tree = %id, duplicates = config.sorted_duplicates, "env.tree.create");
                    trees.insert(
                        name.to_string(),
                        TreeEntry {
                            tree: Arc::clone(&tree),
                            kind,
                            sorted_duplicates: config.sorted_duplicates,
                            transactional: config.transactional,
                        },
                    );
                    tree
                }
            }
        };
        let handle = HandleId(self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let db = Database::new(self.clone(), tree, handle, kind, config);
        self.inner
            .handles
            .lock()
            .insert(handle, Arc::downgrade(db.inner()));
        debug!(db = name, handle = %handle, kind = ?kind, "db.open");
        Ok(db)
    }

    pub(crate) fn forget_handle(&self, handle: HandleId) {
        self.inner.handles.lock().remove(&handle);
    }

    /// Starts a user transaction.
    pub fn begin_transaction(&self, config: TransactionConfig) -> Result<Transaction> {
        self.check_open()?;
        if !self.inner.config.transactional {
            return Err(CairnError::Config("environment is not transactional".to_string()));
        }
        let settings = LockerSettings {
            lock_timeout: config
                .lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.inner.config.lock_timeout()),
            serializable: config
                .serializable_isolation
                .unwrap_or(self.inner.config.txn_serializable_isolation),
            read_uncommitted: config.read_uncommitted,
        };
        let locker = Locker::txn(
            Arc::clone(&self.inner.locks),
            Arc::clone(&self.inner.locker_ids),
            settings,
        );
        debug!(locker = %locker.id(), serializable = locker.is_serializable(), "txn.begin");
        Ok(Transaction::new(self.clone(), locker))
    }

    fn settings(&self, serializable: bool, read_uncommitted: bool) -> LockerSettings {
        LockerSettings {
            lock_timeout: self.inner.config.lock_timeout(),
            serializable,
            read_uncommitted,
        }
    }

    fn txn_locker(&self, txn: &Transaction, db_transactional: bool) -> Result<Arc<Locker>> {
        if !db_transactional {
            return Err(CairnError::NotPermitted {
                operation: "transaction",
                handle: "non-transactional",
            });
        }
        if !txn.belongs_to(self) {
            return Err(CairnError::InvalidArgument(
                "transaction belongs to another environment",
            ));
        }
        txn.locker().check_open()?;
        Ok(Arc::clone(txn.locker()))
    }

    /// Locker for a write: the transaction's, else an auto-commit
    /// transaction on a transactional database, else a basic locker.
    pub(crate) fn writable_locker(&self, txn: Option<&Transaction>, db_transactional: bool) -> Result<Arc<Locker>> {
        match txn {
            Some(txn) => self.txn_locker(txn, db_transactional),
            None if db_transactional => Ok(Locker::auto_txn(
                Arc::clone(&self.inner.locks),
                Arc::clone(&self.inner.locker_ids),
                self.settings(self.inner.config.txn_serializable_isolation, false),
            )),
            None => Ok(Locker::basic(
                Arc::clone(&self.inner.locks),
                Arc::clone(&self.inner.locker_ids),
                self.settings(false, false),
            )),
        }
    }

    /// Locker for a read: the transaction's, else a basic locker.
    pub(crate) fn readable_locker(
        &self,
        txn: Option<&Transaction>,
        db_transactional: bool,
        read_uncommitted: bool,
    ) -> Result<Arc<Locker>> {
        match txn {
            Some(txn) => self.txn_locker(txn, db_transactional),
            None => Ok(Locker::basic(
                Arc::clone(&self.inner.locks),
                Arc::clone(&self.inner.locker_ids),
                self.settings(false, read_uncommitted),
            )),
        }
    }

    /// Ends one operation of `locker`, logging the outcome of an auto-commit
    /// transaction that wrote something.
    pub(crate) fn end_operation(&self, locker: &Arc<Locker>, success: bool) -> Result<()> {
        if locker.kind() == LockerKind::AutoTxn && locker.undo_len() > 0 {
            let kind = if success { LogKind::Commit } else { LogKind::Abort };
            if let Err(err) = self.inner.log.append(&LogRecord::outcome(kind, locker.id())) {
                locker.operation_end(false)?;
                return Err(err);
            }
        }
        locker.operation_end(success)
    }

    /// Passes `result` through, invalidating the environment on a fatal
    /// error.
    pub fn check_result<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.invalidate(err.to_string());
            }
        }
        result
    }

    fn invalidate(&self, reason: String) {
        if !self.inner.state.lock().invalidate(reason.clone()) {
            return;
        }
        error!(reason = %reason, "env.invalidated");
        let handles: Vec<Weak<DatabaseInner>> = self.inner.handles.lock().values().cloned().collect();
        for handle in handles.iter().filter_map(Weak::upgrade) {
            handle.invalidate();
        }
    }

    pub(crate) fn triggers(&self) -> &TriggerRegistry {
        &self.inner.triggers
    }

    pub(crate) fn log(&self) -> &Arc<dyn LogSink> {
        &self.inner.log
    }

    pub(crate) fn same_as(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Removes tombstones that no lock or cursor still refers to.
    pub fn compress(&self) -> Result<usize> {
        self.check_open()?;
        let trees: Vec<Arc<Tree>> = self
            .inner
            .trees
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.tree))
            .collect();
        let removed = trees.iter().map(|tree| tree.compress(&self.inner.locks)).sum();
        debug!(trees = trees.len(), removed, "env.compress");
        Ok(removed)
    }

    /// Lock table counters.
    pub fn lock_stats(&self) -> LockStats {
        self.inner.locks.stats()
    }

    /// Log counters.
    pub fn log_stats(&self) -> WalStats {
        self.inner.log.stats()
    }

    /// Flushes the log.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let result = self.inner.log.flush();
        self.check_result(result)
    }

    /// Names of every database created in this environment, sorted.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.trees.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes the environment. Handles still open are closed first; the
    /// first error seen is returned after everything is closed.
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        let handles: Vec<Weak<DatabaseInner>> = self.inner.handles.lock().values().cloned().collect();
        let mut first_err = None;
        for handle in handles.iter().filter_map(Weak::upgrade) {
            if let Err(err) = handle.close() {
                first_err.get_or_insert(err);
            }
        }
        self.inner.locks.emit_tracing();
        let flushed = self.inner.log.flush();
        *self.inner.state.lock() = EnvState::Closed;
        info!("env.close");
        match (first_err, flushed) {
            (Some(err), _) | (None, Err(err)) => Err(err),
            (None, Ok(())) => Ok(()),
        }
    }
}

fn check_matches(name: &str, entry: &TreeEntry, kind: HandleKind, config: &DatabaseConfig) -> Result<()> {
    // An index tree is only reachable through its SecondaryDatabase.
    if entry.kind != kind {
        return Err(CairnError::ConfigMismatch(format!(
            "database {name} is a {} database",
            entry.kind.as_str()
        )));
    }
    if entry.sorted_duplicates != config.sorted_duplicates {
        return Err(CairnError::ConfigMismatch(format!(
            "database {name} has sorted_duplicates={}",
            entry.sorted_duplicates
        )));
    }
    if entry.transactional != config.transactional {
        return Err(CairnError::ConfigMismatch(format!(
            "database {name} has transactional={}",
            entry.transactional
        )));
    }
    if let Some(order) = &config.key_order {
        if order.name() != entry.tree.key_order().name() {
            return Err(CairnError::ConfigMismatch(format!(
                "database {name} uses key order {}",
                entry.tree.key_order().name()
            )));
        }
    }
    Ok(())
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("state", &*self.inner.state.lock())
            .field("databases", &self.inner.trees.lock().len())
            .finish()
    }
}
