//! Database handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::config::{CursorConfig, DatabaseConfig, JoinConfig, LockMode, SequenceConfig};
use super::cursor::{force_close, Cursor, CursorCore, GetMode, PutMode};
use super::environment::Environment;
use super::join::JoinCursor;
use super::secondary::SecondaryCursor;
use super::sequence::Sequence;
use super::stats::DatabaseStats;
use super::transaction::Transaction;
use crate::primitives::concurrency::Locker;
use crate::storage::btree::{SearchMode, Tree};
use crate::types::{CairnError, HandleId, Lookup, OperationStatus, Result};

/// Whether a handle is a primary database or a secondary index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandleKind {
    /// Records are written directly.
    Primary,
    /// Records are maintained from a primary; direct writes are refused.
    Secondary,
}

/// Operations checked against [`HandleKind::permits`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DbOperation {
    /// Keyed or positional read.
    Get,
    /// Two-argument key/data search.
    GetSearchBoth,
    /// Overwriting put.
    Put,
    /// Put refusing an existing key.
    PutNoOverwrite,
    /// Put refusing an existing key/data pair.
    PutNoDupData,
    /// Put through a positioned cursor.
    PutCurrent,
    /// Delete by key or through a cursor.
    Delete,
    /// Equality join over secondary cursors.
    Join,
    /// Cursor creation.
    OpenCursor,
    /// Sequence creation.
    OpenSequence,
    /// Record or duplicate counting.
    Count,
    /// Statistics and log flushes.
    Stats,
}

impl DbOperation {
    /// Name used in errors.
    pub fn as_str(self) -> &'static str {
        match self {
            DbOperation::Get => "get",
            DbOperation::GetSearchBoth => "get_search_both",
            DbOperation::Put => "put",
            DbOperation::PutNoOverwrite => "put_no_overwrite",
            DbOperation::PutNoDupData => "put_no_dup_data",
            DbOperation::PutCurrent => "put_current",
            DbOperation::Delete => "delete",
            DbOperation::Join => "join",
            DbOperation::OpenCursor => "open_cursor",
            DbOperation::OpenSequence => "open_sequence",
            DbOperation::Count => "count",
            DbOperation::Stats => "stats",
        }
    }
}

impl HandleKind {
    /// True when `operation` is allowed on this kind of handle.
    pub fn permits(self, operation: DbOperation) -> bool {
        match self {
            HandleKind::Primary => true,
            HandleKind::Secondary => match operation {
                DbOperation::Get
                | DbOperation::Delete
                | DbOperation::OpenCursor
                | DbOperation::Count
                | DbOperation::Stats => true,
                DbOperation::GetSearchBoth
                | DbOperation::Put
                | DbOperation::PutNoOverwrite
                | DbOperation::PutNoDupData
                | DbOperation::PutCurrent
                | DbOperation::Join
                | DbOperation::OpenSequence => false,
            },
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            HandleKind::Primary => "primary",
            HandleKind::Secondary => "secondary",
        }
    }
}

/// Lifecycle of a database handle. Both terminal states are final.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DbState {
    /// Accepting operations.
    Open,
    /// Closed by the caller or by the environment.
    Closed,
    /// The environment was invalidated.
    Invalid,
}

impl DbState {
    fn check(self, name: &str) -> Result<()> {
        match self {
            DbState::Open => Ok(()),
            DbState::Closed => Err(CairnError::DatabaseClosed(name.to_string())),
            DbState::Invalid => Err(CairnError::EnvironmentInvalid(format!(
                "database {name} belongs to an invalidated environment"
            ))),
        }
    }

    fn close(&mut self, name: &str) -> Result<()> {
        match self {
            DbState::Closed => Err(CairnError::DatabaseClosed(name.to_string())),
            DbState::Open | DbState::Invalid => {
                *self = DbState::Closed;
                Ok(())
            }
        }
    }
}

pub(crate) struct DatabaseInner {
    env: Environment,
    tree: Arc<Tree>,
    name: String,
    handle: HandleId,
    kind: HandleKind,
    config: DatabaseConfig,
    state: Mutex<DbState>,
    cursors: Mutex<FxHashMap<u64, Weak<Mutex<CursorCore>>>>,
    next_cursor: AtomicU64,
}

impl DatabaseInner {
    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }

    pub(crate) fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handle(&self) -> HandleId {
        self.handle
    }

    pub(crate) fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        self.env.check_open()?;
        self.state.lock().check(&self.name)
    }

    pub(crate) fn check_permitted(&self, operation: DbOperation) -> Result<()> {
        if self.kind.permits(operation) {
            Ok(())
        } else {
            Err(CairnError::NotPermitted {
                operation: operation.as_str(),
                handle: self.kind.as_str(),
            })
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(CairnError::NotPermitted {
                operation: "write",
                handle: "read-only",
            });
        }
        Ok(())
    }

    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        if *state == DbState::Open {
            *state = DbState::Invalid;
        }
    }

    pub(crate) fn has_triggers(&self) -> bool {
        self.env.triggers().shared().has_triggers(self.handle)
    }

    /// Runs every trigger of this handle, stopping at the first error.
    pub(crate) fn notify_triggers(
        &self,
        locker: &Arc<Locker>,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<()> {
        let triggers = self.env.triggers().shared();
        for trigger in triggers.for_handle(self.handle) {
            trigger.database_updated(locker, key, old, new)?;
        }
        Ok(())
    }

    pub(crate) fn register_cursor(&self, core: &Arc<Mutex<CursorCore>>) -> u64 {
        let id = self.next_cursor.fetch_add(1, Ordering::Relaxed) + 1;
        let mut cursors = self.cursors.lock();
        cursors.retain(|_, weak| weak.strong_count() > 0);
        cursors.insert(id, Arc::downgrade(core));
        id
    }

    pub(crate) fn unregister_cursor(&self, id: u64) {
        self.cursors.lock().remove(&id);
    }

    fn open_cursor_count(&self) -> usize {
        self.cursors
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Deletes `key` and, in a duplicate database, every duplicate of it.
    /// Triggers see each record before it is removed.
    pub(crate) fn delete_internal(self: &Arc<Self>, locker: &Arc<Locker>, key: &[u8]) -> Result<OperationStatus> {
        let mut cursor = CursorCore::internal(Arc::clone(self), Arc::clone(locker));
        let Lookup::Found(mut entry) = cursor.search(key, None, LockMode::Rmw, SearchMode::Set)? else {
            return Ok(OperationStatus::NotFound);
        };
        loop {
            if self.has_triggers() {
                self.notify_triggers(locker, &entry.key, Some(&entry.data), None)?;
            }
            let status = cursor.delete_no_notify()?;
            if !status.is_success() {
                return Ok(status);
            }
            if !self.config.sorted_duplicates {
                return Ok(OperationStatus::Success);
            }
            match cursor.retrieve_next(LockMode::Rmw, GetMode::NextDup)? {
                Lookup::Found(next) => entry = next,
                _ => return Ok(OperationStatus::Success),
            }
        }
    }

    pub(crate) fn close(&self) -> Result<()> {
        self.state.lock().close(&self.name)?;
        let removed = self.env.triggers().exclusive().clear(self.handle);
        let cursors: Vec<(u64, Weak<Mutex<CursorCore>>)> = self.cursors.lock().drain().collect();
        let timeout = self.env.config().lock_timeout();
        let mut closed = 0;
        let mut failures = Vec::new();
        for (id, weak) in cursors {
            let Some(core) = weak.upgrade() else {
                continue;
            };
            match force_close(&core, timeout) {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(db = %self.name, cursor = id, error = %err, "db.close.cursor_failed");
                    closed += 1;
                    failures.push(format!("cursor {id}: {err}"));
                }
            }
        }
        self.env.forget_handle(self.handle);
        debug!(db = %self.name, handle = %self.handle, triggers = removed, cursors = closed, "db.close");
        if closed == 0 {
            return Ok(());
        }
        warn!(db = %self.name, cursors = closed, "db.close.open_cursors");
        Err(CairnError::OpenCursors {
            database: self.name.clone(),
            count: closed,
            details: if failures.is_empty() {
                String::new()
            } else {
                format!(" ({})", failures.join("; "))
            },
        })
    }
}

/// Combines an operation's result with the end of its locker's operation;
/// the operation's own error wins.
pub(crate) fn finish_operation<T>(
    env: &Environment,
    locker: &Arc<Locker>,
    result: Result<T>,
    success: impl FnOnce(&T) -> bool,
) -> Result<T> {
    let ok = matches!(&result, Ok(value) if success(value));
    let ended = env.end_operation(locker, ok);
    match (result, ended) {
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Handle over one named tree.
///
/// Single-shot operations run through an internal cursor scoped to the call.
/// Without a transaction, writes to a transactional database auto-commit and
/// reads lock only for the duration of the call.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub(crate) fn new(
        env: Environment,
        tree: Arc<Tree>,
        handle: HandleId,
        kind: HandleKind,
        config: DatabaseConfig,
    ) -> Self {
        let name = tree.name().to_string();
        Self {
            inner: Arc::new(DatabaseInner {
                env,
                tree,
                name,
                handle,
                kind,
                config,
                state: Mutex::new(DbState::Open),
                cursors: Mutex::new(FxHashMap::default()),
                next_cursor: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<DatabaseInner> {
        &self.inner
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Settings the handle was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Owning environment.
    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    /// Primary or secondary.
    pub fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    /// Current handle state.
    pub fn state(&self) -> DbState {
        *self.inner.state.lock()
    }

    /// Cursors currently open on this handle.
    pub fn open_cursors(&self) -> usize {
        self.inner.open_cursor_count()
    }

    fn read<T>(
        &self,
        txn: Option<&Transaction>,
        operation: DbOperation,
        read_uncommitted: bool,
        f: impl FnOnce(&mut CursorCore) -> Result<T>,
    ) -> Result<T> {
        let env = &self.inner.env;
        let result = (|| -> Result<T> {
            self.inner.check_open()?;
            self.inner.check_permitted(operation)?;
            let locker = env.readable_locker(txn, self.inner.config.transactional, read_uncommitted)?;
            let mut cursor = CursorCore::internal(Arc::clone(&self.inner), Arc::clone(&locker));
            let result = f(&mut cursor);
            drop(cursor);
            finish_operation(env, &locker, result, |_| true)
        })();
        env.check_result(result)
    }

    fn write(
        &self,
        txn: Option<&Transaction>,
        operation: DbOperation,
        f: impl FnOnce(&Arc<DatabaseInner>, &Arc<Locker>) -> Result<OperationStatus>,
    ) -> Result<OperationStatus> {
        let env = &self.inner.env;
        let result = (|| -> Result<OperationStatus> {
            self.inner.check_open()?;
            self.inner.check_permitted(operation)?;
            self.inner.check_writable()?;
            let locker = env.writable_locker(txn, self.inner.config.transactional)?;
            let result = f(&self.inner, &locker);
            finish_operation(env, &locker, result, |status| status.is_success())
        })();
        env.check_result(result)
    }

    /// Reads the record stored under `key` (the first duplicate in a
    /// duplicate database).
    pub fn get(&self, txn: Option<&Transaction>, key: &[u8], mode: LockMode) -> Result<Lookup> {
        let read_uncommitted = mode == LockMode::ReadUncommitted;
        self.read(txn, DbOperation::Get, read_uncommitted, |cursor| {
            cursor.search(key, None, mode, SearchMode::Set)
        })
    }

    /// Reads the exact `key`/`data` pair.
    pub fn get_search_both(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        data: &[u8],
        mode: LockMode,
    ) -> Result<Lookup> {
        let read_uncommitted = mode == LockMode::ReadUncommitted;
        self.read(txn, DbOperation::GetSearchBoth, read_uncommitted, |cursor| {
            cursor.search(key, Some(data), mode, SearchMode::Both)
        })
    }

    /// Stores `key`/`data`, replacing the data of an existing key.
    pub fn put(&self, txn: Option<&Transaction>, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        self.put_with(txn, key, data, PutMode::Overwrite, DbOperation::Put)
    }

    /// Stores `key`/`data` unless the key exists.
    pub fn put_no_overwrite(&self, txn: Option<&Transaction>, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        self.put_with(txn, key, data, PutMode::NoOverwrite, DbOperation::PutNoOverwrite)
    }

    /// Stores `key`/`data` unless that exact pair exists.
    pub fn put_no_dup_data(&self, txn: Option<&Transaction>, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        self.put_with(txn, key, data, PutMode::NoDupData, DbOperation::PutNoDupData)
    }

    fn put_with(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        data: &[u8],
        put_mode: PutMode,
        operation: DbOperation,
    ) -> Result<OperationStatus> {
        self.write(txn, operation, |inner, locker| {
            let mut cursor = CursorCore::internal(Arc::clone(inner), Arc::clone(locker));
            cursor.put(Some(key), data, put_mode)
        })
    }

    /// Deletes `key` with all of its duplicates.
    pub fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<OperationStatus> {
        self.write(txn, DbOperation::Delete, |inner, locker| inner.delete_internal(locker, key))
    }

    /// Reads `key` under a write lock and stores the replacement `f` returns,
    /// all within one operation of one locker.
    pub(crate) fn update_record<T>(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        f: impl FnOnce(Option<&[u8]>) -> Result<(Option<Vec<u8>>, T)>,
    ) -> Result<T> {
        let env = &self.inner.env;
        let result = (|| -> Result<T> {
            self.inner.check_open()?;
            self.inner.check_writable()?;
            let locker = env.writable_locker(txn, self.inner.config.transactional)?;
            let mut cursor = CursorCore::internal(Arc::clone(&self.inner), Arc::clone(&locker));
            let result = (|| -> Result<T> {
                let existing = cursor.search(key, None, LockMode::Rmw, SearchMode::Set)?.found();
                let (replacement, value) = f(existing.as_ref().map(|entry| entry.data.as_slice()))?;
                if let Some(data) = replacement {
                    let status = match existing {
                        Some(_) => cursor.put(None, &data, PutMode::Current)?,
                        None => cursor.put(Some(key), &data, PutMode::NoOverwrite)?,
                    };
                    if !status.is_success() {
                        return Err(CairnError::InvalidArgument("record changed during update"));
                    }
                }
                Ok(value)
            })();
            drop(cursor);
            finish_operation(env, &locker, result, |_| true)
        })();
        env.check_result(result)
    }

    /// Opens a cursor. Without a transaction the cursor cannot write to a
    /// transactional database.
    pub fn open_cursor(&self, txn: Option<&Transaction>, config: CursorConfig) -> Result<Cursor> {
        let env = &self.inner.env;
        let result = (|| -> Result<Cursor> {
            self.inner.check_open()?;
            self.inner.check_permitted(DbOperation::OpenCursor)?;
            let locker = env.readable_locker(txn, self.inner.config.transactional, config.read_uncommitted)?;
            Ok(Cursor::register(CursorCore::new(Arc::clone(&self.inner), locker, config)))
        })();
        env.check_result(result)
    }

    /// Runs `f` after the open and permission checks, passing the outcome
    /// through [`Environment::check_result`].
    fn checked<T>(&self, operation: DbOperation, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = (|| -> Result<T> {
            self.inner.check_open()?;
            self.inner.check_permitted(operation)?;
            f()
        })();
        self.inner.env.check_result(result)
    }

    /// Opens (and by default creates) the sequence stored under `key`.
    pub fn open_sequence(&self, txn: Option<&Transaction>, key: &[u8], config: SequenceConfig) -> Result<Sequence> {
        self.checked(DbOperation::OpenSequence, || Sequence::open(self.clone(), txn, key, config))
    }

    /// Equality join: primary records referenced by every one of `cursors`
    /// at their current secondary keys.
    pub fn join(&self, cursors: &mut [&mut SecondaryCursor], config: JoinConfig) -> Result<JoinCursor> {
        self.checked(DbOperation::Join, || JoinCursor::new(self.clone(), cursors, config))
    }

    /// Live records in the database.
    pub fn count(&self) -> Result<u64> {
        self.checked(DbOperation::Count, || Ok(self.inner.tree.summary().live_records))
    }

    /// Flushes the environment log.
    pub fn sync(&self) -> Result<()> {
        self.checked(DbOperation::Stats, || self.inner.env.sync())
    }

    /// Tree shape and counters.
    pub fn stats(&self) -> Result<DatabaseStats> {
        self.checked(DbOperation::Stats, || Ok(DatabaseStats::collect(&self.inner.tree)))
    }

    /// Closes the handle. Triggers are removed and open cursors are
    /// force-closed; if any were open the close still happens and
    /// [`CairnError::OpenCursors`] is returned. A second close fails.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("handle", &self.inner.handle)
            .field("kind", &self.inner.kind)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}
