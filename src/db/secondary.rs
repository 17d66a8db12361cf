//! Secondary indexes: databases whose records map a derived key to the key
//! of a primary record, kept in step by triggers on the primary.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::config::{
    CursorConfig, ForeignKeyDeleteAction, KeyCreator, LockMode, Nullifier, SecondaryConfig,
};
use super::cursor::{Cursor, CursorCore, GetMode, PutMode};
use super::database::{finish_operation, Database, DbOperation, HandleKind};
use super::environment::Environment;
use super::stats::DatabaseStats;
use super::transaction::Transaction;
use super::triggers::Trigger;
use crate::primitives::concurrency::Locker;
use crate::storage::btree::SearchMode;
use crate::types::{CairnError, Entry, Lookup, OperationStatus, Result, SecondaryEntry};

pub(crate) struct SecondaryInner {
    db: Database,
    primary: Database,
    key_creator: KeyCreator,
    foreign: Option<Database>,
    delete_action: ForeignKeyDeleteAction,
    nullifier: Option<Nullifier>,
    immutable_key: bool,
}

impl SecondaryInner {
    fn corrupt(&self, reason: &'static str) -> CairnError {
        CairnError::SecondaryCorrupt {
            database: self.db.name().to_string(),
            reason,
        }
    }

    /// Applies a primary write to the index: entries for keys only `old`
    /// derives are deleted, entries for keys only `new` derives are inserted.
    pub(crate) fn update_secondary(
        &self,
        locker: &Arc<Locker>,
        primary_key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<()> {
        if self.immutable_key && old.is_some() && new.is_some() {
            return Ok(());
        }
        self.db.inner().check_open()?;
        let old_keys = old
            .map(|data| self.key_creator.keys(primary_key, data))
            .unwrap_or_default();
        let new_keys = new
            .map(|data| self.key_creator.keys(primary_key, data))
            .unwrap_or_default();
        if old_keys == new_keys {
            return Ok(());
        }
        let mut cursor = CursorCore::internal(Arc::clone(self.db.inner()), Arc::clone(locker));
        for key in old_keys.difference(&new_keys) {
            self.delete_key(&mut cursor, key, primary_key)?;
        }
        for key in new_keys.difference(&old_keys) {
            self.insert_key(&mut cursor, locker, key, primary_key)?;
        }
        trace!(
            db = %self.db.name(),
            removed = old_keys.difference(&new_keys).count(),
            added = new_keys.difference(&old_keys).count(),
            "secondary.update"
        );
        Ok(())
    }

    fn delete_key(&self, cursor: &mut CursorCore, key: &[u8], primary_key: &[u8]) -> Result<()> {
        match cursor.search(key, Some(primary_key), LockMode::Rmw, SearchMode::Both)? {
            Lookup::Found(_) => {
                if cursor.delete_no_notify()?.is_success() {
                    Ok(())
                } else {
                    Err(self.corrupt("index entry vanished while being deleted"))
                }
            }
            _ => Err(self.corrupt("primary record derives a key missing from the index")),
        }
    }

    fn insert_key(
        &self,
        cursor: &mut CursorCore,
        locker: &Arc<Locker>,
        key: &[u8],
        primary_key: &[u8],
    ) -> Result<()> {
        if let Some(foreign) = &self.foreign {
            foreign.inner().check_open()?;
            let mut lookup = CursorCore::internal(Arc::clone(foreign.inner()), Arc::clone(locker));
            if !lookup.search(key, None, LockMode::Default, SearchMode::Set)?.is_found() {
                return Err(CairnError::ForeignKeyViolation {
                    database: foreign.name().to_string(),
                });
            }
        }
        let put_mode = if self.db.config().sorted_duplicates {
            PutMode::NoDupData
        } else {
            PutMode::NoOverwrite
        };
        let status = cursor.put(Some(key), primary_key, put_mode)?;
        if status.is_success() {
            Ok(())
        } else {
            Err(CairnError::SecondaryInsertFailed {
                database: self.db.name().to_string(),
                status,
            })
        }
    }

    /// Runs the configured delete action for every primary record whose
    /// index entry refers to the deleted foreign key.
    pub(crate) fn on_foreign_key_delete(&self, locker: &Arc<Locker>, foreign_key: &[u8]) -> Result<()> {
        self.db.inner().check_open()?;
        let mut cursor = CursorCore::internal(Arc::clone(self.db.inner()), Arc::clone(locker));
        let mut lookup = cursor.search(foreign_key, None, LockMode::Rmw, SearchMode::Set)?;
        while let Lookup::Found(entry) = lookup {
            let primary_key = entry.data;
            match self.delete_action {
                ForeignKeyDeleteAction::Abort => {
                    debug!(db = %self.db.name(), "secondary.foreign_key.abort");
                    return Err(CairnError::ForeignKeyDeleteAborted {
                        database: self.db.name().to_string(),
                    });
                }
                ForeignKeyDeleteAction::Cascade => {
                    self.primary.inner().check_open()?;
                    let status = self.primary.inner().delete_internal(locker, &primary_key)?;
                    if !status.is_success() {
                        return Err(self.corrupt("index entry refers to a missing primary record"));
                    }
                    trace!(db = %self.db.name(), "secondary.foreign_key.cascade");
                }
                ForeignKeyDeleteAction::Nullify => {
                    self.nullify(locker, &primary_key, foreign_key)?;
                }
            }
            lookup = cursor.retrieve_next(LockMode::Rmw, GetMode::NextDup)?;
        }
        Ok(())
    }

    fn nullify(&self, locker: &Arc<Locker>, primary_key: &[u8], foreign_key: &[u8]) -> Result<()> {
        let Some(nullifier) = &self.nullifier else {
            return Err(CairnError::Config(
                "foreign_key_delete_action Nullify requires a nullifier".into(),
            ));
        };
        self.primary.inner().check_open()?;
        let mut cursor = CursorCore::internal(Arc::clone(self.primary.inner()), Arc::clone(locker));
        let Lookup::Found(record) = cursor.search(primary_key, None, LockMode::Rmw, SearchMode::Set)? else {
            return Err(self.corrupt("index entry refers to a missing primary record"));
        };
        let mut data = record.data;
        if nullifier.nullify(primary_key, &mut data, foreign_key) {
            cursor.put(None, &data, PutMode::Current)?;
            trace!(db = %self.db.name(), "secondary.foreign_key.nullify");
        }
        Ok(())
    }

    /// Reads the primary record an index entry points at.
    ///
    /// Under read-uncommitted isolation a concurrent delete may remove the
    /// primary record between the two reads; if the index entry is gone too,
    /// or the primary no longer derives the key, the read reports `KeyEmpty`.
    fn read_primary(
        &self,
        core: &mut CursorCore,
        entry: Entry,
        mode: LockMode,
    ) -> Result<Lookup<SecondaryEntry>> {
        self.primary.inner().check_open()?;
        let read_uncommitted = core.is_read_uncommitted(mode);
        let primary_mode = if read_uncommitted {
            LockMode::ReadUncommitted
        } else {
            mode
        };
        let mut primary = CursorCore::internal(Arc::clone(self.primary.inner()), Arc::clone(core.locker()));
        match primary.search(&entry.data, None, primary_mode, SearchMode::Set)? {
            Lookup::Found(record) => {
                if read_uncommitted && !self.key_creator.derives(&entry.data, &record.data, &entry.key) {
                    return Ok(Lookup::KeyEmpty);
                }
                Ok(Lookup::Found(SecondaryEntry {
                    key: entry.key,
                    primary_key: entry.data,
                    data: record.data,
                }))
            }
            _ if read_uncommitted => match core.get_current(LockMode::ReadUncommitted)? {
                Lookup::Found(_) => Err(self.corrupt("index entry refers to a missing primary record")),
                _ => Ok(Lookup::KeyEmpty),
            },
            _ => Err(self.corrupt("index entry refers to a missing primary record")),
        }
    }

    /// Resolves a secondary move through the primary. When the entry turned
    /// out to be stale, `then` is applied and the result resolved again.
    fn resolve(
        &self,
        core: &mut CursorCore,
        mut lookup: Lookup,
        mode: LockMode,
        then: Option<GetMode>,
    ) -> Result<Lookup<SecondaryEntry>> {
        loop {
            let entry = match lookup {
                Lookup::Found(entry) => entry,
                Lookup::NotFound => return Ok(Lookup::NotFound),
                Lookup::KeyEmpty => return Ok(Lookup::KeyEmpty),
            };
            match self.read_primary(core, entry, mode)? {
                Lookup::KeyEmpty => match then {
                    Some(get_mode) => lookup = core.retrieve_next(mode, get_mode)?,
                    None => return Ok(Lookup::KeyEmpty),
                },
                resolved => return Ok(resolved),
            }
        }
    }

    /// Fills an empty index from every record of the primary.
    fn populate(&self) -> Result<u64> {
        let env = self.db.environment();
        let locker = env.writable_locker(None, self.db.config().transactional)?;
        let result = (|| -> Result<u64> {
            let mut scan = CursorCore::internal(Arc::clone(self.primary.inner()), Arc::clone(&locker));
            let mut index = CursorCore::internal(Arc::clone(self.db.inner()), Arc::clone(&locker));
            let mut inserted = 0;
            let mut lookup = scan.position(true, LockMode::Default)?;
            while let Lookup::Found(record) = lookup {
                for key in self.key_creator.keys(&record.key, &record.data) {
                    match self.insert_key(&mut index, &locker, &key, &record.key) {
                        Ok(()) => inserted += 1,
                        Err(CairnError::SecondaryInsertFailed {
                            status: OperationStatus::KeyExist,
                            ..
                        }) => {}
                        Err(err) => return Err(err),
                    }
                }
                lookup = scan.retrieve_next(LockMode::Default, GetMode::Next)?;
            }
            Ok(inserted)
        })();
        finish_operation(env, &locker, result, |_| true)
    }
}

/// A secondary index handle.
///
/// Entries are written only by the triggers on the primary; direct writes
/// are refused. Reads return the secondary key with the primary record it
/// refers to, and a delete removes the primary record (and with it every
/// index entry of that record).
#[derive(Clone)]
pub struct SecondaryDatabase {
    inner: Arc<SecondaryInner>,
}

impl SecondaryDatabase {
    pub(crate) fn open(
        env: &Environment,
        name: &str,
        primary: &Database,
        config: SecondaryConfig,
    ) -> Result<Self> {
        config.validate()?;
        primary.inner().check_open()?;
        if primary.kind() != HandleKind::Primary {
            return Err(CairnError::InvalidArgument(
                "a secondary index needs a primary database",
            ));
        }
        if !primary.environment().same_as(env) {
            return Err(CairnError::InvalidArgument(
                "primary database belongs to another environment",
            ));
        }
        if primary.config().sorted_duplicates {
            return Err(CairnError::Config(format!(
                "primary database {} may not have sorted duplicates",
                primary.name()
            )));
        }
        if config.database.transactional != primary.config().transactional {
            return Err(CairnError::ConfigMismatch(format!(
                "secondary {name} and primary {} differ in transactional",
                primary.name()
            )));
        }
        if let Some(foreign) = &config.foreign_key_database {
            foreign.inner().check_open()?;
            if !foreign.environment().same_as(env) {
                return Err(CairnError::InvalidArgument(
                    "foreign key database belongs to another environment",
                ));
            }
        }
        let db = env.open_handle(name, config.database.clone(), HandleKind::Secondary)?;
        let inner = Arc::new(SecondaryInner {
            db,
            primary: primary.clone(),
            key_creator: config.key_creator,
            foreign: config.foreign_key_database,
            delete_action: config.foreign_key_delete_action,
            nullifier: config.foreign_key_nullifier,
            immutable_key: config.immutable_secondary_key,
        });
        {
            let mut triggers = env.triggers().exclusive();
            triggers.add(
                primary.inner().handle(),
                Trigger::SecondaryIndex(Arc::downgrade(&inner)),
            );
            if let Some(foreign) = &inner.foreign {
                triggers.add(foreign.inner().handle(), Trigger::ForeignKey(Arc::downgrade(&inner)));
            }
        }
        let secondary = Self { inner };
        if config.allow_populate && secondary.inner.db.inner().tree().summary().live_records == 0 {
            match secondary.inner.populate() {
                Ok(inserted) => debug!(db = name, primary = %primary.name(), inserted, "secondary.populate"),
                Err(err) => {
                    warn!(db = name, error = %err, "secondary.populate.failed");
                    if let Err(close_err) = secondary.close() {
                        warn!(db = name, error = %close_err, "secondary.populate.close_failed");
                    }
                    return Err(err);
                }
            }
        }
        Ok(secondary)
    }

    /// Index name.
    pub fn name(&self) -> &str {
        self.inner.db.name()
    }

    /// The primary database the index refers to.
    pub fn primary(&self) -> &Database {
        &self.inner.primary
    }

    /// Reads the first entry under `key` together with its primary record.
    pub fn get(&self, txn: Option<&Transaction>, key: &[u8], mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        let db = self.inner.db.inner();
        let env = db.env();
        let result = (|| -> Result<Lookup<SecondaryEntry>> {
            db.check_open()?;
            db.check_permitted(DbOperation::Get)?;
            let read_uncommitted = mode == LockMode::ReadUncommitted;
            let locker = env.readable_locker(txn, db.config().transactional, read_uncommitted)?;
            let mut cursor = CursorCore::internal(Arc::clone(db), Arc::clone(&locker));
            let result = cursor
                .search(key, None, mode, SearchMode::Set)
                .and_then(|lookup| self.inner.resolve(&mut cursor, lookup, mode, Some(GetMode::NextDup)));
            drop(cursor);
            finish_operation(env, &locker, result, |_| true)
        })();
        env.check_result(result)
    }

    /// Deletes every primary record indexed under `key`.
    pub fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<OperationStatus> {
        let db = self.inner.db.inner();
        let primary = self.inner.primary.inner();
        let env = db.env();
        let result = (|| -> Result<OperationStatus> {
            db.check_open()?;
            db.check_permitted(DbOperation::Delete)?;
            primary.check_open()?;
            primary.check_writable()?;
            let locker = env.writable_locker(txn, db.config().transactional)?;
            let mut cursor = CursorCore::internal(Arc::clone(db), Arc::clone(&locker));
            let result = (|| -> Result<OperationStatus> {
                let mut lookup = cursor.search(key, None, LockMode::Rmw, SearchMode::Set)?;
                let mut status = OperationStatus::NotFound;
                while let Lookup::Found(entry) = lookup {
                    if !primary.delete_internal(&locker, &entry.data)?.is_success() {
                        return Err(self.inner.corrupt("index entry refers to a missing primary record"));
                    }
                    status = OperationStatus::Success;
                    lookup = cursor.retrieve_next(LockMode::Rmw, GetMode::NextDup)?;
                }
                Ok(status)
            })();
            drop(cursor);
            finish_operation(env, &locker, result, |status| status.is_success())
        })();
        env.check_result(result)
    }

    /// Opens a cursor over the index.
    pub fn open_cursor(&self, txn: Option<&Transaction>, config: CursorConfig) -> Result<SecondaryCursor> {
        let cursor = self.inner.db.open_cursor(txn, config)?;
        Ok(SecondaryCursor {
            cursor,
            secondary: Arc::clone(&self.inner),
        })
    }

    /// Live index entries.
    pub fn count(&self) -> Result<u64> {
        self.inner.db.count()
    }

    /// Tree shape and counters of the index.
    pub fn stats(&self) -> Result<DatabaseStats> {
        self.inner.db.stats()
    }

    /// Detaches the index from its primary (and foreign key database) and
    /// closes its handle.
    pub fn close(&self) -> Result<()> {
        {
            let env = self.inner.db.environment();
            let mut triggers = env.triggers().exclusive();
            triggers.remove_secondary(&Arc::downgrade(&self.inner));
        }
        debug!(db = %self.name(), primary = %self.inner.primary.name(), "secondary.close");
        self.inner.db.close()
    }
}

impl std::fmt::Debug for SecondaryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryDatabase")
            .field("db", &self.inner.db)
            .field("primary", &self.inner.primary.name())
            .field("key_creator", &self.inner.key_creator)
            .finish()
    }
}

/// Cursor over a secondary index. Every read returns the secondary key, the
/// primary key and the primary data.
pub struct SecondaryCursor {
    cursor: Cursor,
    secondary: Arc<SecondaryInner>,
}

impl SecondaryCursor {
    fn read(
        &mut self,
        mode: LockMode,
        then: Option<GetMode>,
        f: impl FnOnce(&mut CursorCore) -> Result<Lookup>,
    ) -> Result<Lookup<SecondaryEntry>> {
        let secondary = Arc::clone(&self.secondary);
        self.cursor.with_core(DbOperation::Get, |core| {
            let lookup = f(core)?;
            secondary.resolve(core, lookup, mode, then)
        })
    }

    pub(crate) fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    pub(crate) fn refers_to(&self, primary: &Database) -> bool {
        Arc::ptr_eq(self.secondary.primary.inner(), primary.inner())
    }

    /// Moves to the first entry.
    pub fn get_first(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Next), |core| core.position(true, mode))
    }

    /// Moves to the last entry.
    pub fn get_last(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Prev), |core| core.position(false, mode))
    }

    /// Moves to the next entry; an unpositioned cursor moves to the first.
    pub fn get_next(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Next), |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::Next)
            } else {
                core.position(true, mode)
            }
        })
    }

    /// Moves to the previous entry; an unpositioned cursor moves to the last.
    pub fn get_prev(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Prev), |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::Prev)
            } else {
                core.position(false, mode)
            }
        })
    }

    /// Moves to the next primary record sharing the current secondary key.
    pub fn get_next_dup(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::NextDup), |core| {
            core.check_initialized()?;
            core.retrieve_next(mode, GetMode::NextDup)
        })
    }

    /// Moves to the previous primary record sharing the current secondary key.
    pub fn get_prev_dup(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::PrevDup), |core| {
            core.check_initialized()?;
            core.retrieve_next(mode, GetMode::PrevDup)
        })
    }

    /// Moves to the first entry of the next secondary key.
    pub fn get_next_no_dup(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Next), |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::NextNoDup)
            } else {
                core.position(true, mode)
            }
        })
    }

    /// Moves to the last entry of the previous secondary key.
    pub fn get_prev_no_dup(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Prev), |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::PrevNoDup)
            } else {
                core.position(false, mode)
            }
        })
    }

    /// The entry under the cursor; `KeyEmpty` when it was deleted.
    pub fn get_current(&mut self, mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, None, |core| core.get_current(mode))
    }

    /// Moves to the first entry under `key`.
    pub fn get_search_key(&mut self, key: &[u8], mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::NextDup), |core| {
            core.search(key, None, mode, SearchMode::Set)
        })
    }

    /// Moves to the first entry whose key is >= `key`.
    pub fn get_search_key_range(&mut self, key: &[u8], mode: LockMode) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::Next), |core| {
            core.search(key, None, mode, SearchMode::SetRange)
        })
    }

    /// Moves to the entry mapping `key` to `primary_key`.
    pub fn get_search_both(
        &mut self,
        key: &[u8],
        primary_key: &[u8],
        mode: LockMode,
    ) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, None, |core| {
            core.search(key, Some(primary_key), mode, SearchMode::Both)
        })
        .map(|lookup| match lookup {
            Lookup::KeyEmpty => Lookup::NotFound,
            other => other,
        })
    }

    /// Moves to the entry under `key` with the smallest primary key >=
    /// `primary_key`.
    pub fn get_search_both_range(
        &mut self,
        key: &[u8],
        primary_key: &[u8],
        mode: LockMode,
    ) -> Result<Lookup<SecondaryEntry>> {
        self.read(mode, Some(GetMode::NextDup), |core| {
            core.search(key, Some(primary_key), mode, SearchMode::BothRange)
        })
    }

    /// Refused: index entries are written through the primary.
    pub fn put(&mut self, _key: &[u8], _data: &[u8]) -> Result<OperationStatus> {
        self.refuse(DbOperation::Put)
    }

    /// Refused: index entries are written through the primary.
    pub fn put_no_overwrite(&mut self, _key: &[u8], _data: &[u8]) -> Result<OperationStatus> {
        self.refuse(DbOperation::PutNoOverwrite)
    }

    /// Refused: index entries are written through the primary.
    pub fn put_no_dup_data(&mut self, _key: &[u8], _data: &[u8]) -> Result<OperationStatus> {
        self.refuse(DbOperation::PutNoDupData)
    }

    /// Refused: index entries are written through the primary.
    pub fn put_current(&mut self, _data: &[u8]) -> Result<OperationStatus> {
        self.refuse(DbOperation::PutCurrent)
    }

    fn refuse(&mut self, operation: DbOperation) -> Result<OperationStatus> {
        self.cursor
            .with_core(operation, |_| Err(CairnError::InvalidArgument("write on a secondary cursor")))
    }

    /// Deletes the primary record the current entry refers to.
    pub fn delete(&mut self) -> Result<OperationStatus> {
        let secondary = Arc::clone(&self.secondary);
        self.cursor.with_core(DbOperation::Delete, |core| {
            core.check_updates_allowed()?;
            core.check_initialized()?;
            let primary = secondary.primary.inner();
            primary.check_open()?;
            primary.check_writable()?;
            let Lookup::Found(entry) = core.get_current(LockMode::Rmw)? else {
                return Ok(OperationStatus::KeyEmpty);
            };
            let status = primary.delete_internal(core.locker(), &entry.data)?;
            if status.is_success() {
                Ok(status)
            } else {
                Err(secondary.corrupt("index entry refers to a missing primary record"))
            }
        })
    }

    /// Primary records sharing the current secondary key.
    pub fn count(&mut self) -> Result<usize> {
        self.cursor.count()
    }

    /// A new cursor on the same index and transaction.
    pub fn dup(&mut self, same_position: bool) -> Result<SecondaryCursor> {
        Ok(SecondaryCursor {
            cursor: self.cursor.dup(same_position)?,
            secondary: Arc::clone(&self.secondary),
        })
    }

    /// True while the cursor has a position.
    pub fn is_initialized(&self) -> bool {
        self.cursor.is_initialized()
    }

    /// Closes the cursor.
    pub fn close(&mut self) -> Result<()> {
        self.cursor.close()
    }
}

impl std::fmt::Debug for SecondaryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryCursor")
            .field("cursor", &self.cursor)
            .field("index", &self.secondary.db.name())
            .finish()
    }
}
