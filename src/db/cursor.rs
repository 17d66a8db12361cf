//! Database cursors.
//!
//! Every operation that can move or modify a positioned cursor works on a
//! copy of its node cursor and installs the copy only when the operation
//! succeeds, so a failed call leaves the position where it was. Under
//! serializable isolation, moves range-lock the records they pass over and
//! restart from scratch when a range lock had to wait for an insert.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::config::{CursorConfig, LockMode};
use super::database::{DatabaseInner, DbOperation};
use crate::primitives::concurrency::{LockType, Locker};
use crate::storage::btree::{step, NodeCursorImpl, SearchMode, Step};
use crate::types::{CairnError, Lookup, OperationStatus, Result};

/// Unwraps a [`Step`] inside a restart loop, starting the next iteration on
/// [`Step::Restart`].
macro_rules! or_restart {
    ($e:expr) => {
        match $e {
            Step::Done(value) => value,
            Step::Restart => continue,
        }
    };
}

/// Where an operation does its work: on the cursor's own node cursor, or on
/// a clone that replaces it on success.
pub(crate) enum Working {
    InPlace,
    Cloned(NodeCursorImpl),
}

fn target<'a>(imp: &'a mut NodeCursorImpl, working: &'a mut Working) -> &'a mut NodeCursorImpl {
    match working {
        Working::InPlace => imp,
        Working::Cloned(dup) => dup,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum GetMode {
    Next,
    Prev,
    NextDup,
    PrevDup,
    NextNoDup,
    PrevNoDup,
}

impl GetMode {
    fn is_forward(self) -> bool {
        matches!(self, GetMode::Next | GetMode::NextDup | GetMode::NextNoDup)
    }

    fn no_dup(self) -> bool {
        matches!(self, GetMode::NextNoDup | GetMode::PrevNoDup)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PutMode {
    Overwrite,
    NoOverwrite,
    NoDupData,
    Current,
}

impl PutMode {
    fn operation(self) -> DbOperation {
        match self {
            PutMode::Overwrite => DbOperation::Put,
            PutMode::NoOverwrite => DbOperation::PutNoOverwrite,
            PutMode::NoDupData => DbOperation::PutNoDupData,
            PutMode::Current => DbOperation::PutCurrent,
        }
    }
}

/// State behind a [`Cursor`]; also used directly by single-shot database
/// operations and index maintenance.
pub(crate) struct CursorCore {
    db: Arc<DatabaseInner>,
    imp: NodeCursorImpl,
    read_uncommitted_default: bool,
    serializable_default: bool,
    updates_prohibited: bool,
    non_cloning: bool,
}

impl CursorCore {
    pub(crate) fn new(db: Arc<DatabaseInner>, locker: Arc<Locker>, config: CursorConfig) -> Self {
        let read_uncommitted_default = config.read_uncommitted || locker.read_uncommitted_default();
        let serializable_default = locker.is_serializable();
        let updates_prohibited = db.config().transactional && !locker.is_transactional();
        let imp = NodeCursorImpl::new(Arc::clone(db.tree()), locker, config.retain_locks);
        Self {
            db,
            imp,
            read_uncommitted_default,
            serializable_default,
            updates_prohibited,
            non_cloning: false,
        }
    }

    /// A cursor scoped to one operation of `locker`: it keeps every lock for
    /// the locker's operation end and works in place.
    pub(crate) fn internal(db: Arc<DatabaseInner>, locker: Arc<Locker>) -> Self {
        let mut core = Self::new(
            db,
            locker,
            CursorConfig {
                retain_locks: true,
                ..CursorConfig::default()
            },
        );
        core.non_cloning = true;
        core
    }

    pub(crate) fn db(&self) -> &Arc<DatabaseInner> {
        &self.db
    }

    pub(crate) fn locker(&self) -> &Arc<Locker> {
        self.imp.locker()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.imp.is_initialized()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.imp.is_closed()
    }

    pub(crate) fn check_state(&self) -> Result<()> {
        self.db.check_open()?;
        if self.imp.is_closed() {
            return Err(CairnError::CursorClosed);
        }
        if self.imp.locker().is_transactional() {
            self.imp.locker().check_open()?;
        }
        Ok(())
    }

    pub(crate) fn check_initialized(&self) -> Result<()> {
        if self.imp.is_initialized() {
            Ok(())
        } else {
            Err(CairnError::CursorNotInitialized)
        }
    }

    pub(crate) fn check_updates_allowed(&self) -> Result<()> {
        if self.updates_prohibited {
            return Err(CairnError::NotPermitted {
                operation: "write",
                handle: "non-transactional cursor on a transactional database",
            });
        }
        if self.db.config().read_only {
            return Err(CairnError::NotPermitted {
                operation: "write",
                handle: "read-only",
            });
        }
        Ok(())
    }

    pub(crate) fn is_read_uncommitted(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::ReadUncommitted => true,
            LockMode::Default => self.read_uncommitted_default,
            LockMode::Rmw => false,
        }
    }

    fn is_serializable(&self, mode: LockMode) -> bool {
        self.serializable_default && !self.is_read_uncommitted(mode)
    }

    fn lock_type(&self, mode: LockMode, range: bool) -> Option<LockType> {
        if self.is_read_uncommitted(mode) {
            return None;
        }
        Some(match (mode, range) {
            (LockMode::Rmw, false) => LockType::Write,
            (LockMode::Rmw, true) => LockType::RangeWrite,
            (_, false) => LockType::Read,
            (_, true) => LockType::RangeRead,
        })
    }

    fn begin_read(&self) -> Working {
        if self.non_cloning || !self.imp.is_initialized() {
            Working::InPlace
        } else {
            Working::Cloned(self.imp.clone_cursor())
        }
    }

    fn begin_write(&self) -> Working {
        if self.non_cloning {
            Working::InPlace
        } else {
            Working::Cloned(self.imp.clone_cursor())
        }
    }

    /// Installs the clone on success and closes whichever node cursor lost.
    fn end(&mut self, working: Working, success: bool) {
        match working {
            Working::InPlace => {
                if !success {
                    self.imp.reset();
                }
            }
            Working::Cloned(mut dup) => {
                if success {
                    std::mem::swap(&mut self.imp, &mut dup);
                }
                dup.close();
            }
        }
    }

    fn finish<T>(
        &mut self,
        working: Working,
        result: Result<Step<T>>,
        success: impl FnOnce(&T) -> bool,
    ) -> Result<Step<T>> {
        let ok = matches!(&result, Ok(Step::Done(value)) if success(value));
        self.end(working, ok);
        result
    }

    fn insertion_skipped(&self, working: &Working, mode: GetMode) -> bool {
        match working {
            Working::InPlace => false,
            Working::Cloned(dup) => self.imp.insertion_skipped(dup, mode.is_forward(), mode.no_dup()),
        }
    }

    /// First (`first`) or last record.
    pub(crate) fn position(&mut self, first: bool, mode: LockMode) -> Result<Lookup> {
        loop {
            let serializable = self.is_serializable(mode);
            if serializable && !first {
                or_restart!(self.imp.lock_eof(LockType::RangeRead)?);
            }
            let lock_type = self.lock_type(mode, serializable && first);
            let lookup = or_restart!(self.position_allow_phantoms(first, lock_type)?);
            if serializable && first && !lookup.is_found() {
                or_restart!(self.imp.lock_eof(LockType::RangeRead)?);
            }
            return Ok(lookup);
        }
    }

    fn position_allow_phantoms(&mut self, first: bool, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
        let mut working = self.begin_read();
        let result = position_on(target(&mut self.imp, &mut working), first, lock_type);
        self.finish(working, result, Lookup::is_found)
    }

    /// Keyed search.
    pub(crate) fn search(
        &mut self,
        key: &[u8],
        data: Option<&[u8]>,
        mode: LockMode,
        search_mode: SearchMode,
    ) -> Result<Lookup> {
        let advance_on_key_miss = self.db.env().config().both_range_advance_on_key_miss;
        loop {
            let serializable = self.is_serializable(mode);
            let search_lock = self.lock_type(mode, false);
            if !serializable {
                let (lookup, _) = or_restart!(self.search_allow_phantoms(
                    key,
                    data,
                    search_lock,
                    search_lock,
                    search_mode,
                    advance_on_key_miss,
                )?);
                return Ok(lookup);
            }
            let advance_lock = self.lock_type(mode, true);
            if search_mode.is_exact() {
                let lookup = or_restart!(self.search_exact_and_range_lock(
                    key,
                    data,
                    search_lock,
                    advance_lock,
                    search_mode,
                )?);
                return Ok(lookup);
            }
            let (lookup, _) = or_restart!(self.search_allow_phantoms(
                key,
                data,
                search_lock,
                advance_lock,
                search_mode,
                advance_on_key_miss,
            )?);
            if !lookup.is_found() {
                or_restart!(self.imp.lock_eof(LockType::RangeRead)?);
            }
            return Ok(lookup);
        }
    }

    fn search_allow_phantoms(
        &mut self,
        key: &[u8],
        data: Option<&[u8]>,
        search_lock: Option<LockType>,
        advance_lock: Option<LockType>,
        search_mode: SearchMode,
        advance_on_key_miss: bool,
    ) -> Result<Step<(Lookup, bool)>> {
        let mut working = self.begin_read();
        let result = search_internal(
            target(&mut self.imp, &mut working),
            key,
            data,
            search_lock,
            advance_lock,
            search_mode,
            advance_on_key_miss,
        );
        self.finish(working, result, |(lookup, _)| lookup.is_found())
    }

    /// Runs an exact search as a range search so the following key gets
    /// range-locked, reporting not-found (without moving) when the match is
    /// not exact.
    fn search_exact_and_range_lock(
        &mut self,
        key: &[u8],
        data: Option<&[u8]>,
        search_lock: Option<LockType>,
        advance_lock: Option<LockType>,
        search_mode: SearchMode,
    ) -> Result<Step<Lookup>> {
        let mut working = self.begin_read();
        let dup_order = Arc::clone(self.imp.tree().dup_order());
        let result = search_internal(
            target(&mut self.imp, &mut working),
            key,
            data,
            search_lock,
            advance_lock,
            search_mode.as_range(),
            true,
        )
        .map(|step| {
            step.map(|(lookup, key_changed)| {
                let no_next_key = !key_changed && !lookup.is_found();
                let lookup = match lookup {
                    Lookup::Found(_) if key_changed => Lookup::NotFound,
                    Lookup::Found(entry)
                        if search_mode == SearchMode::Both
                            && data.is_some_and(|d| dup_order.compare(&entry.data, d) != Ordering::Equal) =>
                    {
                        Lookup::NotFound
                    }
                    other => other,
                };
                (lookup, no_next_key)
            })
        });
        let (lookup, no_next_key) = step!(self.finish(working, result, |(lookup, _)| lookup.is_found())?);
        if no_next_key {
            step!(self.imp.lock_eof(LockType::RangeRead)?);
        }
        Ok(Step::Done(lookup))
    }

    /// Relative move.
    pub(crate) fn retrieve_next(&mut self, mode: LockMode, get_mode: GetMode) -> Result<Lookup> {
        loop {
            if !self.is_serializable(mode) {
                let lock_type = self.lock_type(mode, false);
                return Ok(or_restart!(self.retrieve_next_allow_phantoms(lock_type, get_mode)?));
            }
            if get_mode == GetMode::NextDup {
                return Ok(or_restart!(self.get_next_dup_and_range_lock(mode)?));
            }
            if !get_mode.is_forward() {
                or_restart!(self.range_lock_current_position(get_mode)?);
            }
            let lock_type = self.lock_type(mode, get_mode.is_forward());
            let lookup = or_restart!(self.retrieve_next_allow_phantoms(lock_type, get_mode)?);
            if get_mode.is_forward() && !lookup.is_found() {
                or_restart!(self.imp.lock_eof(LockType::RangeRead)?);
            }
            return Ok(lookup);
        }
    }

    fn retrieve_next_allow_phantoms(
        &mut self,
        lock_type: Option<LockType>,
        get_mode: GetMode,
    ) -> Result<Step<Lookup>> {
        loop {
            let mut working = self.begin_read();
            let dup = target(&mut self.imp, &mut working);
            let result = match get_mode {
                GetMode::Next => dup.get_next(true, lock_type).map(|s| s.map(|(l, _)| l)),
                GetMode::Prev => dup.get_next(false, lock_type).map(|s| s.map(|(l, _)| l)),
                GetMode::NextDup => dup.get_next_duplicate(true, lock_type),
                GetMode::PrevDup => dup.get_next_duplicate(false, lock_type),
                GetMode::NextNoDup => dup.get_next_no_dup(true, lock_type),
                GetMode::PrevNoDup => dup.get_next_no_dup(false, lock_type),
            };
            let lookup = match result {
                Ok(Step::Done(lookup)) => lookup,
                other => {
                    self.end(working, false);
                    return other;
                }
            };
            if self.insertion_skipped(&working, get_mode) {
                trace!(db = %self.db.name(), ?get_mode, "cursor.insertion_skipped");
                self.end(working, false);
                continue;
            }
            let found = lookup.is_found();
            self.end(working, found);
            return Ok(Step::Done(lookup));
        }
    }

    fn get_next_dup_and_range_lock(&mut self, mode: LockMode) -> Result<Step<Lookup>> {
        let lock_type = self.lock_type(mode, true);
        let (lookup, no_next_key) = loop {
            let mut working = self.begin_read();
            let result = target(&mut self.imp, &mut working).get_next(true, lock_type);
            let (lookup, key_changed) = match result {
                Ok(Step::Done(moved)) => moved,
                Ok(Step::Restart) => {
                    self.end(working, false);
                    return Ok(Step::Restart);
                }
                Err(err) => {
                    self.end(working, false);
                    return Err(err);
                }
            };
            let no_next_key = !lookup.is_found();
            let lookup = if key_changed { Lookup::NotFound } else { lookup };
            if self.insertion_skipped(&working, GetMode::Next) {
                self.end(working, false);
                continue;
            }
            let found = lookup.is_found();
            self.end(working, found);
            break (lookup, no_next_key);
        };
        if no_next_key {
            step!(self.imp.lock_eof(LockType::RangeRead)?);
        }
        Ok(Step::Done(lookup))
    }

    /// Range-locks the record a backward move starts from, or the record (or
    /// EOF) after it when it is gone, so nothing can be inserted between.
    fn range_lock_current_position(&mut self, get_mode: GetMode) -> Result<Step<()>> {
        let lock_type = Some(LockType::RangeRead);
        let mut dup = self.imp.clone_cursor();
        let first = if get_mode == GetMode::PrevNoDup {
            dup.get_first_duplicate(lock_type)
        } else {
            dup.get_current(lock_type)
        };
        let mut found = match first {
            Ok(Step::Done(lookup)) => lookup.is_found(),
            other => {
                dup.close();
                return other.map(|step| step.map(|_| ()));
            }
        };
        if !found {
            loop {
                let next = match dup.get_next(true, lock_type) {
                    Ok(Step::Done((lookup, _))) => lookup,
                    other => {
                        dup.close();
                        return other.map(|step| step.map(|_| ()));
                    }
                };
                if self.imp.insertion_skipped(&dup, true, false) {
                    dup.close();
                    dup = self.imp.clone_cursor();
                    continue;
                }
                found = next.is_found();
                break;
            }
        }
        dup.close();
        if !found {
            step!(self.imp.lock_eof(LockType::RangeRead)?);
        }
        Ok(Step::Done(()))
    }

    /// Record under the cursor, without moving.
    pub(crate) fn get_current(&mut self, mode: LockMode) -> Result<Lookup> {
        self.check_initialized()?;
        let lock_type = self.lock_type(mode, false);
        loop {
            return Ok(or_restart!(self.imp.get_current(lock_type)?));
        }
    }

    /// Writes `data` under `key` (or under the current position for
    /// [`PutMode::Current`]) and notifies the database's triggers.
    pub(crate) fn put(&mut self, key: Option<&[u8]>, data: &[u8], put_mode: PutMode) -> Result<OperationStatus> {
        self.check_updates_allowed()?;
        if put_mode == PutMode::NoDupData && !self.db.config().sorted_duplicates {
            return Err(CairnError::InvalidArgument(
                "put_no_dup_data requires a database with sorted duplicates",
            ));
        }
        let has_triggers = self.db.has_triggers();
        let (status, key, old) = self.put_no_notify(key, data, put_mode)?;
        if has_triggers && status.is_success() {
            self.db
                .notify_triggers(self.imp.locker(), &key, old.as_deref(), Some(data))?;
        }
        Ok(status)
    }

    fn put_no_notify(
        &mut self,
        key: Option<&[u8]>,
        data: &[u8],
        put_mode: PutMode,
    ) -> Result<(OperationStatus, Vec<u8>, Option<Vec<u8>>)> {
        let mut next_key_lock = None;
        if put_mode != PutMode::Current && self.imp.locker().other_serializable_active() {
            let key = key.ok_or(CairnError::InvalidArgument("put requires a key"))?;
            let buddy = self.imp.locker().new_buddy();
            let mut next_key = NodeCursorImpl::new(Arc::clone(self.imp.tree()), buddy, false);
            if let Err(err) = next_key.lock_next_key_for_insert(key, data) {
                next_key.close();
                return Err(err);
            }
            next_key_lock = Some(next_key);
        }
        let result = self.put_allow_phantoms(key, data, put_mode);
        if let Some(mut next_key) = next_key_lock {
            next_key.close();
        }
        result
    }

    fn put_allow_phantoms(
        &mut self,
        key: Option<&[u8]>,
        data: &[u8],
        put_mode: PutMode,
    ) -> Result<(OperationStatus, Vec<u8>, Option<Vec<u8>>)> {
        if put_mode == PutMode::Current {
            self.check_initialized()?;
        }
        let duplicates = self.db.config().sorted_duplicates;
        let mut working = self.begin_write();
        let dup = target(&mut self.imp, &mut working);
        let result = match (put_mode, key) {
            (PutMode::Current, _) => dup.put_current(data).map(|(status, old)| match old {
                Some(old) => (status, old.key, Some(old.data)),
                None => (status, Vec::new(), None),
            }),
            (_, None) => Err(CairnError::InvalidArgument("put requires a key")),
            (PutMode::Overwrite, Some(key)) => match dup.put_ln(key, data, duplicates) {
                Ok(OperationStatus::KeyExist) => dup
                    .put_current(data)
                    .map(|(status, old)| (status, key.to_vec(), old.map(|old| old.data))),
                other => other.map(|status| (status, key.to_vec(), None)),
            },
            (PutMode::NoOverwrite, Some(key)) => {
                dup.put_ln(key, data, false).map(|status| (status, key.to_vec(), None))
            }
            (PutMode::NoDupData, Some(key)) => {
                dup.put_ln(key, data, true).map(|status| (status, key.to_vec(), None))
            }
        };
        let success = matches!(&result, Ok((status, _, _)) if status.is_success());
        self.end(working, success);
        result
    }

    /// Deletes the record under the cursor, notifying triggers first.
    pub(crate) fn delete(&mut self) -> Result<OperationStatus> {
        self.check_updates_allowed()?;
        self.check_initialized()?;
        if self.db.has_triggers() {
            let Lookup::Found(old) = self.get_current(LockMode::Rmw)? else {
                return Ok(OperationStatus::KeyEmpty);
            };
            self.db
                .notify_triggers(self.imp.locker(), &old.key, Some(&old.data), None)?;
        }
        self.delete_no_notify()
    }

    pub(crate) fn delete_no_notify(&mut self) -> Result<OperationStatus> {
        let mut working = self.begin_write();
        let result = target(&mut self.imp, &mut working).delete();
        let success = matches!(&result, Ok(status) if status.is_success());
        self.end(working, success);
        result
    }

    /// Live duplicates of the current key. Counts through a buddy of the
    /// cursor's locker so no lock outlives the call.
    pub(crate) fn count(&mut self, mode: LockMode) -> Result<usize> {
        self.check_initialized()?;
        let lock_type = self.lock_type(mode, false);
        let buddy = self.imp.locker().new_buddy();
        let mut dup = self.imp.clone_with_locker(buddy);
        let result = loop {
            match dup.count(lock_type) {
                Ok(Step::Done(count)) => break Ok(count),
                Ok(Step::Restart) => continue,
                Err(err) => break Err(err),
            }
        };
        dup.close();
        result
    }

    /// A second core sharing this one's database and locker family.
    pub(crate) fn duplicate(&self, same_position: bool) -> Self {
        let imp = if same_position {
            self.imp.clone_cursor()
        } else {
            let locker = if self.imp.locker().is_transactional() {
                Arc::clone(self.imp.locker())
            } else {
                self.imp.locker().new_non_txn_locker()
            };
            NodeCursorImpl::new(Arc::clone(self.imp.tree()), locker, false)
        };
        Self {
            db: Arc::clone(&self.db),
            imp,
            read_uncommitted_default: self.read_uncommitted_default,
            serializable_default: self.serializable_default,
            updates_prohibited: self.updates_prohibited,
            non_cloning: self.non_cloning,
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.imp.is_closed() {
            self.imp.close();
        }
    }
}

impl Drop for CursorCore {
    fn drop(&mut self) {
        self.close();
    }
}

fn position_on(dup: &mut NodeCursorImpl, first: bool, lock_type: Option<LockType>) -> Result<Step<Lookup>> {
    dup.position_first_or_last(first);
    match step!(dup.fetch_current(lock_type, first)?) {
        Lookup::Found(entry) => Ok(Step::Done(Lookup::Found(entry))),
        _ => Ok(dup.get_next(first, lock_type)?.map(|(lookup, _)| lookup)),
    }
}

/// Positions `dup` for a keyed search and settles it on a live record,
/// advancing past tombstones and range misses. The flag reports whether the
/// advance changed the key.
fn search_internal(
    dup: &mut NodeCursorImpl,
    key: &[u8],
    data: Option<&[u8]>,
    search_lock: Option<LockType>,
    advance_lock: Option<LockType>,
    mode: SearchMode,
    advance_on_key_miss: bool,
) -> Result<Step<(Lookup, bool)>> {
    let result = settle_after_search(dup, key, data, search_lock, advance_lock, mode, advance_on_key_miss);
    dup.release_bins();
    result
}

fn settle_after_search(
    dup: &mut NodeCursorImpl,
    key: &[u8],
    data: Option<&[u8]>,
    search_lock: Option<LockType>,
    advance_lock: Option<LockType>,
    mode: SearchMode,
    advance_on_key_miss: bool,
) -> Result<Step<(Lookup, bool)>> {
    let flags = step!(dup.search_and_position(key, data, mode, search_lock)?);
    if !flags.found {
        return Ok(Step::Done((Lookup::NotFound, false)));
    }
    let range_match = match mode {
        SearchMode::SetRange => !flags.exact_key,
        SearchMode::BothRange => !flags.exact_key || !flags.exact_data,
        SearchMode::Set | SearchMode::Both => false,
    };
    if !range_match {
        if let Lookup::Found(entry) = step!(dup.fetch_current(search_lock, true)?) {
            return Ok(Step::Done((Lookup::Found(entry), false)));
        }
    }
    if flags.found_last {
        return Ok(Step::Done((Lookup::NotFound, false)));
    }
    let mut key_changed = false;
    let mut lookup = match mode {
        SearchMode::Set => step!(dup.get_next_duplicate(true, advance_lock)?),
        SearchMode::Both => Lookup::NotFound,
        SearchMode::SetRange | SearchMode::BothRange => {
            if flags.exact_key {
                let (lookup, changed) = step!(dup.get_next(true, advance_lock)?);
                key_changed = if mode.matches_data() {
                    lookup.is_found()
                } else {
                    changed
                };
                lookup
            } else if mode.matches_data() && !advance_on_key_miss {
                Lookup::NotFound
            } else {
                let lookup = step!(dup.get_next_no_dup(true, advance_lock)?);
                key_changed = lookup.is_found();
                lookup
            }
        }
    };
    if mode.matches_data() {
        if let Lookup::Found(entry) = &lookup {
            if dup.tree().key_order().compare(&entry.key, key) != Ordering::Equal {
                lookup = Lookup::NotFound;
            }
        }
    }
    Ok(Step::Done((lookup, key_changed)))
}

/// A cursor over one database.
///
/// Cursors are used by one thread at a time. A failed move or write leaves
/// the position unchanged. Cursors opened without a transaction release the
/// previous operation's locks when the next one succeeds.
pub struct Cursor {
    core: Arc<Mutex<CursorCore>>,
    id: u64,
}

impl Cursor {
    pub(crate) fn register(core: CursorCore) -> Self {
        let db = Arc::clone(core.db());
        let core = Arc::new(Mutex::new(core));
        let id = db.register_cursor(&core);
        trace!(db = %db.name(), cursor = id, "cursor.open");
        Self { core, id }
    }

    pub(crate) fn with_core<T>(
        &mut self,
        operation: DbOperation,
        f: impl FnOnce(&mut CursorCore) -> Result<T>,
    ) -> Result<T> {
        let mut core = self.core.lock();
        let result = core
            .check_state()
            .and_then(|_| core.db().check_permitted(operation))
            .and_then(|_| f(&mut core));
        core.db().env().check_result(result)
    }

    /// Name of the cursor's database.
    pub fn database_name(&self) -> String {
        self.core.lock().db().name().to_string()
    }

    /// True while the cursor has a position.
    pub fn is_initialized(&self) -> bool {
        self.core.lock().is_initialized()
    }

    /// Moves to the first record.
    pub fn get_first(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| core.position(true, mode))
    }

    /// Moves to the last record.
    pub fn get_last(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| core.position(false, mode))
    }

    /// Moves to the next record; an unpositioned cursor moves to the first.
    pub fn get_next(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::Next)
            } else {
                core.position(true, mode)
            }
        })
    }

    /// Moves to the previous record; an unpositioned cursor moves to the last.
    pub fn get_prev(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::Prev)
            } else {
                core.position(false, mode)
            }
        })
    }

    /// Moves to the next duplicate of the current key.
    pub fn get_next_dup(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            core.check_initialized()?;
            core.retrieve_next(mode, GetMode::NextDup)
        })
    }

    /// Moves to the previous duplicate of the current key.
    pub fn get_prev_dup(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            core.check_initialized()?;
            core.retrieve_next(mode, GetMode::PrevDup)
        })
    }

    /// Moves to the first record of the next key.
    pub fn get_next_no_dup(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::NextNoDup)
            } else {
                core.position(true, mode)
            }
        })
    }

    /// Moves to the last record of the previous key.
    pub fn get_prev_no_dup(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            if core.is_initialized() {
                core.retrieve_next(mode, GetMode::PrevNoDup)
            } else {
                core.position(false, mode)
            }
        })
    }

    /// Returns the record under the cursor; `KeyEmpty` if it was deleted.
    pub fn get_current(&mut self, mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| core.get_current(mode))
    }

    /// Moves to `key`.
    pub fn get_search_key(&mut self, key: &[u8], mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| core.search(key, None, mode, SearchMode::Set))
    }

    /// Moves to the smallest key >= `key`.
    pub fn get_search_key_range(&mut self, key: &[u8], mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::Get, |core| {
            core.search(key, None, mode, SearchMode::SetRange)
        })
    }

    /// Moves to the exact `key`/`data` pair.
    pub fn get_search_both(&mut self, key: &[u8], data: &[u8], mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::GetSearchBoth, |core| {
            core.search(key, Some(data), mode, SearchMode::Both)
        })
    }

    /// Moves to `key` with the smallest data >= `data`.
    pub fn get_search_both_range(&mut self, key: &[u8], data: &[u8], mode: LockMode) -> Result<Lookup> {
        self.with_core(DbOperation::GetSearchBoth, |core| {
            core.search(key, Some(data), mode, SearchMode::BothRange)
        })
    }

    /// Stores `key`/`data`, replacing the data of an existing key (or
    /// leaving an identical duplicate in place).
    pub fn put(&mut self, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        self.write(PutMode::Overwrite, Some(key), data)
    }

    /// Stores `key`/`data` unless the key exists.
    pub fn put_no_overwrite(&mut self, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        self.write(PutMode::NoOverwrite, Some(key), data)
    }

    /// Stores `key`/`data` unless that exact pair exists.
    pub fn put_no_dup_data(&mut self, key: &[u8], data: &[u8]) -> Result<OperationStatus> {
        self.write(PutMode::NoDupData, Some(key), data)
    }

    /// Replaces the data of the record under the cursor.
    pub fn put_current(&mut self, data: &[u8]) -> Result<OperationStatus> {
        self.write(PutMode::Current, None, data)
    }

    fn write(&mut self, put_mode: PutMode, key: Option<&[u8]>, data: &[u8]) -> Result<OperationStatus> {
        self.with_core(put_mode.operation(), |core| core.put(key, data, put_mode))
    }

    /// Deletes the record under the cursor. The cursor stays on the deleted
    /// slot; `get_current` then reports `KeyEmpty`.
    pub fn delete(&mut self) -> Result<OperationStatus> {
        self.with_core(DbOperation::Delete, CursorCore::delete)
    }

    /// Live records sharing the current key.
    pub fn count(&mut self) -> Result<usize> {
        self.with_core(DbOperation::Count, |core| core.count(LockMode::Default))
    }

    /// A new cursor on the same database and transaction, optionally at the
    /// same position.
    pub fn dup(&mut self, same_position: bool) -> Result<Cursor> {
        let core = self.with_core(DbOperation::OpenCursor, |core| Ok(core.duplicate(same_position)))?;
        Ok(Cursor::register(core))
    }

    /// Closes the cursor, releasing the locks of a cursor opened without a
    /// transaction. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let mut core = self.core.lock();
        if core.is_closed() {
            return Ok(());
        }
        core.close();
        core.db().unregister_cursor(self.id);
        debug!(db = %core.db().name(), cursor = self.id, "cursor.close");
        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<Mutex<CursorCore>> {
        &self.core
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("id", &self.id).finish()
    }
}

/// Closes a registered cursor from another thread, waiting at most
/// `timeout` for an operation in progress.
pub(crate) fn force_close(core: &Mutex<CursorCore>, timeout: Duration) -> Result<bool> {
    let Some(mut core) = core.try_lock_for(timeout) else {
        return Err(CairnError::InvalidArgument("cursor busy in another thread"));
    };
    if core.is_closed() {
        return Ok(false);
    }
    core.close();
    Ok(true)
}
