//! Per-handle trigger lists behind one environment-wide latch.
//!
//! Writes to a primary notify its triggers while the latch is held shared;
//! opening or closing a secondary takes it exclusively, so trigger lists
//! never change under a running notification. Notifications nest (a cascade
//! delete notifies the primary's own triggers), so shared access is
//! recursive.

use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::secondary::SecondaryInner;
use crate::primitives::concurrency::Locker;
use crate::types::{HandleId, Result};

/// A reaction to a write on the database the trigger is attached to.
#[derive(Clone)]
pub(crate) enum Trigger {
    /// Keeps a secondary index in step with its primary.
    SecondaryIndex(Weak<SecondaryInner>),
    /// Applies a secondary's foreign-key delete action when a foreign
    /// record is deleted.
    ForeignKey(Weak<SecondaryInner>),
}

impl Trigger {
    fn secondary(&self) -> &Weak<SecondaryInner> {
        match self {
            Trigger::SecondaryIndex(sec) | Trigger::ForeignKey(sec) => sec,
        }
    }

    /// Called after a put (`new` set) or before a delete (`new` unset).
    pub(crate) fn database_updated(
        &self,
        locker: &Arc<Locker>,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<()> {
        let Some(sec) = self.secondary().upgrade() else {
            return Ok(());
        };
        match self {
            Trigger::SecondaryIndex(_) => sec.update_secondary(locker, key, old, new),
            Trigger::ForeignKey(_) => {
                if new.is_none() {
                    sec.on_foreign_key_delete(locker, key)
                } else {
                    Ok(())
                }
            }
        }
    }
}

type TriggerList = SmallVec<[Trigger; 2]>;
type Lists = FxHashMap<HandleId, TriggerList>;

#[derive(Default)]
pub(crate) struct TriggerRegistry {
    lists: RwLock<Lists>,
}

impl TriggerRegistry {
    pub(crate) fn shared(&self) -> SharedTriggers<'_> {
        SharedTriggers(self.lists.read_recursive())
    }

    pub(crate) fn exclusive(&self) -> ExclusiveTriggers<'_> {
        ExclusiveTriggers(self.lists.write())
    }
}

pub(crate) struct SharedTriggers<'a>(RwLockReadGuard<'a, Lists>);

impl SharedTriggers<'_> {
    pub(crate) fn has_triggers(&self, handle: HandleId) -> bool {
        self.0.get(&handle).is_some_and(|list| !list.is_empty())
    }

    pub(crate) fn for_handle(&self, handle: HandleId) -> &[Trigger] {
        self.0.get(&handle).map(|list| list.as_slice()).unwrap_or(&[])
    }
}

pub(crate) struct ExclusiveTriggers<'a>(RwLockWriteGuard<'a, Lists>);

impl ExclusiveTriggers<'_> {
    /// Foreign-key triggers go first so a refused delete is reported before
    /// any index entry is touched.
    pub(crate) fn add(&mut self, handle: HandleId, trigger: Trigger) {
        let list = self.0.entry(handle).or_default();
        match trigger {
            Trigger::ForeignKey(_) => list.insert(0, trigger),
            Trigger::SecondaryIndex(_) => list.push(trigger),
        }
    }

    /// Drops every trigger that belongs to `secondary`.
    pub(crate) fn remove_secondary(&mut self, secondary: &Weak<SecondaryInner>) {
        for list in self.0.values_mut() {
            list.retain(|trigger| !Weak::ptr_eq(trigger.secondary(), secondary));
        }
        self.0.retain(|_, list| !list.is_empty());
    }

    /// Drops the whole list of `handle`.
    pub(crate) fn clear(&mut self, handle: HandleId) -> usize {
        self.0.remove(&handle).map(|list| list.len()).unwrap_or(0)
    }
}
