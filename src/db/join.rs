//! Equality joins over secondary indexes of one primary.

use std::sync::Arc;

use tracing::trace;

use super::config::{JoinConfig, LockMode};
use super::cursor::{Cursor, CursorCore};
use super::database::{Database, DbOperation};
use super::secondary::SecondaryCursor;
use crate::storage::btree::SearchMode;
use crate::types::{CairnError, Entry, Lookup, Result};

struct Leg {
    cursor: Cursor,
    key: Vec<u8>,
}

/// Walks the primary keys present under the current key of every input
/// cursor.
///
/// Candidates come from the duplicate set of the first cursor (the one with
/// the fewest duplicates unless sorting is disabled); each candidate is kept
/// only when every other cursor also maps its key to it. The input cursors
/// are duplicated, so their own positions never change.
pub struct JoinCursor {
    primary: Database,
    legs: Vec<Leg>,
    config: JoinConfig,
    started: bool,
}

impl JoinCursor {
    pub(crate) fn new(primary: Database, cursors: &mut [&mut SecondaryCursor], config: JoinConfig) -> Result<Self> {
        if cursors.is_empty() {
            return Err(CairnError::InvalidArgument("join needs at least one cursor"));
        }
        let mut legs = Vec::with_capacity(cursors.len());
        for secondary in cursors.iter_mut() {
            if !secondary.refers_to(&primary) {
                return Err(CairnError::InvalidArgument(
                    "join cursor indexes a different primary database",
                ));
            }
            let cursor = secondary.cursor_mut();
            let key = match cursor.get_current(LockMode::Default)? {
                Lookup::Found(entry) => entry.key,
                _ => return Err(CairnError::CursorNotInitialized),
            };
            legs.push((cursor.dup(true)?, key));
        }
        let mut counted = Vec::with_capacity(legs.len());
        for (mut cursor, key) in legs {
            let count = if config.no_sort { 0 } else { cursor.count()? };
            counted.push((count, Leg { cursor, key }));
        }
        counted.sort_by_key(|(count, _)| *count);
        trace!(
            primary = %primary.name(),
            legs = counted.len(),
            first_count = counted.first().map(|(count, _)| *count).unwrap_or(0),
            "join.open"
        );
        Ok(Self {
            primary,
            legs: counted.into_iter().map(|(_, leg)| leg).collect(),
            config,
            started: false,
        })
    }

    /// The primary database the join reads from.
    pub fn primary(&self) -> &Database {
        &self.primary
    }

    /// Settings the join was opened with.
    pub fn config(&self) -> JoinConfig {
        self.config
    }

    /// Next primary key present under every input key.
    pub fn get_next(&mut self, mode: LockMode) -> Result<Lookup<Vec<u8>>> {
        let Some((first, rest)) = self.legs.split_first_mut() else {
            return Ok(Lookup::NotFound);
        };
        'candidates: loop {
            let candidate = if self.started {
                first.cursor.get_next_dup(mode)?
            } else {
                self.started = true;
                first.cursor.get_current(mode)?
            };
            let primary_key = match candidate {
                Lookup::Found(entry) => entry.data,
                Lookup::KeyEmpty => continue,
                Lookup::NotFound => return Ok(Lookup::NotFound),
            };
            for leg in rest.iter_mut() {
                let key = leg.key.as_slice();
                let found = leg.cursor.with_core(DbOperation::Get, |core| {
                    core.search(key, Some(primary_key.as_slice()), mode, SearchMode::Both)
                })?;
                if !found.is_found() {
                    continue 'candidates;
                }
            }
            return Ok(Lookup::Found(primary_key));
        }
    }

    /// Next joined primary record.
    pub fn get_next_with_data(&mut self, mode: LockMode) -> Result<Lookup<Entry>> {
        loop {
            let primary_key = match self.get_next(mode)? {
                Lookup::Found(key) => key,
                Lookup::NotFound => return Ok(Lookup::NotFound),
                Lookup::KeyEmpty => return Ok(Lookup::KeyEmpty),
            };
            let primary = Arc::clone(self.primary.inner());
            let record = self.legs[0].cursor.with_core(DbOperation::Get, |core| {
                primary.check_open()?;
                let mut cursor = CursorCore::internal(Arc::clone(&primary), Arc::clone(core.locker()));
                cursor.search(&primary_key, None, mode, SearchMode::Set)
            })?;
            match record {
                Lookup::Found(entry) => return Ok(Lookup::Found(entry)),
                _ if mode == LockMode::ReadUncommitted => continue,
                _ => {
                    return Err(CairnError::SecondaryCorrupt {
                        database: self.primary.name().to_string(),
                        reason: "joined key missing from the primary",
                    })
                }
            }
        }
    }

    /// Closes the duplicated cursors.
    pub fn close(&mut self) -> Result<()> {
        for leg in &mut self.legs {
            leg.cursor.close()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for JoinCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinCursor")
            .field("primary", &self.primary.name())
            .field("legs", &self.legs.len())
            .finish()
    }
}
