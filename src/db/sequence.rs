//! Persistent counters stored as ordinary records.
//!
//! Record layout (big-endian): version byte, flag byte, range minimum,
//! range maximum, next value to reserve. A handle reserves `cache_size`
//! values per write and hands them out from memory.

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::config::SequenceConfig;
use super::database::Database;
use super::transaction::Transaction;
use crate::types::{CairnError, Result};

const SEQUENCE_VERSION: u8 = 1;
const FLAG_DECREMENT: u8 = 0x01;
const FLAG_WRAP: u8 = 0x02;
const FLAG_OVERFLOW: u8 = 0x04;
const RECORD_LEN: usize = 2 + 3 * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SequenceRecord {
    decrement: bool,
    wrap: bool,
    overflow: bool,
    range_min: i64,
    range_max: i64,
    stored: i64,
}

impl SequenceRecord {
    fn new(config: &SequenceConfig) -> Self {
        Self {
            decrement: config.decrement,
            wrap: config.wrap,
            overflow: false,
            range_min: config.range_min,
            range_max: config.range_max,
            stored: config.initial_value,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.decrement {
            flags |= FLAG_DECREMENT;
        }
        if self.wrap {
            flags |= FLAG_WRAP;
        }
        if self.overflow {
            flags |= FLAG_OVERFLOW;
        }
        let mut buf = Vec::with_capacity(RECORD_LEN);
        buf.push(SEQUENCE_VERSION);
        buf.push(flags);
        buf.extend_from_slice(&self.range_min.to_be_bytes());
        buf.extend_from_slice(&self.range_max.to_be_bytes());
        buf.extend_from_slice(&self.stored.to_be_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != RECORD_LEN || data[0] != SEQUENCE_VERSION {
            return Err(CairnError::InvalidArgument("record is not a sequence"));
        }
        let flags = data[1];
        let field = |index: usize| -> Result<i64> {
            let start = 2 + index * 8;
            data.get(start..start + 8)
                .and_then(|bytes| bytes.try_into().ok())
                .map(i64::from_be_bytes)
                .ok_or(CairnError::InvalidArgument("record is not a sequence"))
        };
        Ok(Self {
            decrement: flags & FLAG_DECREMENT != 0,
            wrap: flags & FLAG_WRAP != 0,
            overflow: flags & FLAG_OVERFLOW != 0,
            range_min: field(0)?,
            range_max: field(1)?,
            stored: field(2)?,
        })
    }

    /// Reserves at least `delta` and at most `max(delta, cache)` values,
    /// returning the first and last reserved value. `None` when the range is
    /// used up and wrapping is off.
    fn reserve(&mut self, delta: u32, cache: u32) -> Option<(i64, i64)> {
        if self.overflow {
            return None;
        }
        let delta = i128::from(delta);
        let wanted = delta.max(i128::from(cache));
        let (min, max) = (i128::from(self.range_min), i128::from(self.range_max));
        let mut value = i128::from(self.stored);
        let mut available = if self.decrement { value - min + 1 } else { max - value + 1 };
        if available < delta {
            if !self.wrap {
                return None;
            }
            value = if self.decrement { max } else { min };
            available = max - min + 1;
            if available < delta {
                return None;
            }
        }
        let size = wanted.min(available);
        let (first, last, next) = if self.decrement {
            (value, value - size + 1, value - size)
        } else {
            (value, value + size - 1, value + size)
        };
        let restart = if self.decrement { max } else { min };
        let end = if self.decrement { min } else { max };
        let past_end = if self.decrement { next < min } else { next > max };
        self.stored = if !past_end {
            next as i64
        } else if self.wrap {
            restart as i64
        } else {
            self.overflow = true;
            end as i64
        };
        Some((first as i64, last as i64))
    }
}

#[derive(Debug, Default)]
struct SequenceState {
    next: i128,
    last: i128,
    cached: bool,
    gets: u64,
    cached_gets: u64,
}

impl SequenceState {
    fn take(&mut self, delta: u32, decrement: bool) -> Option<i64> {
        if !self.cached {
            return None;
        }
        let delta = i128::from(delta);
        let fits = if decrement {
            self.next - delta + 1 >= self.last
        } else {
            self.next + delta - 1 <= self.last
        };
        if !fits {
            return None;
        }
        let value = self.next as i64;
        self.next = if decrement { self.next - delta } else { self.next + delta };
        Some(value)
    }
}

/// Counters of a sequence handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceStats {
    /// Calls to [`Sequence::get`].
    pub gets: u64,
    /// Calls served from the handle's cache.
    pub cached_gets: u64,
    /// Next value the cache hands out.
    pub cache_value: i64,
    /// Last value reserved in the cache.
    pub cache_last: i64,
    /// Smallest value of the range.
    pub range_min: i64,
    /// Largest value of the range.
    pub range_max: i64,
    /// Values reserved per write.
    pub cache_size: u32,
}

/// Handle on a persistent counter.
pub struct Sequence {
    db: Database,
    key: Vec<u8>,
    name: String,
    cache_size: u32,
    decrement: bool,
    range: (i64, i64),
    state: Mutex<SequenceState>,
}

impl Sequence {
    pub(crate) fn open(db: Database, txn: Option<&Transaction>, key: &[u8], config: SequenceConfig) -> Result<Self> {
        config.validate()?;
        if db.config().sorted_duplicates {
            return Err(CairnError::Config(
                "sequences need a database without sorted duplicates".into(),
            ));
        }
        let name = String::from_utf8_lossy(key).into_owned();
        let record = db.update_record(txn, key, |existing| match existing {
            Some(data) => {
                if config.exclusive_create {
                    return Err(CairnError::SequenceExists(name.clone()));
                }
                Ok((None, SequenceRecord::decode(data)?))
            }
            None => {
                if !config.allow_create {
                    return Err(CairnError::SequenceNotFound(name.clone()));
                }
                let record = SequenceRecord::new(&config);
                Ok((Some(record.encode()), record))
            }
        })?;
        debug!(db = %db.name(), sequence = %name, value = record.stored, "sequence.open");
        Ok(Self {
            db,
            key: key.to_vec(),
            name,
            cache_size: config.cache_size,
            decrement: record.decrement,
            range: (record.range_min, record.range_max),
            state: Mutex::new(SequenceState::default()),
        })
    }

    /// Key of the sequence record.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Returns the next value and advances the sequence by `delta`.
    ///
    /// # Errors
    /// * `CairnError::InvalidArgument` - `delta` is zero, or a transaction is
    ///   given for a cached sequence
    /// * `CairnError::SequenceExhausted` - the range is used up and wrapping
    ///   is off
    pub fn get(&self, txn: Option<&Transaction>, delta: u32) -> Result<i64> {
        if delta == 0 {
            return Err(CairnError::InvalidArgument("sequence delta must be positive"));
        }
        if txn.is_some() && self.cache_size > 0 {
            return Err(CairnError::InvalidArgument(
                "a cached sequence cannot be read inside a transaction",
            ));
        }
        let mut state = self.state.lock();
        state.gets += 1;
        if let Some(value) = state.take(delta, self.decrement) {
            state.cached_gets += 1;
            return Ok(value);
        }
        let cache = self.cache_size;
        let (first, last) = self.db.update_record(txn, &self.key, |existing| {
            let data = existing.ok_or_else(|| CairnError::SequenceNotFound(self.name.clone()))?;
            let mut record = SequenceRecord::decode(data)?;
            let range = record
                .reserve(delta, cache)
                .ok_or_else(|| CairnError::SequenceExhausted(self.name.clone()))?;
            Ok((Some(record.encode()), range))
        })?;
        trace!(sequence = %self.name, first, last, "sequence.reserve");
        state.next = i128::from(first);
        state.last = i128::from(last);
        state.cached = true;
        state
            .take(delta, self.decrement)
            .ok_or_else(|| CairnError::SequenceExhausted(self.name.clone()))
    }

    /// Handle counters.
    pub fn stats(&self) -> SequenceStats {
        let state = self.state.lock();
        SequenceStats {
            gets: state.gets,
            cached_gets: state.cached_gets,
            cache_value: state.next as i64,
            cache_last: state.last as i64,
            range_min: self.range.0,
            range_max: self.range.1,
            cache_size: self.cache_size,
        }
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("db", &self.db.name())
            .field("name", &self.name)
            .finish()
    }
}
