//! Environment, database, cursor and transaction settings.
//!
//! Plain settings derive serde and load from TOML; callbacks (comparators,
//! key creators, nullifiers) are attached in code.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::database::Database;
use crate::storage::btree::{SharedOrder, DEFAULT_MAX_ENTRIES_PER_BIN};
use crate::types::{CairnError, Result};

/// Smallest leaf capacity accepted; splits need room for both halves.
pub const MIN_ENTRIES_PER_BIN: usize = 4;

/// Settings shared by every database of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Enables transactions and auto-commit for transactional databases.
    pub transactional: bool,
    /// Lock wait timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Transactions default to serializable (phantom-free) isolation.
    pub txn_serializable_isolation: bool,
    /// Leaf capacity before a split.
    pub max_entries_per_bin: usize,
    /// A `BothRange` search whose key is not present advances to the next
    /// key instead of reporting not-found.
    pub both_range_advance_on_key_miss: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            transactional: true,
            lock_timeout_ms: 500,
            txn_serializable_isolation: false,
            max_entries_per_bin: DEFAULT_MAX_ENTRIES_PER_BIN,
            both_range_advance_on_key_miss: false,
        }
    }
}

impl EnvironmentConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|err| CairnError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|err| CairnError::Config(format!("{}: {err}", path.display())))
    }

    /// Renders the settings as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| CairnError::Config(err.to_string()))
    }

    /// Lock wait timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_entries_per_bin < MIN_ENTRIES_PER_BIN {
            return Err(CairnError::Config(format!(
                "max_entries_per_bin must be at least {MIN_ENTRIES_PER_BIN}, got {}",
                self.max_entries_per_bin
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CairnError::Config("lock_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Settings for opening one database.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Create the database when it does not exist.
    pub allow_create: bool,
    /// Fail when the database already exists.
    pub exclusive_create: bool,
    /// Keys own sorted duplicate sets.
    pub sorted_duplicates: bool,
    /// Keys are compared by a partial comparator; excludes duplicates.
    pub key_prefixing: bool,
    /// Writes run inside transactions (auto-commit when none is given).
    pub transactional: bool,
    /// The handle rejects writes.
    pub read_only: bool,
    /// Key order; byte order when unset.
    #[serde(skip)]
    pub key_order: Option<SharedOrder>,
    /// Duplicate data order; byte order when unset.
    #[serde(skip)]
    pub dup_order: Option<SharedOrder>,
}

impl DatabaseConfig {
    /// A config that creates the database on first open.
    pub fn create() -> Self {
        Self {
            allow_create: true,
            ..Self::default()
        }
    }

    /// Builder-style toggle for sorted duplicates.
    pub fn with_duplicates(mut self, sorted_duplicates: bool) -> Self {
        self.sorted_duplicates = sorted_duplicates;
        self
    }

    /// Builder-style toggle for transactional writes.
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_prefixing && self.sorted_duplicates {
            return Err(CairnError::Config(
                "key_prefixing cannot be combined with sorted_duplicates".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("allow_create", &self.allow_create)
            .field("exclusive_create", &self.exclusive_create)
            .field("sorted_duplicates", &self.sorted_duplicates)
            .field("key_prefixing", &self.key_prefixing)
            .field("transactional", &self.transactional)
            .field("read_only", &self.read_only)
            .field("key_order", &self.key_order.as_ref().map(|order| order.name().to_string()))
            .field("dup_order", &self.dup_order.as_ref().map(|order| order.name().to_string()))
            .finish()
    }
}

/// Per-cursor isolation settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Reads take no locks unless a lock mode says otherwise.
    pub read_uncommitted: bool,
    /// Non-transactional locks survive until the cursor closes.
    pub retain_locks: bool,
}

/// Per-transaction overrides of the environment defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Overrides `EnvironmentConfig::txn_serializable_isolation`.
    pub serializable_isolation: Option<bool>,
    /// Reads take no locks by default.
    pub read_uncommitted: bool,
    /// Overrides the environment lock timeout.
    pub lock_timeout_ms: Option<u64>,
}

/// Lock requested by a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Read lock, or none under read-uncommitted isolation.
    #[default]
    Default,
    /// No lock; uncommitted data may be returned.
    ReadUncommitted,
    /// Write lock taken by the read so a later update cannot deadlock.
    Rmw,
}

type SingleKeyFn = dyn Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync;
type MultiKeyFn = dyn Fn(&[u8], &[u8]) -> Vec<Vec<u8>> + Send + Sync;

/// Secondary keys derived from a primary record.
pub(crate) type KeySet = BTreeSet<Vec<u8>>;

/// Derives secondary keys from a primary (key, data) pair.
#[derive(Clone)]
pub enum KeyCreator {
    /// At most one secondary key per record.
    Single(Arc<SingleKeyFn>),
    /// Any number of secondary keys per record; duplicates collapse.
    Multi(Arc<MultiKeyFn>),
}

impl KeyCreator {
    /// Wraps a single-key creator.
    pub fn single<F>(f: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        KeyCreator::Single(Arc::new(f))
    }

    /// Wraps a multi-key creator.
    pub fn multi<F>(f: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        KeyCreator::Multi(Arc::new(f))
    }

    pub(crate) fn keys(&self, primary_key: &[u8], data: &[u8]) -> KeySet {
        match self {
            KeyCreator::Single(f) => f(primary_key, data).into_iter().collect(),
            KeyCreator::Multi(f) => {
                let keys: SmallVec<[Vec<u8>; 4]> = f(primary_key, data).into();
                keys.into_iter().collect()
            }
        }
    }

    pub(crate) fn derives(&self, primary_key: &[u8], data: &[u8], secondary_key: &[u8]) -> bool {
        match self {
            KeyCreator::Single(f) => f(primary_key, data).as_deref() == Some(secondary_key),
            KeyCreator::Multi(f) => f(primary_key, data)
                .iter()
                .any(|key| key.as_slice() == secondary_key),
        }
    }
}

impl fmt::Debug for KeyCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCreator::Single(_) => f.write_str("KeyCreator::Single"),
            KeyCreator::Multi(_) => f.write_str("KeyCreator::Multi"),
        }
    }
}

/// What deleting a foreign record does to the records that reference it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignKeyDeleteAction {
    /// Refuse the delete; the enclosing transaction must abort.
    #[default]
    Abort,
    /// Delete every referencing primary record.
    Cascade,
    /// Rewrite referencing primary records through the nullifier.
    Nullify,
}

type SingleNullifyFn = dyn Fn(&mut Vec<u8>) -> bool + Send + Sync;
type MultiNullifyFn = dyn Fn(&[u8], &mut Vec<u8>, &[u8]) -> bool + Send + Sync;

/// Removes a foreign reference from primary data. Returns true when the data
/// was changed and must be written back.
#[derive(Clone)]
pub enum Nullifier {
    /// Called with the primary data.
    Single(Arc<SingleNullifyFn>),
    /// Called with the primary key, the primary data and the deleted key.
    Multi(Arc<MultiNullifyFn>),
}

impl Nullifier {
    /// Wraps a single-key nullifier.
    pub fn single<F>(f: F) -> Self
    where
        F: Fn(&mut Vec<u8>) -> bool + Send + Sync + 'static,
    {
        Nullifier::Single(Arc::new(f))
    }

    /// Wraps a multi-key nullifier.
    pub fn multi<F>(f: F) -> Self
    where
        F: Fn(&[u8], &mut Vec<u8>, &[u8]) -> bool + Send + Sync + 'static,
    {
        Nullifier::Multi(Arc::new(f))
    }

    pub(crate) fn nullify(&self, primary_key: &[u8], data: &mut Vec<u8>, secondary_key: &[u8]) -> bool {
        match self {
            Nullifier::Single(f) => f(data),
            Nullifier::Multi(f) => f(primary_key, data, secondary_key),
        }
    }
}

impl fmt::Debug for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nullifier::Single(_) => f.write_str("Nullifier::Single"),
            Nullifier::Multi(_) => f.write_str("Nullifier::Multi"),
        }
    }
}

/// Settings for opening a secondary index.
#[derive(Clone, Debug)]
pub struct SecondaryConfig {
    /// Settings of the index tree itself.
    pub database: DatabaseConfig,
    /// Key derivation.
    pub key_creator: KeyCreator,
    /// Every secondary key must exist as a key of this database.
    pub foreign_key_database: Option<Database>,
    /// Reaction to deletes in the foreign database.
    pub foreign_key_delete_action: ForeignKeyDeleteAction,
    /// Required for [`ForeignKeyDeleteAction::Nullify`].
    pub foreign_key_nullifier: Option<Nullifier>,
    /// Populate an empty index from the primary when opened.
    pub allow_populate: bool,
    /// Updates never change a record's secondary keys.
    pub immutable_secondary_key: bool,
}

impl SecondaryConfig {
    /// A creatable, duplicate-sorted index over `key_creator`.
    pub fn new(key_creator: KeyCreator) -> Self {
        Self {
            database: DatabaseConfig::create().with_duplicates(true),
            key_creator,
            foreign_key_database: None,
            foreign_key_delete_action: ForeignKeyDeleteAction::Abort,
            foreign_key_nullifier: None,
            allow_populate: false,
            immutable_secondary_key: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.database.validate()?;
        if self.foreign_key_delete_action == ForeignKeyDeleteAction::Nullify
            && self.foreign_key_nullifier.is_none()
        {
            return Err(CairnError::Config(
                "foreign_key_delete_action Nullify requires a nullifier".into(),
            ));
        }
        if let Some(foreign) = &self.foreign_key_database {
            if foreign.config().sorted_duplicates {
                return Err(CairnError::Config(
                    "a foreign key database may not have sorted duplicates".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Settings for a persistent sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Create the sequence record when missing.
    pub allow_create: bool,
    /// Fail when the record already exists.
    pub exclusive_create: bool,
    /// First value handed out by a new sequence.
    pub initial_value: i64,
    /// Smallest value, inclusive.
    pub range_min: i64,
    /// Largest value, inclusive.
    pub range_max: i64,
    /// Values reserved per database write.
    pub cache_size: u32,
    /// Count down instead of up.
    pub decrement: bool,
    /// Restart at the other end of the range instead of failing.
    pub wrap: bool,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            allow_create: true,
            exclusive_create: false,
            initial_value: 0,
            range_min: i64::MIN,
            range_max: i64::MAX,
            cache_size: 0,
            decrement: false,
            wrap: false,
        }
    }
}

impl SequenceConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.range_min >= self.range_max {
            return Err(CairnError::Config("sequence range_min must be below range_max".into()));
        }
        if self.initial_value < self.range_min || self.initial_value > self.range_max {
            return Err(CairnError::Config("sequence initial_value outside its range".into()));
        }
        if i128::from(self.cache_size) > i128::from(self.range_max) - i128::from(self.range_min) {
            return Err(CairnError::Config("sequence cache_size larger than its range".into()));
        }
        Ok(())
    }
}

/// Settings for an equality join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Keep the caller's cursor order instead of sorting by duplicate count.
    pub no_sort: bool,
}
