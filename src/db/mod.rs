//! Database handles, cursors, secondary indexes and transactions.

mod config;
mod cursor;
mod database;
mod environment;
mod join;
mod secondary;
mod sequence;
mod stats;
mod transaction;
mod triggers;

pub use config::{
    CursorConfig, DatabaseConfig, EnvironmentConfig, ForeignKeyDeleteAction, JoinConfig, KeyCreator, LockMode,
    Nullifier, SecondaryConfig, SequenceConfig, TransactionConfig, MIN_ENTRIES_PER_BIN,
};
pub use cursor::Cursor;
pub use database::{Database, DbOperation, DbState, HandleKind};
pub use environment::{EnvState, Environment};
pub use join::JoinCursor;
pub use secondary::{SecondaryCursor, SecondaryDatabase};
pub use sequence::{Sequence, SequenceStats};
pub use stats::DatabaseStats;
pub use transaction::Transaction;
